//! Delivery of inbound application events to the host.

use serde_json::Value;
use tokio::sync::mpsc;

/// Receives every event the engine sends on the application channel.
///
/// Called from the engine's reader task, in the order the engine sent the events.
/// Implementations should not block.
pub trait EventNotifier: Send + Sync + 'static {
    fn channel_receive(&self, event_name: &str, args: Value);
}

impl<F> EventNotifier for F
where
    F: Fn(&str, Value) + Send + Sync + 'static,
{
    fn channel_receive(&self, event_name: &str, args: Value) {
        self(event_name, args)
    }
}

/// An event received from the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub event_name: String,
    pub args: Value,
}

/// Notifier that queues events for an async consumer.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventNotifier for ChannelNotifier {
    fn channel_receive(&self, event_name: &str, args: Value) {
        let event = ChannelEvent {
            event_name: event_name.to_string(),
            args,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!(%event_name, "Event receiver dropped, discarding event");
        }
    }
}
