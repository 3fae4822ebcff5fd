//! Message routing between the wire envelope and the host event contract.
//!
//! Inbound: decode the envelope payload, advance the lifecycle on the control channel,
//! forward application events to the [`EventNotifier`].
//! Outbound: enforce lifecycle preconditions, then build the double-encoded envelope.

use std::sync::Arc;

use crate::bridge::protocol::{Channel, ChannelPayload, Envelope, EventPayload, READY_EVENT};
use crate::error::BridgeError;
use crate::notifier::EventNotifier;
use crate::status::{EngineStatus, LifecycleState};

/// What the router did with an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// The ready signal moved the engine to `Ready`.
    Ready { notified: usize },
    /// Forwarded to the notifier.
    Delivered,
    /// Unknown channel or event, duplicate ready signal, or undecodable payload.
    Ignored,
}

#[derive(Clone)]
pub struct MessageRouter {
    status: EngineStatus,
    notifier: Arc<dyn EventNotifier>,
}

impl MessageRouter {
    pub fn new(status: EngineStatus, notifier: Arc<dyn EventNotifier>) -> Self {
        Self { status, notifier }
    }

    /// Handle one frame from the engine.
    pub fn receive_message(&self, channel_name: &str, payload: &str) -> Routed {
        let inner: EventPayload = match serde_json::from_str(payload) {
            Ok(inner) => inner,
            Err(e) => {
                tracing::warn!(channel = %channel_name, error = %e, "Ignoring frame with undecodable payload");
                return Routed::Ignored;
            }
        };

        match Channel::parse(channel_name) {
            Some(Channel::App) if inner.event == READY_EVENT => match self.status.mark_ready() {
                Some(notified) => {
                    tracing::info!(notified, "Engine ready");
                    Routed::Ready { notified }
                }
                None => {
                    tracing::debug!("Duplicate ready signal");
                    Routed::Ignored
                }
            },
            Some(Channel::Event) => {
                tracing::debug!(event = %inner.event, "Forwarding engine event");
                self.notifier.channel_receive(&inner.event, inner.args());
                Routed::Delivered
            }
            _ => {
                tracing::debug!(channel = %channel_name, event = %inner.event, "Ignoring unroutable frame");
                Routed::Ignored
            }
        }
    }

    pub fn receive_envelope(&self, envelope: &Envelope) -> Routed {
        self.receive_message(&envelope.channel_name, &envelope.payload)
    }

    /// Check send preconditions and build the outbound frame.
    ///
    /// Returns `Ok(None)` when the request has no event name or no args; nothing is sent
    /// in that case.
    pub fn outbound(&self, message: &ChannelPayload) -> Result<Option<Envelope>, BridgeError> {
        match self.status.state() {
            LifecycleState::NotStarted => return Err(BridgeError::NotStarted),
            LifecycleState::Started => return Err(BridgeError::NotReady),
            LifecycleState::Ready => {}
        }

        let Some(args) = message.sendable_args() else {
            tracing::debug!(event = %message.event_name, "Dropping event without name or args");
            return Ok(None);
        };

        Ok(Some(Envelope::event(&message.event_name, args)?))
    }
}
