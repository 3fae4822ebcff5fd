//! Wire protocol types for host-engine communication.
//!
//! Every frame is an [`Envelope`] routed by channel name. The envelope payload is
//! itself JSON: an [`EventPayload`] whose own `payload` is the JSON encoding of the
//! event arguments. Receivers route on the outer frame and decode arguments later.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control plane. The only inbound event understood today is [`READY_EVENT`].
pub const APP_CHANNEL: &str = "APP_CHANNEL";

/// Application plane, carries user events in both directions.
pub const EVENT_CHANNEL: &str = "EVENT_CHANNEL";

/// Sent by the engine on [`APP_CHANNEL`] once its application code is loaded.
pub const READY_EVENT: &str = "ready";

/// Reserved channel names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    App,
    Event,
}

impl Channel {
    /// Unknown names map to `None` so newer engines can add channels.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            APP_CHANNEL => Some(Self::App),
            EVENT_CHANNEL => Some(Self::Event),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => APP_CHANNEL,
            Self::Event => EVENT_CHANNEL,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outer routing frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub channel_name: String,
    /// JSON-encoded [`EventPayload`].
    pub payload: String,
}

impl Envelope {
    pub fn new(channel: Channel, payload: impl Into<String>) -> Self {
        Self {
            channel_name: channel.as_str().to_string(),
            payload: payload.into(),
        }
    }

    /// Build an application event frame: args are encoded, then the wrapper
    /// holding the encoded args is encoded again.
    pub fn event(event: &str, args: &Value) -> Result<Self, serde_json::Error> {
        let inner = EventPayload::new(event, args)?;
        Ok(Self::new(Channel::Event, serde_json::to_string(&inner)?))
    }

    pub fn channel(&self) -> Option<Channel> {
        Channel::parse(&self.channel_name)
    }

    pub fn decode_payload(&self) -> Result<EventPayload, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Inner event frame carried in [`Envelope::payload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event: String,
    /// JSON-encoded arguments. Control events such as `ready` omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl EventPayload {
    pub fn new(event: impl Into<String>, args: &Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.into(),
            payload: Some(serde_json::to_string(args)?),
        })
    }

    /// Decoded arguments.
    ///
    /// A missing payload yields `Null`. A payload that is not valid JSON is handed
    /// over verbatim as a string value.
    pub fn args(&self) -> Value {
        match self.payload.as_deref() {
            None => Value::Null,
            Some(raw) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
            }
        }
    }
}

/// Host-side request to emit an application event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPayload {
    #[serde(default)]
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl ChannelPayload {
    pub fn new(event_name: impl Into<String>, args: Value) -> Self {
        Self {
            event_name: event_name.into(),
            args: Some(args),
        }
    }

    /// Args to put on the wire, or `None` when the request carries nothing to send.
    pub fn sendable_args(&self) -> Option<&Value> {
        if self.event_name.is_empty() {
            return None;
        }
        self.args.as_ref().filter(|args| !is_falsy(args))
    }
}

/// `null`, `false`, `0` and `""` carry no arguments.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}
