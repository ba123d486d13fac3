//! Push channel wire protocol.
//!
//! Every frame is a JSON object `{ "event", "channel"?, "data"? }`. Servers may
//! send `data` either as a JSON value or as a JSON document encoded in a string.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest job-result payload the server pushes inline. Larger payloads are
/// elided from the event and must be fetched over REST.
pub const PUSH_PAYLOAD_LIMIT_BYTES: usize = 10 * 1024;

/// Frame event names.
pub mod events {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const ERROR: &str = "pusher:error";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const JOB_RESULT: &str = "job-result";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PushFrame {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            channel: None,
            data: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn subscribe(channel: &str, auth: &str) -> Self {
        Self::new(events::SUBSCRIBE).with_data(serde_json::json!({
            "channel": channel,
            "auth": auth,
        }))
    }

    pub fn pong() -> Self {
        Self::new(events::PONG).with_data(serde_json::json!({}))
    }

    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn is(&self, event: &str) -> bool {
        self.event == event
    }

    /// The frame's data, with string-encoded documents decoded.
    pub fn data_value(&self) -> Value {
        match &self.data {
            None => Value::Null,
            Some(Value::String(encoded)) => {
                serde_json::from_str(encoded).unwrap_or_else(|_| Value::String(encoded.clone()))
            }
            Some(value) => value.clone(),
        }
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data_value())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionEstablished {
    pub socket_id: String,
    #[serde(default)]
    pub activity_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushErrorData {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<u16>,
}

/// Body POSTed to the channel authorization endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAuthRequest {
    pub socket_id: String,
    pub channel_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAuthResponse {
    pub auth: String,
}
