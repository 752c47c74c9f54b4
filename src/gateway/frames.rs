//! Wire frames of the real-time gateway: JSON objects `{op, d, s, t}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::opcodes;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    /// Sequence number, present on dispatches
    #[serde(default)]
    pub s: Option<u64>,
    /// Dispatch event name
    #[serde(default)]
    pub t: Option<String>,
}

/// Credentials and capabilities sent once per connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyInfo {
    pub token: String,
    pub intents: u64,
}

impl GatewayFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Heartbeat echoing the last seen sequence (null before the first dispatch)
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: opcodes::HEARTBEAT,
            d: sequence.map_or(Value::Null, Value::from),
            s: None,
            t: None,
        }
    }

    pub fn identify(info: &IdentifyInfo) -> Self {
        Self {
            op: opcodes::IDENTIFY,
            d: json!({
                "token": info.token,
                "properties": {
                    "os": "windows",
                    "browser": "chrome",
                    "device": "chrome",
                },
                "intents": info.intents,
            }),
            s: None,
            t: None,
        }
    }

    /// `heartbeat_interval` from a hello frame, in milliseconds
    pub fn heartbeat_interval_ms(&self) -> Option<u64> {
        self.d.get("heartbeat_interval").and_then(Value::as_u64)
    }
}
