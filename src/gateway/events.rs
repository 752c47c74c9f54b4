use serde::{Deserialize, Serialize};

use super::message::PlatformMessage;

/// Who the gateway session is logged in as, captured from `READY`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
}

/// Dispatches the correlator understands; everything else is `Other`
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Ready(SessionIdentity),
    MessageCreate(PlatformMessage),
    MessageUpdate(PlatformMessage),
    Other { event_type: String },
}

impl RawEvent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::Ready(_) => "READY",
            Self::MessageCreate(_) => "MESSAGE_CREATE",
            Self::MessageUpdate(_) => "MESSAGE_UPDATE",
            Self::Other { event_type } => event_type,
        }
    }
}

/// What a gateway session reports upstream
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionReady(SessionIdentity),
    Raw(RawEvent),
    /// The connection dropped; the session reconnects on its own unless shut down
    Disconnected { reason: String },
}
