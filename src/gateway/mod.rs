//! # Gateway
//!
//! Everything that talks to the external platform: the websocket session, its wire
//! protocol, the HTTP interaction sender and the message model.

pub mod errors;
pub mod events;
pub mod frames;
pub mod interactions;
pub mod message;
pub mod protocol;
pub mod session;
pub mod traits;

pub use errors::{GatewayError, GatewayResult};
pub use events::{RawEvent, SessionEvent, SessionIdentity};
pub use frames::{GatewayFrame, IdentifyInfo};
pub use interactions::InteractionClient;
pub use message::{prompts_match, PlatformMessage};
pub use protocol::{GatewayProtocol, ProtocolAction};
pub use session::GatewaySession;
pub use traits::{GatewayCommand, GatewayConnection, MessageHistory};
