pub mod command_relay;

pub use command_relay::{CommandRelay, RelayError, RelayRequest, RelayResponse, RelayResult};
