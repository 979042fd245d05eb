//! WebSocket transport to the conversation relay.

pub mod relay;

pub use relay::{connect, RelayConnection, RelayError};
