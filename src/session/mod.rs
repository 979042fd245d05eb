//! Conversation session: relay messages, the turn state machine and the
//! runner that ties capture, playback and the relay together.
//!
//! ```text
//!  relay reader ──InboundMessage──▶ ┌───────────────┐ ──OutboundMessage──▶ relay writer
//!  user input ──SessionCommand────▶ │ SessionRunner │ ──NodeSpec─────────▶ output mixer
//!  microphone ──CaptureFrame──────▶ └───────────────┘ ──SessionStatus────▶ front end
//! ```

pub mod messages;
pub mod runner;
pub mod state;

pub use messages::{ControlMessage, InboundMessage, MessageError, OutboundMessage};
pub use runner::{SessionCommand, SessionRunner};
pub use state::{
    lock_status, new_shared_status, SessionStatus, SharedStatus, TurnAction, TurnEvent,
    TurnMachine, TurnState,
};
