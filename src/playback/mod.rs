//! Inbound playback: fragment decoding → jitter buffer → scheduled output.
//!
//! # Pipeline
//!
//! ```text
//! InboundFragment → FragmentDecoder → Scheduler ──NodeSpec──▶ Mixer ──▶ output device
//!                                        ▲   │
//!                      AdaptiveController┘   └─▶ PlaybackEvent (session)
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use voice_duplex::config::{AdaptiveConfig, PlaybackConfig};
//! use voice_duplex::playback::{InboundFragment, Mixer, PlaybackState, Scheduler};
//!
//! let mut scheduler = Scheduler::new(
//!     Mixer::new(48_000, 2),
//!     PlaybackConfig::default(),
//!     AdaptiveConfig::default(),
//! );
//!
//! // A bare final message for an unseen context opens and closes it.
//! let events = scheduler.on_fragment(InboundFragment::new("ctx-1", Vec::new(), true), 0.0);
//! assert!(!events.is_empty());
//! assert_eq!(scheduler.state(), PlaybackState::Finalizing);
//! ```

pub mod adaptive;
pub mod decoder;
pub mod fragment;
pub mod history;
pub mod mixer;
pub mod scheduler;

pub use adaptive::{AdaptiveController, QualityMetrics, QualityTier};
pub use decoder::{DecodeError, FormatState, FragmentDecoder};
pub use fragment::{AudioFragment, ContextId, InboundFragment};
pub use history::LatencyHistory;
pub use mixer::{AudioSink, Mixer, NodeId, NodeSpec, PlaybackNode, SharedMixer};
pub use scheduler::{PlaybackEvent, PlaybackState, ScheduledNode, Scheduler};
