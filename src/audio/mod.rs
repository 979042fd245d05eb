//! Device-side audio: microphone capture and the output stream.
//!
//! # Capture pipeline
//!
//! ```text
//! Microphone → cpal callback ─┬─ inline ──────────────┬─▶ CaptureSession
//!                             └─ worker thread (mpsc) ┘     downmix → Resampler → PCM16 → frames
//!                                                          └─▶ CaptureFrame (tokio mpsc)
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use voice_duplex::audio::CaptureSession;
//! use voice_duplex::config::CaptureConfig;
//!
//! // 48 kHz stereo device, 16 kHz mono 1600-sample frames out.
//! let mut session = CaptureSession::new(48_000, 2, &CaptureConfig::default());
//! let frames = session.push(&vec![0.25_f32; 48_000 * 2 / 10]);
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].samples.len(), 1_600);
//! ```

pub mod capture;
pub mod output;
pub mod resample;
pub mod vad;

pub use capture::{
    f32_to_pcm16, CaptureError, CaptureFrame, CaptureSession, CaptureSource, MicrophoneSource,
};
pub use output::{OutputError, OutputStream};
pub use resample::{downmix_to_mono, resample, ResampleState, Resampler};
pub use vad::SpeechDetector;
