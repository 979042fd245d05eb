//! Full-duplex voice conversation client.
//!
//! Microphone audio is resampled to 16 kHz mono PCM and streamed to a relay;
//! synthesized speech fragments come back over the same relay and are played
//! gaplessly through an adaptive jitter buffer.
//!
//! | Module        | Responsibility                                      |
//! |---------------|-----------------------------------------------------|
//! | [`audio`]     | capture, resampling, speech detection, output device |
//! | [`playback`]  | fragment decoding, scheduling, mixing, adaptation   |
//! | [`session`]   | relay messages, turn state machine, event loop      |
//! | [`transport`] | WebSocket relay client                              |
//! | [`config`]    | TOML settings                                       |

pub mod audio;
pub mod config;
pub mod playback;
pub mod session;
pub mod transport;
