//! Configuration module for the voice duplex client.
//!
//! Provides `AppConfig` (top-level settings), sub-configs for each subsystem,
//! `AppPaths` for cross-platform config directories, and TOML persistence via
//! `AppConfig::load` / `AppConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::{AppPaths, CONFIG_ENV};
pub use settings::{
    AdaptiveConfig, AppConfig, CaptureConfig, CaptureMode, ConversationConfig, PlaybackConfig,
    RelayConfig,
};
