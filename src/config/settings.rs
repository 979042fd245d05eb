//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.
//! Every section is `#[serde(default)]`, so a hand-edited `settings.toml` only
//! needs the keys it wants to override.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// RelayConfig
// ---------------------------------------------------------------------------

/// Connection settings for the duplex relay that fronts the transcription,
/// response and synthesis services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL of the relay (e.g. `ws://localhost:8000/ws`).
    pub url: String,
    /// Join an existing session instead of creating a new one.
    pub session_id: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws".into(),
            session_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureMode / CaptureConfig
// ---------------------------------------------------------------------------

/// Where the capture-side resampling and framing runs.
///
/// Both modes drive the same [`crate::audio::CaptureSession`], so the frames
/// they produce are bit-identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Raw device blocks are handed to a dedicated processing thread.
    Worker,
    /// Blocks are processed directly inside the device callback.
    Inline,
}

impl Default for CaptureMode {
    fn default() -> Self {
        Self::Worker
    }
}

/// Microphone capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sample rate expected by the transcription service (Hz).
    pub target_sample_rate: u32,
    /// Samples per outbound PCM16 frame.
    pub frame_samples: usize,
    /// Processing realization.
    pub mode: CaptureMode,
    /// Input device name; `None` means the system default.
    pub device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000,
            frame_samples: 1_600,
            mode: CaptureMode::default(),
            device: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PlaybackConfig
// ---------------------------------------------------------------------------

/// Jitter buffer and playback scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Upper bound of the overlap between consecutive fragments (seconds).
    /// The effective overlap is also capped at 10 % of either fragment.
    pub crossfade_secs: f64,
    /// Length of the click-suppression ramp applied to both ends of every
    /// decoded fragment, in frames.
    pub edge_fade_samples: usize,
    /// Fade applied to nodes that are already sounding when playback is
    /// interrupted (seconds).
    pub interrupt_fade_secs: f64,
    /// Maximum time a context may stay in `Buffering` before its queue is
    /// flushed regardless of the pre-buffer count (seconds).
    pub preroll_secs: f64,
    /// Hard cap on fragments held while buffering; the oldest is dropped.
    pub max_queued_fragments: usize,
    /// Playback speed multiplier (1.0 = natural speed).
    pub playback_rate: f64,
    /// Interval of the device tick that drives timers and the adaptive loop.
    pub tick_ms: u64,
    /// Consecutive decode failures in one context that force a reset.
    pub max_consecutive_decode_failures: u32,
    /// How many superseded or finished context ids are remembered so late
    /// fragments for them can be discarded.
    pub retired_context_memory: usize,
    /// Output device name; `None` uses the system default.
    pub output_device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            crossfade_secs: 0.01,
            edge_fade_samples: 32,
            interrupt_fade_secs: 0.02,
            preroll_secs: 0.15,
            max_queued_fragments: 64,
            playback_rate: 1.0,
            tick_ms: 20,
            max_consecutive_decode_failures: 3,
            retired_context_memory: 16,
            output_device: None,
        }
    }
}

// ---------------------------------------------------------------------------
// AdaptiveConfig
// ---------------------------------------------------------------------------

/// Bounds and gains of the adaptive buffer controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Lower bound of the minimum lead time (seconds).
    pub min_lead_secs: f64,
    /// Upper bound of the minimum lead time (seconds).
    pub max_lead_secs: f64,
    /// Lead time used before any latency has been observed (seconds).
    pub initial_lead_secs: f64,
    /// Lower bound of the pre-buffer depth (fragments).
    pub min_prebuffer: usize,
    /// Upper bound of the pre-buffer depth (fragments).
    pub max_prebuffer: usize,
    /// Pre-buffer depth before any adaptation.
    pub initial_prebuffer: usize,
    /// Number of latency samples in the rolling window.
    pub history_len: usize,
    /// Average latency below which the link is `good` (seconds).
    pub good_latency_secs: f64,
    /// Average latency below which the link is at worst `degraded` (seconds).
    pub degraded_latency_secs: f64,
    /// Dropouts tolerated while still `good`.
    pub low_dropouts: u32,
    /// Dropouts tolerated while still `degraded`.
    pub moderate_dropouts: u32,
    /// Lead multiplier applied while `good` (< 1).
    pub shrink_factor: f64,
    /// Lead multiplier applied while `degraded` (> 1).
    pub grow_factor: f64,
    /// Lead multiplier applied while `poor` (> 1).
    pub poor_grow_factor: f64,
    /// Consecutive `good` observations before the pre-buffer shrinks by one.
    pub good_streak_to_shrink: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_lead_secs: 0.02,
            max_lead_secs: 0.3,
            initial_lead_secs: 0.05,
            min_prebuffer: 3,
            max_prebuffer: 20,
            initial_prebuffer: 5,
            history_len: 10,
            good_latency_secs: 0.1,
            degraded_latency_secs: 0.2,
            low_dropouts: 1,
            moderate_dropouts: 4,
            shrink_factor: 0.95,
            grow_factor: 1.1,
            poor_grow_factor: 1.2,
            good_streak_to_shrink: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// ConversationConfig
// ---------------------------------------------------------------------------

/// Turn-taking behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Re-enter `Listening` after the assistant finishes speaking.
    pub continuous: bool,
    /// Treat local microphone energy as barge-in while speaking.
    pub local_barge_in: bool,
    /// RMS threshold of the local speech detector.
    pub vad_threshold: f32,
    /// Consecutive voiced capture frames required to report speech.
    pub vad_min_speech_frames: u32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            continuous: true,
            local_barge_in: false,
            vad_threshold: 0.02,
            vad_min_speech_frames: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_duplex::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Relay connection.
    pub relay: RelayConfig,
    /// Microphone capture.
    pub capture: CaptureConfig,
    /// Jitter buffer / scheduler.
    pub playback: PlaybackConfig,
    /// Adaptive buffer controller.
    pub adaptive: AdaptiveConfig,
    /// Turn-taking.
    pub conversation: ConversationConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet
    /// (first-run scenario) so callers never need to special-case a missing
    /// file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;
        config.validate();
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Repair values that would break the runtime invariants.
    ///
    /// Every adjustment is logged at `warn` so a bad hand edit is visible.
    pub fn validate(&mut self) {
        let a = &mut self.adaptive;
        // NaN and infinity are valid TOML floats but poison every comparison.
        if !a.min_lead_secs.is_finite()
            || !a.max_lead_secs.is_finite()
            || a.min_lead_secs <= 0.0
            || a.min_lead_secs > a.max_lead_secs
        {
            log::warn!("config: invalid lead bounds, restoring defaults");
            let d = AdaptiveConfig::default();
            a.min_lead_secs = d.min_lead_secs;
            a.max_lead_secs = d.max_lead_secs;
        }
        if !a.initial_lead_secs.is_finite() {
            log::warn!("config: initial_lead_secs must be finite, using default");
            a.initial_lead_secs = AdaptiveConfig::default().initial_lead_secs;
        }
        a.initial_lead_secs = a.initial_lead_secs.clamp(a.min_lead_secs, a.max_lead_secs);

        if a.min_prebuffer == 0 || a.min_prebuffer > a.max_prebuffer {
            log::warn!("config: invalid pre-buffer bounds, restoring defaults");
            let d = AdaptiveConfig::default();
            a.min_prebuffer = d.min_prebuffer;
            a.max_prebuffer = d.max_prebuffer;
        }
        a.initial_prebuffer = a.initial_prebuffer.clamp(a.min_prebuffer, a.max_prebuffer);
        a.history_len = a.history_len.max(1);

        let max_prebuffer = a.max_prebuffer;
        let p = &mut self.playback;
        if p.max_queued_fragments < max_prebuffer {
            log::warn!(
                "config: max_queued_fragments {} below max_prebuffer {max_prebuffer}, raising",
                p.max_queued_fragments
            );
            p.max_queued_fragments = max_prebuffer;
        }
        if p.playback_rate.is_nan() || p.playback_rate <= 0.0 {
            log::warn!("config: playback_rate must be positive, using 1.0");
            p.playback_rate = 1.0;
        }
        if !p.preroll_secs.is_finite() || p.preroll_secs < 0.0 {
            log::warn!("config: preroll_secs must be a finite non-negative value, using default");
            p.preroll_secs = PlaybackConfig::default().preroll_secs;
        }
        p.crossfade_secs = p.crossfade_secs.max(0.0);
        p.interrupt_fade_secs = p.interrupt_fade_secs.max(0.0);
        p.tick_ms = p.tick_ms.max(1);
        p.max_consecutive_decode_failures = p.max_consecutive_decode_failures.max(1);

        if self.capture.frame_samples == 0 {
            log::warn!("config: frame_samples must be > 0, using default");
            self.capture.frame_samples = CaptureConfig::default().frame_samples;
        }
        if self.capture.target_sample_rate == 0 {
            self.capture.target_sample_rate = CaptureConfig::default().target_sample_rate;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// A default `AppConfig` survives a TOML round trip.
    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let original = AppConfig::default();
        original.save_to(&path).expect("save");

        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(original.relay.url, loaded.relay.url);
        assert_eq!(original.relay.session_id, loaded.relay.session_id);
        assert_eq!(original.capture.mode, loaded.capture.mode);
        assert_eq!(original.capture.frame_samples, loaded.capture.frame_samples);
        assert_eq!(original.playback.tick_ms, loaded.playback.tick_ms);
        assert_eq!(
            original.adaptive.initial_prebuffer,
            loaded.adaptive.initial_prebuffer
        );
        assert_eq!(
            original.conversation.continuous,
            loaded.conversation.continuous
        );
    }

    /// `load_from` on a non-existent path must return `Default` without error.
    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        let default = AppConfig::default();

        assert_eq!(config.relay.url, default.relay.url);
        assert_eq!(
            config.capture.target_sample_rate,
            default.capture.target_sample_rate
        );
    }

    #[test]
    fn default_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.capture.target_sample_rate, 16_000);
        assert_eq!(cfg.capture.frame_samples, 1_600);
        assert_eq!(cfg.capture.mode, CaptureMode::Worker);
        assert_eq!(cfg.playback.max_consecutive_decode_failures, 3);
        assert!((cfg.adaptive.min_lead_secs - 0.02).abs() < 1e-12);
        assert!((cfg.adaptive.max_lead_secs - 0.3).abs() < 1e-12);
        assert!(cfg.conversation.continuous);
        assert!(!cfg.conversation.local_barge_in);
    }

    /// A file that only overrides a couple of keys still loads.
    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("partial.toml");
        std::fs::write(
            &path,
            "[relay]\nurl = \"ws://relay.example:9000/ws\"\n\n[capture]\nmode = \"inline\"\n",
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).expect("load");
        assert_eq!(cfg.relay.url, "ws://relay.example:9000/ws");
        assert_eq!(cfg.capture.mode, CaptureMode::Inline);
        assert_eq!(cfg.capture.frame_samples, 1_600);
        assert_eq!(cfg.playback.tick_ms, 20);
    }

    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("modified.toml");

        let mut cfg = AppConfig::default();
        cfg.relay.session_id = Some("abc123".into());
        cfg.capture.frame_samples = 800;
        cfg.capture.device = Some("USB Mic".into());
        cfg.playback.crossfade_secs = 0.005;
        cfg.adaptive.max_prebuffer = 12;
        cfg.conversation.local_barge_in = true;

        cfg.save_to(&path).expect("save");
        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(loaded.relay.session_id.as_deref(), Some("abc123"));
        assert_eq!(loaded.capture.frame_samples, 800);
        assert_eq!(loaded.capture.device.as_deref(), Some("USB Mic"));
        assert!((loaded.playback.crossfade_secs - 0.005).abs() < 1e-12);
        assert_eq!(loaded.adaptive.max_prebuffer, 12);
        assert!(loaded.conversation.local_barge_in);
    }

    #[test]
    fn validate_clamps_inconsistent_values() {
        let mut cfg = AppConfig::default();
        cfg.adaptive.initial_lead_secs = 5.0;
        cfg.adaptive.initial_prebuffer = 100;
        cfg.playback.max_queued_fragments = 2;
        cfg.playback.playback_rate = 0.0;
        cfg.capture.frame_samples = 0;

        cfg.validate();

        assert!((cfg.adaptive.initial_lead_secs - cfg.adaptive.max_lead_secs).abs() < 1e-12);
        assert_eq!(cfg.adaptive.initial_prebuffer, cfg.adaptive.max_prebuffer);
        assert_eq!(cfg.playback.max_queued_fragments, cfg.adaptive.max_prebuffer);
        assert!((cfg.playback.playback_rate - 1.0).abs() < 1e-12);
        assert_eq!(cfg.capture.frame_samples, 1_600);
    }

    #[test]
    fn validate_restores_inverted_lead_bounds() {
        let mut cfg = AppConfig::default();
        cfg.adaptive.min_lead_secs = 0.5;
        cfg.adaptive.max_lead_secs = 0.1;
        cfg.validate();
        assert!(cfg.adaptive.min_lead_secs < cfg.adaptive.max_lead_secs);
    }

    #[test]
    fn non_finite_timing_values_are_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "[adaptive]\nmax_lead_secs = nan\ninitial_lead_secs = inf\n\n[playback]\npreroll_secs = nan\n",
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        let d = AppConfig::default();
        assert!((cfg.adaptive.max_lead_secs - d.adaptive.max_lead_secs).abs() < 1e-12);
        assert!((cfg.adaptive.initial_lead_secs - d.adaptive.initial_lead_secs).abs() < 1e-12);
        assert!((cfg.playback.preroll_secs - d.playback.preroll_secs).abs() < 1e-12);
    }
}
