//! Simple energy-based speech detection on capture frames.
//!
//! [`SpeechDetector`] looks at each outbound capture frame and reports the
//! moment the user starts talking.  The session uses it for local barge-in:
//! when the assistant is speaking and the microphone picks up sustained
//! voice energy, playback is interrupted without waiting for the first
//! partial transcript to come back from the server.
//!
//! ## Algorithm
//!
//! A frame is *voiced* when its RMS amplitude exceeds the threshold.  Speech
//! onset is reported once `min_speech_frames` consecutive voiced frames have
//! been seen; the detector then stays latched until an unvoiced frame resets
//! it, so a single utterance produces a single onset.

/// Energy-based speech onset detector.
///
/// # Example
///
/// ```rust
/// use voice_duplex::audio::SpeechDetector;
///
/// let mut vad = SpeechDetector::new(0.01, 2);
/// assert!(!vad.push_frame(&[0.0; 160]));
/// assert!(!vad.push_frame(&[0.5; 160])); // first voiced frame
/// assert!(vad.push_frame(&[0.5; 160]));  // onset
/// assert!(!vad.push_frame(&[0.5; 160])); // latched
/// ```
#[derive(Debug, Clone)]
pub struct SpeechDetector {
    /// RMS amplitude threshold; frames at or below it are silence.
    rms_threshold: f32,
    min_speech_frames: u32,
    voiced_run: u32,
    latched: bool,
}

impl SpeechDetector {
    /// `rms_threshold` should be in `[0.0, 1.0]`; `0.01`–`0.05` is typical.
    pub fn new(rms_threshold: f32, min_speech_frames: u32) -> Self {
        Self {
            rms_threshold,
            min_speech_frames: min_speech_frames.max(1),
            voiced_run: 0,
            latched: false,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.rms_threshold
    }

    /// Root-mean-square amplitude of `frame` (0.0 for an empty frame).
    pub fn rms(frame: &[f32]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let mean_sq: f32 = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
        mean_sq.sqrt()
    }

    /// Feed one frame; returns `true` exactly once per detected onset.
    pub fn push_frame(&mut self, frame: &[f32]) -> bool {
        if Self::rms(frame) > self.rms_threshold {
            self.voiced_run = self.voiced_run.saturating_add(1);
        } else {
            self.voiced_run = 0;
            self.latched = false;
        }

        if !self.latched && self.voiced_run >= self.min_speech_frames {
            self.latched = true;
            return true;
        }
        false
    }

    /// Forget any partial run, e.g. when capture restarts.
    pub fn reset(&mut self) {
        self.voiced_run = 0;
        self.latched = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_never_triggers() {
        let mut vad = SpeechDetector::new(0.01, 1);
        for _ in 0..50 {
            assert!(!vad.push_frame(&[0.0; 480]));
        }
    }

    #[test]
    fn single_voiced_frame_is_not_enough() {
        let mut vad = SpeechDetector::new(0.01, 3);
        assert!(!vad.push_frame(&[0.5; 480]));
        assert!(!vad.push_frame(&[0.0; 480]));
        assert!(!vad.push_frame(&[0.5; 480]));
        assert!(!vad.push_frame(&[0.5; 480]));
        assert!(vad.push_frame(&[0.5; 480]));
    }

    #[test]
    fn new_onset_after_silence() {
        let mut vad = SpeechDetector::new(0.01, 1);
        assert!(vad.push_frame(&[0.5; 480]));
        assert!(!vad.push_frame(&[0.5; 480]));
        assert!(!vad.push_frame(&[0.0; 480]));
        assert!(vad.push_frame(&[0.5; 480]));
    }

    #[test]
    fn reset_clears_run() {
        let mut vad = SpeechDetector::new(0.01, 2);
        assert!(!vad.push_frame(&[0.5; 480]));
        vad.reset();
        assert!(!vad.push_frame(&[0.5; 480]));
        assert!(vad.push_frame(&[0.5; 480]));
    }

    #[test]
    fn rms_of_constant_signal() {
        assert!((SpeechDetector::rms(&[0.5; 100]) - 0.5).abs() < 1e-6);
        assert_eq!(SpeechDetector::rms(&[]), 0.0);
    }

    #[test]
    fn threshold_reported() {
        let vad = SpeechDetector::new(0.03, 2);
        assert!((vad.threshold() - 0.03).abs() < f32::EPSILON);
    }

    #[test]
    fn zero_min_frames_is_treated_as_one() {
        let mut vad = SpeechDetector::new(0.01, 0);
        assert!(vad.push_frame(&[0.5; 10]));
    }
}
