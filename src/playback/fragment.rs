//! Fragment types shared by the decoder and the scheduler.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one synthesized utterance.
///
/// Fragments with the same id belong to one continuous stream and play in
/// arrival order; a new id supersedes whatever was playing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ContextId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A fragment as it arrives from the relay, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFragment {
    pub context_id: ContextId,
    /// Raw audio bytes (already base64-decoded).
    pub payload: Vec<u8>,
    /// Last fragment of the context.
    pub is_final: bool,
}

impl InboundFragment {
    pub fn new(context_id: impl Into<ContextId>, payload: Vec<u8>, is_final: bool) -> Self {
        Self {
            context_id: context_id.into(),
            payload,
            is_final,
        }
    }
}

/// A decoded fragment ready for scheduling.
///
/// Produced once by the decoder and consumed once by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFragment {
    pub context_id: ContextId,
    /// Interleaved samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Interleaved channel count (≥ 1).
    pub channels: u16,
    pub sample_rate: u32,
    pub is_final: bool,
}

impl AudioFragment {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Natural-speed duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_id_conversions() {
        let a: ContextId = "ctx-1".into();
        let b = ContextId::from(String::from("ctx-1"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "ctx-1");
        assert_eq!(a.to_string(), "ctx-1");
    }

    #[test]
    fn context_id_serializes_as_plain_string() {
        let id = ContextId::new("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn fragment_duration() {
        let frag = AudioFragment {
            context_id: "a".into(),
            samples: vec![0.0; 44_100 * 2],
            channels: 2,
            sample_rate: 44_100,
            is_final: false,
        };
        assert_eq!(frag.frames(), 44_100);
        assert!((frag.duration_secs() - 1.0).abs() < 1e-12);
    }
}
