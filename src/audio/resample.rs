//! Sample-rate conversion and channel mixing for the capture path.
//!
//! The transcription service requires **16 kHz mono** audio.  This module
//! provides the two conversion steps:
//!
//! 1. [`downmix_to_mono`]: average any number of interleaved channels.
//! 2. [`resample`]: block-averaging decimation from any source rate.
//!
//! ## Carry
//!
//! Output sample `i` is the mean of the input samples whose absolute index
//! lies in `[floor(i * in / out), floor((i + 1) * in / out))`.  The bin
//! boundaries are computed from absolute sample counters kept in
//! [`ResampleState`], so input that does not complete a bin is carried to the
//! next call instead of being dropped or re-phased.  Feeding a stream in
//! arbitrary block sizes therefore produces exactly the same output as
//! feeding it in one piece.
//!
//! When the output rate is higher than the input rate a bin can be empty;
//! it then repeats the sample under its start position (sample-and-hold).

// ---------------------------------------------------------------------------
// downmix_to_mono
// ---------------------------------------------------------------------------

/// Mix interleaved multi-channel audio down to mono by averaging all channels.
///
/// The output length is `samples.len() / channels`; a trailing partial frame
/// is ignored.
///
/// * If `channels == 1` the input slice is returned as an owned `Vec`.
/// * If `channels == 0` an empty vector is returned.
///
/// # Example
///
/// ```rust
/// use voice_duplex::audio::downmix_to_mono;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, 0.4]; // L R L R
/// let mono = downmix_to_mono(&stereo, 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[0] - 0.0).abs() < 1e-6);
/// assert!((mono[1] - 0.3).abs() < 1e-6);
/// ```
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// ResampleState
// ---------------------------------------------------------------------------

/// Carry state threaded through successive [`resample`] calls.
///
/// One state belongs to one continuous stream; create a fresh one when a new
/// recording starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResampleState {
    /// Input samples belonging to the first bin not yet emitted.
    carry: Vec<f32>,
    /// Absolute input index of `carry[0]`.
    carry_start: u64,
    /// Number of output samples emitted so far.
    produced: u64,
}

impl ResampleState {
    /// Fresh state for a new stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples currently held back waiting for the rest of their bin.
    pub fn carried(&self) -> &[f32] {
        &self.carry
    }
}

// ---------------------------------------------------------------------------
// resample
// ---------------------------------------------------------------------------

/// Resample one block of mono `input` from `input_rate` to `output_rate`.
///
/// * Equal rates return the input unchanged and leave `state` untouched.
/// * Empty input returns an empty block and leaves `state` untouched.
/// * A zero rate is treated as "no conversion possible" and returns an empty
///   block.
///
/// # Example
///
/// ```rust
/// use voice_duplex::audio::{resample, ResampleState};
///
/// let mut state = ResampleState::new();
/// // 48 kHz → 16 kHz averages every three samples.
/// let out = resample(&[0.3, 0.6, 0.9, 0.0, 0.0, 0.3, 1.0], 48_000, 16_000, &mut state);
/// assert_eq!(out.len(), 2);
/// assert!((out[0] - 0.6).abs() < 1e-6);
/// assert!((out[1] - 0.1).abs() < 1e-6);
/// // The seventh sample waits for its bin to fill.
/// assert_eq!(state.carried(), &[1.0]);
/// ```
pub fn resample(
    input: &[f32],
    input_rate: u32,
    output_rate: u32,
    state: &mut ResampleState,
) -> Vec<f32> {
    if input_rate == output_rate {
        return input.to_vec();
    }
    if input.is_empty() || input_rate == 0 || output_rate == 0 {
        return Vec::new();
    }

    let in_rate = u64::from(input_rate);
    let out_rate = u64::from(output_rate);

    let mut combined = std::mem::take(&mut state.carry);
    combined.extend_from_slice(input);
    let available_end = state.carry_start + combined.len() as u64;

    let bin_start = |i: u64| i * in_rate / out_rate;

    let mut output = Vec::with_capacity((input.len() as u64 * out_rate / in_rate + 1) as usize);
    loop {
        let start = bin_start(state.produced);
        let end = bin_start(state.produced + 1);
        // An empty bin still needs the sample it holds.
        if end.max(start + 1) > available_end {
            break;
        }

        let lo = (start - state.carry_start) as usize;
        let sample = if end > start {
            let hi = (end - state.carry_start) as usize;
            let bin = &combined[lo..hi];
            bin.iter().sum::<f32>() / bin.len() as f32
        } else {
            combined[lo]
        };
        output.push(sample);
        state.produced += 1;
    }

    let next_start = bin_start(state.produced);
    let keep_from = (next_start - state.carry_start) as usize;
    combined.drain(..keep_from.min(combined.len()));
    state.carry = combined;
    state.carry_start = next_start;

    output
}

// ---------------------------------------------------------------------------
// Resampler
// ---------------------------------------------------------------------------

/// Stateful adapter around [`resample`] for a fixed rate pair.
#[derive(Debug, Clone)]
pub struct Resampler {
    input_rate: u32,
    output_rate: u32,
    state: ResampleState,
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            input_rate,
            output_rate,
            state: ResampleState::new(),
        }
    }

    /// Convert the next block of the stream.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        resample(input, self.input_rate, self.output_rate, &mut self.state)
    }

    /// Samples carried into the next call.
    pub fn carried(&self) -> usize {
        self.state.carried().len()
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i % 97) as f32 / 97.0) - 0.5).collect()
    }

    // ---- downmix_to_mono ---------------------------------------------------

    #[test]
    fn downmix_already_mono() {
        let input = vec![0.1_f32, 0.2, 0.3];
        assert_eq!(downmix_to_mono(&input, 1), input);
    }

    #[test]
    fn downmix_two_channel() {
        let out = downmix_to_mono(&[1.0_f32, -1.0, 0.5, 0.5], 2);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn downmix_ignores_partial_frame() {
        let out = downmix_to_mono(&[0.2_f32, 0.4, 0.9], 2);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn downmix_zero_channels() {
        assert!(downmix_to_mono(&[1.0_f32, 2.0], 0).is_empty());
    }

    // ---- resample ----------------------------------------------------------

    #[test]
    fn equal_rates_are_identity() {
        let input = ramp(333);
        let mut state = ResampleState::new();
        let out = resample(&input, 16_000, 16_000, &mut state);
        assert_eq!(out, input);
        assert_eq!(state, ResampleState::new());
    }

    #[test]
    fn empty_input_leaves_carry_unchanged() {
        let mut state = ResampleState::new();
        let _ = resample(&[0.1, 0.2, 0.3, 0.4], 48_000, 16_000, &mut state);
        let before = state.clone();

        let out = resample(&[], 48_000, 16_000, &mut state);
        assert!(out.is_empty());
        assert_eq!(state, before);
    }

    #[test]
    fn integer_ratio_averages_bins() {
        let mut state = ResampleState::new();
        let out = resample(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 48_000, 16_000, &mut state);
        assert_eq!(out, vec![2.0, 5.0]);
        assert!(state.carried().is_empty());
    }

    #[test]
    fn one_second_at_44100_yields_16000() {
        let mut state = ResampleState::new();
        let out = resample(&vec![0.0; 44_100], 44_100, 16_000, &mut state);
        assert_eq!(out.len(), 16_000);
        assert!(state.carried().is_empty());
    }

    #[test]
    fn constant_signal_preserves_amplitude() {
        let mut state = ResampleState::new();
        let out = resample(&vec![0.5_f32; 4_410], 44_100, 16_000, &mut state);
        for &s in &out {
            assert!((s - 0.5).abs() < 1e-5, "amplitude drift: {s}");
        }
    }

    #[test]
    fn upsampling_holds_samples() {
        let mut state = ResampleState::new();
        let out = resample(&[0.1, 0.2, 0.3, 0.4], 8_000, 16_000, &mut state);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3, 0.4, 0.4]);
    }

    #[test]
    fn misaligned_callback_blocks_match_single_call() {
        let input = ramp(48_000);
        let mut whole_state = ResampleState::new();
        let whole = resample(&input, 48_000, 16_000, &mut whole_state);

        let mut split_state = ResampleState::new();
        let mut split = Vec::new();
        for block in input.chunks(441) {
            split.extend(resample(block, 48_000, 16_000, &mut split_state));
        }
        assert_eq!(whole, split);
    }

    #[test]
    fn resampler_adapter_tracks_carry() {
        let mut r = Resampler::new(44_100, 16_000);
        let out = r.process(&[0.25; 10]);
        // bins start at 0, 2, 5, 8, 11 → three complete bins, two samples held.
        assert_eq!(out.len(), 3);
        assert_eq!(r.carried(), 2);
        assert_eq!(r.input_rate(), 44_100);
        assert_eq!(r.output_rate(), 16_000);
    }

    proptest! {
        #[test]
        fn split_blocks_equal_concatenation(
            len in 0usize..4_000,
            split in 0usize..4_000,
            rate_idx in 0usize..5,
        ) {
            let rates = [8_000u32, 22_050, 44_100, 48_000, 96_000];
            let in_rate = rates[rate_idx];
            let input = ramp(len);
            let split = split.min(len);

            let mut one = ResampleState::new();
            let whole = resample(&input, in_rate, 16_000, &mut one);

            let mut two = ResampleState::new();
            let mut parts = resample(&input[..split], in_rate, 16_000, &mut two);
            parts.extend(resample(&input[split..], in_rate, 16_000, &mut two));

            prop_assert!(whole.len().abs_diff(parts.len()) <= 1);
            for (a, b) in whole.iter().zip(parts.iter()) {
                prop_assert!((a - b).abs() < 1e-5);
            }
        }
    }
}
