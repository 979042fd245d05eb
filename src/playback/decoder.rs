//! Fragment decoding: opaque bytes → linear PCM.
//!
//! The synthesis service sends a small WAV container on the first fragment of
//! a context and headerless PCM on the continuations.  [`FragmentDecoder`]
//! remembers the format it learned from the header ([`FormatState`]) and
//! applies it to later fragments of the *same* context only.
//!
//! Decode order for one fragment:
//!
//! 1. RIFF/WAVE header present → parse it, store the format, decode the
//!    payload after the header.  A header that starts with `RIFF` but does
//!    not parse is a failure; it never falls through to the other steps.
//! 2. Format known for this context → the whole buffer is PCM.  Bytes that do
//!    not make up a complete frame are kept for the next continuation.
//! 3. Otherwise try a self-contained MPEG audio stream (`minimp3`).
//! 4. Otherwise fail.  The decoder never guesses a PCM format.
//!
//! Every decoded buffer gets a short linear ramp at both ends so fragment
//! boundaries do not click.

use std::io::Cursor;

use thiserror::Error;

use super::fragment::{AudioFragment, ContextId, InboundFragment};

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

/// Why a fragment could not be turned into samples.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed WAV header: {0}")]
    MalformedHeader(&'static str),

    #[error("unsupported sample format: tag {tag:#06x}, {bits} bits")]
    UnsupportedFormat { tag: u16, bits: u16 },

    #[error("headerless fragment with no format context")]
    NoFormatContext,

    #[error("MPEG decode failed: {0}")]
    Mpeg(String),
}

// ---------------------------------------------------------------------------
// FormatState
// ---------------------------------------------------------------------------

/// PCM layout learned from a container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatState {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub is_float: bool,
}

impl FormatState {
    fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    /// Bytes in one interleaved frame.
    pub fn frame_bytes(&self) -> usize {
        self.bytes_per_sample() * usize::from(self.channels)
    }

    fn validate(&self, tag: u16) -> Result<(), DecodeError> {
        if self.channels == 0 {
            return Err(DecodeError::MalformedHeader("zero channels"));
        }
        if self.sample_rate == 0 {
            return Err(DecodeError::MalformedHeader("zero sample rate"));
        }
        let supported = match (self.is_float, self.bits_per_sample) {
            (false, 16 | 24 | 32) => true,
            (true, 32) => true,
            _ => false,
        };
        if supported {
            Ok(())
        } else {
            Err(DecodeError::UnsupportedFormat {
                tag,
                bits: self.bits_per_sample,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// WAV header parsing
// ---------------------------------------------------------------------------

/// Result of parsing a RIFF/WAVE header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub format: FormatState,
    /// Offset of the first PCM byte.
    pub data_offset: usize,
    /// Bytes of PCM after `data_offset` that belong to the data chunk.
    pub data_len: usize,
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Parse a RIFF/WAVE header at the start of `bytes`.
///
/// Returns `Ok(None)` when the buffer does not start with `RIFF` at all.
/// Streaming writers leave the data size at 0 or `0xFFFFFFFF`; both mean
/// "the rest of the buffer".
pub fn parse_wav_header(bytes: &[u8]) -> Result<Option<WavHeader>, DecodeError> {
    if !bytes.starts_with(b"RIFF") {
        return Ok(None);
    }
    if bytes.get(8..12) != Some(b"WAVE".as_slice()) {
        return Err(DecodeError::MalformedHeader("missing WAVE form type"));
    }

    let mut pos = 12;
    let mut format = None;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = read_u32(bytes, pos + 4).unwrap_or(0);
        let body = pos + 8;

        match id {
            b"fmt " => {
                if size < 16 {
                    return Err(DecodeError::MalformedHeader("fmt chunk too short"));
                }
                let field = |off: usize| {
                    read_u16(bytes, body + off)
                        .ok_or(DecodeError::MalformedHeader("truncated fmt chunk"))
                };
                let mut tag = field(0)?;
                let channels = field(2)?;
                let sample_rate = read_u32(bytes, body + 4)
                    .ok_or(DecodeError::MalformedHeader("truncated fmt chunk"))?;
                let bits_per_sample = field(14)?;
                if tag == WAVE_FORMAT_EXTENSIBLE {
                    // The real format tag leads the sub-format GUID.
                    if size < 40 {
                        return Err(DecodeError::MalformedHeader("extensible fmt too short"));
                    }
                    tag = field(24)?;
                }
                let is_float = match tag {
                    WAVE_FORMAT_PCM => false,
                    WAVE_FORMAT_IEEE_FLOAT => true,
                    other => {
                        return Err(DecodeError::UnsupportedFormat {
                            tag: other,
                            bits: bits_per_sample,
                        })
                    }
                };
                let state = FormatState {
                    channels,
                    sample_rate,
                    bits_per_sample,
                    is_float,
                };
                state.validate(tag)?;
                format = Some(state);
            }
            b"data" => {
                let format = format.ok_or(DecodeError::MalformedHeader("data before fmt"))?;
                let remaining = bytes.len() - body;
                let declared = size as usize;
                let data_len = if size == 0 || size == u32::MAX || declared > remaining {
                    remaining
                } else {
                    declared
                };
                return Ok(Some(WavHeader {
                    format,
                    data_offset: body,
                    data_len,
                }));
            }
            _ => {}
        }

        // Chunks are word aligned.
        pos = body
            .saturating_add(size as usize)
            .saturating_add((size & 1) as usize);
    }

    Err(DecodeError::MalformedHeader("missing data chunk"))
}

// ---------------------------------------------------------------------------
// PCM conversion
// ---------------------------------------------------------------------------

/// Decode whole little-endian interleaved frames of `bytes`; trailing bytes
/// that do not form a complete frame are ignored.
pub fn decode_pcm(bytes: &[u8], format: &FormatState) -> Vec<f32> {
    let frame_bytes = format.frame_bytes();
    if frame_bytes == 0 {
        return Vec::new();
    }
    let usable = bytes.len() - bytes.len() % frame_bytes;
    let bytes = &bytes[..usable];

    match (format.is_float, format.bits_per_sample) {
        (false, 16) => bytes
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0)
            .collect(),
        (false, 24) => bytes
            .chunks_exact(3)
            .map(|b| {
                // Sign-extend by parking the 24 bits at the top of an i32.
                let v = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
                v as f32 / 8_388_608.0
            })
            .collect(),
        (false, 32) => bytes
            .chunks_exact(4)
            .map(|b| (f64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])) / 2_147_483_648.0) as f32)
            .collect(),
        (true, 32) => bytes
            .chunks_exact(4)
            .map(|b| {
                let v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                if v.is_finite() {
                    v.clamp(-1.0, 1.0)
                } else {
                    0.0
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Apply a linear fade-in and fade-out of up to `fade_frames` frames.
///
/// The ramp is shortened to half the buffer for very short fragments.
pub fn apply_edge_fades(samples: &mut [f32], channels: u16, fade_frames: usize) {
    let channels = usize::from(channels.max(1));
    let frames = samples.len() / channels;
    let n = fade_frames.min(frames / 2);
    if n == 0 {
        return;
    }
    for i in 0..n {
        let gain = i as f32 / n as f32;
        let head = i * channels;
        let tail = (frames - 1 - i) * channels;
        for c in 0..channels {
            samples[head + c] *= gain;
            samples[tail + c] *= gain;
        }
    }
}

/// Decode a self-contained MPEG audio stream.
fn decode_mpeg(bytes: &[u8]) -> Result<Option<(Vec<f32>, u16, u32)>, DecodeError> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut samples = Vec::new();
    let mut layout: Option<(u16, u32)> = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                let channels = frame.channels as u16;
                let rate = frame.sample_rate.max(0) as u32;
                match layout {
                    None => layout = Some((channels, rate)),
                    Some(l) if l != (channels, rate) => {
                        log::debug!("decoder: MPEG layout changed mid-stream, stopping");
                        break;
                    }
                    Some(_) => {}
                }
                samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32_768.0));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(DecodeError::Mpeg(e.to_string())),
        }
    }

    Ok(layout
        .filter(|(channels, rate)| *channels > 0 && *rate > 0)
        .map(|(channels, rate)| (samples, channels, rate)))
}

// ---------------------------------------------------------------------------
// FragmentDecoder
// ---------------------------------------------------------------------------

/// Stateful decoder for one stream of fragments.
///
/// Owned by the scheduler; [`reset`](Self::reset) on every context switch.
#[derive(Debug)]
pub struct FragmentDecoder {
    edge_fade_frames: usize,
    format: Option<(ContextId, FormatState)>,
    /// Partial frame left over from the previous continuation.
    remainder: Vec<u8>,
}

impl FragmentDecoder {
    pub fn new(edge_fade_frames: usize) -> Self {
        Self {
            edge_fade_frames,
            format: None,
            remainder: Vec::new(),
        }
    }

    /// Format remembered for `context`, if any.
    pub fn format_for(&self, context: &ContextId) -> Option<FormatState> {
        match &self.format {
            Some((owner, format)) if owner == context => Some(*format),
            _ => None,
        }
    }

    /// Forget the remembered format and any partial frame.
    pub fn reset(&mut self) {
        self.format = None;
        self.remainder.clear();
    }

    /// Decode one fragment.
    ///
    /// A successful result may carry zero frames (a header-only fragment);
    /// it still updates the format state.
    pub fn decode(&mut self, fragment: &InboundFragment) -> Result<AudioFragment, DecodeError> {
        let bytes = fragment.payload.as_slice();

        let (mut samples, channels, sample_rate) = if let Some(header) = parse_wav_header(bytes)? {
            let format = header.format;
            self.format = Some((fragment.context_id.clone(), format));
            self.remainder.clear();

            let data = &bytes[header.data_offset..header.data_offset + header.data_len];
            let whole = data.len() - data.len() % format.frame_bytes();
            self.remainder.extend_from_slice(&data[whole..]);
            (decode_pcm(&data[..whole], &format), format.channels, format.sample_rate)
        } else if let Some(format) = self.format_for(&fragment.context_id) {
            let mut data = std::mem::take(&mut self.remainder);
            data.extend_from_slice(bytes);
            let whole = data.len() - data.len() % format.frame_bytes();
            self.remainder = data.split_off(whole);
            (decode_pcm(&data, &format), format.channels, format.sample_rate)
        } else {
            match decode_mpeg(bytes)? {
                Some(decoded) => decoded,
                None => return Err(DecodeError::NoFormatContext),
            }
        };

        apply_edge_fades(&mut samples, channels, self.edge_fade_frames);

        Ok(AudioFragment {
            context_id: fragment.context_id.clone(),
            samples,
            channels,
            sample_rate,
            is_final: fragment.is_final,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Canonical 44-byte PCM WAV header followed by `pcm`.
    pub(crate) fn wav_bytes(channels: u16, sample_rate: u32, bits: u16, pcm: &[u8]) -> Vec<u8> {
        let block_align = channels * bits / 8;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + pcm.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&WAVE_FORMAT_PCM.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * u32::from(block_align)).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
        out.extend_from_slice(pcm);
        out
    }

    /// `n` mono PCM16 samples of a constant, MPEG-sync-free value.
    pub(crate) fn pcm16(n: usize, value: i16) -> Vec<u8> {
        (0..n).flat_map(|_| value.to_le_bytes()).collect()
    }

    fn no_fades() -> FragmentDecoder {
        FragmentDecoder::new(0)
    }

    #[test]
    fn non_riff_is_not_a_header() {
        assert_eq!(parse_wav_header(b"hello world").unwrap(), None);
    }

    #[test]
    fn parses_canonical_header() {
        let bytes = wav_bytes(1, 44_100, 16, &pcm16(100, 1000));
        let header = parse_wav_header(&bytes).unwrap().unwrap();
        assert_eq!(header.data_offset, 44);
        assert_eq!(header.data_len, 200);
        assert_eq!(
            header.format,
            FormatState {
                channels: 1,
                sample_rate: 44_100,
                bits_per_sample: 16,
                is_float: false
            }
        );
    }

    #[test]
    fn streaming_data_size_means_rest_of_buffer() {
        let mut bytes = wav_bytes(1, 24_000, 16, &pcm16(10, 5));
        bytes[40..44].copy_from_slice(&u32::MAX.to_le_bytes());
        let header = parse_wav_header(&bytes).unwrap().unwrap();
        assert_eq!(header.data_len, 20);
    }

    #[test]
    fn skips_unknown_chunks() {
        let plain = wav_bytes(1, 16_000, 16, &pcm16(4, 7));
        // Insert an odd-sized LIST chunk (with pad byte) between fmt and data.
        let mut bytes = plain[..36].to_vec();
        bytes.extend_from_slice(b"LIST");
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 0]);
        bytes.extend_from_slice(&plain[36..]);

        let header = parse_wav_header(&bytes).unwrap().unwrap();
        assert_eq!(header.data_offset, 56);
        assert_eq!(header.data_len, 8);
    }

    #[test]
    fn corrupt_header_is_an_error() {
        let mut bytes = wav_bytes(1, 16_000, 16, &pcm16(4, 7));
        bytes[8..12].copy_from_slice(b"JUNK");
        assert!(matches!(
            parse_wav_header(&bytes),
            Err(DecodeError::MalformedHeader(_))
        ));
    }

    #[test]
    fn unsupported_bit_depth_is_rejected() {
        let bytes = wav_bytes(1, 16_000, 8, &[128; 16]);
        assert!(matches!(
            parse_wav_header(&bytes),
            Err(DecodeError::UnsupportedFormat { bits: 8, .. })
        ));
    }

    #[test]
    fn decodes_all_supported_depths() {
        let f16 = FormatState { channels: 1, sample_rate: 8_000, bits_per_sample: 16, is_float: false };
        assert_eq!(decode_pcm(&i16::MIN.to_le_bytes(), &f16), vec![-1.0]);

        let f24 = FormatState { bits_per_sample: 24, ..f16 };
        // 0x400000 = half scale positive; 0xC00000 = half scale negative.
        let out = decode_pcm(&[0x00, 0x00, 0x40, 0x00, 0x00, 0xC0], &f24);
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[1] + 0.5).abs() < 1e-6);

        let f32i = FormatState { bits_per_sample: 32, ..f16 };
        let out = decode_pcm(&(i32::MAX / 2).to_le_bytes(), &f32i);
        assert!((out[0] - 0.5).abs() < 1e-6);

        let f32f = FormatState { bits_per_sample: 32, is_float: true, ..f16 };
        let out = decode_pcm(&[0.25f32.to_le_bytes(), 4.0f32.to_le_bytes()].concat(), &f32f);
        assert_eq!(out, vec![0.25, 1.0]);
    }

    #[test]
    fn pcm_is_normalised_to_unit_range() {
        let f16 = FormatState { channels: 1, sample_rate: 8_000, bits_per_sample: 16, is_float: false };
        let out = decode_pcm(&[i16::MAX.to_le_bytes(), i16::MIN.to_le_bytes()].concat(), &f16);
        assert!(out.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn header_then_continuation_reuses_format() {
        let mut decoder = no_fades();
        let first = InboundFragment::new("a", wav_bytes(1, 22_050, 16, &pcm16(100, 1000)), false);
        let out = decoder.decode(&first).unwrap();
        assert_eq!(out.frames(), 100);
        assert_eq!(out.sample_rate, 22_050);

        let second = InboundFragment::new("a", pcm16(100, 1000), true);
        let out = decoder.decode(&second).unwrap();
        assert_eq!(out.frames(), 100);
        assert_eq!(out.sample_rate, 22_050);
        assert!(out.is_final);
    }

    #[test]
    fn format_is_not_reused_across_contexts() {
        let mut decoder = no_fades();
        let first = InboundFragment::new("a", wav_bytes(1, 22_050, 16, &pcm16(10, 1000)), false);
        decoder.decode(&first).unwrap();

        let other = InboundFragment::new("b", pcm16(10, 1000), false);
        assert_eq!(decoder.decode(&other), Err(DecodeError::NoFormatContext));
        assert!(decoder.format_for(&"b".into()).is_none());
    }

    #[test]
    fn reset_forgets_format() {
        let mut decoder = no_fades();
        let first = InboundFragment::new("a", wav_bytes(1, 22_050, 16, &pcm16(10, 1000)), false);
        decoder.decode(&first).unwrap();
        decoder.reset();

        let cont = InboundFragment::new("a", pcm16(10, 1000), false);
        assert_eq!(decoder.decode(&cont), Err(DecodeError::NoFormatContext));
    }

    #[test]
    fn partial_frames_carry_into_next_continuation() {
        let mut decoder = no_fades();
        let first = InboundFragment::new("a", wav_bytes(2, 16_000, 16, &[]), false);
        assert_eq!(decoder.decode(&first).unwrap().frames(), 0);

        // One stereo frame is 4 bytes; send 6, then 2.
        let out = decoder.decode(&InboundFragment::new("a", vec![0x10; 6], false)).unwrap();
        assert_eq!(out.frames(), 1);
        let out = decoder.decode(&InboundFragment::new("a", vec![0x10; 2], false)).unwrap();
        assert_eq!(out.frames(), 1);
    }

    #[test]
    fn headerless_without_context_is_never_guessed() {
        let mut decoder = no_fades();
        let frag = InboundFragment::new("a", pcm16(100, 0x0101), false);
        assert_eq!(decoder.decode(&frag), Err(DecodeError::NoFormatContext));
    }

    #[test]
    fn edge_fades_ramp_both_ends() {
        let mut samples = vec![1.0_f32; 100];
        apply_edge_fades(&mut samples, 1, 10);
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[99], 0.0);
        assert!((samples[5] - 0.5).abs() < 1e-6);
        assert_eq!(samples[50], 1.0);
    }

    #[test]
    fn edge_fades_shrink_for_tiny_buffers() {
        let mut samples = vec![1.0_f32; 4];
        apply_edge_fades(&mut samples, 1, 32);
        assert_eq!(samples, vec![0.0, 0.5, 0.5, 0.0]);
    }

    #[test]
    fn decoder_applies_fades() {
        let mut decoder = FragmentDecoder::new(8);
        let frag = InboundFragment::new("a", wav_bytes(1, 16_000, 16, &pcm16(64, 16_384)), false);
        let out = decoder.decode(&frag).unwrap();
        assert_eq!(out.samples[0], 0.0);
        assert!((out.samples[32] - 0.5).abs() < 1e-6);
    }
}
