//! cpal output stream that renders the shared [`Mixer`].
//!
//! The device callback is the only thing that advances the mixer clock, so
//! the scheduler's notion of "now" is the device's own playback position.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;

use crate::playback::{Mixer, SharedMixer};

use super::capture::f32_to_pcm16;

// ---------------------------------------------------------------------------
// OutputError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("no output device found on the default audio host")]
    NoDevice,

    #[error("output device {0:?} not found")]
    DeviceNotFound(String),

    #[error("failed to enumerate output devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("failed to query default output config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported output sample format {0}")]
    UnsupportedFormat(String),
}

// ---------------------------------------------------------------------------
// OutputStream
// ---------------------------------------------------------------------------

/// A running output stream.  Dropping it stops playback.
pub struct OutputStream {
    _stream: cpal::Stream,
    mixer: SharedMixer,
    sample_rate: u32,
    channels: u16,
}

impl OutputStream {
    /// Open `device` (or the default output) and start rendering a fresh
    /// mixer at the device's native rate and channel count.
    pub fn open(device: Option<&str>) -> Result<Self, OutputError> {
        let device = select_output_device(device)?;
        let supported = device.default_output_config()?;
        let sample_format = supported.sample_format();
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let stream_config: cpal::StreamConfig = supported.into();

        log::info!(
            "output: {} @ {sample_rate} Hz, {channels} ch, {sample_format:?}",
            device.name().unwrap_or_else(|_| "<unknown>".into())
        );

        let mixer = SharedMixer::new(Mixer::new(sample_rate, channels));
        let on_error = |err: cpal::StreamError| log::error!("output: cpal stream error: {err}");

        let stream = match sample_format {
            cpal::SampleFormat::F32 => {
                let mixer = mixer.clone();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| mixer.render(data),
                    on_error,
                    None,
                )?
            }
            cpal::SampleFormat::I16 => {
                let mixer = mixer.clone();
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0);
                        mixer.render(&mut scratch);
                        for (out, &s) in data.iter_mut().zip(&scratch) {
                            *out = f32_to_pcm16(s);
                        }
                    },
                    on_error,
                    None,
                )?
            }
            cpal::SampleFormat::U16 => {
                let mixer = mixer.clone();
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0);
                        mixer.render(&mut scratch);
                        for (out, &s) in data.iter_mut().zip(&scratch) {
                            *out = f32_to_pcm_u16(s);
                        }
                    },
                    on_error,
                    None,
                )?
            }
            other => return Err(OutputError::UnsupportedFormat(format!("{other:?}"))),
        };

        stream.play()?;
        Ok(Self {
            _stream: stream,
            mixer,
            sample_rate,
            channels,
        })
    }

    /// Handle to the mixer this stream renders.
    pub fn mixer(&self) -> SharedMixer {
        self.mixer.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

fn select_output_device(name: Option<&str>) -> Result<cpal::Device, OutputError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| OutputError::DeviceNotFound(name.to_owned())),
        None => host.default_output_device().ok_or(OutputError::NoDevice),
    }
}

/// Offset-binary 16-bit sample.
fn f32_to_pcm_u16(sample: f32) -> u16 {
    (i32::from(f32_to_pcm16(sample)) + 32_768) as u16
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
