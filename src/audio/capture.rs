//! Microphone capture: device blocks → 16 kHz mono PCM16 frames.
//!
//! [`CaptureSession`] is the pure part: downmix, resample with carry, clamp,
//! convert to signed 16-bit and cut fixed-size [`CaptureFrame`]s.  It has no
//! idea where its input comes from, which is what keeps the two device
//! realizations numerically identical.
//!
//! [`MicrophoneSource`] wraps the cpal host/device/stream lifecycle.  The cpal
//! stream is not `Send`, so it is built and owned by a dedicated
//! `audio-capture` thread that lives until [`CaptureSource::stop`].  In
//! [`CaptureMode::Worker`] the callback only copies raw blocks to a second
//! `capture-worker` thread that runs the session; in [`CaptureMode::Inline`]
//! the callback runs the session itself.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::resample::{downmix_to_mono, Resampler};
use crate::config::{CaptureConfig, CaptureMode};

// ---------------------------------------------------------------------------
// CaptureFrame
// ---------------------------------------------------------------------------

/// One outbound frame: mono 16 kHz signed 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFrame {
    pub samples: Vec<i16>,
}

impl CaptureFrame {
    /// Little-endian wire bytes, as sent to the transcription service.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Samples normalised back to `[-1.0, 1.0]`, for local analysis.
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| f32::from(s) / 32_768.0).collect()
    }
}

/// Convert a float sample to signed 16-bit after clamping to `[-1, 1]`.
///
/// Negative values scale by 32 768 and positive by 32 767 so both extremes
/// map exactly onto the i16 range.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32_768.0) as i16
    } else {
        (s * 32_767.0) as i16
    }
}

// ---------------------------------------------------------------------------
// CaptureSession
// ---------------------------------------------------------------------------

/// Per-recording capture state: resampler carry plus the frame accumulator.
///
/// Created when recording starts and dropped when it stops.
#[derive(Debug)]
pub struct CaptureSession {
    channels: u16,
    frame_samples: usize,
    resampler: Resampler,
    accumulator: Vec<i16>,
}

impl CaptureSession {
    pub fn new(input_rate: u32, channels: u16, config: &CaptureConfig) -> Self {
        let frame_samples = config.frame_samples.max(1);
        Self {
            channels,
            frame_samples,
            resampler: Resampler::new(input_rate, config.target_sample_rate),
            accumulator: Vec::with_capacity(frame_samples),
        }
    }

    /// Feed one interleaved device block; returns every frame it completed.
    pub fn push(&mut self, block: &[f32]) -> Vec<CaptureFrame> {
        let mono = downmix_to_mono(block, self.channels);
        let resampled = self.resampler.process(&mono);

        let mut frames = Vec::new();
        for sample in resampled {
            self.accumulator.push(f32_to_pcm16(sample));
            if self.accumulator.len() == self.frame_samples {
                let samples = std::mem::replace(
                    &mut self.accumulator,
                    Vec::with_capacity(self.frame_samples),
                );
                frames.push(CaptureFrame { samples });
            }
        }
        frames
    }

    /// Samples waiting for the current frame to fill.
    pub fn pending_samples(&self) -> usize {
        self.accumulator.len()
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors that can occur while setting up or running the audio capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("input device {0:?} not found")]
    DeviceNotFound(String),

    #[error("failed to enumerate input devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("failed to query default input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("capture thread failed: {0}")]
    Thread(String),
}

// ---------------------------------------------------------------------------
// CaptureSource
// ---------------------------------------------------------------------------

/// Something that can deliver capture frames on demand.
///
/// The session runner starts a source when the user turn begins and stops it
/// when the conversation goes idle.
pub trait CaptureSource {
    /// Begin delivering frames to `frames`.  Calling `start` on a running
    /// source restarts it with a fresh [`CaptureSession`].
    fn start(&mut self, frames: mpsc::UnboundedSender<CaptureFrame>) -> Result<(), CaptureError>;

    /// Stop delivering frames.  Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

// ---------------------------------------------------------------------------
// MicrophoneSource
// ---------------------------------------------------------------------------

/// Live capture from a cpal input device.
pub struct MicrophoneSource {
    config: CaptureConfig,
    running: Option<RunningCapture>,
}

struct RunningCapture {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl MicrophoneSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }
}

impl CaptureSource for MicrophoneSource {
    fn start(&mut self, frames: mpsc::UnboundedSender<CaptureFrame>) -> Result<(), CaptureError> {
        self.stop();

        let config = self.config.clone();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), CaptureError>>();

        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match open_input_stream(&config, frames) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until stop() or the source is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("capture: input stream closed");
            })
            .map_err(|e| CaptureError::Thread(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.running = Some(RunningCapture { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureError::Thread("capture thread exited early".into()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop_tx.send(());
            if running.thread.join().is_err() {
                log::warn!("capture: capture thread panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns the stream plus, in worker mode, the processing thread.
struct InputStream {
    stream: Option<cpal::Stream>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for InputStream {
    fn drop(&mut self) {
        // The stream owns the block sender; closing it ends the worker loop.
        drop(self.stream.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn select_input_device(config: &CaptureConfig) -> Result<cpal::Device, CaptureError> {
    let host = cpal::default_host();
    match &config.device {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().is_ok_and(|n| &n == name))
            .ok_or_else(|| CaptureError::DeviceNotFound(name.clone())),
        None => host.default_input_device().ok_or(CaptureError::NoDevice),
    }
}

fn open_input_stream(
    config: &CaptureConfig,
    frames: mpsc::UnboundedSender<CaptureFrame>,
) -> Result<InputStream, CaptureError> {
    let device = select_input_device(config)?;
    let supported = device.default_input_config()?;
    let channels = supported.channels();
    let sample_rate = supported.sample_rate().0;
    let stream_config: cpal::StreamConfig = supported.into();

    log::info!(
        "capture: {} @ {sample_rate} Hz, {channels} ch, {:?} mode",
        device.name().unwrap_or_else(|_| "<unknown>".into()),
        config.mode
    );

    let mut session = CaptureSession::new(sample_rate, channels, config);
    let on_error = |err: cpal::StreamError| log::error!("capture: cpal stream error: {err}");

    let (stream, worker) = match config.mode {
        CaptureMode::Inline => {
            let stream = device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for frame in session.push(data) {
                        // Receiver gone means the session is shutting down.
                        let _ = frames.send(frame);
                    }
                },
                on_error,
                None,
            )?;
            (stream, None)
        }
        CaptureMode::Worker => {
            let (block_tx, block_rx) = std_mpsc::channel::<Vec<f32>>();
            let worker = std::thread::Builder::new()
                .name("capture-worker".into())
                .spawn(move || {
                    while let Ok(block) = block_rx.recv() {
                        for frame in session.push(&block) {
                            let _ = frames.send(frame);
                        }
                    }
                })
                .map_err(|e| CaptureError::Thread(e.to_string()))?;
            let stream = device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let _ = block_tx.send(data.to_vec());
                },
                on_error,
                None,
            )?;
            (stream, Some(worker))
        }
    };

    stream.play()?;
    Ok(InputStream {
        stream: Some(stream),
        worker,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
