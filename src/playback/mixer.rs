//! Scheduled-buffer audio sink.
//!
//! [`Mixer`] is a timeline of [`PlaybackNode`]s placed at absolute times on
//! the output device clock.  The clock is the number of frames rendered so
//! far, so it advances only when the device (or a test) pulls audio.  That
//! makes the mixer the single source of "now" for the scheduler.
//!
//! The scheduler talks to it through [`AudioSink`]; the cpal output callback
//! renders it through [`SharedMixer`], which never waits on the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

/// Handle of a scheduled node.
pub type NodeId = u64;

// ---------------------------------------------------------------------------
// NodeSpec / PlaybackNode
// ---------------------------------------------------------------------------

/// Everything needed to place one decoded buffer on the timeline.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Interleaved samples.
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Playback speed multiplier.
    pub rate: f64,
    /// Absolute start time (seconds on the device clock).
    pub start: f64,
    /// Length of the initial gain ramp from zero (seconds).
    pub fade_in: f64,
}

/// One buffer on the timeline.
#[derive(Debug, Clone)]
pub struct PlaybackNode {
    id: NodeId,
    samples: Vec<f32>,
    channels: usize,
    frames: usize,
    /// Source frames consumed per second of device time.
    step: f64,
    start: f64,
    end: f64,
    fade_in: f64,
    fade_out: Option<(f64, f64)>,
}

impl PlaybackNode {
    fn new(id: NodeId, spec: NodeSpec) -> Self {
        let channels = usize::from(spec.channels.max(1));
        let frames = spec.samples.len() / channels;
        let rate = if spec.rate > 0.0 { spec.rate } else { 1.0 };
        let step = f64::from(spec.sample_rate.max(1)) * rate;
        Self {
            id,
            samples: spec.samples,
            channels,
            frames,
            step,
            start: spec.start,
            end: spec.start + frames as f64 / step,
            fade_in: spec.fade_in.max(0.0),
            fade_out: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    /// Time at which the node stops producing sound.
    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn fade_in(&self) -> f64 {
        self.fade_in
    }

    /// Fade-out window `(from, until)` if one has been set.
    pub fn fade_out(&self) -> Option<(f64, f64)> {
        self.fade_out
    }

    /// Envelope gain at absolute time `t`.
    pub fn gain_at(&self, t: f64) -> f32 {
        let g_in = if self.fade_in > 0.0 {
            ((t - self.start) / self.fade_in).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let g_out = match self.fade_out {
            Some((from, until)) if t >= from => {
                if until > from {
                    ((until - t) / (until - from)).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }
            _ => 1.0,
        };
        g_in.min(g_out) as f32
    }

    /// Linearly interpolated sample of source channel `channel` at `t`.
    fn sample_at(&self, t: f64, channel: usize) -> f32 {
        let pos = (t - self.start) * self.step;
        if pos < 0.0 || self.frames == 0 {
            return 0.0;
        }
        let idx = pos.floor() as usize;
        if idx >= self.frames {
            return 0.0;
        }
        let frac = (pos - idx as f64) as f32;
        let next = (idx + 1).min(self.frames - 1);
        let a = self.samples[idx * self.channels + channel];
        let b = self.samples[next * self.channels + channel];
        a + (b - a) * frac
    }

    /// Sample for output channel `out_c` of an `out_channels` device.
    fn output_sample(&self, t: f64, out_c: usize, out_channels: usize) -> f32 {
        if out_channels == 1 && self.channels > 1 {
            let sum: f32 = (0..self.channels).map(|c| self.sample_at(t, c)).sum();
            sum / self.channels as f32
        } else {
            self.sample_at(t, out_c.min(self.channels - 1))
        }
    }
}

// ---------------------------------------------------------------------------
// AudioSink
// ---------------------------------------------------------------------------

/// Scheduled-buffer output as seen by the scheduler.
pub trait AudioSink {
    /// Current device time in seconds.
    fn current_time(&self) -> f64;

    /// Place a buffer on the timeline.
    fn schedule(&mut self, spec: NodeSpec) -> NodeId;

    /// Ramp `node` down to silence between `from` and `until`.
    fn ramp_out(&mut self, node: NodeId, from: f64, until: f64);

    /// Stop `node`.  A node that has not started yet is removed outright; a
    /// sounding node fades out over `fade` seconds from now.
    fn stop(&mut self, node: NodeId, fade: f64);
}

// ---------------------------------------------------------------------------
// Mixer
// ---------------------------------------------------------------------------

/// Sample-clock timeline that mixes every scheduled node.
#[derive(Debug)]
pub struct Mixer {
    sample_rate: u32,
    channels: u16,
    frames_rendered: u64,
    next_id: NodeId,
    nodes: Vec<PlaybackNode>,
}

impl Mixer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            frames_rendered: 0,
            next_id: 1,
            nodes: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Nodes that are scheduled or still sounding, in scheduling order.
    pub fn nodes(&self) -> &[PlaybackNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&PlaybackNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn time_of(&self, frame: u64) -> f64 {
        frame as f64 / f64::from(self.sample_rate)
    }

    /// Mix the next `out.len() / channels` frames into `out` (interleaved).
    pub fn render(&mut self, out: &mut [f32]) {
        let channels = usize::from(self.channels);
        out.fill(0.0);
        let frames = out.len() / channels;

        if !self.nodes.is_empty() {
            for (f, frame) in out.chunks_exact_mut(channels).enumerate() {
                let t = self.time_of(self.frames_rendered + f as u64);
                for node in &self.nodes {
                    if t < node.start || t >= node.end {
                        continue;
                    }
                    let gain = node.gain_at(t);
                    if gain == 0.0 {
                        continue;
                    }
                    for (c, out) in frame.iter_mut().enumerate() {
                        *out += node.output_sample(t, c, channels) * gain;
                    }
                }
                for out in frame.iter_mut() {
                    *out = out.clamp(-1.0, 1.0);
                }
            }
        }

        self.frames_rendered += frames as u64;
        self.prune();
    }

    /// Advance the clock by `frames` without producing output.
    pub fn skip_frames(&mut self, frames: u64) {
        if frames == 0 {
            return;
        }
        self.frames_rendered += frames;
        self.prune();
    }

    /// Render and discard `secs` of audio; returns the mixed samples.
    ///
    /// Mainly used to drive the clock deterministically.
    pub fn advance_secs(&mut self, secs: f64) -> Vec<f32> {
        let frames = (secs * f64::from(self.sample_rate)).round().max(0.0) as usize;
        let mut buf = vec![0.0; frames * usize::from(self.channels)];
        self.render(&mut buf);
        buf
    }

    fn prune(&mut self) {
        let now = self.time_of(self.frames_rendered);
        self.nodes.retain(|n| n.end > now);
    }
}

impl AudioSink for Mixer {
    fn current_time(&self) -> f64 {
        self.time_of(self.frames_rendered)
    }

    fn schedule(&mut self, spec: NodeSpec) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.push(PlaybackNode::new(id, spec));
        id
    }

    fn ramp_out(&mut self, node: NodeId, from: f64, until: f64) {
        if let Some(n) = self.nodes.iter_mut().find(|n| n.id == node) {
            let earlier = n.fade_out.map_or(true, |(_, existing)| until < existing);
            if earlier {
                n.fade_out = Some((from, until));
                n.end = n.end.min(until.max(from));
            }
        }
    }

    fn stop(&mut self, node: NodeId, fade: f64) {
        let now = self.current_time();
        let Some(pos) = self.nodes.iter().position(|n| n.id == node) else {
            return;
        };
        if self.nodes[pos].start >= now || fade <= 0.0 {
            self.nodes.remove(pos);
        } else {
            self.ramp_out(node, now, now + fade);
        }
    }
}

// ---------------------------------------------------------------------------
// SharedMixer
// ---------------------------------------------------------------------------

/// Thread-safe handle to a [`Mixer`] shared by the scheduler and the device
/// callback.
///
/// Cheap to clone.  The render side uses `try_lock`: if the scheduler holds
/// the lock the callback emits silence and the skipped frames are added to
/// the clock on the next successful render, so time stays locked to the
/// device.
#[derive(Debug, Clone)]
pub struct SharedMixer {
    inner: Arc<Mutex<Mixer>>,
    missed_frames: Arc<AtomicU64>,
    channels: usize,
}

impl SharedMixer {
    pub fn new(mixer: Mixer) -> Self {
        let channels = usize::from(mixer.channels());
        Self {
            inner: Arc::new(Mutex::new(mixer)),
            missed_frames: Arc::new(AtomicU64::new(0)),
            channels,
        }
    }

    /// Lock the mixer, recovering from a poisoned lock.
    pub fn lock(&self) -> MutexGuard<'_, Mixer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Render from the device callback without blocking.
    pub fn render(&self, out: &mut [f32]) {
        let mut mixer = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => {
                out.fill(0.0);
                self.missed_frames
                    .fetch_add((out.len() / self.channels) as u64, Ordering::Relaxed);
                return;
            }
        };
        let missed = self.missed_frames.swap(0, Ordering::Relaxed);
        mixer.skip_frames(missed);
        mixer.render(out);
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock().sample_rate()
    }
}

impl AudioSink for SharedMixer {
    fn current_time(&self) -> f64 {
        let mixer = self.lock();
        let missed = self.missed_frames.load(Ordering::Relaxed);
        mixer.time_of(mixer.frames_rendered + missed)
    }

    fn schedule(&mut self, spec: NodeSpec) -> NodeId {
        self.lock().schedule(spec)
    }

    fn ramp_out(&mut self, node: NodeId, from: f64, until: f64) {
        self.lock().ramp_out(node, from, until);
    }

    fn stop(&mut self, node: NodeId, fade: f64) {
        self.lock().stop(node, fade);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
