//! Jitter buffer and playback scheduler.
//!
//! The [`Scheduler`] owns every piece of mutable streaming state: the active
//! synthesis context, the buffering queue, the playhead, the decoder's
//! remembered format and the adaptive controller.  It is driven by exactly
//! three entry points, all called from the same single-threaded loop:
//!
//! * [`Scheduler::on_fragment`] when an inbound fragment arrives,
//! * [`Scheduler::on_tick`] on the periodic device tick,
//! * [`Scheduler::reset`] / [`Scheduler::clear_context`] for interruption.
//!
//! Each returns the [`PlaybackEvent`]s it produced so the caller can react
//! (turn state, status display) without the scheduler knowing about it.
//!
//! ## State machine
//!
//! ```text
//!   Idle ──new context──▶ Buffering ──prebuffer / preroll / final──▶ Playing
//!    ▲                                                                  │
//!    │                                                   final fragment │
//!    └──────── completion deadline reached ◀──────── Finalizing ◀───────┘
//!
//!   any state ──new context id / reset / repeated decode failure──▶ Idle
//! ```
//!
//! Interrupted, cleared and superseded contexts are retired: their late
//! fragments are ignored.  A context that completes normally is not, so the
//! relay may reuse its id for the next response.
//!
//! ## Scheduling rule
//!
//! While the playhead has not passed the previous fragment's end, the next
//! fragment is chained onto it, overlapping by
//! `min(crossfade_secs, 10% of the shorter fragment)`.  The outgoing node
//! ramps to zero over the overlap while the incoming node ramps up, so
//! consecutive fragments never leave a gap.  Otherwise the fragment starts
//! `lead_secs` ahead of the playhead.

use std::collections::VecDeque;

use crate::config::{AdaptiveConfig, PlaybackConfig};

use super::adaptive::{AdaptiveController, QualityTier};
use super::decoder::{DecodeError, FragmentDecoder};
use super::fragment::{AudioFragment, ContextId, InboundFragment};
use super::mixer::{AudioSink, NodeId, NodeSpec};

// ---------------------------------------------------------------------------
// PlaybackState / PlaybackEvent
// ---------------------------------------------------------------------------

/// Lifecycle of the active synthesis context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No active context.
    Idle,
    /// Fragments are queued, nothing scheduled yet.
    Buffering,
    /// Fragments are scheduled as they arrive.
    Playing,
    /// The final fragment is scheduled; waiting for the audio to drain.
    Finalizing,
}

/// Something the scheduler did that the session may care about.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    ContextStarted {
        context_id: ContextId,
    },
    PlaybackStarted {
        context_id: ContextId,
    },
    FragmentScheduled {
        context_id: ContextId,
        node: NodeId,
        start: f64,
        end: f64,
    },
    FragmentDropped {
        context_id: ContextId,
        error: DecodeError,
    },
    /// The playhead ran past the last scheduled audio while playing.
    Underrun {
        context_id: ContextId,
    },
    QualityChanged {
        tier: QualityTier,
        lead_secs: f64,
        prebuffer: usize,
    },
    PlaybackComplete {
        context_id: ContextId,
    },
    Interrupted {
        context_id: ContextId,
    },
    /// A fragment for a different context replaced the active one.  The old
    /// context is stopped exactly as on interruption, but the response as a
    /// whole carries on with `by`.
    Superseded {
        context_id: ContextId,
        by: ContextId,
    },
    RepeatedDecodeFailure {
        context_id: ContextId,
        failures: u32,
    },
}

// ---------------------------------------------------------------------------
// Internal bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ActiveContext {
    id: ContextId,
    /// End time of the most recently scheduled fragment.
    last_end: Option<f64>,
    /// Node and effective duration of the most recently scheduled fragment.
    last_node: Option<(NodeId, f64)>,
    consecutive_failures: u32,
    buffering_since: f64,
    /// An underrun has already been counted for the current starvation.
    starved: bool,
}

#[derive(Debug)]
struct QueuedFragment {
    fragment: AudioFragment,
    arrived_at: f64,
}

/// A node handed to the sink, tracked until its end time passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledNode {
    pub id: NodeId,
    pub start: f64,
    pub end: f64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Owner of all playback state for one output sink.
pub struct Scheduler<S: AudioSink> {
    sink: S,
    config: PlaybackConfig,
    decoder: FragmentDecoder,
    adaptive: AdaptiveController,
    state: PlaybackState,
    context: Option<ActiveContext>,
    queue: VecDeque<QueuedFragment>,
    nodes: Vec<ScheduledNode>,
    completion_deadline: Option<f64>,
    retired: VecDeque<ContextId>,
}

impl<S: AudioSink> Scheduler<S> {
    pub fn new(sink: S, config: PlaybackConfig, adaptive: AdaptiveConfig) -> Self {
        Self {
            decoder: FragmentDecoder::new(config.edge_fade_samples),
            adaptive: AdaptiveController::new(adaptive),
            sink,
            config,
            state: PlaybackState::Idle,
            context: None,
            queue: VecDeque::new(),
            nodes: Vec::new(),
            completion_deadline: None,
            retired: VecDeque::new(),
        }
    }

    // ---- Accessors ---------------------------------------------------------

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn context_id(&self) -> Option<&ContextId> {
        self.context.as_ref().map(|c| &c.id)
    }

    pub fn adaptive(&self) -> &AdaptiveController {
        &self.adaptive
    }

    pub fn decoder(&self) -> &FragmentDecoder {
        &self.decoder
    }

    /// Fragments waiting in the buffering queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Nodes scheduled for the active context that have not finished yet.
    pub fn scheduled_nodes(&self) -> &[ScheduledNode] {
        &self.nodes
    }

    pub fn last_scheduled_end(&self) -> Option<f64> {
        self.context.as_ref().and_then(|c| c.last_end)
    }

    pub fn completion_deadline(&self) -> Option<f64> {
        self.completion_deadline
    }

    pub fn is_retired(&self, id: &ContextId) -> bool {
        self.retired.contains(id)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Current time on the output clock.
    pub fn now(&self) -> f64 {
        self.sink.current_time()
    }

    // ---- Entry points ------------------------------------------------------

    /// Handle one inbound fragment observed at `arrived_at` (output clock).
    pub fn on_fragment(&mut self, fragment: InboundFragment, arrived_at: f64) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();

        if self.is_retired(&fragment.context_id) {
            log::debug!("scheduler: dropping fragment for stale context {}", fragment.context_id);
            return events;
        }

        let superseded = self
            .context
            .as_ref()
            .is_some_and(|c| c.id != fragment.context_id);
        if superseded {
            if let Some(previous) = self.stop_context() {
                log::info!("scheduler: context {previous} superseded by {}", fragment.context_id);
                events.push(PlaybackEvent::Superseded {
                    context_id: previous,
                    by: fragment.context_id.clone(),
                });
            }
        }

        if self.context.is_none() {
            self.start_context(fragment.context_id.clone(), &mut events);
        } else if self.state == PlaybackState::Finalizing {
            log::debug!(
                "scheduler: context {} already finalizing, dropping late fragment",
                fragment.context_id
            );
            return events;
        }

        // A bare final message carries no audio and just closes the context.
        if fragment.payload.is_empty() && fragment.is_final {
            self.finish(&mut events);
            return events;
        }

        match self.decoder.decode(&fragment) {
            Ok(audio) => {
                if let Some(ctx) = self.context.as_mut() {
                    ctx.consecutive_failures = 0;
                }
                let is_final = audio.is_final;
                if audio.frames() > 0 {
                    self.accept(audio, arrived_at, &mut events);
                }
                if is_final {
                    self.finish(&mut events);
                }
            }
            Err(error) => self.decode_failed(&fragment, error, &mut events),
        }

        events
    }

    /// Periodic device tick: preroll timeout, underrun detection and the
    /// completion timer.
    pub fn on_tick(&mut self) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        let now = self.now();
        self.nodes.retain(|n| n.end > now);

        match self.state {
            PlaybackState::Idle => {}
            PlaybackState::Buffering => {
                let waited = self
                    .context
                    .as_ref()
                    .map_or(0.0, |c| now - c.buffering_since);
                if !self.queue.is_empty() && waited >= self.config.preroll_secs {
                    log::debug!("scheduler: preroll elapsed after {waited:.3}s");
                    self.flush(&mut events);
                }
            }
            PlaybackState::Playing => {
                if let Some(ctx) = self.context.as_mut() {
                    let starving = ctx.last_end.is_some_and(|end| now > end);
                    if starving && !ctx.starved {
                        ctx.starved = true;
                        self.adaptive.record_dropout();
                        log::warn!("scheduler: underrun in context {}", ctx.id);
                        events.push(PlaybackEvent::Underrun {
                            context_id: ctx.id.clone(),
                        });
                    }
                }
            }
            PlaybackState::Finalizing => {
                if self.completion_deadline.is_some_and(|deadline| now >= deadline) {
                    self.complete(&mut events);
                }
            }
        }

        events
    }

    /// Interrupt whatever is playing.  Safe from any state; a no-op when
    /// already idle.
    pub fn reset(&mut self) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        self.interrupt(&mut events);
        events
    }

    /// Clear one context (or the active one when `id` is `None`).
    ///
    /// Clearing a context that is not active only marks it stale so any of
    /// its fragments that arrive later are ignored.
    pub fn clear_context(&mut self, id: Option<&ContextId>) -> Vec<PlaybackEvent> {
        match id {
            Some(id) if self.context_id() != Some(id) => {
                self.retire(id.clone());
                Vec::new()
            }
            _ => self.reset(),
        }
    }

    // ---- Context lifecycle -------------------------------------------------

    fn start_context(&mut self, id: ContextId, events: &mut Vec<PlaybackEvent>) {
        let now = self.now();
        self.adaptive.reset_metrics();
        self.decoder.reset();
        self.queue.clear();
        self.nodes.clear();
        self.completion_deadline = None;
        log::info!(
            "scheduler: context {id} started (lead {:.3}s, prebuffer {})",
            self.adaptive.lead_secs(),
            self.adaptive.prebuffer()
        );
        events.push(PlaybackEvent::ContextStarted {
            context_id: id.clone(),
        });
        self.context = Some(ActiveContext {
            id,
            last_end: None,
            last_node: None,
            consecutive_failures: 0,
            buffering_since: now,
            starved: false,
        });
        self.state = PlaybackState::Buffering;
    }

    /// Final fragment handled: flush anything still buffered and arm the
    /// completion timer.
    fn finish(&mut self, events: &mut Vec<PlaybackEvent>) {
        if self.state == PlaybackState::Buffering {
            self.flush(events);
        }
        let now = self.now();
        let deadline = self.last_scheduled_end().unwrap_or(now).max(now);
        self.completion_deadline = Some(deadline);
        self.state = PlaybackState::Finalizing;
        log::debug!("scheduler: finalizing, playback ends at {deadline:.3}s");
    }

    fn complete(&mut self, events: &mut Vec<PlaybackEvent>) {
        let Some(ctx) = self.context.take() else {
            return;
        };
        self.queue.clear();
        self.nodes.clear();
        self.decoder.reset();
        self.completion_deadline = None;
        self.state = PlaybackState::Idle;
        log::info!("scheduler: context {} playback complete", ctx.id);
        events.push(PlaybackEvent::PlaybackComplete { context_id: ctx.id });
    }

    fn interrupt(&mut self, events: &mut Vec<PlaybackEvent>) {
        if let Some(id) = self.stop_context() {
            log::info!("scheduler: context {id} interrupted");
            events.push(PlaybackEvent::Interrupted { context_id: id });
        }
    }

    /// Tear down the active context and retire its id.  Returns the id, or
    /// `None` when nothing was active.
    fn stop_context(&mut self) -> Option<ContextId> {
        let ctx = self.context.take()?;
        let now = self.now();
        let fade = self.config.interrupt_fade_secs;
        for node in self.nodes.drain(..) {
            if node.end <= now {
                continue;
            }
            // Pending nodes vanish; sounding ones get a short fade-out.
            let fade = if node.start >= now { 0.0 } else { fade };
            self.sink.stop(node.id, fade);
        }
        let dropped = self.queue.len();
        self.queue.clear();
        self.decoder.reset();
        self.completion_deadline = None;
        self.state = PlaybackState::Idle;
        if dropped > 0 {
            log::debug!("scheduler: {dropped} queued fragments of {} discarded", ctx.id);
        }
        self.retire(ctx.id.clone());
        Some(ctx.id)
    }

    fn retire(&mut self, id: ContextId) {
        if self.retired.contains(&id) {
            return;
        }
        let cap = self.config.retired_context_memory.max(1);
        while self.retired.len() >= cap {
            self.retired.pop_front();
        }
        self.retired.push_back(id);
    }

    // ---- Fragment handling -------------------------------------------------

    fn decode_failed(
        &mut self,
        fragment: &InboundFragment,
        error: DecodeError,
        events: &mut Vec<PlaybackEvent>,
    ) {
        log::warn!(
            "scheduler: dropping undecodable fragment for {} ({} bytes): {error}",
            fragment.context_id,
            fragment.payload.len()
        );
        self.adaptive.record_dropout();
        events.push(PlaybackEvent::FragmentDropped {
            context_id: fragment.context_id.clone(),
            error,
        });

        let failures = match self.context.as_mut() {
            Some(ctx) => {
                ctx.consecutive_failures += 1;
                ctx.consecutive_failures
            }
            None => return,
        };
        if failures >= self.config.max_consecutive_decode_failures.max(1) {
            log::error!(
                "scheduler: {failures} consecutive decode failures in {}, resetting",
                fragment.context_id
            );
            events.push(PlaybackEvent::RepeatedDecodeFailure {
                context_id: fragment.context_id.clone(),
                failures,
            });
            self.interrupt(events);
        } else if fragment.is_final {
            self.finish(events);
        }
    }

    fn accept(&mut self, audio: AudioFragment, arrived_at: f64, events: &mut Vec<PlaybackEvent>) {
        match self.state {
            PlaybackState::Buffering => {
                let cap = self.config.max_queued_fragments.max(1);
                while self.queue.len() >= cap {
                    self.queue.pop_front();
                    self.adaptive.record_dropout();
                    log::warn!("scheduler: buffering queue full, dropped oldest fragment");
                }
                self.queue.push_back(QueuedFragment {
                    fragment: audio,
                    arrived_at,
                });

                let now = self.now();
                let waited = self
                    .context
                    .as_ref()
                    .map_or(0.0, |c| now - c.buffering_since);
                if self.queue.len() >= self.adaptive.prebuffer()
                    || waited >= self.config.preroll_secs
                {
                    self.flush(events);
                }
            }
            PlaybackState::Playing => self.schedule(audio, arrived_at, events),
            PlaybackState::Idle | PlaybackState::Finalizing => {}
        }
    }

    /// Leave `Buffering`: schedule every queued fragment in arrival order.
    fn flush(&mut self, events: &mut Vec<PlaybackEvent>) {
        let Some(id) = self.context_id().cloned() else {
            return;
        };
        self.state = PlaybackState::Playing;
        log::debug!(
            "scheduler: starting playback of {id} with {} buffered fragments",
            self.queue.len()
        );
        events.push(PlaybackEvent::PlaybackStarted { context_id: id });
        while let Some(queued) = self.queue.pop_front() {
            self.schedule(queued.fragment, queued.arrived_at, events);
        }
    }

    fn schedule(&mut self, audio: AudioFragment, arrived_at: f64, events: &mut Vec<PlaybackEvent>) {
        let now = self.now();
        let lead = self.adaptive.lead_secs();
        let rate = if self.config.playback_rate > 0.0 {
            self.config.playback_rate
        } else {
            1.0
        };
        let duration = audio.duration_secs() / rate;
        let crossfade = self.config.crossfade_secs.max(0.0);

        let Some(ctx) = self.context.as_mut() else {
            return;
        };

        let mut chained_from = None;
        let mut start = match (ctx.last_end, ctx.last_node) {
            (Some(end), Some((prev, prev_duration))) if end >= now => {
                chained_from = Some((prev, end));
                end - crossfade.min(0.1 * prev_duration.min(duration))
            }
            (last_end, _) => {
                if last_end.is_some() && !ctx.starved {
                    self.adaptive.record_dropout();
                    log::warn!("scheduler: underrun in context {}", ctx.id);
                }
                now + lead
            }
        };
        if start < now {
            log::debug!("scheduler: overrun, start {start:.4}s is behind {now:.4}s");
            self.adaptive.record_dropout();
            start = now;
        }
        let overlap = chained_from.map_or(0.0, |(_, prev_end)| (prev_end - start).max(0.0));

        let context_id = audio.context_id.clone();
        let node = self.sink.schedule(NodeSpec {
            samples: audio.samples,
            channels: audio.channels,
            sample_rate: audio.sample_rate,
            rate,
            start,
            fade_in: overlap,
        });
        if let Some((prev, prev_end)) = chained_from {
            if overlap > 0.0 {
                self.sink.ramp_out(prev, start, prev_end);
            }
        }

        let end = start + duration;
        ctx.last_end = Some(end);
        ctx.last_node = Some((node, duration));
        ctx.starved = false;
        self.nodes.push(ScheduledNode { id: node, start, end });

        if let Some(tier) = self.adaptive.observe(start - arrived_at) {
            events.push(PlaybackEvent::QualityChanged {
                tier,
                lead_secs: self.adaptive.lead_secs(),
                prebuffer: self.adaptive.prebuffer(),
            });
        }
        log::trace!("scheduler: {context_id} node {node} at {start:.4}s..{end:.4}s");
        events.push(PlaybackEvent::FragmentScheduled {
            context_id,
            node,
            start,
            end,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
