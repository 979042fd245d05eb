//! Session runner: the single-threaded event loop of a conversation.
//!
//! [`SessionRunner`] owns the [`Scheduler`], the [`TurnMachine`] and the
//! capture source, and multiplexes four stimuli with `tokio::select!`:
//!
//! ```text
//! inbound relay message ─┐
//! user command ──────────┤
//! capture frame ─────────┼─▶ SessionRunner ─▶ Scheduler / TurnMachine
//! device tick ───────────┘         │
//!                                  └─▶ OutboundMessage (relay writer)
//!                                  └─▶ SharedStatus   (front end)
//! ```
//!
//! Because fragment handling and the tick run on the same task, the
//! scheduler never needs a lock of its own.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::audio::{CaptureFrame, CaptureSource, SpeechDetector};
use crate::config::AppConfig;
use crate::playback::{AudioSink, PlaybackEvent, Scheduler};

use super::messages::{ControlMessage, InboundMessage, OutboundMessage};
use super::state::{lock_status, SharedStatus, TurnAction, TurnEvent, TurnMachine, TurnState};

// ---------------------------------------------------------------------------
// SessionCommand
// ---------------------------------------------------------------------------

/// Requests from the local user (keyboard, UI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    StartListening,
    /// The user finished speaking.
    EndTurn,
    StopListening,
    /// Talk over the response.
    BargeIn,
    Shutdown,
}

// ---------------------------------------------------------------------------
// SessionRunner
// ---------------------------------------------------------------------------

/// Drives one conversation until the relay closes or shutdown is requested.
///
/// ```rust,no_run
/// use tokio::sync::mpsc;
/// use voice_duplex::audio::MicrophoneSource;
/// use voice_duplex::config::AppConfig;
/// use voice_duplex::playback::{Mixer, SharedMixer};
/// use voice_duplex::session::{new_shared_status, SessionRunner};
///
/// # async fn example() {
/// let config = AppConfig::default();
/// let mixer = SharedMixer::new(Mixer::new(48_000, 2));
/// let (out_tx, _out_rx) = mpsc::unbounded_channel();
/// let (_in_tx, in_rx) = mpsc::channel(64);
/// let (_cmd_tx, cmd_rx) = mpsc::channel(8);
///
/// let runner = SessionRunner::new(
///     &config,
///     mixer,
///     MicrophoneSource::new(config.capture.clone()),
///     out_tx,
///     new_shared_status(),
/// );
/// runner.run(in_rx, cmd_rx).await;
/// # }
/// ```
pub struct SessionRunner<S: AudioSink, C: CaptureSource> {
    scheduler: Scheduler<S>,
    turn: TurnMachine,
    capture: C,
    capture_rate: u32,
    frame_samples: usize,
    tick: Duration,
    vad: Option<SpeechDetector>,
    frame_tx: mpsc::UnboundedSender<CaptureFrame>,
    frame_rx: Option<mpsc::UnboundedReceiver<CaptureFrame>>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    status: SharedStatus,
}

impl<S: AudioSink, C: CaptureSource> SessionRunner<S, C> {
    pub fn new(
        config: &AppConfig,
        sink: S,
        capture: C,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        status: SharedStatus,
    ) -> Self {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let conversation = &config.conversation;
        let vad = conversation.local_barge_in.then(|| {
            SpeechDetector::new(conversation.vad_threshold, conversation.vad_min_speech_frames)
        });
        let runner = Self {
            scheduler: Scheduler::new(sink, config.playback.clone(), config.adaptive.clone()),
            turn: TurnMachine::new(conversation.continuous),
            capture,
            capture_rate: config.capture.target_sample_rate,
            frame_samples: config.capture.frame_samples,
            tick: Duration::from_millis(config.playback.tick_ms.max(1)),
            vad,
            frame_tx,
            frame_rx: Some(frame_rx),
            outbound,
            status,
        };
        runner.refresh_status();
        runner
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler<S> {
        &mut self.scheduler
    }

    pub fn turn_state(&self) -> TurnState {
        self.turn.state()
    }

    pub fn capture(&self) -> &C {
        &self.capture
    }

    // -----------------------------------------------------------------------
    // Main async loop
    // -----------------------------------------------------------------------

    /// Run until `inbound` closes or [`SessionCommand::Shutdown`] arrives.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) {
        let Some(mut frames) = self.frame_rx.take() else {
            log::error!("session: runner already started");
            return;
        };
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_inbound(msg),
                    None => {
                        log::info!("session: relay closed, shutting down");
                        break;
                    }
                },
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(SessionCommand::Shutdown) => {
                        log::info!("session: shutdown requested");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => commands_open = false,
                },
                Some(frame) = frames.recv() => self.handle_frame(frame),
                _ = tick.tick() => self.handle_tick(),
            }
        }

        self.shutdown();
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    pub fn handle_inbound(&mut self, msg: InboundMessage) {
        match msg {
            InboundMessage::SessionCreated { session_id }
            | InboundMessage::SessionJoined { session_id } => {
                log::info!("session: joined session {session_id}");
                lock_status(&self.status).session_id = Some(session_id);
            }
            InboundMessage::PartialTranscript { text } => {
                let speech = !text.trim().is_empty();
                lock_status(&self.status).partial_transcript = text;
                if speech && self.turn.state() == TurnState::Speaking {
                    log::info!("session: barge-in from partial transcript");
                    self.apply_turn(TurnEvent::BargeIn);
                }
            }
            InboundMessage::FinalTranscript { text } => {
                log::debug!("session: final transcript {text:?}");
                {
                    let mut st = lock_status(&self.status);
                    st.partial_transcript.clear();
                    st.response_text.clear();
                    st.last_transcript = Some(text);
                }
                self.apply_turn(TurnEvent::TurnEnded);
            }
            InboundMessage::ResponseToken { token } => {
                lock_status(&self.status).response_text.push_str(&token);
            }
            msg @ InboundMessage::AudioChunk { .. } => match msg.into_fragment() {
                Some(Ok(fragment)) => {
                    let now = self.scheduler.now();
                    let events = self.scheduler.on_fragment(fragment, now);
                    self.apply_playback(events);
                }
                Some(Err(e)) => log::warn!("session: dropping audio chunk: {e}"),
                None => {}
            },
            InboundMessage::ClearContext { context_id } => {
                let events = self.scheduler.clear_context(context_id.as_ref());
                self.apply_playback(events);
            }
            InboundMessage::Error { message } => {
                log::warn!("session: relay error: {message}");
                lock_status(&self.status).last_notice = Some(message);
            }
        }
        self.refresh_status();
    }

    pub fn handle_command(&mut self, cmd: SessionCommand) {
        log::debug!("session: command {cmd:?}");
        match cmd {
            SessionCommand::StartListening => self.apply_turn(TurnEvent::StartListening),
            SessionCommand::EndTurn => {
                if self.turn.state() == TurnState::Listening {
                    self.send(ControlMessage::TurnEnd);
                    self.apply_turn(TurnEvent::TurnEnded);
                }
            }
            SessionCommand::StopListening => self.apply_turn(TurnEvent::StopListening),
            SessionCommand::BargeIn => self.apply_turn(TurnEvent::BargeIn),
            SessionCommand::Shutdown => self.shutdown(),
        }
        self.refresh_status();
    }

    /// Forward one capture frame and run local barge-in detection.
    pub fn handle_frame(&mut self, frame: CaptureFrame) {
        if !self.turn.is_capturing() {
            return;
        }
        let speaking = self.turn.state() == TurnState::Speaking;
        let onset = match self.vad.as_mut() {
            Some(vad) => vad.push_frame(&frame.to_f32()),
            None => false,
        };
        self.emit(OutboundMessage::Audio(frame.to_le_bytes()));

        if onset && speaking {
            log::info!("session: barge-in from local speech");
            self.apply_turn(TurnEvent::BargeIn);
            self.refresh_status();
        }
    }

    pub fn handle_tick(&mut self) {
        let events = self.scheduler.on_tick();
        if !events.is_empty() {
            self.apply_playback(events);
        }
        self.refresh_status();
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn apply_playback(&mut self, events: Vec<PlaybackEvent>) {
        for event in events {
            match event {
                PlaybackEvent::ContextStarted { context_id } => {
                    lock_status(&self.status).context_id = Some(context_id.to_string());
                    self.apply_turn(TurnEvent::ResponseAudioStarted);
                }
                PlaybackEvent::PlaybackComplete { .. } => {
                    lock_status(&self.status).context_id = None;
                    self.apply_turn(TurnEvent::PlaybackComplete);
                }
                // The ContextStarted that follows keeps the turn in Speaking.
                PlaybackEvent::Superseded { context_id, by } => {
                    log::debug!("session: response moved from {context_id} to {by}");
                }
                PlaybackEvent::Interrupted { .. } => {
                    lock_status(&self.status).context_id = None;
                    self.apply_turn(TurnEvent::PlaybackCleared);
                }
                PlaybackEvent::RepeatedDecodeFailure { .. } => {
                    self.apply_turn(TurnEvent::RepeatedDecodeFailure);
                }
                PlaybackEvent::QualityChanged { tier, .. } => {
                    lock_status(&self.status).tier = tier;
                }
                PlaybackEvent::PlaybackStarted { .. }
                | PlaybackEvent::FragmentScheduled { .. }
                | PlaybackEvent::FragmentDropped { .. }
                | PlaybackEvent::Underrun { .. } => {}
            }
        }
    }

    fn apply_turn(&mut self, event: TurnEvent) {
        for action in self.turn.handle(event) {
            match action {
                TurnAction::StartCapture => self.start_capture(),
                TurnAction::StopCapture => self.stop_capture(),
                TurnAction::InterruptPlayback => {
                    let context_id = self.scheduler.context_id().cloned();
                    let events = self.scheduler.reset();
                    self.send(ControlMessage::Interrupt { context_id });
                    self.apply_playback(events);
                }
                TurnAction::Notify(message) => {
                    log::warn!("session: {message}");
                    lock_status(&self.status).last_notice = Some(message);
                }
            }
        }
    }

    fn start_capture(&mut self) {
        if self.capture.is_running() {
            return;
        }
        match self.capture.start(self.frame_tx.clone()) {
            Ok(()) => {
                if let Some(vad) = self.vad.as_mut() {
                    vad.reset();
                }
                self.send(ControlMessage::StartCapture {
                    sample_rate: self.capture_rate,
                    frame_samples: self.frame_samples,
                });
            }
            Err(e) => {
                log::error!("session: failed to start capture: {e}");
                self.apply_turn(TurnEvent::DeviceUnavailable(e.to_string()));
            }
        }
    }

    fn stop_capture(&mut self) {
        if self.capture.is_running() {
            self.capture.stop();
            self.send(ControlMessage::StopCapture);
        }
    }

    fn send(&self, msg: ControlMessage) {
        self.emit(OutboundMessage::Control(msg));
    }

    fn emit(&self, msg: OutboundMessage) {
        if self.outbound.send(msg).is_err() {
            log::debug!("session: outbound channel closed, message dropped");
        }
    }

    fn shutdown(&mut self) {
        let events = self.scheduler.reset();
        self.apply_playback(events);
        self.stop_capture();
        self.refresh_status();
    }

    fn refresh_status(&self) {
        let adaptive = self.scheduler.adaptive();
        let mut st = lock_status(&self.status);
        st.turn = self.turn.state();
        st.tier = adaptive.tier();
        st.lead_secs = adaptive.lead_secs();
        st.prebuffer = adaptive.prebuffer();
        st.dropouts = adaptive.metrics().dropouts();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
