//! Turn state machine and shared session status.
//!
//! [`TurnMachine`] decides who is talking.  It is pure: every
//! [`TurnEvent`] returns the [`TurnAction`]s the runner must carry out
//! (start/stop the microphone, interrupt playback, tell the relay).
//!
//! [`SessionStatus`] is the single snapshot a front end reads.
//! [`SharedStatus`] is a type alias for `Arc<Mutex<SessionStatus>>`, cheap to
//! clone and safe to share across threads.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::playback::QualityTier;

// ---------------------------------------------------------------------------
// TurnState
// ---------------------------------------------------------------------------

/// Conversation turn.
///
/// ```text
/// Idle ──start listening──▶ Listening ──end of turn──▶ AwaitingResponse
///   │                          ▲                             │
///   │ response audio           │ barge-in            response audio
///   ▼                          │                             ▼
/// Speaking ◀───────────────────┴──────────────────────── Speaking
/// Speaking ──playback complete──▶ Listening (continuous, capturing) | Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    /// The microphone is streaming the user's turn.
    Listening,
    /// The user finished; waiting for the first response audio.
    AwaitingResponse,
    /// Response audio is playing.
    Speaking,
}

impl TurnState {
    /// Short label for status displays.
    ///
    /// ```
    /// use voice_duplex::session::TurnState;
    ///
    /// assert_eq!(TurnState::AwaitingResponse.label(), "Thinking");
    /// ```
    pub fn label(&self) -> &'static str {
        match self {
            TurnState::Idle => "Idle",
            TurnState::Listening => "Listening",
            TurnState::AwaitingResponse => "Thinking",
            TurnState::Speaking => "Speaking",
        }
    }
}

// ---------------------------------------------------------------------------
// TurnEvent / TurnAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// The user wants to talk.
    StartListening,
    /// The user leaves the conversation.
    StopListening,
    /// End of the user's turn (final transcript or explicit request).
    TurnEnded,
    /// First audio of a new response context arrived.
    ResponseAudioStarted,
    /// The response finished playing.
    PlaybackComplete,
    /// Playback was cleared without completing (server request, superseded).
    PlaybackCleared,
    /// The user started talking over the response.
    BargeIn,
    /// Repeated decode failures forced a playback reset.
    RepeatedDecodeFailure,
    /// A microphone or output device could not be acquired.
    DeviceUnavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnAction {
    StartCapture,
    StopCapture,
    /// Stop the scheduler and tell the relay to drop the context.
    InterruptPlayback,
    /// Show a message to the user.
    Notify(String),
}

// ---------------------------------------------------------------------------
// TurnMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TurnMachine {
    state: TurnState,
    /// Re-enter `Listening` when a response finishes.
    continuous: bool,
    capturing: bool,
}

impl TurnMachine {
    pub fn new(continuous: bool) -> Self {
        Self {
            state: TurnState::Idle,
            continuous,
            capturing: false,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Whether capture frames should currently be sent.
    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn handle(&mut self, event: TurnEvent) -> Vec<TurnAction> {
        use TurnState::*;

        let mut actions = Vec::new();
        let from = self.state;

        match (from, event) {
            (Idle, TurnEvent::StartListening) => self.listen(&mut actions),
            (Speaking, TurnEvent::StartListening | TurnEvent::BargeIn) => {
                actions.push(TurnAction::InterruptPlayback);
                self.listen(&mut actions);
            }
            (_, TurnEvent::StartListening | TurnEvent::BargeIn) => {}

            (_, TurnEvent::StopListening) => {
                if from == Speaking {
                    actions.push(TurnAction::InterruptPlayback);
                }
                self.idle(&mut actions);
            }

            (Listening, TurnEvent::TurnEnded) => self.state = AwaitingResponse,
            (_, TurnEvent::TurnEnded) => {}

            (Idle | Listening | AwaitingResponse, TurnEvent::ResponseAudioStarted) => {
                self.state = Speaking
            }
            (Speaking, TurnEvent::ResponseAudioStarted) => {}

            (Speaking, TurnEvent::PlaybackComplete | TurnEvent::PlaybackCleared) => {
                self.after_response(&mut actions)
            }
            (_, TurnEvent::PlaybackComplete | TurnEvent::PlaybackCleared) => {}

            (_, TurnEvent::RepeatedDecodeFailure) => {
                actions.push(TurnAction::Notify(
                    "Response audio could not be decoded and was skipped".into(),
                ));
                if from == Speaking {
                    self.after_response(&mut actions);
                }
            }

            (_, TurnEvent::DeviceUnavailable(reason)) => {
                if from == Speaking {
                    actions.push(TurnAction::InterruptPlayback);
                }
                actions.push(TurnAction::Notify(format!("Audio device unavailable: {reason}")));
                self.idle(&mut actions);
            }
        }

        if self.state != from {
            log::debug!("turn: {:?} → {:?}", from, self.state);
        }
        actions
    }

    fn listen(&mut self, actions: &mut Vec<TurnAction>) {
        if !self.capturing {
            self.capturing = true;
            actions.push(TurnAction::StartCapture);
        }
        self.state = TurnState::Listening;
    }

    fn idle(&mut self, actions: &mut Vec<TurnAction>) {
        if self.capturing {
            self.capturing = false;
            actions.push(TurnAction::StopCapture);
        }
        self.state = TurnState::Idle;
    }

    /// Continuous conversations keep listening; a response heard while the
    /// user was not in a conversation leaves the machine idle.
    fn after_response(&mut self, actions: &mut Vec<TurnAction>) {
        if self.continuous && self.capturing {
            self.state = TurnState::Listening;
        } else {
            self.idle(actions);
        }
    }
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Everything a front end needs to display the session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStatus {
    pub turn: TurnState,
    /// Relay session id once created or joined.
    pub session_id: Option<String>,
    /// Context currently being played.
    pub context_id: Option<String>,
    pub tier: QualityTier,
    pub lead_secs: f64,
    pub prebuffer: usize,
    /// Dropouts counted for the current context.
    pub dropouts: u32,
    pub partial_transcript: String,
    pub last_transcript: Option<String>,
    /// Response text streamed so far for the current turn.
    pub response_text: String,
    /// Latest user-visible notice (errors, device problems).
    pub last_notice: Option<String>,
}

/// Thread-safe handle to [`SessionStatus`].
///
/// Lock for a short critical section; do **not** hold the lock across
/// `.await` points.
pub type SharedStatus = Arc<Mutex<SessionStatus>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(Mutex::new(SessionStatus::default()))
}

/// Lock `status`, recovering the data if a previous holder panicked.
pub fn lock_status(status: &SharedStatus) -> MutexGuard<'_, SessionStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
