//! The live conversation context.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::adapters::Turn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    WakeDetected,
    Listening,
    Thinking,
    Speaking,
    Paused,
    Error,
    /// Audio pipeline torn down.
    Stopped,
}

impl SessionState {
    /// Wake (spoken or `trigger_wake`) is only actionable from these states.
    pub fn accepts_wake(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::WakeDetected => "wake_detected",
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
            SessionState::Paused => "paused",
            SessionState::Error => "error",
            SessionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session data. Mutated only by the session loop.
///
/// The epoch counter survives [`Session::clear`] so it stays monotonic
/// across agent restarts.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    epoch: u64,
    running: bool,
    turn: u64,
    current_transcript: Option<String>,
    current_response: Option<String>,
    history: Vec<Turn>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Stopped,
            epoch: 0,
            running: false,
            turn: 0,
            current_transcript: None,
            current_response: None,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of the turn in progress (or last finished).
    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn current_transcript(&self) -> Option<&str> {
        self.current_transcript.as_deref()
    }

    pub fn current_response(&self) -> Option<&str> {
        self.current_response.as_deref()
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// `true` when `epoch` still belongs to the current generation of work.
    pub fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }

    pub(crate) fn set_state(&mut self, state: SessionState) -> SessionState {
        std::mem::replace(&mut self.state, state)
    }

    pub(crate) fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Invalidate all in-flight work.
    pub(crate) fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Start a new turn: clears the per-turn text and bumps the epoch.
    pub(crate) fn begin_turn(&mut self) -> u64 {
        self.turn += 1;
        self.current_transcript = None;
        self.current_response = None;
        self.bump_epoch()
    }

    pub(crate) fn set_transcript(&mut self, text: String) {
        self.current_transcript = Some(text);
    }

    /// Record the response and close the exchange into the history.
    pub(crate) fn set_response(&mut self, text: String) {
        if let Some(user) = self.current_transcript.clone() {
            self.history.push(Turn {
                user,
                assistant: text.clone(),
            });
        }
        self.current_response = Some(text);
    }

    pub(crate) fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Drop all conversation data (agent stop). Keeps the epoch.
    pub(crate) fn clear(&mut self) {
        self.current_transcript = None;
        self.current_response = None;
        self.history.clear();
    }
}
