// Lifecycle of a single generation request

use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Requesting,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// One generation attempt. Sessions start `Idle`, are driven once, and end in
/// a terminal state; a fresh session is created for every request.
#[derive(Debug)]
pub struct GenerationSession {
    id: Uuid,
    token: CancellationToken,
    state: Mutex<SessionState>,
}

impl GenerationSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            token: CancellationToken::new(),
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Signal cancellation. A session that already finished keeps its state.
    pub fn cancel(&self) {
        self.token.cancel();
        if self.transition(SessionState::Cancelled) {
            tracing::debug!(session = %self.id, "generation session cancelled");
        }
    }

    /// Move to `to` unless the session is already terminal. Returns whether it moved.
    pub(crate) fn transition(&self, to: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_terminal() {
            return false;
        }
        *state = to;
        true
    }

    /// `Idle -> Requesting`; false if the session was already started or finished.
    pub(crate) fn start(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SessionState::Idle {
            return false;
        }
        *state = SessionState::Requesting;
        true
    }
}

impl Default for GenerationSession {
    fn default() -> Self {
        Self::new()
    }
}
