// At most one in-flight generation per UI slot

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::session::GenerationSession;

pub const SLOT_ANALYSIS: &str = "analysis";
pub const SLOT_WRITING: &str = "writing";

/// Shared by every creative map tool; starting one tool stops another.
pub const SLOT_CREATIVE_MAP: &str = "creativemap";

#[derive(Debug)]
pub struct SlotRegistry {
    grace: Duration,
    sessions: Mutex<HashMap<String, Arc<GenerationSession>>>,
}

impl SlotRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a fresh session for `slot`.
    ///
    /// Any unfinished session already in the slot is cancelled first, then the
    /// grace period elapses so its stream can tear down before the caller
    /// issues a new request.
    pub async fn begin(&self, slot: &str) -> Arc<GenerationSession> {
        let previous = self.lock().remove(slot);

        if let Some(previous) = previous.filter(|s| !s.is_finished()) {
            tracing::debug!(slot, session = %previous.id(), "cancelling previous generation");
            previous.cancel();
            if !self.grace.is_zero() {
                tokio::time::sleep(self.grace).await;
            }
        }

        let session = Arc::new(GenerationSession::new());
        // A concurrent begin may have landed during the grace period; it loses.
        if let Some(raced) = self.lock().insert(slot.to_string(), session.clone()) {
            raced.cancel();
        }
        session
    }

    /// Stop whatever is running in `slot`. Returns whether anything was cancelled.
    pub fn cancel(&self, slot: &str) -> bool {
        match self.lock().remove(slot) {
            Some(session) if !session.is_finished() => {
                session.cancel();
                true
            }
            _ => false,
        }
    }

    /// Release `slot` if it still holds `session`.
    pub fn finish(&self, slot: &str, session: &GenerationSession) {
        let mut sessions = self.lock();
        if sessions.get(slot).is_some_and(|current| current.id() == session.id()) {
            sessions.remove(slot);
        }
    }

    pub fn active(&self, slot: &str) -> Option<Arc<GenerationSession>> {
        self.lock().get(slot).filter(|s| !s.is_finished()).cloned()
    }

    /// Cancel every slot, e.g. when the front end is shutting down.
    pub fn cancel_all(&self) {
        for (_, session) in self.lock().drain() {
            session.cancel();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<GenerationSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}
