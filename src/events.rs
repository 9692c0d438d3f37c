// Event types for async communication between a generation task and its consumer

use tokio::sync::mpsc;

use crate::generation::GenerationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    /// A piece of generated text, in arrival order
    Fragment(String),
    /// Generation finished normally
    Completed,
    /// Generation stopped because its session was cancelled
    Cancelled,
    /// Generation failed; never carries `GenerationError::Cancelled`
    Failed(GenerationError),
}

impl GenerationEvent {
    /// The terminal event for a finished generation.
    pub fn from_result(result: Result<(), GenerationError>) -> Self {
        match result {
            Ok(()) => Self::Completed,
            Err(GenerationError::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed(e),
        }
    }

    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Fragment(_))
    }
}

/// Fragment callback that forwards each fragment over `tx`.
pub fn forward_fragments(tx: mpsc::UnboundedSender<GenerationEvent>) -> impl FnMut(&str) + Send {
    move |fragment: &str| {
        let _ = tx.send(GenerationEvent::Fragment(fragment.to_string()));
    }
}
