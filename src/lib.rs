//! Core of the Zhixia writing assistant: manuscript chapter import, a local
//! store for works and prompts, and cancellable streaming generation against
//! an OpenRouter-compatible chat-completion API.

pub mod api;
pub mod app;
pub mod chapters;
pub mod config;
pub mod debounce;
pub mod events;
pub mod generation;
pub mod models;
pub mod session;
pub mod slots;
pub mod storage;

pub use chapters::{append_to_chapter, put_chapter, split_chapters, split_or_whole, Chapter, ChapterFormatter};
pub use generation::{GenerateOptions, GenerationError, Generator};
pub use session::{GenerationSession, SessionState};
