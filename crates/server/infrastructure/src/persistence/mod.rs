//! History storage.

pub mod history;

pub use history::InMemoryHistoryRecorder;
