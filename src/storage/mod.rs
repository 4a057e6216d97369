use crate::types::{LogEntry, LogIndex, ReplicaId, Term};
use serde::{Deserialize, Serialize};

/// The term and vote record that must survive restarts.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Eq, PartialEq)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<ReplicaId>,
}

/// The log-storage collaborator. Appended entries are only guaranteed to
/// survive a crash once `flush` has reported an index covering them.
pub trait LogStorage: Send + 'static {
    fn hard_state(&self) -> std::io::Result<HardState>;
    fn save_hard_state(&mut self, state: &HardState) -> std::io::Result<()>;

    /// Appends entries that must directly follow the current last index.
    fn append(&mut self, entries: &[LogEntry]) -> std::io::Result<()>;
    /// Removes every entry with an index greater than `after_index`.
    fn truncate_suffix(&mut self, after_index: LogIndex) -> std::io::Result<()>;
    /// Makes all appended entries durable, returning the durable index.
    fn flush(&mut self) -> std::io::Result<LogIndex>;
    /// Reads entries `from..=to`.
    fn read_range(&self, from: LogIndex, to: LogIndex) -> std::io::Result<Vec<LogEntry>>;

    /// Term of the entry at `index`; index 0 always has term 0.
    fn term_at(&self, index: LogIndex) -> std::io::Result<Option<Term>>;
    fn last_index(&self) -> std::io::Result<LogIndex>;
    fn last_term(&self) -> std::io::Result<Term>;
}

pub use memory::MemoryStorage;

mod memory;
