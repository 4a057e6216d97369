use crate::storage::{HardState, LogStorage};
use crate::types::{LogEntry, LogIndex, Term};
use std::io::{Error, ErrorKind, Result};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    hard_state: HardState,
    entries: Vec<LogEntry>,
    durable_index: LogIndex,
    flushes: usize,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    /// Starts from an existing log, treated as already durable.
    pub fn with_entries(hard_state: HardState, entries: Vec<LogEntry>) -> Result<MemoryStorage> {
        let mut storage = MemoryStorage {
            hard_state,
            ..MemoryStorage::default()
        };
        storage.append(&entries)?;
        storage.durable_index = storage.last_index()?;
        Ok(storage)
    }

    pub fn durable_index(&self) -> LogIndex {
        self.durable_index
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl LogStorage for MemoryStorage {
    fn hard_state(&self) -> Result<HardState> {
        Ok(self.hard_state.clone())
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let mut expected = self.entries.len() as LogIndex + 1;
        for e in entries {
            if e.index != expected {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("expected entry {} but got {}", expected, e.index),
                ));
            }
            expected += 1;
        }
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_suffix(&mut self, after_index: LogIndex) -> Result<()> {
        self.entries.truncate(after_index as usize);
        self.durable_index = self.durable_index.min(after_index);
        Ok(())
    }

    fn flush(&mut self) -> Result<LogIndex> {
        self.flushes += 1;
        self.durable_index = self.entries.len() as LogIndex;
        Ok(self.durable_index)
    }

    fn read_range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>> {
        if from > to {
            return Ok(Vec::new());
        }
        if from == 0 || to > self.entries.len() as LogIndex {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "range {}..={} is outside the log 1..={}",
                    from,
                    to,
                    self.entries.len()
                ),
            ));
        }
        Ok(self.entries[(from - 1) as usize..to as usize].to_vec())
    }

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        Ok(self.entries.get((index - 1) as usize).map(|e| e.term))
    }

    fn last_index(&self) -> Result<LogIndex> {
        Ok(self.entries.last().map(|e| e.index).unwrap_or(0))
    }

    fn last_term(&self) -> Result<Term> {
        Ok(self.entries.last().map(|e| e.term).unwrap_or(0))
    }
}
