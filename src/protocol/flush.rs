use super::commit::{complete_through, fail_above, Waiters};
use super::{ReplicaState, Shared};
use crate::error::{Error, Result};
use crate::probe::ProbeEvent;
use crate::storage::LogStorage;
use crate::types::{LogEntry, LogIndex, Role};
use async_channel::Receiver;
use log::{error, info, trace};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Bookkeeping for entries that are appended but not yet durable.
pub(crate) struct FlushManager {
    flushed_index: LogIndex,
    appended_index: LogIndex,
    backlog: VecDeque<(LogIndex, usize)>,
    backlog_bytes: usize,
    max_entries: usize,
    max_bytes: usize,
    waiters: Waiters,
}

impl FlushManager {
    pub(crate) fn new(durable_index: LogIndex, max_entries: usize, max_bytes: usize) -> FlushManager {
        FlushManager {
            flushed_index: durable_index,
            appended_index: durable_index,
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            max_entries,
            max_bytes,
            waiters: Waiters::new(),
        }
    }

    pub(crate) fn flushed_index(&self) -> LogIndex {
        self.flushed_index
    }

    pub(crate) fn appended_index(&self) -> LogIndex {
        self.appended_index
    }

    pub(crate) fn backlog_entries(&self) -> usize {
        self.backlog.len()
    }

    /// Whether another entry may be appended without exceeding the backlog limits.
    pub(crate) fn has_capacity(&self) -> bool {
        self.backlog.len() < self.max_entries && self.backlog_bytes < self.max_bytes
    }

    pub(crate) fn needs_flush(&self) -> bool {
        self.appended_index > self.flushed_index
    }

    pub(crate) fn record_append(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            let size = entry.size();
            self.backlog.push_back((entry.index, size));
            self.backlog_bytes += size;
            self.appended_index = entry.index;
        }
    }

    pub(crate) fn complete_flush(&mut self, durable: LogIndex) -> Result<()> {
        if durable < self.flushed_index {
            return Err(Error::FlushRegressed {
                previous: self.flushed_index,
                durable,
            });
        }
        self.flushed_index = durable;
        while let Some(&(index, size)) = self.backlog.front() {
            if index > durable {
                break;
            }
            self.backlog.pop_front();
            self.backlog_bytes -= size;
        }
        complete_through(&mut self.waiters, durable);
        Ok(())
    }

    /// Resolves once `index` is durable.
    pub(crate) fn wait(&mut self, index: LogIndex) -> oneshot::Receiver<Result<LogIndex>> {
        let (tx, rx) = oneshot::channel();
        if index <= self.flushed_index {
            let _ = tx.send(Ok(index));
        } else {
            self.waiters.entry(index).or_default().push(tx);
        }
        rx
    }

    /// The log now ends at `after_index`.
    pub(crate) fn truncated(&mut self, after_index: LogIndex) {
        self.backlog.retain(|&(index, _)| index <= after_index);
        self.backlog_bytes = self.backlog.iter().map(|&(_, size)| size).sum();
        self.appended_index = after_index;
        self.flushed_index = self.flushed_index.min(after_index);
        fail_above(&mut self.waiters, after_index, Error::EntryTruncated);
    }

    pub(crate) fn fail_pending(&mut self, error: impl Fn() -> Error) {
        fail_above(&mut self.waiters, 0, |_| error());
    }
}

impl<S: LogStorage> ReplicaState<S> {
    /// Makes every appended entry durable with a single storage flush.
    pub(crate) fn flush_log(&mut self) -> Result<LogIndex> {
        if !self.flush.needs_flush() {
            return Ok(self.flush.flushed_index());
        }
        let durable = self.storage.flush()?;
        self.flush.complete_flush(durable)?;
        self.record(ProbeEvent::LogFlushed);
        trace!("Flushed log through index {}", durable);
        if self.role == Role::Leader {
            self.maybe_advance_commit()?;
        }
        Ok(durable)
    }

    /// Drops every entry after `after_index`. Committed entries are never dropped.
    pub(crate) fn truncate_log(&mut self, after_index: LogIndex) -> Result<()> {
        let commit_index = self.commit.commit_index();
        if after_index < commit_index {
            return Err(Error::TruncationBelowCommit {
                after_index,
                commit_index,
            });
        }
        info!("{}: truncating log after index {}", self.id, after_index);
        self.storage.truncate_suffix(after_index)?;
        self.flush.truncated(after_index);
        self.record(ProbeEvent::LogTruncated);
        Ok(())
    }
}

/// Flushes the log whenever new entries are appended. Appends that arrive
/// while a flush is running are covered by the next one.
pub(crate) async fn run_flusher<S: LogStorage>(shared: Arc<Shared<S>>, requests: Receiver<()>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            request = requests.recv() => if request.is_err() {
                trace!("Flush request channel disconnected; shutting down");
                return;
            },
        }
        let mut st = shared.state.lock().await;
        if st.role == Role::Halted {
            return;
        }
        if let Err(e) = st.flush_log() {
            error!("Failed to flush the log: {}", e);
            if st.escalate(e).is_fatal() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FlushManager;
    use crate::error::Error;
    use crate::types::{LogCommand, LogEntry};
    use bytes::Bytes;

    fn entry(index: u64, payload: &'static [u8]) -> LogEntry {
        LogEntry {
            index,
            term: 1,
            command: LogCommand::Command(Bytes::from_static(payload)),
        }
    }

    #[test]
    fn backlog_limits_capacity() {
        let mut flush = FlushManager::new(0, 2, 1024);
        assert!(flush.has_capacity());
        flush.record_append(&[entry(1, b"a"), entry(2, b"b")]);
        assert!(!flush.has_capacity());
        assert!(flush.needs_flush());

        flush.complete_flush(1).unwrap();
        assert_eq!(flush.backlog_entries(), 1);
        assert!(flush.has_capacity());

        let mut bytes = FlushManager::new(0, 100, 20);
        bytes.record_append(&[entry(1, b"0123456789")]);
        assert!(!bytes.has_capacity());
    }

    #[test]
    fn waiters_follow_durability() {
        let mut flush = FlushManager::new(0, 8, 1024);
        flush.record_append(&[entry(1, b"a"), entry(2, b"b"), entry(3, b"c")]);
        let mut second = flush.wait(2);
        let mut third = flush.wait(3);

        flush.complete_flush(2).unwrap();
        assert_eq!(second.try_recv().unwrap().unwrap(), 2);
        assert!(third.try_recv().is_err());

        flush.truncated(2);
        assert!(matches!(
            third.try_recv().unwrap(),
            Err(Error::EntryTruncated(3))
        ));
        assert!(!flush.needs_flush());
    }

    #[test]
    fn durable_index_must_not_regress() {
        let mut flush = FlushManager::new(4, 8, 1024);
        assert!(matches!(
            flush.complete_flush(3),
            Err(Error::FlushRegressed {
                previous: 4,
                durable: 3
            })
        ));
    }
}
