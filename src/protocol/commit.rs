use super::ReplicaState;
use crate::error::{Error, Result};
use crate::storage::LogStorage;
use crate::types::LogIndex;
use log::{debug, error};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

pub(crate) type Completion = oneshot::Sender<Result<LogIndex>>;
pub(crate) type Waiters = BTreeMap<LogIndex, Vec<Completion>>;

/// Tracks the commit index and the proposals waiting on it.
#[derive(Default)]
pub(crate) struct CommitTracker {
    commit_index: LogIndex,
    waiters: Waiters,
}

impl CommitTracker {
    pub(crate) fn new() -> CommitTracker {
        CommitTracker::default()
    }

    pub(crate) fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Moves the commit index forward to `index`. Never moves it back.
    pub(crate) fn advance(&mut self, index: LogIndex) -> bool {
        if index <= self.commit_index {
            return false;
        }
        self.commit_index = index;
        complete_through(&mut self.waiters, index);
        true
    }

    pub(crate) fn wait(&mut self, index: LogIndex) -> oneshot::Receiver<Result<LogIndex>> {
        let (tx, rx) = oneshot::channel();
        if index <= self.commit_index {
            let _ = tx.send(Ok(index));
        } else {
            self.waiters.entry(index).or_default().push(tx);
        }
        rx
    }

    pub(crate) fn pending(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }

    pub(crate) fn fail_pending(&mut self, error: impl Fn() -> Error) {
        for (_, completions) in std::mem::take(&mut self.waiters) {
            for tx in completions {
                let _ = tx.send(Err(error()));
            }
        }
    }
}

pub(crate) fn complete_through(waiters: &mut Waiters, index: LogIndex) {
    let remaining = waiters.split_off(&(index + 1));
    for (done, completions) in std::mem::replace(waiters, remaining) {
        for tx in completions {
            let _ = tx.send(Ok(done));
        }
    }
}

pub(crate) fn fail_above(waiters: &mut Waiters, index: LogIndex, error: impl Fn(LogIndex) -> Error) {
    for (failed, completions) in waiters.split_off(&(index + 1)) {
        for tx in completions {
            let _ = tx.send(Err(error(failed)));
        }
    }
}

/// Highest index acknowledged by at least `quorum` of the given replicas.
pub(crate) fn quorum_index(mut acked: Vec<LogIndex>, quorum: usize) -> LogIndex {
    if quorum == 0 || acked.len() < quorum {
        return 0;
    }
    acked.sort_unstable_by(|a, b| b.cmp(a));
    acked[quorum - 1]
}

impl<S: LogStorage> ReplicaState<S> {
    /// Recomputes the commit index from the leader's flushed index and the
    /// followers' match indices. Only an entry of the current term can be
    /// committed by counting replicas; earlier entries commit along with it.
    pub(crate) fn maybe_advance_commit(&mut self) -> Result<bool> {
        let leader = match self.leader.as_ref() {
            Some(leader) => leader,
            None => return Ok(false),
        };
        let mut acked = vec![self.flush.flushed_index()];
        acked.extend(
            leader
                .followers()
                .filter(|(_, f)| f.voting)
                .map(|(_, f)| if f.unreachable { 0 } else { f.match_index }),
        );
        let candidate = quorum_index(acked, self.quorum());
        let commit_index = self.commit.commit_index();
        if candidate <= commit_index {
            return Ok(false);
        }

        let term = self.current_term();
        match self.storage.term_at(candidate)? {
            Some(t) if t == term => {
                debug!("Increasing commit index to {} from {}", candidate, commit_index);
                self.commit.advance(candidate);
                self.signals.commit_advanced();
                Ok(true)
            }
            Some(t) => {
                debug!(
                    "Index {} from term {} is on a quorum; waiting for an entry of term {}",
                    candidate, t, term
                );
                Ok(false)
            }
            None => {
                error!(
                    "Log index {} should be available; is the storage corrupted?",
                    candidate
                );
                Err(Error::Storage(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("missing log entry {}", candidate),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{quorum_index, CommitTracker};
    use crate::error::Error;

    #[test]
    fn quorum_is_the_median_of_acknowledgments() {
        assert_eq!(quorum_index(vec![5, 3, 4], 2), 4);
        assert_eq!(quorum_index(vec![5, 0, 0], 2), 0);
        assert_eq!(quorum_index(vec![7], 1), 7);
        assert_eq!(quorum_index(vec![9, 2, 6, 6, 1], 3), 6);
    }

    #[test]
    fn waiters_complete_in_order() {
        let mut tracker = CommitTracker::new();
        let mut first = tracker.wait(2);
        let mut second = tracker.wait(4);
        assert_eq!(tracker.pending(), 2);

        assert!(tracker.advance(3));
        assert_eq!(first.try_recv().unwrap().unwrap(), 2);
        assert!(second.try_recv().is_err());

        assert!(!tracker.advance(1));
        assert_eq!(tracker.commit_index(), 3);

        let mut done = tracker.wait(3);
        assert_eq!(done.try_recv().unwrap().unwrap(), 3);

        tracker.fail_pending(|| Error::NotLeader { leader: None });
        assert!(matches!(
            second.try_recv().unwrap(),
            Err(Error::NotLeader { .. })
        ));
        assert_eq!(tracker.pending(), 0);
    }
}
