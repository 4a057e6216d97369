//! Per-follower catch-up state kept by the leader.
//!
//! A follower that rejects an append drops into `Probing`: the leader sends
//! empty appends, walking `next_index` back with the help of the follower's
//! conflict hint, until one is accepted. It then streams the missing suffix in
//! `Recovering` and returns to `InSync` once its match index reaches the end of
//! the leader's log. Appends that fail outright count toward marking the
//! follower unreachable, which removes it from commit arithmetic until it
//! answers again.

use super::replication::FollowerState;
use crate::rpc::ConflictHint;
use crate::storage::LogStorage;
use crate::types::{LogIndex, Term};
use log::{debug, info, warn};
use std::io;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum RecoveryState {
    InSync,
    Probing { attempts: u32 },
    Recovering,
}

impl FollowerState {
    /// Any response, accepted or not, proves the follower is alive.
    pub(crate) fn record_contact(&mut self, peer: &str) {
        self.last_ack = Some(Instant::now());
        self.consecutive_failures = 0;
        if self.unreachable {
            info!("Peer {} is reachable again", peer);
            self.unreachable = false;
        }
    }

    pub(crate) fn on_success(&mut self, matched: LogIndex, leader_last: LogIndex) {
        self.match_index = self.match_index.max(matched);
        self.next_index = self.next_index.max(matched + 1);
        self.recovery = match self.recovery {
            RecoveryState::InSync => RecoveryState::InSync,
            _ if self.match_index >= leader_last => {
                debug!("Follower caught up at index {}", self.match_index);
                RecoveryState::InSync
            }
            _ => RecoveryState::Recovering,
        };
    }

    /// Moves `next_index` back after the follower rejected an append whose
    /// previous entry was `rejected_prev`.
    pub(crate) fn on_rejection<S: LogStorage>(
        &mut self,
        rejected_prev: LogIndex,
        hint: Option<&ConflictHint>,
        storage: &S,
    ) -> io::Result<()> {
        let suggested = match hint {
            Some(ConflictHint {
                term: None,
                first_index,
            }) => *first_index,
            // Skip the follower's whole conflicting term unless we hold
            // entries of that term ourselves.
            Some(ConflictHint {
                term: Some(term),
                first_index,
            }) => match last_index_of_term(storage, *term, rejected_prev)? {
                Some(index) => index + 1,
                None => *first_index,
            },
            None => rejected_prev,
        };
        let ceiling = rejected_prev.max(1);
        let floor = (self.match_index + 1).min(ceiling);
        self.next_index = suggested.clamp(floor, ceiling);
        self.recovery = match self.recovery {
            RecoveryState::Probing { attempts } => RecoveryState::Probing {
                attempts: attempts + 1,
            },
            _ => RecoveryState::Probing { attempts: 1 },
        };
        debug!(
            "Append at {} rejected; probing from {} next",
            rejected_prev, self.next_index
        );
        Ok(())
    }

    /// Records a failed send. Returns true when this failure made the
    /// follower unreachable.
    pub(crate) fn on_failure(&mut self, peer: &str, max_attempts: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if let RecoveryState::Probing { attempts } = self.recovery {
            self.recovery = RecoveryState::Probing {
                attempts: attempts + 1,
            };
        }
        if !self.unreachable && self.consecutive_failures >= max_attempts {
            warn!(
                "Peer {} failed {} consecutive requests (last answer {:?} ago); excluding it from the quorum until it answers",
                peer,
                self.consecutive_failures,
                self.last_ack.map(|at| at.elapsed())
            );
            self.unreachable = true;
            return true;
        }
        false
    }

    /// Whether another request should go out without waiting for a heartbeat.
    pub(crate) fn has_pending(&self, leader_last: LogIndex) -> bool {
        matches!(self.recovery, RecoveryState::Probing { .. }) || self.next_index <= leader_last
    }
}

fn last_index_of_term<S: LogStorage>(
    storage: &S,
    term: Term,
    upto: LogIndex,
) -> io::Result<Option<LogIndex>> {
    let mut index = upto;
    while index > 0 {
        match storage.term_at(index)? {
            Some(t) if t == term => return Ok(Some(index)),
            Some(t) if t < term => return Ok(None),
            _ => index -= 1,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::RecoveryState;
    use crate::protocol::replication::FollowerState;
    use crate::rpc::ConflictHint;
    use crate::storage::{HardState, MemoryStorage};
    use crate::types::{LogCommand, LogEntry};

    fn leader_log(terms: &[u64]) -> MemoryStorage {
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, term)| LogEntry {
                index: i as u64 + 1,
                term: *term,
                command: LogCommand::Noop,
            })
            .collect();
        MemoryStorage::with_entries(HardState::default(), entries).unwrap()
    }

    #[test]
    fn short_follower_jumps_to_its_end() {
        let storage = leader_log(&[1, 1, 2, 2, 2, 2]);
        let mut follower = FollowerState::new(7, true);
        let hint = ConflictHint {
            term: None,
            first_index: 3,
        };
        follower.on_rejection(6, Some(&hint), &storage).unwrap();
        assert_eq!(follower.next_index, 3);
        assert_eq!(follower.recovery, RecoveryState::Probing { attempts: 1 });
    }

    #[test]
    fn conflicting_term_is_skipped_whole() {
        let storage = leader_log(&[1, 1, 3, 3, 3, 3]);
        let mut follower = FollowerState::new(7, true);
        // Follower holds term 2 from index 3 onward; we never had term 2.
        let hint = ConflictHint {
            term: Some(2),
            first_index: 3,
        };
        follower.on_rejection(6, Some(&hint), &storage).unwrap();
        assert_eq!(follower.next_index, 3);

        // Follower holds term 1 through index 4 while we switched to term 3
        // at index 3: resume right after our last term-1 entry.
        let mut other = FollowerState::new(5, true);
        let hint = ConflictHint {
            term: Some(1),
            first_index: 1,
        };
        other.on_rejection(4, Some(&hint), &storage).unwrap();
        assert_eq!(other.next_index, 3);
    }

    #[test]
    fn next_index_never_drops_below_match() {
        let storage = leader_log(&[1, 1, 1, 1]);
        let mut follower = FollowerState::new(5, true);
        follower.match_index = 3;
        follower.on_rejection(4, None, &storage).unwrap();
        assert_eq!(follower.next_index, 4);
        follower.on_rejection(4, None, &storage).unwrap();
        assert_eq!(follower.recovery, RecoveryState::Probing { attempts: 2 });
    }

    #[test]
    fn probing_recovers_then_syncs() {
        let mut follower = FollowerState::new(3, true);
        follower.recovery = RecoveryState::Probing { attempts: 2 };
        follower.on_success(2, 10);
        assert_eq!(follower.recovery, RecoveryState::Recovering);
        assert!(follower.has_pending(10));
        follower.on_success(10, 10);
        assert_eq!(follower.recovery, RecoveryState::InSync);
        assert_eq!(follower.next_index, 11);
        assert!(!follower.has_pending(10));
    }

    #[test]
    fn repeated_failures_mark_unreachable() {
        let mut follower = FollowerState::new(1, true);
        assert!(!follower.on_failure("b", 3));
        assert!(!follower.on_failure("b", 3));
        assert!(follower.on_failure("b", 3));
        assert!(follower.unreachable);
        assert!(!follower.on_failure("b", 3));

        follower.record_contact("b");
        assert!(!follower.unreachable);
        assert_eq!(follower.consecutive_failures, 0);
    }
}
