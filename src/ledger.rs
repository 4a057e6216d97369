//! Durable record of the current term and the vote cast in it.
//!
//! Every change is written through to the log storage before it is
//! reflected in memory, so a replica never acts on a term or vote it could
//! forget after a crash.

use crate::storage::{HardState, LogStorage};
use crate::types::{ReplicaId, Term};
use log::debug;

#[derive(Debug, Clone, Default)]
pub struct TermLedger {
    state: HardState,
}

impl TermLedger {
    pub fn load<S: LogStorage>(storage: &S) -> std::io::Result<TermLedger> {
        Ok(TermLedger {
            state: storage.hard_state()?,
        })
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term
    }

    pub fn voted_for(&self) -> Option<&ReplicaId> {
        self.state.voted_for.as_ref()
    }

    /// Moves to `term` if it is newer, clearing the vote. Returns whether the
    /// term advanced; older or equal terms leave the ledger untouched.
    pub fn observe<S: LogStorage>(&mut self, storage: &mut S, term: Term) -> std::io::Result<bool> {
        if term <= self.state.current_term {
            return Ok(false);
        }
        debug!(
            "Advancing term from {} to {}",
            self.state.current_term, term
        );
        self.persist(
            storage,
            HardState {
                current_term: term,
                voted_for: None,
            },
        )?;
        Ok(true)
    }

    /// Starts a new term with a vote for `candidate` (ourselves).
    pub fn begin_election<S: LogStorage>(
        &mut self,
        storage: &mut S,
        candidate: &str,
    ) -> std::io::Result<Term> {
        let term = self.state.current_term + 1;
        self.persist(
            storage,
            HardState {
                current_term: term,
                voted_for: Some(candidate.to_string()),
            },
        )?;
        Ok(term)
    }

    /// Records a vote for `candidate` in the current term. Returns false if a
    /// different candidate already holds this term's vote.
    pub fn record_vote<S: LogStorage>(
        &mut self,
        storage: &mut S,
        candidate: &str,
    ) -> std::io::Result<bool> {
        match self.state.voted_for {
            Some(ref existing) if existing == candidate => Ok(true),
            Some(_) => Ok(false),
            None => {
                self.persist(
                    storage,
                    HardState {
                        current_term: self.state.current_term,
                        voted_for: Some(candidate.to_string()),
                    },
                )?;
                Ok(true)
            }
        }
    }

    fn persist<S: LogStorage>(&mut self, storage: &mut S, state: HardState) -> std::io::Result<()> {
        storage.save_hard_state(&state)?;
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TermLedger;
    use crate::storage::{LogStorage, MemoryStorage};

    #[test]
    fn term_never_decreases() {
        let mut storage = MemoryStorage::new();
        let mut ledger = TermLedger::load(&storage).unwrap();

        assert!(ledger.observe(&mut storage, 5).unwrap());
        assert!(!ledger.observe(&mut storage, 3).unwrap());
        assert!(!ledger.observe(&mut storage, 5).unwrap());
        assert_eq!(ledger.current_term(), 5);
        assert_eq!(storage.hard_state().unwrap().current_term, 5);
    }

    #[test]
    fn one_vote_per_term() {
        let mut storage = MemoryStorage::new();
        let mut ledger = TermLedger::load(&storage).unwrap();
        ledger.observe(&mut storage, 2).unwrap();

        assert!(ledger.record_vote(&mut storage, "a").unwrap());
        assert!(ledger.record_vote(&mut storage, "a").unwrap());
        assert!(!ledger.record_vote(&mut storage, "b").unwrap());

        // A newer term frees the vote again.
        ledger.observe(&mut storage, 3).unwrap();
        assert_eq!(ledger.voted_for(), None);
        assert!(ledger.record_vote(&mut storage, "b").unwrap());
        assert_eq!(
            storage.hard_state().unwrap().voted_for,
            Some("b".to_string())
        );
    }

    #[test]
    fn election_votes_for_self() {
        let mut storage = MemoryStorage::new();
        let mut ledger = TermLedger::load(&storage).unwrap();
        assert_eq!(ledger.begin_election(&mut storage, "me").unwrap(), 1);
        assert_eq!(ledger.begin_election(&mut storage, "me").unwrap(), 2);
        assert_eq!(ledger.voted_for().map(String::as_str), Some("me"));
        assert!(!ledger.record_vote(&mut storage, "other").unwrap());

        let reloaded = TermLedger::load(&storage).unwrap();
        assert_eq!(reloaded.current_term(), 2);
    }
}
