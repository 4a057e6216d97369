use super::replication::LeaderState;
use super::{ReplicaState, Shared};
use crate::error::{Error, Result};
use crate::probe::ProbeEvent;
use crate::rpc::{VoteRequest, VoteResponse};
use crate::storage::LogStorage;
use crate::types::{LogCommand, Peer, ReplicaId, Role, Term};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) struct ElectionRound {
    pub(crate) term: Term,
    pub(crate) request: VoteRequest,
    pub(crate) voters: Vec<Peer>,
    pub(crate) quorum: usize,
}

impl<S: LogStorage> ReplicaState<S> {
    /// Switches roles, cancelling every task tied to the previous one.
    pub(crate) fn set_role(&mut self, role: Role) {
        if self.role == role {
            return;
        }
        info!(
            "{} moving from {} to {} in term {}",
            self.id,
            self.role,
            role,
            self.current_term()
        );
        self.role_token.cancel();
        self.role_token = self.shutdown.child_token();
        if self.role == Role::Leader {
            self.leader = None;
            if self.commit.pending() > 0 {
                debug!(
                    "Failing {} proposals that were waiting for commit",
                    self.commit.pending()
                );
            }
            self.commit.fail_pending(|| Error::NotLeader { leader: None });
        }
        self.role = role;
    }

    pub(crate) fn set_leader(&mut self, leader: Option<ReplicaId>) {
        if self.leader_id == leader {
            return;
        }
        if let Some(ref id) = leader {
            info!(
                "{}: {} leads term {}",
                self.partition,
                id,
                self.current_term()
            );
            self.record(ProbeEvent::LeadershipChanged);
        }
        self.leader_id = leader;
    }

    /// Adopts `term` if it is newer than ours, stepping down to follower.
    pub(crate) fn observe_term(&mut self, term: Term) -> Result<bool> {
        if !self.ledger.observe(&mut self.storage, term)? {
            return Ok(false);
        }
        self.set_role(Role::Follower);
        self.set_leader(None);
        Ok(true)
    }

    pub(crate) fn become_follower(&mut self, leader: &str) {
        self.set_role(Role::Follower);
        self.set_leader(Some(leader.to_string()));
    }

    pub(crate) fn become_candidate(&mut self) {
        if self.role == Role::Follower {
            self.set_role(Role::Candidate);
        }
    }

    /// Starts a new term voting for ourselves. A replica that is the only
    /// voter wins on the spot.
    pub(crate) fn start_election(&mut self) -> Result<ElectionRound> {
        let term = self.ledger.begin_election(&mut self.storage, &self.id)?;
        self.set_leader(None);
        let request = VoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index: self.storage.last_index()?,
            last_log_term: self.storage.last_term()?,
        };
        let voters: Vec<Peer> = self.peers.iter().filter(|p| p.voting).cloned().collect();
        let quorum = self.quorum();
        info!(
            "{} starting election for term {} ({} of {} votes needed)",
            self.id,
            term,
            quorum,
            self.voting_replicas()
        );
        if quorum <= 1 {
            self.become_leader(term)?;
        }
        Ok(ElectionRound {
            term,
            request,
            voters,
            quorum,
        })
    }

    /// Takes leadership of `term` if we are still campaigning in it.
    pub(crate) fn become_leader(&mut self, term: Term) -> Result<bool> {
        if self.role != Role::Candidate || self.current_term() != term {
            return Ok(false);
        }
        self.set_role(Role::Leader);
        let id = self.id.clone();
        self.set_leader(Some(id));
        let next_index = self.storage.last_index()? + 1;
        self.leader = Some(LeaderState::new(&self.peers, next_index));
        // Entries from earlier terms only commit behind one of our own.
        self.append_local(LogCommand::Noop)?;
        Ok(true)
    }

    pub(crate) fn handle_vote_request(&mut self, request: VoteRequest) -> Result<VoteResponse> {
        self.record(ProbeEvent::VoteRequestReceived);
        self.ensure_running()?;
        if request.term < self.current_term() {
            debug!(
                "Rejecting vote for {}: term {} is older than {}",
                request.candidate_id,
                request.term,
                self.current_term()
            );
            return Ok(VoteResponse::failed(self.current_term()));
        }
        self.observe_term(request.term)?;
        let term = self.current_term();

        let local = (self.storage.last_term()?, self.storage.last_index()?);
        let candidate = (request.last_log_term, request.last_log_index);
        if candidate < local {
            debug!(
                "Rejecting vote for {}: its log {:?} is behind ours {:?}",
                request.candidate_id, candidate, local
            );
            return Ok(VoteResponse::failed(term));
        }
        if !self.ledger.record_vote(&mut self.storage, &request.candidate_id)? {
            debug!(
                "Rejecting vote for {}: already voted for {:?} in term {}",
                request.candidate_id,
                self.ledger.voted_for(),
                term
            );
            return Ok(VoteResponse::failed(term));
        }
        info!("Voting for {} in term {}", request.candidate_id, term);
        self.signals.leader_contact();
        Ok(VoteResponse::granted(term))
    }
}

/// Randomized election timeouts whose ceiling doubles after every failed
/// round, up to a cap.
pub(crate) struct ElectionBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl ElectionBackoff {
    pub(crate) fn new(base: Duration, max: Duration) -> ElectionBackoff {
        ElectionBackoff {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    pub(crate) fn ceiling(&self) -> Duration {
        self.base
            .saturating_mul(1 << (self.failures.min(16) + 1))
            .min(self.max)
    }

    pub(crate) fn next_timeout(&mut self) -> Duration {
        let span = (self.ceiling() - self.base).as_millis() as u64;
        self.failures = self.failures.saturating_add(1);
        self.base + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
    }
}

enum ElectionResult {
    Winner,
    NotWinner,
    OutdatedTerm(Term),
}

pub(crate) struct Candidate<'a, S: LogStorage> {
    shared: &'a Shared<S>,
    backoff: ElectionBackoff,
}

impl<'a, S: LogStorage> Candidate<'a, S> {
    pub(crate) fn new(shared: &'a Shared<S>) -> Candidate<'a, S> {
        Candidate {
            shared,
            backoff: ElectionBackoff::new(
                shared.settings.election_timeout,
                shared.settings.max_election_backoff,
            ),
        }
    }

    pub(crate) async fn run(&mut self, token: &CancellationToken) {
        loop {
            let timeout = self.backoff.next_timeout();
            let started = Instant::now();
            match self.run_once(token, timeout).await {
                Role::Candidate if !token.is_cancelled() => {}
                _ => return,
            }
            // If the election fails quickly, make sure we wait out the timer.
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(started + timeout) => {}
            }
        }
    }

    pub(crate) async fn run_once(&self, token: &CancellationToken, timeout: Duration) -> Role {
        let round = {
            let mut st = self.shared.state.lock().await;
            if token.is_cancelled() {
                return st.role;
            }
            match st.start_election() {
                Ok(round) => round,
                Err(e) => {
                    error!("Failed to start an election: {}", e);
                    st.escalate(e);
                    return st.role;
                }
            }
        };

        let result = tokio::select! {
            _ = token.cancelled() => return self.shared.current_role().await,
            result = tokio::time::timeout(timeout, self.collect_votes(&round)) => match result {
                Ok(result) => result,
                Err(_) => {
                    info!("Election timeout reached for term {}", round.term);
                    ElectionResult::NotWinner
                }
            },
        };

        let mut st = self.shared.state.lock().await;
        if token.is_cancelled() {
            return st.role;
        }
        match result {
            ElectionResult::Winner => {
                info!(
                    "Received a majority of votes in term {}, converting to leader",
                    round.term
                );
                if let Err(e) = st.become_leader(round.term) {
                    error!("Failed to take leadership of term {}: {}", round.term, e);
                    st.escalate(e);
                }
            }
            ElectionResult::OutdatedTerm(term) => {
                if let Err(e) = st.observe_term(term) {
                    error!("Could not adopt newer term {}: {}", term, e);
                }
            }
            ElectionResult::NotWinner => {
                info!("Term {} had no election winner", round.term);
            }
        }
        st.role
    }

    async fn collect_votes(&self, round: &ElectionRound) -> ElectionResult {
        let mut votes = 1;
        if votes >= round.quorum {
            return ElectionResult::Winner;
        }
        let mut responses: FuturesUnordered<_> = round
            .voters
            .iter()
            .map(|peer| {
                self.shared.probe.record(ProbeEvent::VoteRequestSent);
                let request = round.request.clone();
                let transport = self.shared.transport.clone();
                async move { (peer, transport.request_vote(&peer.id, request).await) }
            })
            .collect();

        // More rejections than this put a majority out of reach.
        let max_rejections = round.voters.len() + 1 - round.quorum;
        let mut rejections = 0;
        while let Some((peer, response)) = responses.next().await {
            match response {
                Ok(response) if response.term > round.term => {
                    info!("Peer {} is on newer term {}", peer, response.term);
                    return ElectionResult::OutdatedTerm(response.term);
                }
                Ok(response) if response.granted => {
                    info!("Received vote from {} in term {}", peer, round.term);
                    votes += 1;
                    if votes >= round.quorum {
                        return ElectionResult::Winner;
                    }
                }
                Ok(_) => {
                    let rejected = Error::VoteRejected {
                        voter: peer.id.clone(),
                        term: round.term,
                    };
                    info!("{}", rejected);
                    rejections += 1;
                }
                Err(e) => {
                    info!("No vote from {} in term {}: {}", peer, round.term, e);
                    rejections += 1;
                }
            }
            if rejections > max_rejections {
                return ElectionResult::NotWinner;
            }
        }
        ElectionResult::NotWinner
    }
}

#[cfg(test)]
mod tests {
    use super::ElectionBackoff;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let base = Duration::from_millis(100);
        let mut backoff = ElectionBackoff::new(base, Duration::from_millis(500));
        assert_eq!(backoff.ceiling(), Duration::from_millis(200));
        let mut ceilings = Vec::new();
        for _ in 0..5 {
            let timeout = backoff.next_timeout();
            assert!(timeout >= base);
            assert!(timeout <= Duration::from_millis(500));
            ceilings.push(backoff.ceiling().as_millis());
        }
        assert_eq!(ceilings, vec![400, 500, 500, 500, 500]);
    }
}
