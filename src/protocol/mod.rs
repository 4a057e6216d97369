use crate::config::{Config, Settings};
use crate::error::{Error, Result};
use crate::ledger::TermLedger;
use crate::probe::{Probe, ProbeEvent};
use crate::rpc::{AppendRequest, AppendResponse, RpcHandler, Transport, VoteRequest, VoteResponse};
use crate::storage::LogStorage;
use crate::types::{
    ConsistencyLevel, LogEntry, LogIndex, PartitionId, Peer, ReplicaId, ReplicaStatus, Role, Term,
};
use async_channel::{Receiver, Sender};
use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info, trace};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod apply;
mod commit;
mod election;
mod flush;
mod heartbeat;
mod recovery;
mod replication;


pub use apply::{NullStateMachine, StateMachine};

use apply::LogCommitter;
use commit::CommitTracker;
use election::Candidate;
use flush::FlushManager;
use heartbeat::Replicator;
use replication::LeaderState;

pub(crate) struct Signals {
    leader_contact: Sender<()>,
    flush: Sender<()>,
    commit: Sender<()>,
}

pub(crate) struct SignalReceivers {
    pub(crate) leader_contact: Receiver<()>,
    pub(crate) flush: Receiver<()>,
    pub(crate) commit: Receiver<()>,
}

impl Signals {
    pub(crate) fn new() -> (Signals, SignalReceivers) {
        let (leader_contact_tx, leader_contact_rx) = async_channel::bounded(1);
        let (flush_tx, flush_rx) = async_channel::bounded(1);
        let (commit_tx, commit_rx) = async_channel::bounded(1);
        (
            Signals {
                leader_contact: leader_contact_tx,
                flush: flush_tx,
                commit: commit_tx,
            },
            SignalReceivers {
                leader_contact: leader_contact_rx,
                flush: flush_rx,
                commit: commit_rx,
            },
        )
    }

    pub(crate) fn leader_contact(&self) {
        let _ = self.leader_contact.try_send(());
    }

    pub(crate) fn request_flush(&self) {
        let _ = self.flush.try_send(());
    }

    pub(crate) fn commit_advanced(&self) {
        let _ = self.commit.try_send(());
    }
}

/// Everything one replica mutates. Lives behind a single lock, so term
/// changes, vote grants and commit advances are serialized.
pub(crate) struct ReplicaState<S: LogStorage> {
    pub(crate) id: ReplicaId,
    pub(crate) partition: PartitionId,
    pub(crate) peers: Vec<Peer>,
    pub(crate) settings: Settings,
    pub(crate) role: Role,
    pub(crate) leader_id: Option<ReplicaId>,
    pub(crate) ledger: TermLedger,
    pub(crate) storage: S,
    pub(crate) commit: CommitTracker,
    pub(crate) flush: FlushManager,
    pub(crate) leader: Option<LeaderState>,
    pub(crate) applied_index: LogIndex,
    pub(crate) signals: Signals,
    probe: Arc<dyn Probe>,
    shutdown: CancellationToken,
    role_token: CancellationToken,
}

impl<S: LogStorage> ReplicaState<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ReplicaId,
        partition: PartitionId,
        peers: Vec<Peer>,
        settings: Settings,
        storage: S,
        probe: Arc<dyn Probe>,
        signals: Signals,
        shutdown: CancellationToken,
    ) -> Result<ReplicaState<S>> {
        let ledger = TermLedger::load(&storage)?;
        let flush = FlushManager::new(
            storage.last_index()?,
            settings.max_unflushed_entries,
            settings.max_unflushed_bytes,
        );
        let role_token = shutdown.child_token();
        Ok(ReplicaState {
            id,
            partition,
            peers,
            settings,
            role: Role::Follower,
            leader_id: None,
            ledger,
            storage,
            commit: CommitTracker::new(),
            flush,
            leader: None,
            applied_index: 0,
            signals,
            probe,
            shutdown,
            role_token,
        })
    }

    pub(crate) fn current_term(&self) -> Term {
        self.ledger.current_term()
    }

    pub(crate) fn role_token(&self) -> CancellationToken {
        self.role_token.clone()
    }

    pub(crate) fn record(&self, event: ProbeEvent) {
        self.probe.record(event);
    }

    pub(crate) fn voting_replicas(&self) -> usize {
        1 + self.peers.iter().filter(|p| p.voting).count()
    }

    pub(crate) fn quorum(&self) -> usize {
        self.voting_replicas() / 2 + 1
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        match self.role {
            Role::Halted => Err(Error::Halted),
            _ => Ok(()),
        }
    }

    pub(crate) fn ensure_leader(&self) -> Result<()> {
        match self.role {
            Role::Leader => Ok(()),
            Role::Halted => Err(Error::Halted),
            Role::Follower | Role::Candidate => Err(Error::NotLeader {
                leader: self.leader_id.clone(),
            }),
        }
    }

    pub(crate) fn escalate(&mut self, error: Error) -> Error {
        if error.is_fatal() {
            self.halt(&error);
        }
        error
    }

    pub(crate) fn halt(&mut self, reason: &Error) {
        if self.role == Role::Halted {
            return;
        }
        error!(
            "Halting replica {} of {}: {}",
            self.id, self.partition, reason
        );
        self.stop_with(|| Error::Halted);
    }

    pub(crate) fn stop(&mut self) {
        if self.role != Role::Halted {
            info!("Shutting down replica {} of {}", self.id, self.partition);
            self.stop_with(|| Error::RaftProtocolTerminated);
        }
        self.shutdown.cancel();
    }

    fn stop_with(&mut self, error: impl Fn() -> Error) {
        self.commit.fail_pending(&error);
        self.flush.fail_pending(&error);
        self.set_role(Role::Halted);
        self.set_leader(None);
        self.shutdown.cancel();
    }

    pub(crate) fn status(&self) -> Result<ReplicaStatus> {
        Ok(ReplicaStatus {
            id: self.id.clone(),
            partition: self.partition.clone(),
            role: self.role,
            term: self.current_term(),
            leader: self.leader_id.clone(),
            commit_index: self.commit.commit_index(),
            flushed_index: self.flush.flushed_index(),
            last_index: self.storage.last_index()?,
            applied_index: self.applied_index,
        })
    }
}

pub(crate) struct Shared<S: LogStorage> {
    pub(crate) id: ReplicaId,
    pub(crate) state: Mutex<ReplicaState<S>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) settings: Settings,
    pub(crate) probe: Arc<dyn Probe>,
    pub(crate) shutdown: CancellationToken,
}

impl<S: LogStorage> Shared<S> {
    pub(crate) fn new(
        state: ReplicaState<S>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Shared<S>> {
        Arc::new(Shared {
            id: state.id.clone(),
            settings: state.settings.clone(),
            probe: state.probe.clone(),
            shutdown: state.shutdown.clone(),
            state: Mutex::new(state),
            transport,
        })
    }

    async fn current_role(&self) -> Role {
        self.state.lock().await.role
    }
}

/// A running member of a replica set.
pub struct Replica<S: LogStorage> {
    shared: Arc<Shared<S>>,
}

impl<S: LogStorage> Replica<S> {
    pub async fn start<M: StateMachine>(
        config: &Config,
        storage: S,
        transport: Arc<dyn Transport>,
        state_machine: M,
        probe: Arc<dyn Probe>,
    ) -> Result<Replica<S>> {
        let settings = config.settings()?;
        let peers = config.peers()?;
        let (signals, receivers) = Signals::new();
        let state = ReplicaState::new(
            config.id.clone(),
            config.partition(),
            peers,
            settings,
            storage,
            probe,
            signals,
            CancellationToken::new(),
        )?;
        let shared = Shared::new(state, transport);
        let SignalReceivers {
            leader_contact,
            flush: flush_requests,
            commit: commits,
        } = receivers;

        let tasks = ProtocolTasks::new(shared.clone(), leader_contact);
        tokio::spawn(async move { tasks.run().await });

        let flusher = shared.clone();
        tokio::spawn(async move { flush::run_flusher(flusher, flush_requests).await });

        let committer = LogCommitter::new(shared.clone(), state_machine, commits);
        tokio::spawn(async move { committer.run().await });

        info!(
            "Started replica {} of {} with peers {:?}",
            config.id,
            config.partition(),
            config.peer.iter().flatten().map(|p| &p.id).collect::<Vec<_>>()
        );
        Ok(Replica { shared })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn server(&self) -> Arc<dyn RpcHandler> {
        Arc::new(RaftServer {
            shared: self.shared.clone(),
        })
    }

    /// Appends `payload` to the replicated log and waits for the
    /// acknowledgment `level` asks for.
    pub async fn propose(&self, payload: Bytes, level: ConsistencyLevel) -> Result<LogIndex> {
        let (index, completion) = loop {
            let mut st = self.shared.state.lock().await;
            st.ensure_leader()?;
            if !st.flush.has_capacity() {
                debug!(
                    "Unflushed backlog is full ({} entries); waiting for a flush",
                    st.flush.backlog_entries()
                );
                let appended = st.flush.appended_index();
                let flushed = st.flush.wait(appended);
                st.signals.request_flush();
                drop(st);
                // Whatever the outcome, re-check leadership and capacity.
                let _ = flushed.await;
                continue;
            }
            st.record(ProbeEvent::ReplicateRequest(level));
            let index = st.append_client_entry(payload.clone())?;
            let completion = match level {
                ConsistencyLevel::AckNone => None,
                ConsistencyLevel::AckLeader => Some(st.flush.wait(index)),
                ConsistencyLevel::AckAll => Some(st.commit.wait(index)),
            };
            break (index, completion);
        };
        if let Some(completion) = completion {
            completion
                .await
                .map_err(|_| Error::RaftProtocolTerminated)??;
        }
        self.shared.probe.record(ProbeEvent::ReplicateDone);
        Ok(index)
    }

    pub async fn status(&self) -> Result<ReplicaStatus> {
        self.shared.state.lock().await.status()
    }

    pub async fn log_entries(&self) -> Result<Vec<LogEntry>> {
        let st = self.shared.state.lock().await;
        let last_index = st.storage.last_index()?;
        Ok(st.storage.read_range(1, last_index)?)
    }

    pub async fn shutdown(&self) {
        self.shared.state.lock().await.stop();
    }
}

/// Inbound side of the protocol: applies peer requests to the replica state.
#[derive(Clone)]
pub struct RaftServer<S: LogStorage> {
    shared: Arc<Shared<S>>,
}

#[async_trait]
impl<S: LogStorage> RpcHandler for RaftServer<S> {
    async fn append_entries(&self, request: AppendRequest) -> Result<AppendResponse> {
        let mut st = self.shared.state.lock().await;
        trace!(
            "{}: append from {} at {}/{} with {} entries",
            st.id,
            request.leader_id,
            request.prev_log_index,
            request.prev_log_term,
            request.entries.len()
        );
        match st.handle_append_request(request) {
            Ok(response) => Ok(response),
            Err(e) => Err(st.escalate(e)),
        }
    }

    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let mut st = self.shared.state.lock().await;
        match st.handle_vote_request(request) {
            Ok(response) => Ok(response),
            Err(e) => Err(st.escalate(e)),
        }
    }
}

pub(crate) struct ProtocolTasks<S: LogStorage> {
    shared: Arc<Shared<S>>,
    leader_contact_rx: Receiver<()>,
}

impl<S: LogStorage> ProtocolTasks<S> {
    fn new(shared: Arc<Shared<S>>, leader_contact_rx: Receiver<()>) -> ProtocolTasks<S> {
        ProtocolTasks {
            shared,
            leader_contact_rx,
        }
    }

    async fn run(&self) {
        loop {
            if self.shared.shutdown.is_cancelled() {
                return;
            }
            // Grab the current role and run the matching protocol logic until
            // the role changes.
            let (role, token) = {
                let st = self.shared.state.lock().await;
                (st.role, st.role_token())
            };
            match role {
                Role::Follower => {
                    let follower = Follower::new(&self.shared, &self.leader_contact_rx);
                    if follower.run(&token).await == Role::Halted {
                        return;
                    }
                }
                Role::Candidate => Candidate::new(&self.shared).run(&token).await,
                Role::Leader => Leader::new(&self.shared).run(&token).await,
                Role::Halted => {
                    debug!("Replica {} has halted; stopping protocol tasks", self.shared.id);
                    return;
                }
            }
        }
    }
}

pub(crate) struct Follower<'a, S: LogStorage> {
    shared: &'a Shared<S>,
    leader_contact_rx: &'a Receiver<()>,
    timeout: Duration,
}

impl<'a, S: LogStorage> Follower<'a, S> {
    pub(crate) fn new(shared: &'a Shared<S>, leader_contact_rx: &'a Receiver<()>) -> Follower<'a, S> {
        let timeout = shared
            .settings
            .election_timeout
            .mul_f32(1. + rand::thread_rng().gen::<f32>());
        Follower {
            shared,
            leader_contact_rx,
            timeout,
        }
    }

    pub(crate) async fn run(&self, token: &CancellationToken) -> Role {
        loop {
            match self.run_once(token).await {
                Role::Follower if !token.is_cancelled() => {}
                other => return other,
            }
        }
    }

    pub(crate) async fn run_once(&self, token: &CancellationToken) -> Role {
        tokio::select! {
            _ = token.cancelled() => self.shared.current_role().await,
            // Any valid append request or granted vote restarts the timer.
            contact = self.leader_contact_rx.recv() => match contact {
                Ok(()) => Role::Follower,
                Err(_) => {
                    trace!("Leader contact signal disconnected; shutting down");
                    Role::Halted
                }
            },
            _ = tokio::time::sleep(self.timeout) => {
                let mut st = self.shared.state.lock().await;
                if token.is_cancelled() {
                    return st.role;
                }
                info!("Election timeout reached; transitioning to candidate state");
                st.become_candidate();
                st.role
            }
        }
    }
}

pub(crate) struct Leader<'a, S: LogStorage> {
    shared: &'a Arc<Shared<S>>,
}

impl<'a, S: LogStorage> Leader<'a, S> {
    pub(crate) fn new(shared: &'a Arc<Shared<S>>) -> Leader<'a, S> {
        Leader { shared }
    }

    pub(crate) async fn run(&self, token: &CancellationToken) {
        let replicators = {
            let mut st = self.shared.state.lock().await;
            if token.is_cancelled() {
                return;
            }
            st.attach_replicators()
        };
        for (peer, notify_rx) in replicators {
            let replicator = Replicator::new(peer, self.shared.clone(), notify_rx);
            let token = token.clone();
            tokio::spawn(async move { replicator.run(token).await });
        }
        token.cancelled().await;
    }
}
