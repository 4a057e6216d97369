use super::recovery::RecoveryState;
use super::ReplicaState;
use crate::error::{Error, Result};
use crate::probe::{ErrorPath, ProbeEvent};
use crate::rpc::{AppendRequest, AppendResponse, ConflictHint};
use crate::storage::LogStorage;
use crate::types::{LogCommand, LogEntry, LogIndex, Peer, ReplicaId, Role, Term};
use async_channel::{Receiver, Sender, TrySendError};
use bytes::Bytes;
use log::{debug, error, info, trace};
use std::collections::BTreeMap;
use std::io;
use std::time::Instant;

#[derive(Debug, Clone)]
pub(crate) struct FollowerState {
    pub(crate) match_index: LogIndex,
    pub(crate) next_index: LogIndex,
    pub(crate) last_ack: Option<Instant>,
    pub(crate) recovery: RecoveryState,
    pub(crate) consecutive_failures: u32,
    pub(crate) unreachable: bool,
    pub(crate) voting: bool,
}

impl FollowerState {
    pub(crate) fn new(next_index: LogIndex, voting: bool) -> FollowerState {
        FollowerState {
            match_index: 0,
            next_index,
            last_ack: None,
            recovery: RecoveryState::InSync,
            consecutive_failures: 0,
            unreachable: false,
            voting,
        }
    }
}

pub(crate) struct LeaderState {
    followers: BTreeMap<ReplicaId, FollowerState>,
    notifiers: Vec<Sender<()>>,
}

impl LeaderState {
    pub(crate) fn new(peers: &[Peer], next_index: LogIndex) -> LeaderState {
        LeaderState {
            followers: peers
                .iter()
                .map(|p| (p.id.clone(), FollowerState::new(next_index, p.voting)))
                .collect(),
            notifiers: Vec::new(),
        }
    }

    pub(crate) fn follower(&self, id: &str) -> Option<&FollowerState> {
        self.followers.get(id)
    }

    pub(crate) fn follower_mut(&mut self, id: &str) -> Option<&mut FollowerState> {
        self.followers.get_mut(id)
    }

    pub(crate) fn followers(&self) -> impl Iterator<Item = (&ReplicaId, &FollowerState)> {
        self.followers.iter()
    }

    fn notify_replicators(&mut self) {
        self.notifiers.retain(|tx| match tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum SendKind {
    Heartbeat,
    Replicate,
    Probe,
    Recovery,
}

impl SendKind {
    fn error_path(self) -> ErrorPath {
        match self {
            SendKind::Heartbeat => ErrorPath::Heartbeat,
            SendKind::Replicate => ErrorPath::Replicate,
            SendKind::Probe | SendKind::Recovery => ErrorPath::Recovery,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OutboundAppend {
    pub(crate) request: AppendRequest,
    pub(crate) kind: SendKind,
}

impl<S: LogStorage> ReplicaState<S> {
    pub(crate) fn attach_replicators(&mut self) -> Vec<(Peer, Receiver<()>)> {
        let leader = match self.leader.as_mut() {
            Some(leader) => leader,
            None => return Vec::new(),
        };
        self.peers
            .iter()
            .map(|peer| {
                let (tx, rx) = async_channel::bounded(1);
                leader.notifiers.push(tx);
                (peer.clone(), rx)
            })
            .collect()
    }

    pub(crate) fn append_local(&mut self, command: LogCommand) -> Result<LogIndex> {
        let entry = LogEntry {
            index: self.storage.last_index()? + 1,
            term: self.current_term(),
            command,
        };
        let index = entry.index;
        let entries = [entry];
        self.storage.append(&entries)?;
        self.flush.record_append(&entries);
        self.signals.request_flush();
        if let Some(leader) = self.leader.as_mut() {
            leader.notify_replicators();
        }
        Ok(index)
    }

    pub(crate) fn append_client_entry(&mut self, payload: Bytes) -> Result<LogIndex> {
        self.ensure_leader()?;
        let index = self.append_local(LogCommand::Command(payload))?;
        trace!("Appended entry {} in term {}", index, self.current_term());
        Ok(index)
    }

    pub(crate) fn build_append_request(&mut self, peer: &str) -> Result<Option<OutboundAppend>> {
        if self.role != Role::Leader {
            return Ok(None);
        }
        let (next_index, recovery) = match self.leader.as_ref().and_then(|l| l.follower(peer)) {
            Some(follower) => (follower.next_index, follower.recovery),
            None => return Ok(None),
        };
        let last_index = self.storage.last_index()?;
        let prev_log_index = next_index - 1;
        let prev_log_term = self.storage.term_at(prev_log_index)?.ok_or_else(|| {
            Error::Storage(io::Error::new(
                io::ErrorKind::NotFound,
                format!("missing log entry {}", prev_log_index),
            ))
        })?;

        let kind = match recovery {
            RecoveryState::Probing { .. } => SendKind::Probe,
            RecoveryState::Recovering => SendKind::Recovery,
            RecoveryState::InSync if next_index > last_index => SendKind::Heartbeat,
            RecoveryState::InSync => SendKind::Replicate,
        };
        let entries = if kind == SendKind::Probe || next_index > last_index {
            Vec::new()
        } else {
            let last = last_index.min(next_index + self.settings.max_entries_per_request as u64 - 1);
            self.storage.read_range(next_index, last)?
        };

        Ok(Some(OutboundAppend {
            request: AppendRequest {
                term: self.current_term(),
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term,
                leader_commit: self.commit.commit_index(),
                entries,
            },
            kind,
        }))
    }

    /// Applies a follower's answer. Returns whether the follower still needs
    /// more requests right away.
    pub(crate) fn on_append_response(
        &mut self,
        peer: &str,
        sent: &OutboundAppend,
        response: AppendResponse,
    ) -> Result<bool> {
        let current_term = self.current_term();
        if response.term > current_term {
            let stale = Error::TermStale {
                local: current_term,
                observed: response.term,
            };
            info!("Peer {} answered with a newer term: {}", peer, stale);
            self.observe_term(response.term)?;
            return Ok(false);
        }
        if self.role != Role::Leader || sent.request.term != current_term {
            return Ok(false);
        }

        let last_index = self.storage.last_index()?;
        let follower = match self.leader.as_mut().and_then(|l| l.follower_mut(peer)) {
            Some(follower) => follower,
            None => return Ok(false),
        };
        follower.record_contact(peer);
        if response.success {
            follower.on_success(sent.request.last_index(), last_index);
        } else {
            follower.on_rejection(
                sent.request.prev_log_index,
                response.conflict.as_ref(),
                &self.storage,
            )?;
        }
        let more = follower.has_pending(last_index);

        if response.success {
            self.maybe_advance_commit()?;
        }
        Ok(more)
    }

    pub(crate) fn on_append_failure(&mut self, peer: &str, sent: &OutboundAppend, error: &Error) {
        self.record(ProbeEvent::Error(sent.kind.error_path()));
        debug!("{:?} request to {} failed: {}", sent.kind, peer, error);
        let max_attempts = self.settings.max_probe_attempts;
        if let Some(follower) = self.leader.as_mut().and_then(|l| l.follower_mut(peer)) {
            follower.on_failure(peer, max_attempts);
        }
    }

    pub(crate) fn handle_append_request(&mut self, request: AppendRequest) -> Result<AppendResponse> {
        self.record(ProbeEvent::AppendRequestReceived);
        self.ensure_running()?;
        let current_term = self.current_term();
        if request.term < current_term {
            debug!(
                "Rejecting append from {}: term {} is older than {}",
                request.leader_id, request.term, current_term
            );
            return Ok(AppendResponse::failed(current_term));
        }
        self.observe_term(request.term)?;
        if self.role == Role::Leader {
            error!(
                "{} received an append from {} while leading term {}",
                self.id, request.leader_id, request.term
            );
            return Ok(AppendResponse::failed(self.current_term()));
        }
        self.become_follower(&request.leader_id);
        self.signals.leader_contact();
        let term = self.current_term();

        if let Some(hint) = self.find_conflict(request.prev_log_index, request.prev_log_term)? {
            let conflict = Error::LogConflict {
                index: request.prev_log_index,
                expected: request.prev_log_term,
                found: hint.term,
            };
            debug!("Rejecting append from {}: {}", request.leader_id, conflict);
            return Ok(AppendResponse::conflict(term, hint));
        }

        let mut new_entries: Vec<LogEntry> = Vec::new();
        for entry in request.entries.iter() {
            if !new_entries.is_empty() {
                new_entries.push(entry.clone());
                continue;
            }
            match self.storage.term_at(entry.index)? {
                Some(existing) if existing == entry.term => {}
                Some(_) => {
                    self.truncate_log(entry.index - 1)?;
                    new_entries.push(entry.clone());
                }
                None => new_entries.push(entry.clone()),
            }
        }
        if !new_entries.is_empty() {
            self.storage.append(&new_entries)?;
            self.flush.record_append(&new_entries);
        }

        let matched = request.last_index();
        // Only durable entries are acknowledged.
        if matched > self.flush.flushed_index() {
            self.flush_log()?;
        }
        if self.commit.advance(request.leader_commit.min(matched)) {
            trace!("Commit index is now {}", self.commit.commit_index());
            self.signals.commit_advanced();
        }
        Ok(AppendResponse::success(term, matched))
    }

    fn find_conflict(&self, prev_index: LogIndex, prev_term: Term) -> Result<Option<ConflictHint>> {
        match self.storage.term_at(prev_index)? {
            Some(term) if term == prev_term => Ok(None),
            Some(term) => Ok(Some(ConflictHint {
                term: Some(term),
                first_index: self.first_index_of_term(term, prev_index)?,
            })),
            None => Ok(Some(ConflictHint {
                term: None,
                first_index: self.storage.last_index()? + 1,
            })),
        }
    }

    fn first_index_of_term(&self, term: Term, from: LogIndex) -> Result<LogIndex> {
        let floor = self.commit.commit_index() + 1;
        let mut index = from;
        while index > floor && self.storage.term_at(index - 1)? == Some(term) {
            index -= 1;
        }
        Ok(index)
    }
}
