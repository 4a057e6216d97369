use crate::error::Result;
use crate::types::{LogEntry, LogIndex, ReplicaId, Term};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct AppendRequest {
    pub term: Term,
    pub leader_id: ReplicaId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    pub entries: Vec<LogEntry>,
}

impl AppendRequest {
    /// Index of the last entry this request would leave in place on success.
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }
}

/// Where a follower's log diverges from the leader's `prev_log_index`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConflictHint {
    /// Term the follower holds at the probed index, or `None` if its log is
    /// shorter than that.
    pub term: Option<Term>,
    /// First index of `term` in the follower's log, or one past the end of
    /// the follower's log when `term` is `None`.
    pub first_index: LogIndex,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct AppendResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
    pub conflict: Option<ConflictHint>,
}

impl AppendResponse {
    pub fn success(term: Term, match_index: LogIndex) -> AppendResponse {
        AppendResponse {
            term,
            success: true,
            match_index,
            conflict: None,
        }
    }

    pub fn failed(term: Term) -> AppendResponse {
        AppendResponse {
            term,
            success: false,
            match_index: 0,
            conflict: None,
        }
    }

    pub fn conflict(term: Term, hint: ConflictHint) -> AppendResponse {
        AppendResponse {
            term,
            success: false,
            match_index: 0,
            conflict: Some(hint),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: ReplicaId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

impl VoteResponse {
    pub fn granted(term: Term) -> VoteResponse {
        VoteResponse {
            term,
            granted: true,
        }
    }

    pub fn failed(term: Term) -> VoteResponse {
        VoteResponse {
            term,
            granted: false,
        }
    }
}

/// Outbound side of the RPC collaborator.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn append_entries(&self, target: &str, request: AppendRequest) -> Result<AppendResponse>;

    async fn request_vote(&self, target: &str, request: VoteRequest) -> Result<VoteResponse>;
}

/// Inbound side: what a transport delivers requests to.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn append_entries(&self, request: AppendRequest) -> Result<AppendResponse>;

    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse>;
}

mod memory;

pub use memory::MemoryNetwork;
