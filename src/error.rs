use crate::types::{LogIndex, ReplicaId, Term};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("this replica is not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<ReplicaId> },
    #[error("local term {local} is stale, peer is on term {observed}")]
    TermStale { local: Term, observed: Term },
    #[error("log conflict at index {index}: leader has term {expected}, local log has {found:?}")]
    LogConflict {
        index: LogIndex,
        expected: Term,
        found: Option<Term>,
    },
    #[error("{voter} rejected the vote request for term {term}")]
    VoteRejected { voter: ReplicaId, term: Term },
    #[error("append request to {0} timed out")]
    ReplicationTimeout(ReplicaId),
    #[error("replica {0} is unreachable")]
    Unreachable(ReplicaId),
    #[error("refusing to truncate after index {after_index}: commit index is {commit_index}")]
    TruncationBelowCommit {
        after_index: LogIndex,
        commit_index: LogIndex,
    },
    #[error("durable index went backwards from {previous} to {durable}")]
    FlushRegressed { previous: LogIndex, durable: LogIndex },
    #[error("entry {0} was truncated before it became durable")]
    EntryTruncated(LogIndex),
    #[error("the replica has halted")]
    Halted,
    #[error("the raft protocol has been terminated")]
    RaftProtocolTerminated,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("could not parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("error while interacting with stable storage: {0}")]
    Storage(#[from] std::io::Error),
    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Fatal errors mean a committed entry or a durability guarantee was
    /// violated; the replica must halt instead of continuing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::TruncationBelowCommit { .. } | Error::FlushRegressed { .. }
        )
    }
}
