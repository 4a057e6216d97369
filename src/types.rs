use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

pub type Term = u64;
pub type LogIndex = u64;
pub type ReplicaId = String;

/// Per-entry bookkeeping overhead used when sizing the unflushed backlog.
const ENTRY_OVERHEAD_BYTES: usize = 16;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    /// Terminal: the replica hit a fatal consistency error or was shut down.
    Halted,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Halted => "halted",
        };
        f.write_str(name)
    }
}

/// How much acknowledgment a proposal collects before it is reported complete.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConsistencyLevel {
    /// Complete once appended to the leader's log.
    AckNone,
    /// Complete once the leader has flushed the entry.
    AckLeader,
    /// Complete once the entry is committed by a quorum.
    AckAll,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum LogCommand {
    Command(Bytes),
    Noop,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: LogCommand,
}

impl LogEntry {
    pub fn size(&self) -> usize {
        let payload = match self.command {
            LogCommand::Command(ref data) => data.len(),
            LogCommand::Noop => 0,
        };
        payload + ENTRY_OVERHEAD_BYTES
    }
}

/// Namespace, topic and partition number a replica serves.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash)]
pub struct PartitionId {
    pub namespace: String,
    pub topic: String,
    pub partition: u32,
}

impl Default for PartitionId {
    fn default() -> Self {
        PartitionId {
            namespace: "kafka".to_string(),
            topic: "default".to_string(),
            partition: 0,
        }
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Peer {
    pub id: ReplicaId,
    pub address: String,
    pub voting: bool,
}

impl Peer {
    pub fn voting(id: &str) -> Peer {
        Peer {
            id: id.to_string(),
            address: id.to_string(),
            voting: true,
        }
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({}: {})", self.id, self.address)
    }
}

/// Point-in-time view of a replica, as returned by `Replica::status`.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct ReplicaStatus {
    pub id: ReplicaId,
    pub partition: PartitionId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<ReplicaId>,
    pub commit_index: LogIndex,
    pub flushed_index: LogIndex,
    pub last_index: LogIndex,
    pub applied_index: LogIndex,
}
