//! # Keelson
//!
//! `keelson` is the consensus core of a partitioned, replicated log: leader
//! election, log replication, commit tracking and follower recovery for one
//! replica set. Storage, transport and the state machine are supplied by the
//! embedding application through the [`storage::LogStorage`],
//! [`rpc::Transport`] and [`StateMachine`] traits.

pub mod config;
pub mod error;
pub mod ledger;
pub mod probe;
mod protocol;
pub mod rpc;
pub mod storage;
mod types;

pub use config::{Config, PeerConfig, Settings};
pub use error::{Error, Result};
pub use protocol::{NullStateMachine, RaftServer, Replica, StateMachine};
pub use types::{
    ConsistencyLevel, LogCommand, LogEntry, LogIndex, PartitionId, Peer, ReplicaId,
    ReplicaStatus, Role, Term,
};
