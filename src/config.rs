use crate::error::{Error, Result};
use crate::types::{PartitionId, Peer, ReplicaId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 500;
const DEFAULT_MAX_ENTRIES_PER_REQUEST: usize = 100;
const DEFAULT_MAX_PROBE_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_UNFLUSHED_ENTRIES: usize = 1024;
const DEFAULT_MAX_UNFLUSHED_BYTES: usize = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub id: ReplicaId,
    pub partition: Option<PartitionId>,
    pub peer: Option<Vec<PeerConfig>>,
    pub election_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub append_timeout_ms: Option<u64>,
    pub max_election_backoff_ms: Option<u64>,
    pub max_entries_per_request: Option<usize>,
    pub max_probe_attempts: Option<u32>,
    pub max_unflushed_entries: Option<usize>,
    pub max_unflushed_bytes: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerConfig {
    pub id: ReplicaId,
    pub address: Option<String>,
    pub voting: Option<bool>,
}

/// Resolved and validated tunables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub append_timeout: Duration,
    pub max_election_backoff: Duration,
    pub max_entries_per_request: usize,
    pub max_probe_attempts: u32,
    pub max_unflushed_entries: usize,
    pub max_unflushed_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let election_timeout = Duration::from_millis(DEFAULT_ELECTION_TIMEOUT_MS);
        Settings {
            election_timeout,
            // The broadcast time should be an order of magnitude less than the
            // election timeout.
            heartbeat_interval: election_timeout / 10,
            append_timeout: election_timeout,
            max_election_backoff: election_timeout * 8,
            max_entries_per_request: DEFAULT_MAX_ENTRIES_PER_REQUEST,
            max_probe_attempts: DEFAULT_MAX_PROBE_ATTEMPTS,
            max_unflushed_entries: DEFAULT_MAX_UNFLUSHED_ENTRIES,
            max_unflushed_bytes: DEFAULT_MAX_UNFLUSHED_BYTES,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval >= self.election_timeout {
            return Err(Error::Config(format!(
                "heartbeat interval {:?} must be shorter than the election timeout {:?}",
                self.heartbeat_interval, self.election_timeout
            )));
        }
        if self.max_election_backoff < self.election_timeout {
            return Err(Error::Config(
                "election backoff cap must be at least the election timeout".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.append_timeout.is_zero() {
            return Err(Error::Config(
                "heartbeat interval and append timeout must be positive".to_string(),
            ));
        }
        if self.max_entries_per_request == 0
            || self.max_probe_attempts == 0
            || self.max_unflushed_entries == 0
            || self.max_unflushed_bytes == 0
        {
            return Err(Error::Config(
                "entry, probe and backlog limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn new(id: &str, peers: &[&str]) -> Config {
        Config {
            id: id.to_string(),
            partition: None,
            peer: Some(
                peers
                    .iter()
                    .map(|p| PeerConfig {
                        id: p.to_string(),
                        address: None,
                        voting: None,
                    })
                    .collect(),
            ),
            election_timeout_ms: None,
            heartbeat_interval_ms: None,
            append_timeout_ms: None,
            max_election_backoff_ms: None,
            max_entries_per_request: None,
            max_probe_attempts: None,
            max_unflushed_entries: None,
            max_unflushed_bytes: None,
        }
    }

    pub fn from_toml(input: &str) -> Result<Config> {
        Ok(toml::from_str(input)?)
    }

    pub fn partition(&self) -> PartitionId {
        self.partition.clone().unwrap_or_default()
    }

    pub fn peers(&self) -> Result<Vec<Peer>> {
        let mut peers: Vec<Peer> = Vec::new();
        for p in self.peer.iter().flatten() {
            if p.id == self.id {
                return Err(Error::Config(format!(
                    "replica {} lists itself as a peer",
                    p.id
                )));
            }
            if peers.iter().any(|existing| existing.id == p.id) {
                return Err(Error::Config(format!("peer {} is listed twice", p.id)));
            }
            peers.push(Peer {
                id: p.id.clone(),
                address: p.address.clone().unwrap_or_else(|| p.id.clone()),
                voting: p.voting.unwrap_or(true),
            });
        }
        Ok(peers)
    }

    pub fn settings(&self) -> Result<Settings> {
        let defaults = Settings::default();
        let election_timeout = self
            .election_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.election_timeout);
        let settings = Settings {
            election_timeout,
            heartbeat_interval: self
                .heartbeat_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(election_timeout / 10),
            append_timeout: self
                .append_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(election_timeout),
            max_election_backoff: self
                .max_election_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(election_timeout * 8),
            max_entries_per_request: self
                .max_entries_per_request
                .unwrap_or(defaults.max_entries_per_request),
            max_probe_attempts: self
                .max_probe_attempts
                .unwrap_or(defaults.max_probe_attempts),
            max_unflushed_entries: self
                .max_unflushed_entries
                .unwrap_or(defaults.max_unflushed_entries),
            max_unflushed_bytes: self
                .max_unflushed_bytes
                .unwrap_or(defaults.max_unflushed_bytes),
        };
        settings.validate()?;
        Ok(settings)
    }
}
