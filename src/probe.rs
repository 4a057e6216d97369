//! Event sink for the consensus core.
//!
//! The core reports every countable event through [`Probe::record`]
//! synchronously, while holding the replica's state lock, so implementations
//! must be cheap and must not block. [`CounterProbe`] registers one
//! Prometheus counter per metric of the `raft` group on its own registry,
//! labelled with the replica's partition. Serving the registry is left to the
//! embedding application.

use crate::error::{Error, Result};
use crate::types::{ConsistencyLevel, PartitionId};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Which request path an error was observed on.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorPath {
    Replicate,
    Heartbeat,
    Recovery,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProbeEvent {
    VoteRequestReceived,
    VoteRequestSent,
    AppendRequestReceived,
    ReplicateRequest(ConsistencyLevel),
    ReplicateDone,
    LogFlushed,
    LogTruncated,
    LeadershipChanged,
    Error(ErrorPath),
}

pub trait Probe: Send + Sync {
    fn record(&self, event: ProbeEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProbe;

impl Probe for NoopProbe {
    fn record(&self, _event: ProbeEvent) {}
}

pub const METRICS_GROUP: &str = "raft";

const LABELS: [&str; 3] = ["namespace", "topic", "partition"];

/// Name and description of every counter, in counter order.
pub const METRICS: [(&str, &str); 13] = [
    ("received_vote_requests", "Number of vote requests received"),
    ("received_append_requests", "Number of append requests received"),
    ("sent_vote_requests", "Number of vote requests sent"),
    (
        "replicate_ack_all_requests",
        "Number of replicate requests with quorum ack consistency",
    ),
    (
        "replicate_ack_leader_requests",
        "Number of replicate requests with leader ack consistency",
    ),
    (
        "replicate_ack_none_requests",
        "Number of replicate requests with no ack consistency",
    ),
    ("done_replicate_requests", "Number of finished replicate requests"),
    ("log_flushes", "Number of log flushes"),
    ("log_truncations", "Number of log truncations"),
    ("leadership_changes", "Number of leadership changes"),
    ("replicate_request_errors", "Number of failed replicate requests"),
    ("heartbeat_requests_errors", "Number of failed heartbeat requests"),
    ("recovery_requests_errors", "Number of failed recovery requests"),
];

fn counter_slot(event: ProbeEvent) -> usize {
    match event {
        ProbeEvent::VoteRequestReceived => 0,
        ProbeEvent::AppendRequestReceived => 1,
        ProbeEvent::VoteRequestSent => 2,
        ProbeEvent::ReplicateRequest(ConsistencyLevel::AckAll) => 3,
        ProbeEvent::ReplicateRequest(ConsistencyLevel::AckLeader) => 4,
        ProbeEvent::ReplicateRequest(ConsistencyLevel::AckNone) => 5,
        ProbeEvent::ReplicateDone => 6,
        ProbeEvent::LogFlushed => 7,
        ProbeEvent::LogTruncated => 8,
        ProbeEvent::LeadershipChanged => 9,
        ProbeEvent::Error(ErrorPath::Replicate) => 10,
        ProbeEvent::Error(ErrorPath::Heartbeat) => 11,
        ProbeEvent::Error(ErrorPath::Recovery) => 12,
    }
}

pub struct CounterProbe {
    partition: PartitionId,
    registry: Registry,
    counters: Vec<IntCounter>,
}

impl CounterProbe {
    pub fn new(partition: PartitionId) -> Result<CounterProbe> {
        let registry = Registry::new_custom(Some(METRICS_GROUP.to_string()), None)?;
        let number = partition.partition.to_string();
        let values = [
            partition.namespace.as_str(),
            partition.topic.as_str(),
            number.as_str(),
        ];
        let mut counters = Vec::with_capacity(METRICS.len());
        for (name, help) in METRICS.iter() {
            let vec = IntCounterVec::new(Opts::new(*name, *help), &LABELS)?;
            registry.register(Box::new(vec.clone()))?;
            counters.push(vec.with_label_values(&values));
        }
        Ok(CounterProbe {
            partition,
            registry,
            counters,
        })
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn get(&self, event: ProbeEvent) -> u64 {
        self.counters[counter_slot(event)].get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Every counter in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}

impl Probe for CounterProbe {
    fn record(&self, event: ProbeEvent) {
        self.counters[counter_slot(event)].inc();
    }
}
