use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use env_logger::Env;
use keelson::probe::CounterProbe;
use keelson::rpc::MemoryNetwork;
use keelson::storage::MemoryStorage;
use keelson::{Config, LogIndex, Replica, ReplicaStatus, Role, StateMachine};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn setup() {
    let _ = env_logger::Builder::from_env(Env::default())
        .filter_module("keelson", log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Remembers every command it was handed.
#[derive(Clone, Default)]
pub struct Recorder {
    applied: Arc<Mutex<Vec<(LogIndex, Bytes)>>>,
}

impl Recorder {
    pub async fn applied(&self) -> Vec<(LogIndex, Bytes)> {
        self.applied.lock().await.clone()
    }
}

#[async_trait]
impl StateMachine for Recorder {
    async fn apply(&mut self, index: LogIndex, command: Bytes) {
        self.applied.lock().await.push((index, command));
    }
}

pub struct Member {
    pub replica: Replica<MemoryStorage>,
    pub probe: Arc<CounterProbe>,
    pub recorder: Recorder,
}

pub struct Cluster {
    pub network: MemoryNetwork,
    pub members: Vec<Member>,
}

pub async fn cluster(configs: &[&str]) -> Cluster {
    setup();
    let network = MemoryNetwork::new();
    let mut members = Vec::new();
    for input in configs {
        let config = Config::from_toml(input).unwrap();
        let probe = Arc::new(CounterProbe::new(config.partition()).unwrap());
        let recorder = Recorder::default();
        let replica = Replica::start(
            &config,
            MemoryStorage::new(),
            network.transport(&config.id),
            recorder.clone(),
            probe.clone(),
        )
        .await
        .unwrap();
        network.register(&config.id, replica.server()).await;
        members.push(Member {
            replica,
            probe,
            recorder,
        });
    }
    Cluster { network, members }
}

impl Cluster {
    pub fn member(&self, id: &str) -> &Member {
        self.members
            .iter()
            .find(|m| m.replica.id() == id)
            .unwrap_or_else(|| panic!("no member {}", id))
    }

    pub async fn statuses(&self) -> Vec<ReplicaStatus> {
        let mut statuses = Vec::new();
        for member in &self.members {
            statuses.push(member.replica.status().await.unwrap());
        }
        statuses
    }

    /// Waits until one of the members outside `excluding` leads and every
    /// other member outside `excluding` follows it.
    pub async fn wait_for_leader(&self, excluding: &[&str]) -> ReplicaStatus {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let statuses: Vec<ReplicaStatus> = self
                .statuses()
                .await
                .into_iter()
                .filter(|s| !excluding.contains(&s.id.as_str()))
                .collect();
            let leader = statuses.iter().find(|s| s.role == Role::Leader);
            if let Some(leader) = leader {
                let agreed = statuses
                    .iter()
                    .all(|s| s.leader.as_deref() == Some(leader.id.as_str()) && s.term == leader.term);
                if agreed {
                    return leader.clone();
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no agreed leader among {:?}",
                statuses
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(&self) {
        for member in &self.members {
            member.replica.shutdown().await;
        }
    }
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub const CONFIG_1: &str = r#"
id = "peer1"
election_timeout_ms = 150
[partition]
namespace = "kafka"
topic = "orders"
partition = 0
[[peer]]
id = "peer2"
[[peer]]
id = "peer3"
"#;
pub const CONFIG_2: &str = r#"
id = "peer2"
election_timeout_ms = 150
[partition]
namespace = "kafka"
topic = "orders"
partition = 0
[[peer]]
id = "peer1"
[[peer]]
id = "peer3"
"#;
pub const CONFIG_3: &str = r#"
id = "peer3"
election_timeout_ms = 150
[partition]
namespace = "kafka"
topic = "orders"
partition = 0
[[peer]]
id = "peer1"
[[peer]]
id = "peer2"
"#;
pub const SOLO_CONFIG: &str = r#"
id = "solo"
election_timeout_ms = 150
"#;
