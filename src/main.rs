use bytes::Bytes;
use env_logger::Env;
use keelson::probe::CounterProbe;
use keelson::rpc::MemoryNetwork;
use keelson::storage::MemoryStorage;
use keelson::{Config, ConsistencyLevel, NullStateMachine, PeerConfig, Replica, Role};
use log::info;
use std::env;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG: &str = r#"
id = "peer1"
election_timeout_ms = 300
[[peer]]
id = "peer2"
[[peer]]
id = "peer3"
"#;

const LEADER_WAIT: Duration = Duration::from_secs(10);

/// The configuration `id` would use in the replica set `config` describes.
fn peer_config(config: &Config, id: &str) -> Config {
    let mut peer = config.clone();
    peer.id = id.to_string();
    peer.peer = Some(
        config
            .peer
            .iter()
            .flatten()
            .filter(|p| p.id != id)
            .cloned()
            .chain(std::iter::once(PeerConfig {
                id: config.id.clone(),
                address: None,
                voting: Some(true),
            }))
            .collect(),
    );
    peer
}

async fn wait_for_leader(replicas: &[Replica<MemoryStorage>]) -> Result<usize, Box<dyn Error>> {
    let deadline = tokio::time::Instant::now() + LEADER_WAIT;
    while tokio::time::Instant::now() < deadline {
        for (i, replica) in replicas.iter().enumerate() {
            if replica.status().await?.role == Role::Leader {
                return Ok(i);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Err("no leader was elected".into())
}

/// Runs the configured replica set in-process and pushes a few writes
/// through it.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let input = match env::args().nth(1) {
        Some(path) => std::fs::read_to_string(path)?,
        None => DEFAULT_CONFIG.to_string(),
    };
    let config = Config::from_toml(&input)?;

    let network = MemoryNetwork::new();
    let mut configs = vec![config.clone()];
    configs.extend(
        config
            .peer
            .iter()
            .flatten()
            .map(|p| peer_config(&config, &p.id)),
    );
    let mut replicas = Vec::new();
    let mut probes = Vec::new();
    for cfg in &configs {
        let probe = Arc::new(CounterProbe::new(cfg.partition())?);
        let replica = Replica::start(
            cfg,
            MemoryStorage::new(),
            network.transport(&cfg.id),
            NullStateMachine,
            probe.clone(),
        )
        .await?;
        network.register(&cfg.id, replica.server()).await;
        replicas.push(replica);
        probes.push(probe);
    }

    let leader = &replicas[wait_for_leader(&replicas).await?];
    info!("{} leads {}", leader.id(), config.partition());
    let levels = [
        ConsistencyLevel::AckNone,
        ConsistencyLevel::AckLeader,
        ConsistencyLevel::AckAll,
    ];
    for (i, level) in levels.iter().enumerate() {
        let payload = Bytes::from(format!("write {}", i + 1));
        let index = leader.propose(payload, *level).await?;
        info!("{:?} write landed at index {}", level, index);
    }

    // Give followers a heartbeat to learn the final commit index.
    tokio::time::sleep(config.settings()?.election_timeout).await;
    for (replica, probe) in replicas.iter().zip(&probes) {
        println!("{}", serde_json::to_string_pretty(&replica.status().await?)?);
        print!("{}", probe.encode()?);
    }
    for replica in &replicas {
        replica.shutdown().await;
    }
    Ok(())
}
