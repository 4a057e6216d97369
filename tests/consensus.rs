mod common;

use bytes::Bytes;
use common::{cluster, eventually, CONFIG_1, CONFIG_2, CONFIG_3, SOLO_CONFIG};
use keelson::probe::{ErrorPath, ProbeEvent};
use keelson::{ConsistencyLevel, Error, Role};
use std::collections::HashMap;
use std::time::Duration;

const CLUSTER: [&str; 3] = [CONFIG_1, CONFIG_2, CONFIG_3];

fn payload(i: usize) -> Bytes {
    Bytes::from(format!("record {}", i))
}

#[tokio::test]
async fn one_leader_per_term() {
    let cluster = &cluster(&CLUSTER).await;
    let mut leaders: HashMap<u64, String> = HashMap::new();
    for _ in 0..40 {
        for status in cluster.statuses().await {
            if status.role == Role::Leader {
                let leader = leaders.entry(status.term).or_insert_with(|| status.id.clone());
                assert_eq!(*leader, status.id, "two leaders in term {}", status.term);
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let leader = cluster.wait_for_leader(&[]).await;
    if let Some(seen) = leaders.get(&leader.term) {
        assert_eq!(*seen, leader.id);
    }
    assert!(!leaders.is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn committed_entries_apply_everywhere_in_order() {
    let cluster = &cluster(&CLUSTER).await;
    let leader = cluster.wait_for_leader(&[]).await;
    let replica = &cluster.member(&leader.id).replica;

    let mut last = 0;
    for i in 1..=10 {
        let index = replica
            .propose(payload(i), ConsistencyLevel::AckAll)
            .await
            .unwrap();
        assert!(index > last);
        last = index;
    }
    assert!(replica.status().await.unwrap().commit_index >= last);

    eventually("every replica to apply the writes", || async move {
        let statuses = cluster.statuses().await;
        statuses.iter().all(|s| s.applied_index >= last)
    })
    .await;

    let expected: Vec<Bytes> = (1..=10).map(payload).collect();
    for member in &cluster.members {
        let applied: Vec<Bytes> = member
            .recorder
            .applied()
            .await
            .into_iter()
            .map(|(_, command)| command)
            .collect();
        assert_eq!(applied, expected, "{} applied a different history", member.replica.id());
    }

    let logs_match = {
        let reference = replica.log_entries().await.unwrap();
        let mut all = true;
        for member in &cluster.members {
            all &= member.replica.log_entries().await.unwrap() == reference;
        }
        all
    };
    assert!(logs_match);

    let probe = &cluster.member(&leader.id).probe;
    assert_eq!(
        probe.get(ProbeEvent::ReplicateRequest(ConsistencyLevel::AckAll)),
        10
    );
    assert_eq!(probe.get(ProbeEvent::ReplicateDone), 10);
    assert!(probe.get(ProbeEvent::LogFlushed) > 0);
    let exported = probe.encode().unwrap();
    assert!(exported.contains("raft_replicate_ack_all_requests{"));
    assert!(exported.contains("topic=\"orders\""));
    cluster.shutdown().await;
}

#[tokio::test]
async fn ack_none_and_ack_leader_complete_without_followers() {
    let cluster = &cluster(&CLUSTER).await;
    let leader = cluster.wait_for_leader(&[]).await;
    let member = cluster.member(&leader.id);
    for status in cluster.statuses().await {
        if status.id != leader.id {
            cluster.network.isolate(&status.id).await;
        }
    }

    let unacked = tokio::time::timeout(
        Duration::from_secs(1),
        member.replica.propose(payload(1), ConsistencyLevel::AckNone),
    )
    .await
    .expect("AckNone blocked")
    .unwrap();
    let flushed = tokio::time::timeout(
        Duration::from_secs(1),
        member.replica.propose(payload(2), ConsistencyLevel::AckLeader),
    )
    .await
    .expect("AckLeader blocked")
    .unwrap();
    assert!(flushed > unacked);
    assert!(member.replica.status().await.unwrap().flushed_index >= flushed);

    // Without a majority nothing commits.
    let quorum = tokio::time::timeout(
        Duration::from_millis(500),
        member.replica.propose(payload(3), ConsistencyLevel::AckAll),
    )
    .await;
    assert!(quorum.is_err());
    assert!(member.replica.status().await.unwrap().commit_index < unacked);

    // Failures are only visible through the probe.
    let errors = |probe: &keelson::probe::CounterProbe| {
        probe.get(ProbeEvent::Error(ErrorPath::Heartbeat))
            + probe.get(ProbeEvent::Error(ErrorPath::Replicate))
            + probe.get(ProbeEvent::Error(ErrorPath::Recovery))
    };
    assert!(errors(&member.probe) > 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn failover_keeps_committed_entries() {
    let cluster = &cluster(&CLUSTER).await;
    let old = cluster.wait_for_leader(&[]).await;
    for i in 1..=3 {
        cluster
            .member(&old.id)
            .replica
            .propose(payload(i), ConsistencyLevel::AckAll)
            .await
            .unwrap();
    }

    cluster.network.isolate(&old.id).await;
    let new = cluster.wait_for_leader(&[old.id.as_str()]).await;
    assert_ne!(new.id, old.id);
    assert!(new.term > old.term);
    for i in 4..=5 {
        cluster
            .member(&new.id)
            .replica
            .propose(payload(i), ConsistencyLevel::AckAll)
            .await
            .unwrap();
    }

    cluster.network.reconnect(&old.id).await;
    let old_id = old.id.as_str();
    eventually("the old leader to rejoin as a follower", || async move {
        let status = cluster.member(old_id).replica.status().await.unwrap();
        status.role == Role::Follower && status.applied_index >= 5
    })
    .await;

    let expected: &Vec<Bytes> = &(1..=5).map(payload).collect();
    eventually("every replica to apply all five writes", || async move {
        let mut done = true;
        for member in &cluster.members {
            let applied: Vec<Bytes> = member
                .recorder
                .applied()
                .await
                .into_iter()
                .map(|(_, command)| command)
                .collect();
            done &= applied == *expected;
        }
        done
    })
    .await;
    assert!(cluster.member(&old.id).probe.get(ProbeEvent::LeadershipChanged) >= 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn followers_redirect_proposals() {
    let cluster = &cluster(&CLUSTER).await;
    let leader = cluster.wait_for_leader(&[]).await;
    let follower = cluster
        .members
        .iter()
        .find(|m| m.replica.id() != leader.id)
        .unwrap();
    match follower
        .replica
        .propose(payload(1), ConsistencyLevel::AckAll)
        .await
    {
        Err(Error::NotLeader { leader: Some(id) }) => assert_eq!(id, leader.id),
        other => panic!("unexpected proposal result {:?}", other),
    }
    assert!(follower.probe.get(ProbeEvent::AppendRequestReceived) > 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn single_replica_commits_alone() {
    let cluster = &cluster(&[SOLO_CONFIG]).await;
    let leader = cluster.wait_for_leader(&[]).await;
    assert_eq!(leader.id, "solo");
    let replica = &cluster.member("solo").replica;
    let index = replica
        .propose(payload(1), ConsistencyLevel::AckAll)
        .await
        .unwrap();
    assert!(replica.status().await.unwrap().commit_index >= index);
    assert_eq!(
        cluster.member("solo").probe.get(ProbeEvent::VoteRequestSent),
        0
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_proposals() {
    let cluster = &cluster(&CLUSTER).await;
    let leader = cluster.wait_for_leader(&[]).await;
    let replica = &cluster.member(&leader.id).replica;
    replica.shutdown().await;
    assert_eq!(replica.status().await.unwrap().role, Role::Halted);
    assert!(matches!(
        replica.propose(payload(1), ConsistencyLevel::AckNone).await,
        Err(Error::Halted)
    ));
    cluster.shutdown().await;
}
