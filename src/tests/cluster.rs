use std::{sync::Arc, time::Duration};

use crate::{
    cluster::{
        event::{Event, EventFilter},
        member::MemberStatus,
        query::QueryParams,
        Cluster, ClusterConfig,
    },
    swim::{codec::QueryFilter, security::Keyring, SwimConfig},
    tests::utils::*,
};

fn member_status(cluster: &Arc<Cluster>, name: &str) -> Option<MemberStatus> {
    cluster
        .members()
        .into_iter()
        .find(|member| member.name == name)
        .map(|member| member.status)
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_join_and_heartbeat() {
    let a = start_node("node-a").await;
    let b = start_node("node-b").await;

    let joined = b.join(&[a.swim.advertise]).await.unwrap();
    assert_eq!(joined, 1);

    for node in [&a, &b] {
        assert!(
            wait_until(Duration::from_secs(5), || {
                let members = node.members();
                members.len() == 2
                    && members.iter().all(|m| m.status == MemberStatus::Alive)
            })
            .await,
            "both sides should see two alive members"
        );
    }

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn user_events_disseminate_and_coalesce() {
    let a = start_node("node-a").await;
    let b = start_node("node-b").await;
    b.join(&[a.swim.advertise]).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || b.members().len() == 2).await);

    let (_, mut events) = b.subscribe_coalesced(vec![EventFilter::User(Some(
        "deploy".to_string(),
    ))]);

    a.user_event("deploy", b"v1".to_vec(), true).unwrap();
    a.user_event("deploy", b"v2".to_vec(), true).unwrap();
    a.user_event("deploy", b"v3".to_vec(), true).unwrap();

    // Three publishes inside the coalesce window surface as a single
    // event carrying the latest payload.
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event within the deadline")
        .expect("event stream closed");
    match event {
        Event::User(event) => {
            assert_eq!(event.name, "deploy");
            assert_eq!(event.payload, b"v3");
            assert!(event.coalesce);
        }
        other => panic!("expected a user event, got {:?}", other),
    }

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_user_events_are_rejected() {
    let a = start_node("node-a").await;
    let payload = vec![0u8; a.config.user_event_size_limit + 1];
    assert!(a.user_event("big", payload, false).is_err());
    a.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_nodes_are_detected_and_reaped() {
    let mut config = test_cluster_config();
    config.reconnect_timeout = Duration::from_millis(500);
    let a = start_node_with("node-a", config, None).await;
    let b = start_node("node-b").await;
    b.join(&[a.swim.advertise]).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || a.members().len() == 2).await);

    // Kill B without a leave broadcast.
    b.shutdown();

    assert!(
        wait_until(Duration::from_secs(10), || {
            member_status(&a, "node-b") == Some(MemberStatus::Failed)
        })
        .await,
        "node-b should transition to Failed"
    );

    // After the reconnect timeout the tombstone is purged.
    assert!(
        wait_until(Duration::from_secs(5), || {
            member_status(&a, "node-b").is_none()
        })
        .await,
        "node-b should be reaped"
    );

    a.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_leave_lands_in_left() {
    let a = start_node("node-a").await;
    let b = start_node("node-b").await;
    b.join(&[a.swim.advertise]).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || a.members().len() == 2).await);

    b.leave().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            member_status(&a, "node-b") == Some(MemberStatus::Left)
        })
        .await,
        "a graceful departure must land in Left, not Failed"
    );

    b.shutdown();
    a.shutdown();
}

fn respond_to_health_queries(cluster: &Arc<Cluster>) {
    let name = cluster.swim.config.node_name.clone();
    let (_, mut queries) = cluster.subscribe(vec![EventFilter::Query(Some(
        "health".to_string(),
    ))]);
    tokio::spawn(async move {
        while let Some(event) = queries.recv().await {
            if let Event::Query(query) = event {
                query.respond(name.clone().into_bytes()).ok();
            }
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn queries_honor_tag_filters() {
    let a = start_tagged_node("node-a", &[("role", "api")]).await;
    let b = start_tagged_node("node-b", &[("role", "db")]).await;
    let c = start_tagged_node("node-c", &[("role", "api")]).await;
    b.join(&[a.swim.advertise]).await.unwrap();
    c.join(&[a.swim.advertise]).await.unwrap();
    for node in [&a, &b, &c] {
        assert!(wait_until(Duration::from_secs(5), || node.members().len() == 3).await);
        respond_to_health_queries(node);
    }

    let mut handle = a
        .query(
            "health",
            Vec::new(),
            QueryParams {
                filters: vec![QueryFilter::Tag("role".to_string(), "api".to_string())],
                request_ack: false,
                relay_factor: 0,
                timeout: Some(Duration::from_secs(1)),
            },
        )
        .unwrap();

    let mut responders = Vec::new();
    while let Some(response) = handle.response_rx.recv().await {
        responders.push(response.from);
    }
    responders.sort();
    assert_eq!(responders, vec!["node-a".to_string(), "node-c".to_string()]);

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn query_with_no_peers_completes_immediately() {
    let a = start_node("node-a").await;

    let started = std::time::Instant::now();
    let mut handle = a
        .query(
            "health",
            Vec::new(),
            QueryParams {
                filters: vec![QueryFilter::NodeName("nobody".to_string())],
                request_ack: true,
                relay_factor: 0,
                timeout: Some(Duration::from_secs(5)),
            },
        )
        .unwrap();

    assert!(handle.response_rx.recv().await.is_none());
    assert!(handle.ack_rx.recv().await.is_none());
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "an empty cluster must not wait out the full deadline"
    );

    a.shutdown();
}

fn shared_key() -> Vec<u8> {
    vec![7u8; 32]
}

async fn start_encrypted_node(name: &str) -> Arc<Cluster> {
    start_node_with(
        name,
        test_cluster_config(),
        Some(Arc::new(Keyring::new(shared_key(), None).unwrap())),
    )
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn key_rotation_across_the_cluster() {
    let a = start_encrypted_node("node-a").await;
    let b = start_encrypted_node("node-b").await;
    let c = start_encrypted_node("node-c").await;
    b.join(&[a.swim.advertise]).await.unwrap();
    c.join(&[a.swim.advertise]).await.unwrap();
    for node in [&a, &b, &c] {
        assert!(wait_until(Duration::from_secs(5), || node.members().len() == 3).await);
    }

    let new_key = base64::encode(vec![9u8; 32]);
    let old_key = base64::encode(shared_key());

    let response = a.install_key(&new_key).await.unwrap();
    assert_eq!(response.num_err, 0, "{:?}", response.messages);
    assert!(response.num_resp >= 2);

    let response = a.use_key(&new_key).await.unwrap();
    assert_eq!(response.num_err, 0, "{:?}", response.messages);
    for node in [&a, &b, &c] {
        assert!(
            wait_until(Duration::from_secs(2), || {
                base64::encode(node.swim.keyring().unwrap().primary_key()) == new_key
            })
            .await,
            "every node must switch its primary key"
        );
    }

    let response = a.remove_key(&old_key).await.unwrap();
    assert_eq!(response.num_err, 0, "{:?}", response.messages);

    let listing = a.list_keys().await.unwrap();
    assert_eq!(listing.primary_keys.keys().collect::<Vec<_>>(), vec![&new_key]);
    assert!(!listing.keys.contains_key(&old_key));

    // Gossip still flows on the rotated key.
    assert!(
        wait_until(Duration::from_secs(5), || {
            a.members()
                .iter()
                .all(|member| member.status == MemberStatus::Alive)
        })
        .await
    );

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_key_listings_truncate_but_succeed() {
    let keyring = Arc::new(Keyring::new(shared_key(), None).unwrap());
    for fill in 1u8..=8 {
        keyring.install(vec![fill; 32]).unwrap();
    }

    let mut config = test_cluster_config();
    // Small enough that nine keys cannot possibly fit.
    config.query_response_size_limit = 256;
    let a = start_node_with("node-a", config, Some(keyring)).await;

    let listing = a.list_keys().await.unwrap();
    assert_eq!(listing.num_err, 0, "{:?}", listing.messages);
    let reported: usize = listing.keys.values().sum();
    assert!(reported > 0 && reported < 9, "got {} keys", reported);
    assert!(listing
        .messages
        .values()
        .any(|message| message.contains("truncated")));

    a.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_recovery_restores_state_and_rejoins() {
    let dir = temp_dir("mesh-recovery");
    let snapshot_path = dir.join("snapshot");

    let mut config_a = test_cluster_config();
    config_a.snapshot_path = Some(snapshot_path.clone());
    let a = start_node_with("node-a", config_a.clone(), None).await;
    let b = start_node("node-b").await;
    let c = start_node("node-c").await;
    b.join(&[a.swim.advertise]).await.unwrap();
    c.join(&[a.swim.advertise]).await.unwrap();
    for node in [&a, &b, &c] {
        assert!(wait_until(Duration::from_secs(5), || node.members().len() == 3).await);
    }

    a.user_event("checkpoint", b"1".to_vec(), false).unwrap();
    let event_time = a.event_clock.time();
    let member_time = a.swim.clock.time();

    // Stop A without a leave and give the snapshotter time to drain.
    a.shutdown();
    tokio::time::sleep(Duration::from_millis(600)).await;

    // The restarted node recovers its clocks and alive set before any
    // join, then contacts the previously known peers on its own.
    let restarted = start_node_with("node-a", config_a, None).await;
    assert!(restarted.event_clock.time() >= event_time);
    assert!(restarted.swim.clock.time() >= member_time);

    assert!(
        wait_until(Duration::from_secs(10), || {
            member_status(&b, "node-a") == Some(MemberStatus::Alive)
                && restarted.members().len() == 3
        })
        .await,
        "the restarted node should rejoin via its snapshot"
    );

    restarted.shutdown();
    b.shutdown();
    c.shutdown();
    destroy_temp_dir(&dir);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejoining_after_leave_looks_like_a_fresh_join() {
    let a = start_node("node-a").await;
    let b = start_node("node-b").await;
    b.join(&[a.swim.advertise]).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || a.members().len() == 2).await);

    b.leave().await.unwrap();
    b.shutdown();
    assert!(
        wait_until(Duration::from_secs(5), || {
            member_status(&a, "node-b") == Some(MemberStatus::Left)
        })
        .await
    );

    // A fresh instance under the same name joins cleanly.
    let b2 = start_node("node-b").await;
    b2.join(&[a.swim.advertise]).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            member_status(&a, "node-b") == Some(MemberStatus::Alive)
        })
        .await,
        "the rejoining node must supersede its tombstone"
    );

    a.shutdown();
    b2.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn suspicion_of_a_live_node_is_refuted() {
    use crate::swim::codec::Suspect;

    let a = start_node("node-a").await;
    let b = start_node("node-b").await;
    b.join(&[a.swim.advertise]).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || b.members().len() == 2).await);

    let incarnation = b
        .members()
        .into_iter()
        .find(|m| m.name == "node-a")
        .unwrap()
        .incarnation;

    // Falsely accuse A; it must re-assert itself with exactly one
    // incarnation bump.
    b.swim.suspect_node(Suspect {
        ltime: b.swim.clock.increment(),
        incarnation,
        node: "node-a".to_string(),
        from: "node-b".to_string(),
    });

    assert!(
        wait_until(Duration::from_secs(5), || {
            b.members()
                .into_iter()
                .find(|m| m.name == "node-a")
                .map(|m| m.status == MemberStatus::Alive && m.incarnation == incarnation + 1)
                .unwrap_or(false)
        })
        .await,
        "the accused node should refute with incarnation + 1"
    );

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn tag_updates_gossip_to_peers() {
    let a = start_node("node-a").await;
    let b = start_node("node-b").await;
    b.join(&[a.swim.advertise]).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || a.members().len() == 2).await);

    b.set_tags(
        [("role".to_string(), "db".to_string())].into_iter().collect(),
        &[],
    )
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            a.members()
                .into_iter()
                .find(|m| m.name == "node-b")
                .map(|m| m.tags.get("role") == Some(&"db".to_string()))
                .unwrap_or(false)
        })
        .await,
        "tag updates must reach other members"
    );

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn coordinates_are_estimated_from_probes() {
    let config = ClusterConfig::default();
    let mut swim_a = SwimConfig::local("node-a");
    swim_a.probe_interval = Duration::from_millis(100);
    swim_a.probe_timeout = Duration::from_millis(50);
    let a = Cluster::start(
        config.clone(),
        swim_a,
        None,
        Arc::new(crate::metrics::Metrics::default()),
    )
    .await
    .unwrap();
    let b = start_node("node-b").await;
    b.join(&[a.swim.advertise]).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            a.get_coordinate("node-b").is_some()
        })
        .await,
        "probing should learn the peer's coordinate"
    );
    assert!(a.get_coordinate("node-a").is_some());
    assert!(a.get_coordinate("nobody").is_none());

    a.shutdown();
    b.shutdown();
}
