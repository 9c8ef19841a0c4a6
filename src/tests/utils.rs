use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use crate::{
    cluster::{Cluster, ClusterConfig},
    metrics::Metrics,
    swim::{security::Keyring, SwimConfig},
};

/// Timing profile tight enough for loopback tests.
pub fn test_cluster_config() -> ClusterConfig {
    ClusterConfig {
        coalesce_period: Duration::from_millis(500),
        quiescent_period: Duration::from_millis(200),
        reap_interval: Duration::from_millis(200),
        broadcast_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

pub async fn start_node(name: &str) -> Arc<Cluster> {
    start_node_with(name, test_cluster_config(), None).await
}

pub async fn start_node_with(
    name: &str,
    config: ClusterConfig,
    keyring: Option<Arc<Keyring>>,
) -> Arc<Cluster> {
    Cluster::start(
        config,
        SwimConfig::local(name),
        keyring,
        Arc::new(Metrics::default()),
    )
    .await
    .unwrap_or_else(|err| panic!("Failed to start node '{}': {}", name, err))
}

pub async fn start_tagged_node(name: &str, tags: &[(&str, &str)]) -> Arc<Cluster> {
    let mut config = test_cluster_config();
    config.tags = tags
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>();
    start_node_with(name, config, None).await
}

pub fn temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{}-{:x}", prefix, rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn destroy_temp_dir(dir: &PathBuf) {
    std::fs::remove_dir_all(dir).ok();
}

/// Polls `check` every few milliseconds until it passes or the timeout
/// elapses.
pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
