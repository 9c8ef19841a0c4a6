/*
 * Copyright (c) 2020-2022, Stalwart Labs Ltd.
 *
 * This file is part of the Stalwart Mesh Server.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 *
 * You can be released from the requirements of the AGPLv3 license by
 * purchasing a commercial license. Please contact licensing@stalw.art
 * for more details.
*/

use std::{collections::HashMap, net::ToSocketAddrs, path::PathBuf, sync::Arc, time::Duration};

use futures_util::stream::StreamExt;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use stalwart_mesh::{
    cluster::{Cluster, ClusterConfig},
    config::EnvSettings,
    error::Result,
    logger::{LogBroadcaster, LogLayer},
    metrics::Metrics,
    rpc::{listener::spawn_rpc, RpcConfig},
    swim::{security::Keyring, SwimConfig},
    DEFAULT_GOSSIP_PORT, DEFAULT_RPC_PORT,
};
use tracing::{error, info, Level};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Read configuration parameters
    let settings = EnvSettings::new();

    // Enable logging
    let log_broadcaster = Arc::new(LogBroadcaster::default());
    tracing_subscriber::registry()
        .with(LevelFilter::from_level(
            settings.parse("log-level").unwrap_or(Level::INFO),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(LogLayer {
            broadcaster: log_broadcaster.clone(),
        })
        .init();

    let cluster = match start_node(&settings, log_broadcaster).await {
        Ok(cluster) => cluster,
        Err(err) => {
            error!("Failed to start: {}", err);
            std::process::exit(1);
        }
    };

    // Wait for shutdown signal
    let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT, SIGQUIT])?;
    let leave_on_terminate = !settings.contains_key("skip-leave-on-terminate");

    while let Some(signal) = signals.next().await {
        match signal {
            SIGHUP => {
                // Reload key material from disk.
                if let Some(keyring) = cluster.swim.keyring() {
                    match keyring.reload() {
                        Ok(()) => info!("Reloaded keyring from disk."),
                        Err(err) => error!("Failed to reload keyring: {}", err),
                    }
                }
            }
            SIGTERM | SIGINT | SIGQUIT => {
                info!(
                    "Shutting down Stalwart Mesh server v{}...",
                    env!("CARGO_PKG_VERSION")
                );
                if leave_on_terminate {
                    if let Err(err) = cluster.leave().await {
                        error!("Failed to leave gracefully: {}", err);
                    }
                }
                cluster.shutdown();

                // Let the snapshotter and sessions drain.
                tokio::time::sleep(Duration::from_secs(1)).await;
                break;
            }
            _ => unreachable!(),
        }
    }

    Ok(())
}

async fn start_node(
    settings: &EnvSettings,
    log_broadcaster: Arc<LogBroadcaster>,
) -> Result<Arc<Cluster>> {
    let metrics = Arc::new(Metrics::default());
    let keyring = build_keyring(settings)?;

    let mut swim_config = SwimConfig {
        bind_addr: settings.parse_socketaddr(
            "bind-addr",
            &format!("0.0.0.0:{}", DEFAULT_GOSSIP_PORT),
        ),
        ..Default::default()
    };
    if let Some(name) = settings.get("node-name") {
        swim_config.node_name = name;
    }
    if settings.contains_key("advertise-addr") {
        swim_config.advertise_addr =
            Some(settings.parse_socketaddr("advertise-addr", "127.0.0.1:7946"));
    }
    if let Some(ms) = settings.parse("probe-interval") {
        swim_config.probe_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = settings.parse("gossip-interval") {
        swim_config.gossip_interval = Duration::from_millis(ms);
    }
    if let Some(cidrs) = settings.parse_list("allowed-cidrs") {
        for cidr in cidrs {
            swim_config.allowed_cidrs.push(cidr.parse().map_err(|err| {
                stalwart_mesh::error::Error::Configuration(format!(
                    "Invalid CIDR '{}': {}",
                    cidr, err
                ))
            })?);
        }
    }

    let cluster_config = ClusterConfig {
        tags: parse_tags(settings),
        snapshot_path: settings.get("snapshot-path").map(PathBuf::from),
        rejoin_after_leave: settings.contains_key("rejoin-after-leave"),
        ..Default::default()
    };

    let cluster = Cluster::start(cluster_config, swim_config, keyring, metrics).await?;

    // Make the initial contact with any configured peers.
    if let Some(peers) = settings.parse_list("join") {
        let mut addrs = Vec::with_capacity(peers.len());
        for peer in &peers {
            let peer = if peer.contains(':') {
                peer.clone()
            } else {
                format!("{}:{}", peer, DEFAULT_GOSSIP_PORT)
            };
            match peer.to_socket_addrs() {
                Ok(mut resolved) => addrs.extend(resolved.next()),
                Err(err) => error!("Failed to resolve join address '{}': {}", peer, err),
            }
        }
        if !addrs.is_empty() {
            let joined = cluster.join(&addrs).await?;
            info!("Contacted {} of {} join addresses.", joined, addrs.len());
        }
    }

    let rpc_config = RpcConfig {
        bind_addr: settings.parse_socketaddr(
            "rpc-addr",
            &format!("127.0.0.1:{}", DEFAULT_RPC_PORT),
        ),
        auth_key: settings
            .get("rpc-auth")
            .or_else(|| std::env::var("SERF_RPC_AUTH").ok())
            .filter(|key| !key.is_empty()),
    };
    spawn_rpc(cluster.clone(), log_broadcaster, rpc_config).await?;

    Ok(cluster)
}

fn build_keyring(settings: &EnvSettings) -> Result<Option<Arc<Keyring>>> {
    let keyring_file = settings.get("keyring-file").map(PathBuf::from);
    let encrypt_key = settings
        .get("encrypt-key")
        .or_else(|| std::env::var("SERF_ENCRYPT_KEY").ok())
        .filter(|key| !key.is_empty());

    if let Some(path) = &keyring_file {
        if path.exists() {
            return Ok(Some(Arc::new(Keyring::load(path)?)));
        }
    }
    match encrypt_key {
        Some(key) => {
            let key = base64::decode(&key).map_err(|err| {
                stalwart_mesh::error::Error::Configuration(format!(
                    "Invalid base64 gossip key: {}",
                    err
                ))
            })?;
            Ok(Some(Arc::new(Keyring::new(key, keyring_file)?)))
        }
        None => Ok(None),
    }
}

fn parse_tags(settings: &EnvSettings) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    if let Some(pairs) = settings.parse_list("tag") {
        for pair in pairs {
            match pair.split_once('=') {
                Some((key, value)) => {
                    tags.insert(key.to_string(), value.to_string());
                }
                None => {
                    error!("Ignoring malformed tag '{}' (expected key=value).", pair);
                }
            }
        }
    }
    tags
}
