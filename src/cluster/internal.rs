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

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::swim::codec::{
    self, ConflictResponseMsg, KeyRequestMsg, KeyResponseMsg, MessageType,
};

use super::{query::QueryEvent, Cluster, INTERNAL_QUERY_PREFIX};

/// Handles the reserved `_serf_*` queries that mutate the keyring and
/// resolve name conflicts. Runs as its own task so slow keyring file
/// writes never stall the query dispatch loop.
pub(crate) fn spawn_internal_query_handler(
    cluster: Arc<Cluster>,
    mut rx: mpsc::Receiver<Arc<QueryEvent>>,
) {
    let mut shutdown_rx = cluster.shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => handle_query(&cluster, event),
                        None => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("Internal query handler shutting down.");
                    break;
                }
            }
        }
    });
}

fn handle_query(cluster: &Arc<Cluster>, event: Arc<QueryEvent>) {
    let op = event
        .name
        .strip_prefix(INTERNAL_QUERY_PREFIX)
        .unwrap_or_default()
        .to_string();

    match op.as_str() {
        "install-key" | "use-key" | "remove-key" | "list-keys" => {
            let response = handle_key_query(cluster, &op, &event);
            respond_key(&event, response);
        }
        "conflict" => handle_conflict_query(cluster, &event),
        other => {
            warn!("Unrecognized internal query '{}'.", other);
        }
    }
}

fn handle_key_query(cluster: &Arc<Cluster>, op: &str, event: &QueryEvent) -> KeyResponseMsg {
    let keyring = match cluster.swim.keyring() {
        Some(keyring) => keyring.clone(),
        None => {
            return KeyResponseMsg {
                result: false,
                message: "encryption disabled".to_string(),
                ..Default::default()
            };
        }
    };

    if op == "list-keys" {
        // Keys are added in ring order until the encoded response would
        // exceed the size limit; truncation is reported but still
        // counts as success.
        let budget = event.response_budget();
        let all = keyring.keys();
        let primary_key = base64::encode(keyring.primary_key());
        let mut response = KeyResponseMsg {
            result: true,
            message: String::new(),
            keys: Vec::new(),
            primary_key,
        };
        for key in &all {
            let mut candidate = response.clone();
            candidate.keys.push(base64::encode(key));
            let encoded = codec::encode(MessageType::KeyResponse, &candidate)
                .map(|bytes| bytes.len())
                .unwrap_or(usize::MAX);
            if encoded > budget {
                response.message = format!(
                    "keys truncated, showing {} of {}",
                    response.keys.len(),
                    all.len()
                );
                break;
            }
            response = candidate;
        }
        return response;
    }

    // The remaining operations carry a key in the payload.
    let request: KeyRequestMsg = match codec::message_type(&event.payload) {
        Ok(MessageType::KeyRequest) => match codec::decode(&event.payload) {
            Ok(request) => request,
            Err(err) => {
                return KeyResponseMsg {
                    result: false,
                    message: format!("invalid key request: {}", err),
                    ..Default::default()
                };
            }
        },
        _ => {
            return KeyResponseMsg {
                result: false,
                message: "invalid key request".to_string(),
                ..Default::default()
            };
        }
    };

    let result = match op {
        "install-key" => keyring.install(request.key.to_vec()),
        "use-key" => keyring.use_key(&request.key),
        "remove-key" => keyring.remove(&request.key),
        _ => unreachable!(),
    };

    match result {
        Ok(()) => KeyResponseMsg {
            result: true,
            ..Default::default()
        },
        Err(err) => KeyResponseMsg {
            result: false,
            message: err.to_string(),
            ..Default::default()
        },
    }
}

fn respond_key(event: &QueryEvent, response: KeyResponseMsg) {
    match codec::encode(MessageType::KeyResponse, &response) {
        Ok(bytes) => {
            if let Err(err) = event.respond(bytes) {
                debug!("Failed to respond to '{}': {}", event.name, err);
            }
        }
        Err(err) => {
            debug!("Failed to encode key response: {}", err);
        }
    }
}

/// Replies with our view of the conflicted name so the conflicted node
/// can count votes.
fn handle_conflict_query(cluster: &Arc<Cluster>, event: &QueryEvent) {
    let name = String::from_utf8_lossy(&event.payload).into_owned();

    let view = if name == cluster.swim.config.node_name {
        let local = cluster.swim.local_node_state();
        Some(ConflictResponseMsg {
            name: local.name,
            addr: local.addr,
            port: local.port,
        })
    } else {
        cluster.swim.node_state(&name).map(|node| ConflictResponseMsg {
            name: node.name,
            addr: node.addr,
            port: node.port,
        })
    };

    if let Some(view) = view {
        match codec::encode(MessageType::ConflictResponse, &view) {
            Ok(bytes) => {
                if let Err(err) = event.respond(bytes) {
                    debug!("Failed to respond to conflict query: {}", err);
                }
            }
            Err(err) => {
                debug!("Failed to encode conflict response: {}", err);
            }
        }
    }
}
