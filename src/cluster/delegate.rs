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

use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    lamport::LamportTime,
    metrics::Metrics,
    swim::{
        codec::{self, Alive, LeaveIntent, MessageType, UserEventMsg},
        delegate::Delegate,
        state::NodeState,
    },
};

use super::Cluster;

/// Opaque blob exchanged as the upper tier's push/pull user state: the
/// event and query clocks plus the recent-event buffer for replay.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct UserStateSnapshot {
    pub event_ltime: LamportTime,
    pub query_ltime: LamportTime,
    pub events: Vec<UserEventMsg>,
}

/// Bridges membership callbacks into the cluster tier. Holds a weak
/// reference so the delegate never keeps the cluster alive on its own;
/// the membership layer receives it as a trait object at construction.
#[derive(Default)]
pub struct ClusterDelegate {
    cluster: OnceLock<Weak<Cluster>>,
}

impl ClusterDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(ClusterDelegate::default())
    }

    pub(crate) fn init(&self, cluster: &Arc<Cluster>) {
        self.cluster.set(Arc::downgrade(cluster)).ok();
    }

    fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster.get().and_then(Weak::upgrade)
    }
}

impl Delegate for ClusterDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        let cluster = match self.cluster() {
            Some(cluster) => cluster,
            None => return Vec::new(),
        };
        let tags = codec::encode_tags(&cluster.config.tags).unwrap_or_default();
        if tags.len() > limit {
            debug!("Tag map of {} bytes exceeds the {} byte limit.", tags.len(), limit);
            return Vec::new();
        }
        tags
    }

    fn notify_msg(&self, _from: SocketAddr, msg: &[u8]) {
        let cluster = match self.cluster() {
            Some(cluster) => cluster,
            None => return,
        };
        let message_type = match codec::message_type(msg) {
            Ok(message_type) => message_type,
            Err(_) => {
                Metrics::incr(&cluster.metrics.protocol_errors);
                return;
            }
        };

        let handled: crate::error::Result<()> = match message_type {
            MessageType::Leave => {
                codec::decode::<LeaveIntent>(msg).map(|intent| cluster.handle_leave_intent_msg(intent))
            }
            MessageType::UserEvent => codec::decode::<UserEventMsg>(msg).map(|event| {
                cluster.handle_user_event_msg(event);
            }),
            MessageType::UserEventBatch => {
                codec::decode::<Vec<UserEventMsg>>(msg).map(|events| {
                    for event in events {
                        cluster.handle_user_event_msg(event);
                    }
                })
            }
            MessageType::Query => {
                codec::decode(msg).map(|query| cluster.handle_query_msg(query, false))
            }
            MessageType::QueryResponse => {
                codec::decode(msg).map(|response| cluster.handle_query_response_msg(response))
            }
            MessageType::Relay => codec::decode(msg).map(|relay| cluster.handle_relay_msg(relay)),
            other => {
                debug!("Ignoring unexpected {:?} message.", other);
                Ok(())
            }
        };
        if handled.is_err() {
            Metrics::incr(&cluster.metrics.protocol_errors);
        }
    }

    fn broadcasts(&self, overhead: usize, budget: usize, num_nodes: usize) -> Vec<Vec<u8>> {
        match self.cluster() {
            Some(cluster) => cluster.broadcasts.pop(overhead, budget, num_nodes),
            None => Vec::new(),
        }
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        match self.cluster() {
            Some(cluster) => cluster.encode_user_state(),
            None => Vec::new(),
        }
    }

    fn merge_remote_state(&self, buf: &[u8], _join: bool) {
        if let Some(cluster) = self.cluster() {
            cluster.merge_user_state(buf);
        }
    }

    fn notify_join(&self, node: &NodeState) {
        if let Some(cluster) = self.cluster() {
            cluster.handle_node_join(node);
        }
    }

    fn notify_leave(&self, node: &NodeState) {
        if let Some(cluster) = self.cluster() {
            cluster.handle_node_leave(node);
        }
    }

    fn notify_update(&self, node: &NodeState) {
        if let Some(cluster) = self.cluster() {
            cluster.handle_node_update(node);
        }
    }

    fn notify_conflict(&self, existing: &NodeState, other: &Alive) {
        if let Some(cluster) = self.cluster() {
            cluster.handle_node_conflict(existing, other);
        }
    }

    fn notify_ping_complete(&self, node: &NodeState, rtt: Duration, payload: &[u8]) {
        if let Some(cluster) = self.cluster() {
            cluster.handle_ping_complete(node, rtt, payload);
        }
    }

    fn ack_payload(&self) -> Vec<u8> {
        match self.cluster() {
            Some(cluster) => {
                rmp_serde::to_vec(&cluster.coord_client.get()).unwrap_or_default()
            }
            None => Vec::new(),
        }
    }
}
