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
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use regex::Regex;
use serde_bytes::ByteBuf;
use tokio::{sync::mpsc, time};
use tracing::debug;

use crate::{
    error::{Error, Result},
    lamport::LamportTime,
    metrics::Metrics,
    swim::{
        codec::{
            self, MessageType, QueryFilter, QueryMsg, QueryResponseMsg, RelayMsg,
            QUERY_FLAG_ACK, QUERY_FLAG_NO_BROADCAST, RESPONSE_FLAG_ACK,
        },
        Swim,
    },
};

use super::{event::Event, Cluster, INTERNAL_QUERY_PREFIX};

/// Assumed average response size when sizing the ack/response channels
/// from `query_response_size_limit`.
const AVG_RESPONSE_SIZE: usize = 32;

#[derive(Debug, Default, Clone)]
pub struct QueryParams {
    pub filters: Vec<QueryFilter>,
    pub request_ack: bool,
    pub relay_factor: u8,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct NodeResponse {
    pub from: String,
    pub payload: Vec<u8>,
}

/// Issuer-side handle: bounded ack and response streams plus the hard
/// deadline after which both close.
pub struct QueryResponseHandle {
    pub ltime: LamportTime,
    pub id: u32,
    pub deadline: Instant,
    pub ack_rx: mpsc::Receiver<String>,
    pub response_rx: mpsc::Receiver<NodeResponse>,
    cluster: Arc<Cluster>,
}

impl QueryResponseHandle {
    /// Releases the issuer-side bookkeeping before the deadline.
    pub fn close(&self) {
        self.cluster.query_core.lock().responses.remove(&self.ltime);
    }
}

impl Drop for QueryResponseHandle {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct QueryState {
    id: u32,
    deadline: Instant,
    ack_tx: mpsc::Sender<String>,
    response_tx: mpsc::Sender<NodeResponse>,
    acked: HashSet<String>,
    responded: HashSet<String>,
}

struct QuerySlot {
    ltime: LamportTime,
    ids: Vec<u32>,
}

/// Issuer bookkeeping plus the recent-query ring used to deduplicate
/// deliveries by `(ltime, id)`.
pub(crate) struct QueryCore {
    pub responses: HashMap<LamportTime, QueryState>,
    recent: Vec<Option<QuerySlot>>,
}

impl QueryCore {
    pub fn new(capacity: usize) -> Self {
        let mut recent = Vec::with_capacity(capacity);
        recent.resize_with(capacity, || None);
        QueryCore {
            responses: HashMap::new(),
            recent,
        }
    }

    pub fn capacity(&self) -> usize {
        self.recent.len()
    }

    /// Records a query; false means this `(ltime, id)` was already seen.
    fn witness(&mut self, ltime: LamportTime, id: u32) -> bool {
        let idx = (ltime as usize) % self.recent.len();
        match &mut self.recent[idx] {
            Some(slot) if slot.ltime == ltime => {
                if slot.ids.contains(&id) {
                    return false;
                }
                slot.ids.push(id);
                true
            }
            slot => {
                *slot = Some(QuerySlot {
                    ltime,
                    ids: vec![id],
                });
                true
            }
        }
    }
}

/// A query delivered to this node. Handlers answer with
/// [`QueryEvent::respond`], which sends the payload straight back to the
/// issuer over UDP.
pub struct QueryEvent {
    pub ltime: LamportTime,
    pub id: u32,
    pub name: String,
    pub payload: Vec<u8>,
    pub source_node: String,
    pub source_addr: SocketAddr,
    pub deadline: Instant,
    responded: AtomicBool,
    response_size_limit: usize,
    swim: Arc<Swim>,
}

impl std::fmt::Debug for QueryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEvent")
            .field("ltime", &self.ltime)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("source_node", &self.source_node)
            .finish()
    }
}

impl QueryEvent {
    pub fn respond(&self, payload: Vec<u8>) -> Result<()> {
        self.respond_with_flags(0, payload)
    }

    pub(crate) fn respond_with_flags(&self, flags: u32, payload: Vec<u8>) -> Result<()> {
        if Instant::now() > self.deadline {
            return Err(Error::State("Query deadline already passed".to_string()));
        }
        if flags & RESPONSE_FLAG_ACK == 0 && self.responded.swap(true, Ordering::SeqCst) {
            return Err(Error::State(
                "Query was already responded to".to_string(),
            ));
        }
        let response = QueryResponseMsg {
            ltime: self.ltime,
            id: self.id,
            from: self.swim.config.node_name.clone(),
            flags,
            payload: ByteBuf::from(payload),
        };
        let raw = codec::encode(MessageType::QueryResponse, &response)?;
        if raw.len() > self.response_size_limit {
            return Err(Error::State(format!(
                "Query response of {} bytes exceeds the {} byte limit",
                raw.len(),
                self.response_size_limit
            )));
        }
        self.swim.send_to(self.source_addr, raw);
        Ok(())
    }

    pub fn response_size_limit(&self) -> usize {
        self.response_size_limit
    }

    /// Payload bytes a handler can respond with before the wrapped
    /// response would exceed the size limit.
    pub fn response_budget(&self) -> usize {
        let envelope = QueryResponseMsg {
            ltime: self.ltime,
            id: self.id,
            from: self.swim.config.node_name.clone(),
            flags: 0,
            payload: ByteBuf::new(),
        };
        let overhead = codec::encode(MessageType::QueryResponse, &envelope)
            .map(|bytes| bytes.len() + 5)
            .unwrap_or(64);
        self.response_size_limit.saturating_sub(overhead)
    }
}

impl Cluster {
    /// Default query deadline: `gossip_interval x query_timeout_mult x
    /// ceil(log10(n + 1))`.
    pub fn default_query_timeout(&self) -> Duration {
        let n = self.swim.num_nodes();
        let scale = ((n + 1) as f64).log10().ceil().max(1.0);
        self.swim.config.gossip_interval * self.config.query_timeout_mult * scale as u32
    }

    /// Issues a query against the (optionally filtered) membership and
    /// returns the streaming response handle.
    pub fn query(
        self: &Arc<Self>,
        name: impl Into<String>,
        payload: Vec<u8>,
        params: QueryParams,
    ) -> Result<QueryResponseHandle> {
        let name = name.into();
        let timeout = params.timeout.unwrap_or_else(|| self.default_query_timeout());
        let deadline = Instant::now() + timeout;
        let ltime = self.query_clock.increment();
        let id = self.query_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);

        let mut flags = 0;
        if params.request_ack {
            flags |= QUERY_FLAG_ACK;
        }

        let msg = QueryMsg {
            ltime,
            id,
            source_node: self.swim.config.node_name.clone(),
            source_addr: self.swim.advertise.ip(),
            source_port: self.swim.advertise.port(),
            filters: params.filters,
            flags,
            relay_factor: params.relay_factor,
            timeout_ms: timeout.as_millis() as u64,
            name,
            payload: ByteBuf::from(payload),
        };
        let raw = codec::encode(MessageType::Query, &msg)?;
        if raw.len() > self.config.query_size_limit {
            return Err(Error::State(format!(
                "Query of {} bytes exceeds the {} byte limit",
                raw.len(),
                self.config.query_size_limit
            )));
        }

        let capacity = (self.config.query_response_size_limit / AVG_RESPONSE_SIZE).max(1);
        let (ack_tx, ack_rx) = mpsc::channel(capacity);
        let (response_tx, response_rx) = mpsc::channel(capacity);
        self.query_core.lock().responses.insert(
            ltime,
            QueryState {
                id,
                deadline,
                ack_tx,
                response_tx,
                acked: HashSet::new(),
                responded: HashSet::new(),
            },
        );
        Metrics::incr(&self.metrics.queries_sent);

        // Deliver locally; this also queues the broadcast that carries
        // the query to the rest of the cluster.
        self.handle_query_msg(msg, false);

        // With no live peers there is nothing further to wait for; the
        // deadline collapses once local delivery has run.
        let expiry = if self.swim.alive_peers() == 0 {
            Instant::now() + Duration::from_millis(50)
        } else {
            deadline
        };
        let cluster = self.clone();
        tokio::spawn(async move {
            time::sleep_until(time::Instant::from_std(expiry)).await;
            cluster.query_core.lock().responses.remove(&ltime);
        });

        Ok(QueryResponseHandle {
            ltime,
            id,
            deadline,
            ack_rx,
            response_rx,
            cluster: self.clone(),
        })
    }

    /// Processes a query received from the mesh (or issued locally).
    pub(crate) fn handle_query_msg(self: &Arc<Self>, msg: QueryMsg, relayed: bool) {
        self.query_clock.witness(msg.ltime);

        let mut core = self.query_core.lock();
        let min_time = self
            .query_clock
            .time()
            .saturating_sub(core.capacity() as u64);
        if msg.ltime < min_time {
            Metrics::incr(&self.metrics.query_dropped);
            return;
        }
        if !core.witness(msg.ltime, msg.id) {
            return;
        }
        drop(core);
        Metrics::incr(&self.metrics.queries_received);

        // Keep the infection going.
        if msg.flags & QUERY_FLAG_NO_BROADCAST == 0 && !relayed {
            if let Ok(raw) = codec::encode(MessageType::Query, &msg) {
                let key = format!("query:{}:{}", msg.ltime, msg.id);
                let queue_key = key.clone();
                self.broadcasts.queue_broadcast(
                    key,
                    msg.ltime,
                    raw,
                    |other| other.key == queue_key,
                    None,
                );
            }
        }

        let source = SocketAddr::new(msg.source_addr, msg.source_port);
        let deadline = Instant::now() + Duration::from_millis(msg.timeout_ms);
        let event = Arc::new(QueryEvent {
            ltime: msg.ltime,
            id: msg.id,
            name: msg.name.clone(),
            payload: msg.payload.to_vec(),
            source_node: msg.source_node.clone(),
            source_addr: source,
            deadline,
            responded: AtomicBool::new(false),
            response_size_limit: self.config.query_response_size_limit,
            swim: self.swim.clone(),
        });

        // Acks go out on receipt, before any filtering; the issuer does
        // not ack its own query.
        if msg.flags & QUERY_FLAG_ACK != 0 && msg.source_node != self.swim.config.node_name {
            if let Err(err) = event.respond_with_flags(RESPONSE_FLAG_ACK, Vec::new()) {
                debug!("Failed to ack query '{}': {}", msg.name, err);
            }
        }

        // Forward through a few random peers to survive packet loss;
        // relayed copies are never relayed again.
        if !relayed && msg.relay_factor > 0 {
            self.relay_query(&msg);
        }

        if !self.matches_query_filters(&msg.filters) {
            return;
        }

        if msg.name.starts_with(INTERNAL_QUERY_PREFIX) {
            if self.internal_tx.try_send(event).is_err() {
                Metrics::incr(&self.metrics.query_dropped);
            }
        } else {
            self.dispatch(Event::Query(event));
        }
    }

    fn relay_query(&self, msg: &QueryMsg) {
        let alive = self.swim.alive_peers();
        if alive <= 1 {
            return;
        }
        let count = (msg.relay_factor as usize).min(alive - 1);
        let local_name = &self.swim.config.node_name;
        let peers = self.swim.random_nodes(count, |node| {
            node.is_alive() && node.name != msg.source_node && &node.name != local_name
        });
        if peers.is_empty() {
            return;
        }

        let raw = match codec::encode(MessageType::Query, msg) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let relay = RelayMsg {
            node: self.swim.config.node_name.clone(),
            payload: ByteBuf::from(raw),
        };
        if let Ok(bytes) = codec::encode(MessageType::Relay, &relay) {
            for peer in peers {
                self.swim.send_to(peer.socket_addr(), bytes.clone());
                Metrics::incr(&self.metrics.query_relayed);
            }
        }
    }

    pub(crate) fn handle_relay_msg(self: &Arc<Self>, relay: RelayMsg) {
        let payload = relay.payload.into_vec();
        match codec::message_type(&payload) {
            Ok(MessageType::Query) => {
                if let Ok(msg) = codec::decode::<QueryMsg>(&payload) {
                    self.handle_query_msg(msg, true);
                }
            }
            _ => {
                Metrics::incr(&self.metrics.protocol_errors);
            }
        }
    }

    /// Routes an ack or response back into the issuing query's channels;
    /// overflow drops the newest entry rather than blocking dispatch.
    pub(crate) fn handle_query_response_msg(&self, msg: QueryResponseMsg) {
        let mut core = self.query_core.lock();
        let state = match core.responses.get_mut(&msg.ltime) {
            Some(state) if state.id == msg.id => state,
            _ => {
                Metrics::incr(&self.metrics.query_dropped);
                return;
            }
        };
        if Instant::now() > state.deadline {
            Metrics::incr(&self.metrics.query_dropped);
            return;
        }

        if msg.flags & RESPONSE_FLAG_ACK != 0 {
            if state.acked.insert(msg.from.clone()) {
                Metrics::incr(&self.metrics.query_acks);
                if state.ack_tx.try_send(msg.from).is_err() {
                    Metrics::incr(&self.metrics.query_dropped);
                }
            }
        } else if state.responded.insert(msg.from.clone()) {
            Metrics::incr(&self.metrics.query_responses);
            let response = NodeResponse {
                from: msg.from,
                payload: msg.payload.to_vec(),
            };
            if state.response_tx.try_send(response).is_err() {
                Metrics::incr(&self.metrics.query_dropped);
            }
        }
    }

    /// True when this node passes every filter attached to a query.
    pub(crate) fn matches_query_filters(&self, filters: &[QueryFilter]) -> bool {
        let local_name = &self.swim.config.node_name;
        let tags = codec::decode_tags(&self.swim.local_tags());
        for filter in filters {
            let matched = match filter {
                QueryFilter::NodeName(expr) => {
                    anchored(expr).map_or(false, |re| re.is_match(local_name))
                }
                QueryFilter::Tag(tag, expr) => tags
                    .get(tag)
                    .map(|value| anchored(expr).map_or(false, |re| re.is_match(value)))
                    .unwrap_or(false),
            };
            if !matched {
                return false;
            }
        }
        true
    }
}

fn anchored(expr: &str) -> Option<Regex> {
    Regex::new(&format!("^(?:{})$", expr))
        .map_err(|err| {
            debug!("Invalid query filter '{}': {}", expr, err);
            err
        })
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_query_ring_deduplicates() {
        let mut core = QueryCore::new(8);
        assert!(core.witness(3, 1));
        assert!(!core.witness(3, 1));
        assert!(core.witness(3, 2));
        assert!(core.witness(4, 1));

        // Slot reuse forgets the evicted entry.
        assert!(core.witness(11, 9));
        assert!(core.witness(3, 1));
    }

    #[test]
    fn anchored_filter_semantics() {
        let re = anchored("node-\\d+").unwrap();
        assert!(re.is_match("node-12"));
        assert!(!re.is_match("a-node-12-b"));
        assert!(anchored("(").is_none());
    }
}
