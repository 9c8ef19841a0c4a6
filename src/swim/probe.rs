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
    sync::{atomic::Ordering, Arc},
    time::Instant,
};

use rand::seq::SliceRandom;
use serde_bytes::ByteBuf;
use tokio::{sync::oneshot, time};
use tracing::debug;

use crate::metrics::Metrics;

use super::{
    codec::{self, Ack, IndirectPing, MessageType, Nack, Ping, Suspect},
    state::NodeState,
    Swim,
};

#[derive(Debug)]
pub struct AckInfo {
    pub payload: Vec<u8>,
    pub arrival: Instant,
}

impl Swim {
    /// Runs the failure detector: every `probe_interval` one random live
    /// peer is pinged, escalating to indirect probes and then suspicion.
    pub(crate) fn spawn_probe_loop(self: &Arc<Self>) {
        let swim = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(swim.config.probe_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => swim.probe_tick(),
                    _ = shutdown_rx.changed() => {
                        debug!("Prober shutting down.");
                        break;
                    }
                }
            }
        });
    }

    fn probe_tick(self: &Arc<Self>) {
        let target = match self
            .random_nodes(1, |node| node.is_probeable())
            .into_iter()
            .next()
        {
            Some(target) => target,
            None => return,
        };

        let seq = self.next_seq();
        let rx = self.register_ack_handler(seq);
        let ping = Ping {
            seq,
            node: target.name.clone(),
        };
        let bytes = match codec::encode(MessageType::Ping, &ping) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        self.send_message(target.socket_addr(), bytes);
        Metrics::incr(&self.metrics.probes_sent);

        let swim = self.clone();
        tokio::spawn(async move {
            swim.await_probe(target, seq, rx).await;
        });
    }

    async fn await_probe(
        self: &Arc<Self>,
        target: NodeState,
        seq: u32,
        mut rx: oneshot::Receiver<AckInfo>,
    ) {
        let sent = Instant::now();
        let acked = match time::timeout(self.config.probe_timeout, &mut rx).await {
            Ok(Ok(ack)) => {
                self.complete_probe(&target, sent, ack);
                true
            }
            _ => false,
        };

        if !acked {
            // Ask up to `indirect_checks` other live peers to probe the
            // target on our behalf; any of them can complete the ack.
            let helpers = self.random_nodes(self.config.indirect_checks, |node| {
                node.is_probeable() && node.name != target.name
            });
            for helper in &helpers {
                let indirect = IndirectPing {
                    seq,
                    node: target.name.clone(),
                    addr: target.addr,
                    port: target.port,
                    nack: true,
                };
                if let Ok(bytes) = codec::encode(MessageType::IndirectPing, &indirect) {
                    self.send_message(helper.socket_addr(), bytes);
                    Metrics::incr(&self.metrics.indirect_probes_sent);
                }
            }

            let second_window = self
                .config
                .probe_interval
                .saturating_sub(self.config.probe_timeout)
                .max(self.config.probe_timeout);
            match time::timeout(second_window, &mut rx).await {
                Ok(Ok(ack)) => {
                    self.complete_probe(&target, sent, ack);
                }
                _ => {
                    debug!("Probe of '{}' failed, marking it suspect.", target.name);
                    self.suspect_node(Suspect {
                        ltime: self.clock.increment(),
                        incarnation: target.incarnation,
                        node: target.name.clone(),
                        from: self.config.node_name.clone(),
                    });
                }
            }
        }
        self.ack_handlers.lock().remove(&seq);
    }

    fn complete_probe(&self, target: &NodeState, sent: Instant, ack: AckInfo) {
        Metrics::incr(&self.metrics.acks_received);
        let rtt = ack.arrival.saturating_duration_since(sent);
        self.delegate.notify_ping_complete(target, rtt, &ack.payload);
    }

    pub(crate) fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    pub(crate) fn register_ack_handler(&self, seq: u32) -> oneshot::Receiver<AckInfo> {
        let (tx, rx) = oneshot::channel();
        self.ack_handlers.lock().insert(seq, tx);
        rx
    }

    pub(crate) fn handle_ping(&self, ping: Ping, from: SocketAddr) {
        if ping.node != self.config.node_name {
            debug!(
                "Ignoring ping meant for '{}' (we are '{}').",
                ping.node, self.config.node_name
            );
            return;
        }
        let ack = Ack {
            seq: ping.seq,
            payload: ByteBuf::from(self.delegate.ack_payload()),
        };
        if let Ok(bytes) = codec::encode(MessageType::Ack, &ack) {
            self.send_message(from, bytes);
        }
    }

    pub(crate) fn handle_ack(&self, ack: Ack, arrival: Instant) {
        if let Some(handler) = self.ack_handlers.lock().remove(&ack.seq) {
            handler
                .send(AckInfo {
                    payload: ack.payload.into_vec(),
                    arrival,
                })
                .ok();
        }
    }

    /// Probes the target on behalf of another node and forwards the ack
    /// (or a nack) back to the requester.
    pub(crate) fn handle_indirect_ping(self: &Arc<Self>, indirect: IndirectPing, from: SocketAddr) {
        let seq = self.next_seq();
        let mut rx = self.register_ack_handler(seq);
        let ping = Ping {
            seq,
            node: indirect.node.clone(),
        };
        let target = SocketAddr::new(indirect.addr, indirect.port);
        if let Ok(bytes) = codec::encode(MessageType::Ping, &ping) {
            self.send_message(target, bytes);
        }

        let swim = self.clone();
        tokio::spawn(async move {
            match time::timeout(swim.config.probe_timeout, &mut rx).await {
                Ok(Ok(ack)) => {
                    let forwarded = Ack {
                        seq: indirect.seq,
                        payload: ByteBuf::from(ack.payload),
                    };
                    if let Ok(bytes) = codec::encode(MessageType::Ack, &forwarded) {
                        swim.send_message(from, bytes);
                    }
                }
                _ => {
                    if indirect.nack {
                        if let Ok(bytes) =
                            codec::encode(MessageType::Nack, &Nack { seq: indirect.seq })
                        {
                            swim.send_message(from, bytes);
                        }
                    }
                }
            }
            swim.ack_handlers.lock().remove(&seq);
        });
    }

    /// Ships queued broadcasts to a few random peers in a single UDP
    /// packet each, every `gossip_interval`.
    pub(crate) fn spawn_gossip_loop(self: &Arc<Self>) {
        let swim = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(swim.config.gossip_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => swim.gossip_tick(),
                    _ = shutdown_rx.changed() => {
                        debug!("Gossiper shutting down.");
                        break;
                    }
                }
            }
        });
    }

    fn gossip_tick(&self) {
        let targets = self.random_nodes(self.config.gossip_nodes, |node| node.is_probeable());
        if targets.is_empty() {
            return;
        }
        let num_nodes = self.nodes.read().len() + 1;
        let budget = self.packet_budget();

        for target in targets {
            let mut messages = self.broadcasts.pop(COMPOUND_OVERHEAD, budget, num_nodes);
            let used = messages
                .iter()
                .map(|m| m.len() + COMPOUND_OVERHEAD)
                .sum::<usize>();
            messages.extend(self.delegate.broadcasts(
                COMPOUND_OVERHEAD,
                budget.saturating_sub(used),
                num_nodes,
            ));
            if messages.is_empty() {
                continue;
            }

            let packet = if messages.len() == 1 {
                messages.pop().unwrap()
            } else {
                match codec::encode_compound(&messages) {
                    Ok(packet) => packet,
                    Err(_) => continue,
                }
            };
            self.send_message(target.socket_addr(), packet);
        }
    }

    /// Uniformly random selection from the known node table.
    pub(crate) fn random_nodes(
        &self,
        count: usize,
        filter: impl Fn(&NodeState) -> bool,
    ) -> Vec<NodeState> {
        let nodes = self.nodes.read();
        let candidates = nodes.values().filter(|n| filter(n)).collect::<Vec<_>>();
        candidates
            .choose_multiple(&mut rand::thread_rng(), count)
            .map(|n| (*n).clone())
            .collect()
    }
}

/// Per-message cost inside a compound packet: the MsgPack bin header.
const COMPOUND_OVERHEAD: usize = 5;
