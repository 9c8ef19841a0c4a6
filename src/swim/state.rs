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
    net::{IpAddr, SocketAddr},
    sync::{atomic::Ordering, Arc},
    time::Instant,
};

use serde_bytes::ByteBuf;
use tracing::{debug, info, warn};

use crate::{lamport::LamportTime, metrics::Metrics};

use super::{
    codec::{self, Alive, Dead, MessageType, Suspect},
    Swim,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl NodeStatus {
    pub fn as_u8(&self) -> u8 {
        match self {
            NodeStatus::Alive => 0,
            NodeStatus::Suspect => 1,
            NodeStatus::Dead => 2,
            NodeStatus::Left => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => NodeStatus::Suspect,
            2 => NodeStatus::Dead,
            3 => NodeStatus::Left,
            _ => NodeStatus::Alive,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeState {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub tags: Vec<u8>,
    pub incarnation: u64,
    pub ltime: LamportTime,
    pub status: NodeStatus,
    pub status_change: Instant,
    pub vsn: [u8; 6],
}

impl NodeState {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    pub fn is_alive(&self) -> bool {
        self.status == NodeStatus::Alive
    }

    pub fn is_probeable(&self) -> bool {
        matches!(self.status, NodeStatus::Alive | NodeStatus::Suspect)
    }
}

/// A received update `(lt', inc')` overrides the local `(lt, inc)` iff
/// `lt' > lt` or `lt' = lt` and `inc' > inc`. Equal tuples were already
/// applied; lower ones are stale.
pub fn supersedes(
    new_ltime: LamportTime,
    new_incarnation: u64,
    ltime: LamportTime,
    incarnation: u64,
) -> bool {
    new_ltime > ltime || (new_ltime == ltime && new_incarnation > incarnation)
}

impl Swim {
    /// Applies an alive message, creating or reviving the node and
    /// re-queuing the update for further gossip.
    pub fn alive_node(self: &Arc<Self>, alive: Alive) {
        self.clock.witness(alive.ltime);

        // An alive message about ourselves: either our own broadcast
        // coming back, a replay we must out-bid, or a name conflict with
        // a different address.
        if alive.node == self.config.node_name {
            let (local_addr, local_port) = (self.advertise.ip(), self.advertise.port());
            if alive.addr != local_addr || alive.port != local_port {
                warn!(
                    "Name conflict for '{}': {}:{} is also claiming it.",
                    alive.node, alive.addr, alive.port
                );
                let existing = self.local_node_state();
                self.delegate.notify_conflict(&existing, &alive);
                return;
            }
            if alive.incarnation > self.incarnation.load(Ordering::SeqCst) {
                self.refute(alive.incarnation);
            }
            return;
        }

        let mut event = None;
        {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(&alive.node) {
                None => {
                    let node = NodeState {
                        name: alive.node.clone(),
                        addr: alive.addr,
                        port: alive.port,
                        tags: alive.tags.to_vec(),
                        incarnation: alive.incarnation,
                        ltime: alive.ltime,
                        status: NodeStatus::Alive,
                        status_change: Instant::now(),
                        vsn: alive.vsn,
                    };
                    info!("Node '{}' joined at {}:{}.", node.name, node.addr, node.port);
                    event = Some((MemberDelta::Join, node.clone()));
                    nodes.insert(alive.node.clone(), node);
                }
                Some(node) => {
                    if !supersedes(alive.ltime, alive.incarnation, node.ltime, node.incarnation) {
                        return;
                    }
                    if alive.addr != node.addr || alive.port != node.port {
                        if node.is_probeable() {
                            // Conflicting claim over a live name; the
                            // conflicted node resolves it cluster-wide.
                            warn!(
                                "Conflicting address for '{}': knew {}:{}, update says {}:{}.",
                                node.name, node.addr, node.port, alive.addr, alive.port
                            );
                            let existing = node.clone();
                            drop(nodes);
                            self.delegate.notify_conflict(&existing, &alive);
                            return;
                        }
                        // The previous holder is dead or gone; this is a
                        // restart on a new address reclaiming the name.
                        info!(
                            "Node '{}' came back at {}:{}.",
                            node.name, alive.addr, alive.port
                        );
                        node.addr = alive.addr;
                        node.port = alive.port;
                    }

                    let was_dead = !node.is_probeable();
                    let tags_changed = node.tags != alive.tags.to_vec();
                    node.incarnation = alive.incarnation;
                    node.ltime = alive.ltime;
                    node.tags = alive.tags.to_vec();
                    node.vsn = alive.vsn;
                    if node.status != NodeStatus::Alive {
                        node.status = NodeStatus::Alive;
                        node.status_change = Instant::now();
                    }
                    if was_dead {
                        info!("Node '{}' is alive again.", node.name);
                        event = Some((MemberDelta::Join, node.clone()));
                    } else if tags_changed {
                        event = Some((MemberDelta::Update, node.clone()));
                    }
                }
            }
        }

        // A node that proved itself alive cancels any running suspicion.
        self.cancel_suspicion(&alive.node);
        self.queue_state_broadcast(MessageType::Alive, &alive.node, alive.ltime, &alive);

        match event {
            Some((MemberDelta::Join, node)) => self.delegate.notify_join(&node),
            Some((MemberDelta::Update, node)) => self.delegate.notify_update(&node),
            _ => (),
        }
    }

    /// Applies a suspect message, starting (or confirming) the suspicion
    /// timer that will declare the node dead if it does not refute.
    pub fn suspect_node(self: &Arc<Self>, suspect: Suspect) {
        self.clock.witness(suspect.ltime);

        if suspect.node == self.config.node_name {
            if suspect.incarnation >= self.incarnation.load(Ordering::SeqCst) {
                debug!("Refuting suspicion raised by '{}'.", suspect.from);
                self.refute(suspect.incarnation);
            }
            return;
        }

        {
            let mut nodes = self.nodes.write();
            let node = match nodes.get_mut(&suspect.node) {
                Some(node) => node,
                None => return,
            };
            if suspect.incarnation < node.incarnation || !node.is_probeable() {
                return;
            }
            if node.status == NodeStatus::Suspect {
                drop(nodes);
                self.confirm_suspicion(&suspect.node, &suspect.from);
                self.queue_state_broadcast(
                    MessageType::Suspect,
                    &suspect.node,
                    suspect.ltime,
                    &suspect,
                );
                return;
            }

            info!(
                "Node '{}' is now suspect (reported by '{}').",
                suspect.node, suspect.from
            );
            node.status = NodeStatus::Suspect;
            node.incarnation = suspect.incarnation;
            node.ltime = suspect.ltime;
            node.status_change = Instant::now();
        }

        Metrics::incr(&self.metrics.suspicions_raised);
        self.start_suspicion(&suspect.node, &suspect.from);
        self.queue_state_broadcast(MessageType::Suspect, &suspect.node, suspect.ltime, &suspect);
    }

    /// Applies a dead message. A message where the reporter is the node
    /// itself is a graceful departure and lands in `Left`; anything else
    /// is a failure.
    pub fn dead_node(self: &Arc<Self>, dead: Dead) {
        self.clock.witness(dead.ltime);

        if dead.node == self.config.node_name {
            // Our own death notice: refute unless we are shutting down.
            if !self.leaving.load(Ordering::SeqCst) {
                if dead.incarnation >= self.incarnation.load(Ordering::SeqCst) {
                    warn!("Refuting death reported by '{}'.", dead.from);
                    self.refute(dead.incarnation);
                }
                return;
            }
        }

        let graceful = dead.from == dead.node;
        let mut event = None;
        {
            let mut nodes = self.nodes.write();
            let node = match nodes.get_mut(&dead.node) {
                Some(node) => node,
                None => return,
            };
            if dead.incarnation < node.incarnation || !node.is_probeable() {
                return;
            }

            node.incarnation = dead.incarnation;
            node.ltime = dead.ltime;
            node.status = if graceful { NodeStatus::Left } else { NodeStatus::Dead };
            node.status_change = Instant::now();
            if graceful {
                info!("Node '{}' left the cluster.", node.name);
            } else {
                info!("Node '{}' is now failed (reported by '{}').", node.name, dead.from);
                Metrics::incr(&self.metrics.nodes_failed);
            }
            event = Some(node.clone());
        }

        self.cancel_suspicion(&dead.node);
        self.queue_state_broadcast(MessageType::Dead, &dead.node, dead.ltime, &dead);

        if let Some(node) = event {
            self.delegate.notify_leave(&node);
        }
    }

    /// Re-asserts our own liveness with a higher incarnation than the
    /// message that declared us suspect or dead.
    pub fn refute(self: &Arc<Self>, accused_incarnation: u64) {
        self.incarnation
            .fetch_max(accused_incarnation + 1, Ordering::SeqCst);
        Metrics::incr(&self.metrics.refutations);
        self.broadcast_local_alive();
    }

    /// Broadcasts the local node's current alive state, stamping a fresh
    /// membership Lamport time.
    pub fn broadcast_local_alive(self: &Arc<Self>) {
        let alive = self.local_alive_message(self.clock.increment());
        let node = alive.node.clone();
        let ltime = alive.ltime;
        self.queue_state_broadcast(MessageType::Alive, &node, ltime, &alive);
    }

    pub fn local_alive_message(&self, ltime: LamportTime) -> Alive {
        Alive {
            ltime,
            incarnation: self.incarnation.load(Ordering::SeqCst),
            node: self.config.node_name.clone(),
            addr: self.advertise.ip(),
            port: self.advertise.port(),
            tags: ByteBuf::from(self.local_tags.lock().clone()),
            vsn: self.config.versions(),
        }
    }

    pub fn local_node_state(&self) -> NodeState {
        NodeState {
            name: self.config.node_name.clone(),
            addr: self.advertise.ip(),
            port: self.advertise.port(),
            tags: self.local_tags.lock().clone(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
            ltime: self.clock.time(),
            status: NodeStatus::Alive,
            status_change: Instant::now(),
            vsn: self.config.versions(),
        }
    }

    /// Snapshot of every known remote node.
    pub fn node_states(&self) -> Vec<NodeState> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        self.nodes.read().get(name).cloned()
    }

    /// Count of peers we believe are alive, excluding ourselves.
    pub fn alive_peers(&self) -> usize {
        self.nodes.read().values().filter(|n| n.is_alive()).count()
    }

    /// Removes nodes that have been dead or left longer than the given
    /// cutoffs; returns the reaped nodes.
    pub fn reap_nodes(
        &self,
        failed_cutoff: std::time::Duration,
        left_cutoff: std::time::Duration,
    ) -> Vec<NodeState> {
        let mut reaped = Vec::new();
        let mut nodes = self.nodes.write();
        nodes.retain(|_, node| {
            let expired = match node.status {
                NodeStatus::Dead => node.status_change.elapsed() >= failed_cutoff,
                NodeStatus::Left => node.status_change.elapsed() >= left_cutoff,
                _ => false,
            };
            if expired {
                reaped.push(node.clone());
            }
            !expired
        });
        if !reaped.is_empty() {
            for node in &reaped {
                debug!("Reaped node '{}'.", node.name);
                Metrics::incr(&self.metrics.nodes_reaped);
            }
        }
        reaped
    }

    fn queue_state_broadcast<T: serde::Serialize>(
        &self,
        message_type: MessageType,
        node: &str,
        ltime: LamportTime,
        message: &T,
    ) {
        if let Ok(bytes) = codec::encode(message_type, message) {
            let key = node.to_string();
            self.broadcasts.queue_broadcast(
                key.clone(),
                ltime,
                bytes,
                |other| other.key == key && other.ltime <= ltime,
                None,
            );
        }
    }
}

enum MemberDelta {
    Join,
    Update,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_rule_dominance() {
        // Higher Lamport time always wins.
        assert!(supersedes(5, 1, 4, 9));
        // Ties break on incarnation.
        assert!(supersedes(5, 2, 5, 1));
        // Equal tuples were already applied.
        assert!(!supersedes(5, 1, 5, 1));
        // Lower tuples are stale.
        assert!(!supersedes(4, 9, 5, 1));
    }

    #[test]
    fn status_byte_round_trip() {
        for status in [
            NodeStatus::Alive,
            NodeStatus::Suspect,
            NodeStatus::Dead,
            NodeStatus::Left,
        ] {
            assert_eq!(NodeStatus::from_u8(status.as_u8()), status);
        }
    }
}
