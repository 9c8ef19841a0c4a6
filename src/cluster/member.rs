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
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use parking_lot::RwLock;

use crate::{
    lamport::LamportTime,
    swim::{
        codec,
        state::{NodeState, NodeStatus},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Alive => "alive",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Left => "left",
            MemberStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub tags: HashMap<String, String>,
    pub status: MemberStatus,
    pub incarnation: u64,
    pub status_ltime: LamportTime,
    pub vsn: [u8; 6],
}

impl Member {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    fn from_node(node: &NodeState, status: MemberStatus) -> Self {
        Member {
            name: node.name.clone(),
            addr: node.addr,
            port: node.port,
            tags: codec::decode_tags(&node.tags),
            status,
            incarnation: node.incarnation,
            status_ltime: node.ltime,
            vsn: node.vsn,
        }
    }
}

struct MemberState {
    member: Member,
    status_change: Instant,
}

#[derive(Default)]
pub struct MemberMap {
    members: HashMap<String, MemberState>,
}

impl MemberMap {
    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name).map(|state| &state.member)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Member> {
        self.members.get_mut(name).map(|state| &mut state.member)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values().map(|state| &state.member)
    }

    fn upsert(&mut self, member: Member) {
        match self.members.get_mut(&member.name) {
            Some(state) => {
                if state.member.status != member.status {
                    state.status_change = Instant::now();
                }
                state.member = member;
            }
            None => {
                self.members.insert(
                    member.name.clone(),
                    MemberState {
                        member,
                        status_change: Instant::now(),
                    },
                );
            }
        }
    }
}

/// Authoritative name-to-member mapping for the upper tier. All access
/// goes through the transactional `with` accessor so related updates
/// (status change, Lamport stamp, reap bookkeeping) commit atomically.
#[derive(Default)]
pub struct MemberManager {
    inner: RwLock<MemberMap>,
}

impl MemberManager {
    /// Runs `f` with exclusive access to the member map.
    pub fn with<R>(&self, f: impl FnOnce(&mut MemberMap) -> R) -> R {
        f(&mut self.inner.write())
    }

    pub fn get(&self, name: &str) -> Option<Member> {
        self.inner.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<Member> {
        self.inner.read().iter().cloned().collect()
    }

    /// A node came up (or back): record it Alive. Returns the member
    /// snapshot if anything changed.
    pub fn handle_join(&self, node: &NodeState) -> Option<Member> {
        self.with(|map| {
            let member = Member::from_node(node, MemberStatus::Alive);
            let changed = map
                .get(&node.name)
                .map(|existing| {
                    existing.status != MemberStatus::Alive
                        || existing.status_ltime < member.status_ltime
                        || existing.tags != member.tags
                })
                .unwrap_or(true);
            if changed {
                map.upsert(member.clone());
                Some(member)
            } else {
                None
            }
        })
    }

    /// Tag or version update for a live node.
    pub fn handle_update(&self, node: &NodeState) -> Option<Member> {
        self.with(|map| match map.get_mut(&node.name) {
            Some(member) => {
                member.tags = codec::decode_tags(&node.tags);
                member.incarnation = node.incarnation;
                member.status_ltime = node.ltime;
                member.vsn = node.vsn;
                Some(member.clone())
            }
            None => {
                let member = Member::from_node(node, MemberStatus::Alive);
                map.upsert(member.clone());
                Some(member)
            }
        })
    }

    /// A node stopped being reachable. Graceful departures move
    /// Leaving -> Left; failures go straight to Failed.
    pub fn handle_leave(&self, node: &NodeState) -> Option<Member> {
        let status = match node.status {
            NodeStatus::Left => MemberStatus::Left,
            _ => MemberStatus::Failed,
        };
        self.with(|map| match map.members.get_mut(&node.name) {
            Some(state) => {
                if matches!(
                    state.member.status,
                    MemberStatus::Left | MemberStatus::Failed
                ) {
                    return None;
                }
                state.member.status = status;
                state.member.incarnation = node.incarnation;
                state.member.status_ltime = node.ltime;
                state.status_change = Instant::now();
                Some(state.member.clone())
            }
            None => {
                let member = Member::from_node(node, status);
                map.upsert(member.clone());
                Some(member)
            }
        })
    }

    /// A graceful-leave intent was gossiped ahead of the actual death
    /// notice; mark the member Leaving so the final transition lands in
    /// Left instead of Failed.
    pub fn handle_leave_intent(&self, name: &str, ltime: LamportTime) -> bool {
        self.with(|map| match map.get_mut(name) {
            Some(member)
                if member.status == MemberStatus::Alive && ltime > member.status_ltime =>
            {
                member.status = MemberStatus::Leaving;
                member.status_ltime = ltime;
                true
            }
            _ => false,
        })
    }

    /// Purges Failed members older than `reconnect_timeout` and Left
    /// members older than `tombstone_timeout`; returns what was removed.
    pub fn reap(&self, reconnect_timeout: Duration, tombstone_timeout: Duration) -> Vec<Member> {
        self.with(|map| {
            let mut reaped = Vec::new();
            map.members.retain(|_, state| {
                let expired = match state.member.status {
                    MemberStatus::Failed => state.status_change.elapsed() >= reconnect_timeout,
                    MemberStatus::Left => state.status_change.elapsed() >= tombstone_timeout,
                    _ => false,
                };
                if expired {
                    reaped.push(state.member.clone());
                }
                !expired
            });
            reaped
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, status: NodeStatus, incarnation: u64, ltime: LamportTime) -> NodeState {
        NodeState {
            name: name.to_string(),
            addr: "127.0.0.1".parse().unwrap(),
            port: 7946,
            tags: Vec::new(),
            incarnation,
            ltime,
            status,
            status_change: Instant::now(),
            vsn: [1; 6],
        }
    }

    #[test]
    fn join_update_leave_lifecycle() {
        let members = MemberManager::default();

        let joined = members.handle_join(&node("a", NodeStatus::Alive, 1, 1));
        assert_eq!(joined.unwrap().status, MemberStatus::Alive);

        // Applying the same update twice leaves the table unchanged.
        assert!(members.handle_join(&node("a", NodeStatus::Alive, 1, 1)).is_none());

        let failed = members.handle_leave(&node("a", NodeStatus::Dead, 1, 2));
        assert_eq!(failed.unwrap().status, MemberStatus::Failed);

        // A second death notice is ignored.
        assert!(members.handle_leave(&node("a", NodeStatus::Dead, 1, 3)).is_none());
    }

    #[test]
    fn graceful_departure_lands_in_left() {
        let members = MemberManager::default();
        members.handle_join(&node("b", NodeStatus::Alive, 1, 1));

        assert!(members.handle_leave_intent("b", 2));
        assert_eq!(members.get("b").unwrap().status, MemberStatus::Leaving);

        let left = members.handle_leave(&node("b", NodeStatus::Left, 1, 3));
        assert_eq!(left.unwrap().status, MemberStatus::Left);
    }

    #[test]
    fn stale_leave_intent_is_ignored() {
        let members = MemberManager::default();
        members.handle_join(&node("c", NodeStatus::Alive, 1, 5));
        assert!(!members.handle_leave_intent("c", 4));
        assert_eq!(members.get("c").unwrap().status, MemberStatus::Alive);
    }

    #[test]
    fn reap_honors_both_timeouts() {
        let members = MemberManager::default();
        members.handle_join(&node("dead", NodeStatus::Alive, 1, 1));
        members.handle_join(&node("gone", NodeStatus::Alive, 1, 1));
        members.handle_leave(&node("dead", NodeStatus::Dead, 1, 2));
        members.handle_leave(&node("gone", NodeStatus::Left, 1, 2));

        // Nothing has expired yet.
        assert!(members
            .reap(Duration::from_secs(60), Duration::from_secs(60))
            .is_empty());

        // Zero timeouts expire both tombstones.
        let reaped = members.reap(Duration::ZERO, Duration::ZERO);
        assert_eq!(reaped.len(), 2);
        assert!(members.list().is_empty());
    }
}
