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

use std::{net::SocketAddr, time::Duration};

use super::{codec::Alive, state::NodeState};

/// Capability set the membership layer exposes to the tier above it.
/// Implementations borrow the `Swim` handle rather than own it; they
/// must never block, since several hooks run on the packet dispatch
/// path.
pub trait Delegate: Send + Sync + 'static {
    /// Piggyback metadata advertised in our alive messages.
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    /// A message with an upper-tier type byte arrived.
    fn notify_msg(&self, _from: SocketAddr, _msg: &[u8]) {}

    /// Upper-tier broadcasts to piggyback on outgoing gossip, within
    /// `budget` bytes at `overhead` cost per message.
    fn broadcasts(&self, _overhead: usize, _budget: usize, _num_nodes: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Opaque state blob exchanged during push/pull.
    fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }

    fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}

    fn notify_join(&self, _node: &NodeState) {}

    fn notify_leave(&self, _node: &NodeState) {}

    fn notify_update(&self, _node: &NodeState) {}

    /// Two nodes claim the same name with different addresses.
    fn notify_conflict(&self, _existing: &NodeState, _other: &Alive) {}

    /// A probe completed; `payload` is the remote `ack_payload`.
    fn notify_ping_complete(&self, _node: &NodeState, _rtt: Duration, _payload: &[u8]) {}

    /// Payload to attach to outgoing acks (the network coordinate).
    fn ack_payload(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Stand-alone membership without an upper tier, used in tests.
pub struct NoopDelegate;

impl Delegate for NoopDelegate {}
