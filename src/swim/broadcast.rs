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

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::lamport::LamportTime;

/// A pending outbound broadcast. `key` and `ltime` are the identity other
/// broadcasts inspect when deciding whether this one is obsolete.
pub struct QueuedBroadcast {
    pub key: String,
    pub ltime: LamportTime,
    pub message: Vec<u8>,
    transmits: u32,
    notify: Option<oneshot::Sender<()>>,
}

impl QueuedBroadcast {
    fn finished(&mut self) {
        if let Some(notify) = self.notify.take() {
            notify.send(()).ok();
        }
    }
}

/// Ordered multiset of pending broadcasts shared by every outbound
/// carrier. Dequeue prefers the least-transmitted messages that fit the
/// byte budget; a message is retired after
/// `retransmit_mult x ceil(log10(n + 1))` transmissions.
pub struct BroadcastQueue {
    queue: Mutex<Vec<QueuedBroadcast>>,
    retransmit_mult: u32,
}

impl BroadcastQueue {
    pub fn new(retransmit_mult: u32) -> Self {
        BroadcastQueue {
            queue: Mutex::new(Vec::new()),
            retransmit_mult,
        }
    }

    /// Enqueues a broadcast, dropping any queued entry the caller's
    /// predicate invalidates (a fresher update for the same node, an
    /// older coalesced version of the same event).
    pub fn queue_broadcast(
        &self,
        key: impl Into<String>,
        ltime: LamportTime,
        message: Vec<u8>,
        invalidates: impl Fn(&QueuedBroadcast) -> bool,
        notify: Option<oneshot::Sender<()>>,
    ) {
        let mut queue = self.queue.lock();
        let mut idx = 0;
        while idx < queue.len() {
            if invalidates(&queue[idx]) {
                queue[idx].finished();
                queue.remove(idx);
            } else {
                idx += 1;
            }
        }
        queue.push(QueuedBroadcast {
            key: key.into(),
            ltime,
            message,
            transmits: 0,
            notify,
        });
    }

    /// Selects messages fitting `budget` bytes (each costing `overhead`
    /// extra), least-transmitted first, and bumps their transmit counter.
    /// Messages past the retransmit limit for a cluster of `num_nodes`
    /// are retired.
    pub fn pop(&self, overhead: usize, budget: usize, num_nodes: usize) -> Vec<Vec<u8>> {
        let limit = retransmit_limit(self.retransmit_mult, num_nodes);
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return Vec::new();
        }
        queue.sort_by_key(|b| b.transmits);

        let mut remaining = budget;
        let mut selected = Vec::new();
        let mut idx = 0;
        while idx < queue.len() {
            let cost = queue[idx].message.len() + overhead;
            if cost <= remaining {
                remaining -= cost;
                selected.push(queue[idx].message.clone());
                queue[idx].transmits += 1;
                if queue[idx].transmits >= limit {
                    queue[idx].finished();
                    queue.remove(idx);
                    continue;
                }
            }
            idx += 1;
        }
        selected
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

pub fn retransmit_limit(retransmit_mult: u32, num_nodes: usize) -> u32 {
    let scale = ((num_nodes + 1) as f64).log10().ceil() as u32;
    retransmit_mult * scale.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(byte: u8, len: usize) -> Vec<u8> {
        vec![byte; len]
    }

    #[test]
    fn invalidation_drops_older_entries() {
        let queue = BroadcastQueue::new(2);
        queue.queue_broadcast("node-a", 1, msg(1, 8), |_| false, None);
        queue.queue_broadcast("node-b", 1, msg(2, 8), |_| false, None);

        // A fresher update for node-a replaces the queued one.
        queue.queue_broadcast(
            "node-a",
            5,
            msg(3, 8),
            |other| other.key == "node-a" && other.ltime < 5,
            None,
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn invalidation_fires_notify() {
        let queue = BroadcastQueue::new(2);
        let (tx, mut rx) = oneshot::channel();
        queue.queue_broadcast("node-a", 1, msg(1, 8), |_| false, Some(tx));
        queue.queue_broadcast("node-a", 2, msg(2, 8), |other| other.key == "node-a", None);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn pop_respects_budget_and_prefers_fresh_messages() {
        let queue = BroadcastQueue::new(4);
        queue.queue_broadcast("a", 0, msg(1, 100), |_| false, None);
        queue.queue_broadcast("b", 0, msg(2, 100), |_| false, None);

        // Only one message fits the budget.
        let batch = queue.pop(0, 150, 10);
        assert_eq!(batch.len(), 1);

        // The untransmitted message is preferred on the next pop.
        let batch2 = queue.pop(0, 150, 10);
        assert_eq!(batch2.len(), 1);
        assert_ne!(batch[0][0], batch2[0][0]);
    }

    #[test]
    fn messages_are_retired_after_the_retransmit_limit() {
        // One node: limit = mult x ceil(log10(2)) = mult.
        let queue = BroadcastQueue::new(2);
        queue.queue_broadcast("a", 0, msg(1, 8), |_| false, None);

        assert_eq!(queue.pop(0, 1024, 1).len(), 1);
        assert_eq!(queue.pop(0, 1024, 1).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn limit_scales_with_cluster_size() {
        assert_eq!(retransmit_limit(4, 1), 4);
        assert_eq!(retransmit_limit(4, 9), 4);
        assert_eq!(retransmit_limit(4, 10), 8);
        assert_eq!(retransmit_limit(4, 99), 8);
        assert_eq!(retransmit_limit(4, 100), 12);
    }
}
