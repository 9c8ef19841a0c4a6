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
    sync::atomic::{AtomicU64, Ordering},
};

/// Process-wide counters surfaced by the `stats` RPC command. Injected
/// through constructors rather than reached for as a global.
#[derive(Debug, Default)]
pub struct Metrics {
    // Transport
    pub udp_received: AtomicU64,
    pub udp_sent: AtomicU64,
    pub udp_rejected: AtomicU64,
    pub tcp_accepted: AtomicU64,
    pub tcp_connects: AtomicU64,
    pub decrypt_errors: AtomicU64,
    pub protocol_errors: AtomicU64,

    // Failure detector
    pub probes_sent: AtomicU64,
    pub indirect_probes_sent: AtomicU64,
    pub acks_received: AtomicU64,
    pub suspicions_raised: AtomicU64,
    pub refutations: AtomicU64,
    pub nodes_failed: AtomicU64,
    pub nodes_reaped: AtomicU64,
    pub push_pulls: AtomicU64,

    // Events
    pub events_sent: AtomicU64,
    pub events_received: AtomicU64,
    pub events_stale: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_coalesced: AtomicU64,

    // Queries
    pub queries_sent: AtomicU64,
    pub queries_received: AtomicU64,
    pub query_acks: AtomicU64,
    pub query_responses: AtomicU64,
    pub query_dropped: AtomicU64,
    pub query_relayed: AtomicU64,

    // Snapshot
    pub snapshot_writes: AtomicU64,
    pub snapshot_errors: AtomicU64,
    pub snapshot_compactions: AtomicU64,

    // RPC
    pub rpc_sessions: AtomicU64,
    pub rpc_requests: AtomicU64,
    pub rpc_errors: AtomicU64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> HashMap<String, HashMap<String, String>> {
        fn group(pairs: &[(&str, &AtomicU64)]) -> HashMap<String, String> {
            pairs
                .iter()
                .map(|(name, value)| (name.to_string(), value.load(Ordering::Relaxed).to_string()))
                .collect()
        }

        HashMap::from_iter([
            (
                "transport".to_string(),
                group(&[
                    ("udp_received", &self.udp_received),
                    ("udp_sent", &self.udp_sent),
                    ("udp_rejected", &self.udp_rejected),
                    ("tcp_accepted", &self.tcp_accepted),
                    ("tcp_connects", &self.tcp_connects),
                    ("decrypt_errors", &self.decrypt_errors),
                    ("protocol_errors", &self.protocol_errors),
                ]),
            ),
            (
                "swim".to_string(),
                group(&[
                    ("probes_sent", &self.probes_sent),
                    ("indirect_probes_sent", &self.indirect_probes_sent),
                    ("acks_received", &self.acks_received),
                    ("suspicions_raised", &self.suspicions_raised),
                    ("refutations", &self.refutations),
                    ("nodes_failed", &self.nodes_failed),
                    ("nodes_reaped", &self.nodes_reaped),
                    ("push_pulls", &self.push_pulls),
                ]),
            ),
            (
                "event".to_string(),
                group(&[
                    ("sent", &self.events_sent),
                    ("received", &self.events_received),
                    ("stale", &self.events_stale),
                    ("dropped", &self.events_dropped),
                    ("coalesced", &self.events_coalesced),
                ]),
            ),
            (
                "query".to_string(),
                group(&[
                    ("sent", &self.queries_sent),
                    ("received", &self.queries_received),
                    ("acks", &self.query_acks),
                    ("responses", &self.query_responses),
                    ("dropped", &self.query_dropped),
                    ("relayed", &self.query_relayed),
                ]),
            ),
            (
                "snapshot".to_string(),
                group(&[
                    ("writes", &self.snapshot_writes),
                    ("errors", &self.snapshot_errors),
                    ("compactions", &self.snapshot_compactions),
                ]),
            ),
            (
                "rpc".to_string(),
                group(&[
                    ("sessions", &self.rpc_sessions),
                    ("requests", &self.rpc_requests),
                    ("errors", &self.rpc_errors),
                ]),
            ),
        ])
    }
}
