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
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tracing::debug;

use super::{codec::Dead, Swim};

/// A running suspicion timer for one node. Dropping the handle cancels
/// the timer; each independent confirmation shortens the remaining time.
pub struct SuspicionHandle {
    confirm_tx: mpsc::Sender<String>,
    _cancel_tx: oneshot::Sender<()>,
}

impl SuspicionHandle {
    pub fn confirm(&self, from: &str) {
        self.confirm_tx.try_send(from.to_string()).ok();
    }
}

impl Swim {
    /// Starts the suspicion timer for a node just marked suspect. The
    /// initial timeout is `suspicion_mult x log10(n + 1) x probe_interval`
    /// and decays toward `probe_interval` as confirmations arrive; on
    /// expiry without refutation the node is declared dead.
    pub(crate) fn start_suspicion(self: &Arc<Self>, node: &str, from: &str) {
        let n = self.nodes.read().len() + 1;
        let min = self.config.probe_interval;
        let scale = ((n + 1) as f64).log10().max(1.0);
        let max = self
            .config
            .probe_interval
            .mul_f64(self.config.suspicion_mult as f64 * scale);
        // Expected independent confirmers: the indirect probe fan-out.
        let k = self.config.indirect_checks as u32;

        let (confirm_tx, mut confirm_rx) = mpsc::channel::<String>(16);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let handle = SuspicionHandle {
            confirm_tx,
            _cancel_tx: cancel_tx,
        };
        self.suspicions.lock().insert(node.to_string(), handle);

        let swim = self.clone();
        let node = node.to_string();
        let mut confirmers: HashSet<String> = HashSet::from_iter([from.to_string()]);
        tokio::spawn(async move {
            let start = Instant::now();
            loop {
                let timeout = suspicion_timeout(min, max, k, confirmers.len() as u32 - 1);
                let remaining = timeout.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    break;
                }
                tokio::select! {
                    _ = time::sleep(remaining) => {
                        if start.elapsed() >= suspicion_timeout(min, max, k, confirmers.len() as u32 - 1) {
                            break;
                        }
                    }
                    confirmer = confirm_rx.recv() => {
                        match confirmer {
                            Some(confirmer) => {
                                confirmers.insert(confirmer);
                            }
                            None => return,
                        }
                    }
                    _ = &mut cancel_rx => {
                        debug!("Suspicion of '{}' was refuted.", node);
                        return;
                    }
                }
            }

            // Timer expired without refutation.
            swim.suspicions.lock().remove(&node);
            let (incarnation, ltime) = {
                match swim.node_state(&node) {
                    Some(state) => (state.incarnation, swim.clock.increment()),
                    None => return,
                }
            };
            debug!("Suspicion of '{}' timed out, declaring it dead.", node);
            swim.dead_node(Dead {
                ltime,
                incarnation,
                node: node.clone(),
                from: swim.config.node_name.clone(),
            });
        });
    }

    pub(crate) fn confirm_suspicion(&self, node: &str, from: &str) {
        if let Some(handle) = self.suspicions.lock().get(node) {
            handle.confirm(from);
        }
    }

    pub(crate) fn cancel_suspicion(&self, node: &str) {
        self.suspicions.lock().remove(node);
    }
}

/// Decaying timeout: with `c` independent confirmations out of an
/// expected `k`, the timeout shrinks logarithmically from `max` to `min`.
pub fn suspicion_timeout(min: Duration, max: Duration, k: u32, confirmations: u32) -> Duration {
    if k == 0 {
        return min.max(max);
    }
    let frac = ((confirmations + 1) as f64).ln() / ((k + 2) as f64).ln();
    let timeout = max.as_secs_f64() - frac * (max.as_secs_f64() - min.as_secs_f64());
    Duration::from_secs_f64(timeout.max(min.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_decays_with_confirmations() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(10);

        let none = suspicion_timeout(min, max, 3, 0);
        let one = suspicion_timeout(min, max, 3, 1);
        let three = suspicion_timeout(min, max, 3, 3);

        assert_eq!(none, max);
        assert!(one < none);
        assert!(three < one);
        assert!(three >= min);
    }

    #[test]
    fn timeout_never_drops_below_the_floor() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(10);
        assert!(suspicion_timeout(min, max, 3, 100) >= min);
    }
}
