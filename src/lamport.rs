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

use std::sync::atomic::{AtomicU64, Ordering};

pub type LamportTime = u64;

/// Monotonic logical clock. Three instances exist per node: one for
/// membership updates, one for user events and one for queries; the
/// membership clock is never advanced by user events.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new(start: LamportTime) -> Self {
        LamportClock {
            counter: AtomicU64::new(start),
        }
    }

    pub fn time(&self) -> LamportTime {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn increment(&self) -> LamportTime {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Witness a remote time, advancing the local counter to just past it
    /// if the remote one is ahead.
    pub fn witness(&self, time: LamportTime) {
        let mut current = self.counter.load(Ordering::SeqCst);
        while current < time + 1 {
            match self.counter.compare_exchange_weak(
                current,
                time + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(now) => current = now,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LamportClock;

    #[test]
    fn lamport_clock() {
        let clock = LamportClock::default();
        assert_eq!(clock.time(), 0);
        assert_eq!(clock.increment(), 1);
        assert_eq!(clock.increment(), 2);

        // Witnessing an older or equal time never moves the clock backwards.
        clock.witness(1);
        assert_eq!(clock.time(), 2);
        clock.witness(2);
        assert_eq!(clock.time(), 3);

        // Witnessing a newer time jumps just past it.
        clock.witness(41);
        assert_eq!(clock.time(), 42);
        assert_eq!(clock.increment(), 43);
    }
}
