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

use std::{collections::VecDeque, fmt::Write, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{field::Field, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

const LOG_RING_SIZE: usize = 512;
const LOG_CHANNEL_BUFFER: usize = 512;

#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: Level,
    pub line: String,
}

/// Retains the most recent formatted log lines and fans new ones out to
/// `monitor` RPC subscribers. Installed as an extra subscriber layer next
/// to the fmt output.
pub struct LogBroadcaster {
    tx: broadcast::Sender<LogLine>,
    ring: Mutex<VecDeque<LogLine>>,
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        LogBroadcaster {
            tx: broadcast::channel(LOG_CHANNEL_BUFFER).0,
            ring: Mutex::new(VecDeque::with_capacity(LOG_RING_SIZE)),
        }
    }
}

impl LogBroadcaster {
    /// Returns the retained backlog at or above `level` plus a receiver
    /// for lines logged from now on.
    pub fn subscribe(&self, level: Level) -> (Vec<LogLine>, broadcast::Receiver<LogLine>) {
        let backlog = self
            .ring
            .lock()
            .iter()
            .filter(|line| line.level <= level)
            .cloned()
            .collect();
        (backlog, self.tx.subscribe())
    }

    pub fn publish(&self, level: Level, line: String) {
        let line = LogLine { level, line };
        {
            let mut ring = self.ring.lock();
            if ring.len() == LOG_RING_SIZE {
                ring.pop_front();
            }
            ring.push_back(line.clone());
        }
        self.tx.send(line).ok();
    }

    /// Parses the levels accepted by the `monitor` RPC command.
    pub fn parse_level(level: &str) -> Option<Level> {
        match level.to_ascii_uppercase().as_str() {
            "TRACE" => Some(Level::TRACE),
            "DEBUG" => Some(Level::DEBUG),
            "INFO" => Some(Level::INFO),
            "WARN" => Some(Level::WARN),
            "ERR" | "ERROR" => Some(Level::ERROR),
            _ => None,
        }
    }
}

pub struct LogLayer {
    pub broadcaster: Arc<LogBroadcaster>,
}

impl<S: Subscriber> Layer<S> for LogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let mut line = format!("[{}] {}: {}", metadata.level(), metadata.target(), visitor.message);
        if !visitor.fields.is_empty() {
            write!(line, " {}", visitor.fields).ok();
        }
        self.broadcaster.publish(*metadata.level(), line);
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            write!(self.fields, "{}={:?}", field.name(), value).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_is_level_filtered() {
        let broadcaster = LogBroadcaster::default();
        broadcaster.publish(Level::INFO, "started".to_string());
        broadcaster.publish(Level::DEBUG, "probing".to_string());
        broadcaster.publish(Level::ERROR, "boom".to_string());

        let (backlog, _rx) = broadcaster.subscribe(Level::INFO);
        assert_eq!(backlog.len(), 2);
        assert!(backlog.iter().all(|l| l.level <= Level::INFO));

        let (backlog, _rx) = broadcaster.subscribe(Level::TRACE);
        assert_eq!(backlog.len(), 3);
    }

    #[test]
    fn level_names() {
        assert_eq!(LogBroadcaster::parse_level("ERR"), Some(Level::ERROR));
        assert_eq!(LogBroadcaster::parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(LogBroadcaster::parse_level("verbose"), None);
    }
}
