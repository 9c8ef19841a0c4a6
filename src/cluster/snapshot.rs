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
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    sync::{mpsc, watch},
    time,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    lamport::LamportClock,
    metrics::Metrics,
    swim::Swim,
};

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);
const ERROR_RECOVERY_INTERVAL: Duration = Duration::from_secs(30);
const MIN_COMPACT_SIZE: u64 = 128 * 1024;
const COMPACTION_THRESHOLD: u64 = 8;
const OPEN_RETRIES: u32 = 3;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(250);
const SNAPSHOT_CHANNEL_BUFFER: usize = 1024;

#[derive(Debug)]
pub enum SnapEvent {
    Alive(String, SocketAddr),
    NotAlive(String),
    Leave,
}

/// What a recovery replay yields: the alive set and the three Lamport
/// clocks as of the last shutdown.
#[derive(Debug, Default)]
pub struct SnapshotReplay {
    pub alive_nodes: Vec<(String, SocketAddr)>,
    pub clock: u64,
    pub event_clock: u64,
    pub query_clock: u64,
    pub left: bool,
}

/// Replays the snapshot line by line. A `leave` marker discards all
/// state up to that point unless rejoining after leave is enabled.
pub fn replay(path: &Path, rejoin_after_leave: bool) -> Result<SnapshotReplay> {
    let mut replay = SnapshotReplay::default();
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(replay),
        Err(err) => {
            return Err(Error::Fatal(format!(
                "Failed to read snapshot {}: {}",
                path.display(),
                err
            )));
        }
    };

    let mut alive: HashMap<String, SocketAddr> = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("alive: ") {
            match rest.rsplit_once(' ') {
                Some((name, addr)) => match addr.parse() {
                    Ok(addr) => {
                        alive.insert(name.to_string(), addr);
                    }
                    Err(_) => warn!("Skipping snapshot line with bad address: {}", line),
                },
                None => warn!("Skipping malformed snapshot line: {}", line),
            }
        } else if let Some(name) = line.strip_prefix("not-alive: ") {
            alive.remove(name);
        } else if let Some(value) = line.strip_prefix("clock: ") {
            replay.clock = value.parse().unwrap_or(replay.clock);
        } else if let Some(value) = line.strip_prefix("event-clock: ") {
            replay.event_clock = value.parse().unwrap_or(replay.event_clock);
        } else if let Some(value) = line.strip_prefix("query-clock: ") {
            replay.query_clock = value.parse().unwrap_or(replay.query_clock);
        } else if line == "leave" {
            if rejoin_after_leave {
                continue;
            }
            alive.clear();
            replay.clock = 0;
            replay.event_clock = 0;
            replay.query_clock = 0;
            replay.left = true;
        } else {
            warn!("Skipping unrecognized snapshot line: {}", line);
        }
    }

    replay.alive_nodes = alive.into_iter().collect();
    Ok(replay)
}

/// Append-only recovery log. Consumes member transitions from the event
/// dispatch (the one path that may apply backpressure), records clock
/// progress, and compacts itself in place when it grows past the
/// threshold.
pub struct Snapshotter {
    path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    alive_nodes: HashMap<String, SocketAddr>,
    last_clock: u64,
    last_event_clock: u64,
    last_query_clock: u64,
    last_error_compact: Option<Instant>,
    leaving: bool,

    swim: Arc<Swim>,
    event_clock: Arc<LamportClock>,
    query_clock: Arc<LamportClock>,
    metrics: Arc<Metrics>,
}

impl Snapshotter {
    /// Opens (creating if needed) the snapshot, seeds it from the replay
    /// and spawns the writer task. Returns the event sender.
    pub async fn start(
        path: PathBuf,
        replayed: &SnapshotReplay,
        swim: Arc<Swim>,
        event_clock: Arc<LamportClock>,
        query_clock: Arc<LamportClock>,
        metrics: Arc<Metrics>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<mpsc::Sender<SnapEvent>> {
        let file = open_append(&path).await?;
        let offset = file.metadata().map(|m| m.len()).unwrap_or(0);

        let snapshotter = Snapshotter {
            path,
            file: BufWriter::new(file),
            offset,
            alive_nodes: replayed.alive_nodes.iter().cloned().collect(),
            last_clock: replayed.clock,
            last_event_clock: replayed.event_clock,
            last_query_clock: replayed.query_clock,
            last_error_compact: None,
            leaving: false,
            swim,
            event_clock,
            query_clock,
            metrics,
        };

        let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_BUFFER);
        tokio::spawn(snapshotter.run(rx, shutdown_rx));
        Ok(tx)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SnapEvent>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut flush_timer = time::interval(FLUSH_INTERVAL);
        flush_timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            self.process(event);
                            // Member transitions hit disk right away.
                            self.flush();
                        }
                        None => break,
                    }
                }
                _ = flush_timer.tick() => {
                    self.update_clocks();
                    self.flush();
                    self.maybe_compact();
                }
                _ = shutdown_rx.changed() => {
                    debug!("Snapshotter draining and shutting down.");
                    let deadline = Instant::now() + SHUTDOWN_FLUSH_TIMEOUT;
                    loop {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        match time::timeout(remaining, rx.recv()).await {
                            Ok(Some(event)) => self.process(event),
                            _ => break,
                        }
                    }
                    self.update_clocks();
                    self.flush();
                    break;
                }
            }
        }
    }

    fn process(&mut self, event: SnapEvent) {
        match event {
            SnapEvent::Alive(name, addr) => {
                if self.alive_nodes.insert(name.clone(), addr) != Some(addr) {
                    self.append(&format!("alive: {} {}\n", name, addr));
                }
            }
            SnapEvent::NotAlive(name) => {
                if self.alive_nodes.remove(&name).is_some() {
                    self.append(&format!("not-alive: {}\n", name));
                }
            }
            SnapEvent::Leave => {
                self.leaving = true;
                self.append("leave\n");
            }
        }
        self.update_clocks();
    }

    /// Appends clock lines for any clock that advanced since the last
    /// write.
    fn update_clocks(&mut self) {
        let clock = self.swim.clock.time();
        if clock > self.last_clock {
            self.last_clock = clock;
            self.append(&format!("clock: {}\n", clock));
        }
        let event_clock = self.event_clock.time();
        if event_clock > self.last_event_clock {
            self.last_event_clock = event_clock;
            self.append(&format!("event-clock: {}\n", event_clock));
        }
        let query_clock = self.query_clock.time();
        if query_clock > self.last_query_clock {
            self.last_query_clock = query_clock;
            self.append(&format!("query-clock: {}\n", query_clock));
        }
    }

    fn append(&mut self, line: &str) {
        Metrics::incr(&self.metrics.snapshot_writes);
        if let Err(err) = self.file.write_all(line.as_bytes()) {
            Metrics::incr(&self.metrics.snapshot_errors);
            error!("Failed to append to snapshot: {}", err);
            self.compact_after_error();
            return;
        }
        self.offset += line.len() as u64;
    }

    fn flush(&mut self) {
        if let Err(err) = self.file.flush() {
            Metrics::incr(&self.metrics.snapshot_errors);
            error!("Failed to flush snapshot: {}", err);
            self.compact_after_error();
        }
    }

    fn compact_threshold(&self) -> u64 {
        MIN_COMPACT_SIZE.max(self.alive_nodes.len() as u64 * 128 * COMPACTION_THRESHOLD)
    }

    fn maybe_compact(&mut self) {
        if self.offset > self.compact_threshold() {
            if let Err(err) = self.compact() {
                Metrics::incr(&self.metrics.snapshot_errors);
                error!("Snapshot compaction failed: {}", err);
            }
        }
    }

    /// Write errors trigger an attempted compaction (which reopens the
    /// file) at most once per recovery interval.
    fn compact_after_error(&mut self) {
        if self
            .last_error_compact
            .map(|at| at.elapsed() >= ERROR_RECOVERY_INTERVAL)
            .unwrap_or(true)
        {
            self.last_error_compact = Some(Instant::now());
            if let Err(err) = self.compact() {
                error!("Snapshot recovery compaction failed: {}", err);
            }
        }
    }

    /// Rewrites the currently-alive set plus the latest clocks into a
    /// sibling file and renames it over the live log.
    fn compact(&mut self) -> Result<()> {
        let compact_path = self.path.with_extension("compact");
        let mut out = BufWriter::new(File::create(&compact_path).map_err(|err| {
            Error::Fatal(format!(
                "Failed to create {}: {}",
                compact_path.display(),
                err
            ))
        })?);

        let mut offset = 0u64;
        let mut write = |line: String| -> std::io::Result<u64> {
            out.write_all(line.as_bytes())?;
            Ok(line.len() as u64)
        };
        for (name, addr) in &self.alive_nodes {
            offset += write(format!("alive: {} {}\n", name, addr)).map_err(Error::Transport)?;
        }
        offset += write(format!("clock: {}\n", self.last_clock)).map_err(Error::Transport)?;
        offset +=
            write(format!("event-clock: {}\n", self.last_event_clock)).map_err(Error::Transport)?;
        offset +=
            write(format!("query-clock: {}\n", self.last_query_clock)).map_err(Error::Transport)?;
        if self.leaving {
            offset += write("leave\n".to_string()).map_err(Error::Transport)?;
        }
        out.flush().map_err(Error::Transport)?;
        drop(out);

        std::fs::rename(&compact_path, &self.path).map_err(|err| {
            Error::Fatal(format!(
                "Failed to install compacted snapshot: {}",
                err
            ))
        })?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(Error::Transport)?;
        self.file = BufWriter::new(file);
        self.offset = offset;
        Metrics::incr(&self.metrics.snapshot_compactions);
        info!("Compacted snapshot to {} bytes.", offset);
        Ok(())
    }
}

/// Opens the log in append mode, retrying a few times to tolerate
/// residual locks from a previous process.
async fn open_append(path: &Path) -> Result<File> {
    let mut attempt = 0;
    loop {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => return Ok(file),
            Err(err) => {
                attempt += 1;
                if attempt >= OPEN_RETRIES {
                    return Err(Error::Fatal(format!(
                        "Failed to open snapshot {}: {}",
                        path.display(),
                        err
                    )));
                }
                warn!(
                    "Snapshot {} is busy ({}), retrying.",
                    path.display(),
                    err
                );
                time::sleep(OPEN_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mesh-snapshot-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn replay_rebuilds_alive_set_and_clocks() {
        let path = temp_path("snapshot");
        std::fs::write(
            &path,
            "# header comment\n\
             alive: node-a 127.0.0.1:7946\n\
             alive: node-b 127.0.0.1:7947\n\
             clock: 10\n\
             event-clock: 4\n\
             not-alive: node-b\n\
             query-clock: 2\n\
             bogus line\n",
        )
        .unwrap();

        let replay = replay(&path, false).unwrap();
        assert_eq!(replay.alive_nodes.len(), 1);
        assert_eq!(replay.alive_nodes[0].0, "node-a");
        assert_eq!(replay.clock, 10);
        assert_eq!(replay.event_clock, 4);
        assert_eq!(replay.query_clock, 2);
        assert!(!replay.left);
    }

    #[test]
    fn leave_marker_discards_prior_state() {
        let path = temp_path("snapshot");
        std::fs::write(
            &path,
            "alive: node-a 127.0.0.1:7946\n\
             clock: 10\n\
             leave\n\
             alive: node-c 127.0.0.1:7948\n",
        )
        .unwrap();

        let replay = replay(&path, false).unwrap();
        assert!(replay.left);
        assert_eq!(replay.clock, 0);
        // State after the marker is kept.
        assert_eq!(replay.alive_nodes.len(), 1);
        assert_eq!(replay.alive_nodes[0].0, "node-c");

        // With rejoin enabled the marker is ignored entirely.
        let replay = super::replay(&path, true).unwrap();
        assert!(!replay.left);
        assert_eq!(replay.alive_nodes.len(), 2);
        assert_eq!(replay.clock, 10);
    }

    #[test]
    fn missing_snapshot_is_empty() {
        let path = temp_path("does-not-exist");
        let replay = replay(&path, false).unwrap();
        assert!(replay.alive_nodes.is_empty());
        assert_eq!(replay.clock, 0);
    }

    #[test]
    fn names_with_spaces_survive_replay() {
        let path = temp_path("snapshot");
        std::fs::write(&path, "alive: db node one 10.0.0.9:7946\n").unwrap();
        let replay = replay(&path, false).unwrap();
        assert_eq!(replay.alive_nodes[0].0, "db node one");
        assert_eq!(
            replay.alive_nodes[0].1,
            "10.0.0.9:7946".parse::<SocketAddr>().unwrap()
        );
    }
}
