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

use std::{net::SocketAddr, sync::Arc, time::Instant};

use futures::{SinkExt, StreamExt};
use serde_bytes::ByteBuf;
use tokio::{net::TcpStream, sync::mpsc, time};
use tracing::{debug, error};

use crate::{
    error::{Error, Result},
    metrics::Metrics,
};

use super::{
    codec::{self, Alive, Dead, MessageType, PushNodeState, PushPull, Suspect},
    state::NodeStatus,
    transport::stream_frames,
    Swim,
};

impl Swim {
    /// Periodic anti-entropy: a full state exchange with one random live
    /// peer over TCP.
    pub(crate) fn spawn_push_pull_loop(self: &Arc<Self>) {
        let swim = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(swim.config.push_pull_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh node
            // does not sync before its join round.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Some(peer) = swim
                            .random_nodes(1, |node| node.is_alive())
                            .into_iter()
                            .next()
                        {
                            if let Err(err) = swim.push_pull_node(peer.socket_addr(), false).await {
                                debug!("Push/pull with {} failed: {}", peer.socket_addr(), err);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Push/pull syncer shutting down.");
                        break;
                    }
                }
            }
        });
    }

    /// Performs one push/pull exchange with the peer at `addr`.
    pub async fn push_pull_node(self: &Arc<Self>, addr: SocketAddr, join: bool) -> Result<()> {
        let stream = self.transport.connect(addr).await?;
        let mut frames = stream_frames(stream);
        frames.send(self.encode_local_state(join)?.into()).await?;

        let reply = frames
            .next()
            .await
            .ok_or_else(|| {
                Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Connection closed before the push/pull response",
                ))
            })??;
        let reply = self
            .unseal(reply.to_vec())
            .ok_or(Error::DecryptionFailed)?;
        if codec::message_type(&reply)? != MessageType::PushPull {
            return Err(Error::Protocol(
                "Expected a push/pull response".to_string(),
            ));
        }
        let remote: PushPull = codec::decode(&reply)?;
        self.merge_remote_state(remote);
        Metrics::incr(&self.metrics.push_pulls);
        Ok(())
    }

    pub(crate) fn encode_local_state(&self, join: bool) -> Result<Vec<u8>> {
        let mut nodes = self
            .nodes
            .read()
            .values()
            .map(|node| PushNodeState {
                name: node.name.clone(),
                addr: node.addr,
                port: node.port,
                tags: ByteBuf::from(node.tags.clone()),
                incarnation: node.incarnation,
                ltime: node.ltime,
                state: node.status.as_u8(),
                vsn: node.vsn,
            })
            .collect::<Vec<_>>();
        let local = self.local_node_state();
        nodes.push(PushNodeState {
            name: local.name,
            addr: local.addr,
            port: local.port,
            tags: ByteBuf::from(local.tags),
            incarnation: local.incarnation,
            ltime: self.clock.time(),
            state: NodeStatus::Alive.as_u8(),
            vsn: local.vsn,
        });

        let push_pull = PushPull {
            join,
            ltime: self.clock.time(),
            nodes,
            user_state: ByteBuf::from(self.delegate.local_state(join)),
        };
        Ok(self.seal(codec::encode(MessageType::PushPull, &push_pull)?))
    }

    /// Merges a remote node table using the ordering rule; the newer
    /// `(ltime, incarnation)` tuple wins for each name.
    pub(crate) fn merge_remote_state(self: &Arc<Self>, remote: PushPull) {
        self.clock.witness(remote.ltime);
        let join = remote.join;
        let user_state = remote.user_state;

        for node in remote.nodes {
            match NodeStatus::from_u8(node.state) {
                NodeStatus::Alive => {
                    self.alive_node(
                        Alive {
                            ltime: node.ltime,
                            incarnation: node.incarnation,
                            node: node.name,
                            addr: node.addr,
                            port: node.port,
                            tags: node.tags,
                            vsn: node.vsn,
                        });
                }
                NodeStatus::Suspect => {
                    self.alive_node(
                        Alive {
                            ltime: node.ltime.saturating_sub(1),
                            incarnation: node.incarnation,
                            node: node.name.clone(),
                            addr: node.addr,
                            port: node.port,
                            tags: node.tags,
                            vsn: node.vsn,
                        });
                    self.suspect_node(Suspect {
                        ltime: node.ltime,
                        incarnation: node.incarnation,
                        node: node.name.clone(),
                        from: node.name,
                    });
                }
                NodeStatus::Dead | NodeStatus::Left => {
                    let graceful = NodeStatus::from_u8(node.state) == NodeStatus::Left;
                    self.alive_node(
                        Alive {
                            ltime: node.ltime.saturating_sub(1),
                            incarnation: node.incarnation,
                            node: node.name.clone(),
                            addr: node.addr,
                            port: node.port,
                            tags: node.tags,
                            vsn: node.vsn,
                        });
                    self.dead_node(Dead {
                        ltime: node.ltime,
                        incarnation: node.incarnation,
                        node: node.name.clone(),
                        from: if graceful {
                            node.name
                        } else {
                            self.config.node_name.clone()
                        },
                    });
                }
            }
        }

        if !user_state.is_empty() {
            self.delegate.merge_remote_state(&user_state, join);
        }
    }

    /// Handles inbound TCP streams: push/pull exchanges and reliable
    /// user messages.
    pub(crate) fn spawn_stream_loop(
        self: &Arc<Self>,
        mut stream_rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    ) {
        let swim = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    stream = stream_rx.recv() => {
                        match stream {
                            Some((stream, from)) => {
                                let swim = swim.clone();
                                tokio::spawn(async move {
                                    if let Err(err) = swim.handle_stream(stream, from).await {
                                        debug!("Stream from {} failed: {}", from, err);
                                    }
                                });
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Stream handler shutting down.");
                        break;
                    }
                }
            }
        });
    }

    async fn handle_stream(self: Arc<Self>, stream: TcpStream, from: SocketAddr) -> Result<()> {
        let mut frames = stream_frames(stream);
        let frame = match frames.next().await {
            Some(frame) => frame?,
            None => return Ok(()),
        };
        let bytes = match self.unseal(frame.to_vec()) {
            Some(bytes) => bytes,
            None => {
                return Err(Error::DecryptionFailed);
            }
        };

        match codec::message_type(&bytes)? {
            MessageType::PushPull => {
                let remote: PushPull = codec::decode(&bytes)?;
                // Reply with our state before merging theirs so both
                // sides exchange their pre-merge views.
                let local = self.encode_local_state(remote.join)?;
                if let Err(err) = frames.send(local.into()).await {
                    error!("Failed to send push/pull response to {}: {}", from, err);
                }
                self.merge_remote_state(remote);
                Metrics::incr(&self.metrics.push_pulls);
            }
            MessageType::UserMsg => {
                self.delegate.notify_msg(from, &bytes[1..]);
            }
            _ => {
                self.handle_message(bytes, from, Instant::now());
            }
        }
        Ok(())
    }
}
