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

pub mod broadcast;
pub mod codec;
pub mod delegate;
pub mod probe;
pub mod pushpull;
pub mod security;
pub mod state;
pub mod suspicion;
pub mod transport;

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use ipnetwork::IpNetwork;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    lamport::LamportClock,
    metrics::Metrics,
};

use self::{
    broadcast::BroadcastQueue,
    codec::MessageType,
    delegate::Delegate,
    probe::AckInfo,
    security::Keyring,
    suspicion::SuspicionHandle,
    transport::{Packet, Transport, TransportConfig},
};

pub const IPC_CHANNEL_BUFFER: usize = 1024;
pub const DEFAULT_GOSSIP_PORT: u16 = 7946;

pub const PROTOCOL_VERSION: u8 = 1;
pub const DELEGATE_VERSION: u8 = 1;

#[derive(Debug, Clone)]
pub struct SwimConfig {
    pub node_name: String,
    pub bind_addr: SocketAddr,
    pub advertise_addr: Option<SocketAddr>,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub indirect_checks: usize,
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub push_pull_interval: Duration,
    pub suspicion_mult: u32,
    pub retransmit_mult: u32,
    pub mtu: usize,
    pub allowed_cidrs: Vec<IpNetwork>,
    pub connect_timeout: Duration,
}

impl Default for SwimConfig {
    fn default() -> Self {
        SwimConfig {
            node_name: gethostname::gethostname().to_string_lossy().into_owned(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_GOSSIP_PORT)),
            advertise_addr: None,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            push_pull_interval: Duration::from_secs(30),
            suspicion_mult: 4,
            retransmit_mult: 4,
            mtu: 1400,
            allowed_cidrs: Vec::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SwimConfig {
    /// A tighter timing profile for clusters on a loopback or fast LAN,
    /// used heavily by the integration tests.
    pub fn local(node_name: impl Into<String>) -> Self {
        SwimConfig {
            node_name: node_name.into(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(100),
            gossip_interval: Duration::from_millis(50),
            push_pull_interval: Duration::from_secs(5),
            ..Default::default()
        }
    }

    pub fn versions(&self) -> [u8; 6] {
        [
            1,
            PROTOCOL_VERSION,
            PROTOCOL_VERSION,
            1,
            DELEGATE_VERSION,
            DELEGATE_VERSION,
        ]
    }
}

/// The SWIM membership layer: owns the transport, the node table, the
/// failure detector, anti-entropy and the encrypted codec. The tier
/// above participates through its [`Delegate`].
pub struct Swim {
    pub config: SwimConfig,
    pub advertise: SocketAddr,
    pub clock: LamportClock,
    pub broadcasts: BroadcastQueue,

    pub(crate) nodes: RwLock<HashMap<String, state::NodeState>>,
    pub(crate) incarnation: AtomicU64,
    pub(crate) seq: AtomicU32,
    pub(crate) ack_handlers: Mutex<HashMap<u32, oneshot::Sender<AckInfo>>>,
    pub(crate) suspicions: Mutex<HashMap<String, SuspicionHandle>>,
    pub(crate) local_tags: Mutex<Vec<u8>>,
    pub(crate) leaving: AtomicBool,

    pub(crate) transport: Transport,
    pub(crate) keyring: Option<Arc<Keyring>>,
    pub(crate) delegate: Arc<dyn Delegate>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,

    receivers: Mutex<Option<Receivers>>,
}

struct Receivers {
    packet_rx: mpsc::Receiver<Packet>,
    stream_rx: mpsc::Receiver<(tokio::net::TcpStream, SocketAddr)>,
}

impl Swim {
    /// Binds the gossip sockets and builds the membership layer; no task
    /// runs until [`Swim::start`].
    pub async fn new(
        config: SwimConfig,
        keyring: Option<Arc<Keyring>>,
        delegate: Arc<dyn Delegate>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Swim>> {
        if config.node_name.is_empty() {
            return Err(Error::Configuration(
                "Node name must not be empty".to_string(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (transport, packet_rx, stream_rx) = Transport::bind(
            TransportConfig {
                bind_addr: config.bind_addr,
                allowed_cidrs: config.allowed_cidrs.clone(),
                connect_timeout: config.connect_timeout,
            },
            metrics.clone(),
            shutdown_rx.clone(),
        )
        .await?;

        let advertise = config.advertise_addr.unwrap_or(transport.local_addr);
        info!(
            "Node '{}' listening at {} (UDP/TCP).",
            config.node_name, transport.local_addr
        );

        Ok(Arc::new(Swim {
            broadcasts: BroadcastQueue::new(config.retransmit_mult),
            clock: LamportClock::new(0),
            config,
            advertise,
            nodes: RwLock::new(HashMap::new()),
            incarnation: AtomicU64::new(1),
            seq: AtomicU32::new(0),
            ack_handlers: Mutex::new(HashMap::new()),
            suspicions: Mutex::new(HashMap::new()),
            local_tags: Mutex::new(Vec::new()),
            leaving: AtomicBool::new(false),
            transport,
            keyring,
            delegate,
            metrics,
            shutdown_rx,
            shutdown_tx,
            receivers: Mutex::new(Some(Receivers {
                packet_rx,
                stream_rx,
            })),
        }))
    }

    /// Spawns the long-lived tasks: packet dispatch, stream handling,
    /// the prober, the gossiper and the push/pull syncer.
    pub fn start(self: &Arc<Self>) {
        let Receivers {
            packet_rx,
            stream_rx,
        } = self
            .receivers
            .lock()
            .take()
            .expect("membership tasks already started");

        *self.local_tags.lock() = self.delegate.node_meta(self.config.mtu / 2);
        self.spawn_receive_loop(packet_rx);
        self.spawn_stream_loop(stream_rx);
        self.spawn_probe_loop();
        self.spawn_gossip_loop();
        self.spawn_push_pull_loop();

        // Announce ourselves; the delegate observes the local join like
        // any other.
        self.broadcast_local_alive();
        self.delegate.notify_join(&self.local_node_state());
    }

    fn spawn_receive_loop(self: &Arc<Self>, mut packet_rx: mpsc::Receiver<Packet>) {
        let swim = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    packet = packet_rx.recv() => {
                        match packet {
                            Some(packet) => swim.handle_packet(packet),
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Packet dispatcher shutting down.");
                        // Drain outstanding probe waiters so they fail
                        // fast instead of timing out one by one.
                        swim.ack_handlers.lock().clear();
                        break;
                    }
                }
            }
        });
    }

    fn handle_packet(self: &Arc<Self>, packet: Packet) {
        let bytes = match self.unseal(packet.bytes) {
            Some(bytes) => bytes,
            None => return,
        };
        self.handle_message(bytes, packet.from, packet.arrival);
    }

    /// Routes one decoded (and decrypted) message. Messages the
    /// membership layer does not own are forwarded to the delegate with
    /// their type byte intact.
    pub(crate) fn handle_message(self: &Arc<Self>, bytes: Vec<u8>, from: SocketAddr, arrival: Instant) {
        let message_type = match codec::message_type(&bytes) {
            Ok(message_type) => message_type,
            Err(_) => {
                Metrics::incr(&self.metrics.protocol_errors);
                debug!("Dropping packet with unknown message type from {}.", from);
                return;
            }
        };

        let result: Result<()> = match message_type {
            MessageType::Ping => codec::decode(&bytes).map(|ping| self.handle_ping(ping, from)),
            MessageType::IndirectPing => {
                codec::decode(&bytes).map(|ind| self.handle_indirect_ping(ind, from))
            }
            MessageType::Ack => codec::decode(&bytes).map(|ack| self.handle_ack(ack, arrival)),
            MessageType::Nack => Ok(()),
            MessageType::Suspect => codec::decode(&bytes).map(|s| self.suspect_node(s)),
            MessageType::Alive => codec::decode(&bytes).map(|a| self.alive_node(a)),
            MessageType::Dead => codec::decode(&bytes).map(|d| self.dead_node(d)),
            MessageType::Compound => codec::decode_compound(&bytes).map(|parts| {
                for part in parts {
                    self.handle_message(part, from, arrival);
                }
            }),
            MessageType::PushPull => Err(Error::Protocol(
                "Push/pull received on the packet path".to_string(),
            )),
            MessageType::UserMsg => {
                self.delegate.notify_msg(from, bytes.get(1..).unwrap_or_default());
                Ok(())
            }
            _ => {
                self.delegate.notify_msg(from, &bytes);
                Ok(())
            }
        };

        if result.is_err() {
            Metrics::incr(&self.metrics.protocol_errors);
            debug!("Dropping malformed {:?} packet from {}.", message_type, from);
        }
    }

    /// Joins a cluster by running a push/pull against each given address;
    /// returns how many succeeded.
    pub async fn join(self: &Arc<Self>, addrs: &[SocketAddr]) -> usize {
        let mut joined = 0;
        for addr in addrs {
            match self.push_pull_node(*addr, true).await {
                Ok(()) => {
                    joined += 1;
                }
                Err(err) => {
                    debug!("Failed to join through {}: {}", addr, err);
                }
            }
        }
        if joined > 0 {
            // Make sure the cluster learns about us right away.
            self.broadcast_local_alive();
        }
        joined
    }

    /// Broadcasts a graceful departure and waits (up to `timeout`) for
    /// the broadcast to finish disseminating.
    pub async fn leave(self: &Arc<Self>, timeout: Duration) {
        if self.leaving.swap(true, Ordering::SeqCst) {
            return;
        }
        let ltime = self.clock.increment();
        let dead = codec::Dead {
            ltime,
            incarnation: self.incarnation.load(Ordering::SeqCst),
            node: self.config.node_name.clone(),
            from: self.config.node_name.clone(),
        };
        if self.alive_peers() == 0 {
            return;
        }
        if let Ok(bytes) = codec::encode(MessageType::Dead, &dead) {
            let (tx, rx) = oneshot::channel();
            let key = self.config.node_name.clone();
            self.broadcasts.queue_broadcast(
                key.clone(),
                ltime,
                bytes,
                |other| other.key == key,
                Some(tx),
            );
            tokio::time::timeout(timeout, rx).await.ok();
        }
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send(true).ok();
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Best-effort user message to a named peer: UDP when it fits one
    /// packet, a one-shot TCP stream otherwise.
    pub fn send_user_msg(self: &Arc<Self>, to: &str, msg: &[u8]) -> Result<()> {
        let node = self
            .node_state(to)
            .ok_or_else(|| Error::State(format!("Unknown node '{}'", to)))?;
        let mut bytes = Vec::with_capacity(msg.len() + 1);
        bytes.push(MessageType::UserMsg as u8);
        bytes.extend_from_slice(msg);

        if bytes.len() <= self.packet_budget() {
            self.send_message(node.socket_addr(), bytes);
        } else {
            let swim = self.clone();
            let addr = node.socket_addr();
            let sealed = self.seal(bytes);
            tokio::spawn(async move {
                if let Err(err) = swim.transport.send_reliable(addr, sealed).await {
                    debug!("Failed to send user message to {}: {}", addr, err);
                }
            });
        }
        Ok(())
    }

    /// Sends an already-encoded message, sealing it if encryption is
    /// enabled.
    pub(crate) fn send_message(&self, addr: SocketAddr, bytes: Vec<u8>) {
        self.transport.send_packet(addr, self.seal(bytes));
    }

    /// Direct datagram to an arbitrary peer address, used by the query
    /// engine for responses and relays.
    pub fn send_to(&self, addr: SocketAddr, bytes: Vec<u8>) {
        self.send_message(addr, bytes);
    }

    pub(crate) fn seal(&self, bytes: Vec<u8>) -> Vec<u8> {
        match &self.keyring {
            Some(keyring) => keyring.encrypt(&bytes).unwrap_or(bytes),
            None => bytes,
        }
    }

    pub(crate) fn unseal(&self, bytes: Vec<u8>) -> Option<Vec<u8>> {
        match &self.keyring {
            Some(keyring) => match keyring.decrypt(&bytes) {
                Ok(bytes) => Some(bytes),
                Err(_) => {
                    Metrics::incr(&self.metrics.decrypt_errors);
                    None
                }
            },
            None => Some(bytes),
        }
    }

    /// Bytes available for broadcasts in a single gossip packet.
    pub(crate) fn packet_budget(&self) -> usize {
        let overhead = if self.keyring.is_some() {
            security::ENCRYPT_OVERHEAD
        } else {
            0
        };
        self.config.mtu.saturating_sub(overhead + 16)
    }

    pub fn keyring(&self) -> Option<&Arc<Keyring>> {
        self.keyring.as_ref()
    }

    pub fn encryption_enabled(&self) -> bool {
        self.keyring.is_some()
    }

    /// Replaces the local tag map and re-broadcasts our alive state so
    /// the change gossips out.
    pub fn update_tags(self: &Arc<Self>, tags: Vec<u8>) {
        *self.local_tags.lock() = tags;
        self.incarnation.fetch_add(1, Ordering::SeqCst);
        self.broadcast_local_alive();
    }

    pub fn local_tags(&self) -> Vec<u8> {
        self.local_tags.lock().clone()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.read().len() + 1
    }
}
