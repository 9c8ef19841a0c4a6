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

pub mod coalesce;
pub mod coordinate;
pub mod delegate;
pub mod event;
pub mod internal;
pub mod key_manager;
pub mod member;
pub mod query;
pub mod snapshot;

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde_bytes::ByteBuf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    lamport::LamportClock,
    metrics::Metrics,
    swim::{
        broadcast::BroadcastQueue,
        codec::{
            self, Alive, ConflictResponseMsg, LeaveIntent, MessageType, UserEventMsg,
        },
        security::Keyring,
        state::NodeState,
        Swim, SwimConfig, IPC_CHANNEL_BUFFER,
    },
};

use self::{
    coalesce::coalesced_events,
    coordinate::{Coordinate, CoordinateClient, CoordinateConfig},
    delegate::{ClusterDelegate, UserStateSnapshot},
    event::{Event, EventFilter, MemberEventKind, RecentEvents, UserEvent},
    internal::spawn_internal_query_handler,
    member::{Member, MemberManager, MemberStatus},
    query::{QueryCore, QueryEvent},
    snapshot::{SnapEvent, Snapshotter},
};

/// Reserved prefix for queries handled by the engine itself.
pub const INTERNAL_QUERY_PREFIX: &str = "_serf_";

const EVENT_CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Alive,
    Leaving,
    Left,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub tags: HashMap<String, String>,
    pub event_buffer: usize,
    pub query_buffer: usize,
    pub coalesce_period: Duration,
    pub quiescent_period: Duration,
    pub reap_interval: Duration,
    pub reconnect_timeout: Duration,
    pub tombstone_timeout: Duration,
    pub query_timeout_mult: u32,
    pub query_response_size_limit: usize,
    pub query_size_limit: usize,
    pub user_event_size_limit: usize,
    pub broadcast_timeout: Duration,
    pub snapshot_path: Option<PathBuf>,
    pub rejoin_after_leave: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            tags: HashMap::new(),
            event_buffer: 512,
            query_buffer: 512,
            coalesce_period: Duration::from_secs(3),
            quiescent_period: Duration::from_secs(2),
            reap_interval: Duration::from_secs(15),
            reconnect_timeout: Duration::from_secs(24 * 60 * 60),
            tombstone_timeout: Duration::from_secs(24 * 60 * 60),
            query_timeout_mult: 16,
            query_response_size_limit: 1024,
            query_size_limit: 1024,
            user_event_size_limit: 512,
            broadcast_timeout: Duration::from_secs(5),
            snapshot_path: None,
            rejoin_after_leave: false,
        }
    }
}

struct EventSubscription {
    id: u64,
    filters: Vec<EventFilter>,
    tx: mpsc::Sender<Event>,
}

/// The upper tier: stable member lifecycle, Lamport-ordered events and
/// queries, keyring rotation, coordinates and the recovery snapshot,
/// layered over the SWIM membership through its delegate.
pub struct Cluster {
    pub config: ClusterConfig,
    pub swim: Arc<Swim>,
    pub event_clock: Arc<LamportClock>,
    pub query_clock: Arc<LamportClock>,

    pub(crate) members: MemberManager,
    pub(crate) broadcasts: BroadcastQueue,
    pub(crate) event_memory: Mutex<RecentEvents>,
    pub(crate) query_core: Mutex<QueryCore>,
    pub(crate) query_id: AtomicU32,
    pub(crate) internal_tx: mpsc::Sender<Arc<QueryEvent>>,
    pub(crate) snapshot_tx: Option<mpsc::Sender<SnapEvent>>,
    pub(crate) coord_client: CoordinateClient,
    pub(crate) peer_coords: RwLock<HashMap<String, Coordinate>>,
    pub(crate) metrics: Arc<Metrics>,

    subscriptions: Mutex<Vec<EventSubscription>>,
    next_subscription_id: AtomicU64,
    state: Mutex<ClusterState>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Cluster {
    /// Replays the snapshot, brings up the membership layer and spawns
    /// every long-lived task of the upper tier.
    pub async fn start(
        config: ClusterConfig,
        swim_config: SwimConfig,
        keyring: Option<Arc<Keyring>>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Cluster>> {
        let replayed = match &config.snapshot_path {
            Some(path) => snapshot::replay(path, config.rejoin_after_leave)?,
            None => Default::default(),
        };

        let event_clock = Arc::new(LamportClock::new(replayed.event_clock));
        let query_clock = Arc::new(LamportClock::new(replayed.query_clock));

        let delegate = ClusterDelegate::new();
        let swim = Swim::new(swim_config, keyring, delegate.clone(), metrics.clone()).await?;
        if replayed.clock > 0 {
            swim.clock.witness(replayed.clock);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let snapshot_tx = match &config.snapshot_path {
            Some(path) => Some(
                Snapshotter::start(
                    path.clone(),
                    &replayed,
                    swim.clone(),
                    event_clock.clone(),
                    query_clock.clone(),
                    metrics.clone(),
                    shutdown_rx.clone(),
                )
                .await?,
            ),
            None => None,
        };

        let (internal_tx, internal_rx) = mpsc::channel(IPC_CHANNEL_BUFFER);
        let cluster = Arc::new(Cluster {
            event_memory: Mutex::new(RecentEvents::new(config.event_buffer)),
            query_core: Mutex::new(QueryCore::new(config.query_buffer)),
            broadcasts: BroadcastQueue::new(swim.config.retransmit_mult),
            config,
            swim,
            event_clock,
            query_clock,
            members: MemberManager::default(),
            query_id: AtomicU32::new(0),
            internal_tx,
            snapshot_tx,
            coord_client: CoordinateClient::new(CoordinateConfig::default()),
            peer_coords: RwLock::new(HashMap::new()),
            metrics,
            subscriptions: Mutex::new(Vec::new()),
            next_subscription_id: AtomicU64::new(1),
            state: Mutex::new(ClusterState::Alive),
            shutdown_rx,
            shutdown_tx,
        });
        delegate.init(&cluster);

        spawn_internal_query_handler(cluster.clone(), internal_rx);
        cluster.spawn_reaper();
        cluster.swim.start();

        // Try to pick the cluster back up where the snapshot left it.
        if !replayed.alive_nodes.is_empty() {
            let cluster_ = cluster.clone();
            let addrs = replayed
                .alive_nodes
                .iter()
                .filter(|(name, _)| name != &cluster.swim.config.node_name)
                .map(|(_, addr)| *addr)
                .collect::<Vec<_>>();
            tokio::spawn(async move {
                if addrs.is_empty() {
                    return;
                }
                let joined = cluster_.swim.join(&addrs).await;
                info!(
                    "Rejoined {} of {} previously known nodes.",
                    joined,
                    addrs.len()
                );
            });
        }

        Ok(cluster)
    }

    pub fn state(&self) -> ClusterState {
        *self.state.lock()
    }

    /// Local node as a member record, with the lifecycle state overlaid.
    pub fn local_member(&self) -> Member {
        let node = self.swim.local_node_state();
        let status = match self.state() {
            ClusterState::Alive => MemberStatus::Alive,
            ClusterState::Leaving => MemberStatus::Leaving,
            ClusterState::Left | ClusterState::Shutdown => MemberStatus::Left,
        };
        Member {
            name: node.name,
            addr: node.addr,
            port: node.port,
            tags: codec::decode_tags(&node.tags),
            status,
            incarnation: node.incarnation,
            status_ltime: node.ltime,
            vsn: node.vsn,
        }
    }

    pub fn members(&self) -> Vec<Member> {
        let local_name = &self.swim.config.node_name;
        let mut members = self.members.list();
        let mut found_local = false;
        for member in members.iter_mut() {
            if &member.name == local_name {
                *member = self.local_member();
                found_local = true;
            }
        }
        if !found_local {
            members.push(self.local_member());
        }
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Joins the mesh through any of the given peers; resolves names via
    /// the usual lookup rules and returns the number of peers contacted.
    pub async fn join(self: &Arc<Self>, addrs: &[SocketAddr]) -> Result<usize> {
        match self.state() {
            ClusterState::Alive | ClusterState::Leaving => (),
            _ => {
                return Err(Error::State(
                    "Cannot join after leaving the cluster".to_string(),
                ));
            }
        }
        Ok(self.swim.join(addrs).await)
    }

    /// Graceful departure: records the intent in the snapshot, gossips a
    /// leave intent, then broadcasts the departure and waits for it to
    /// finish disseminating.
    pub async fn leave(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ClusterState::Leaving | ClusterState::Left => return Ok(()),
                ClusterState::Shutdown => {
                    return Err(Error::State(
                        "Cannot leave after shutdown".to_string(),
                    ));
                }
                ClusterState::Alive => *state = ClusterState::Leaving,
            }
        }
        info!("Leaving the cluster.");

        if let Some(tx) = &self.snapshot_tx {
            tx.send(SnapEvent::Leave).await.ok();
        }

        let ltime = self.swim.clock.increment();
        let intent = LeaveIntent {
            ltime,
            node: self.swim.config.node_name.clone(),
        };
        if let Ok(bytes) = codec::encode(MessageType::Leave, &intent) {
            let key = format!("leave-intent:{}", intent.node);
            let queue_key = key.clone();
            self.broadcasts.queue_broadcast(
                key,
                ltime,
                bytes,
                |other| other.key == queue_key,
                None,
            );
        }

        self.swim.leave(self.config.broadcast_timeout).await;
        *self.state.lock() = ClusterState::Left;
        Ok(())
    }

    /// Marks a node Failed immediately and broadcasts the transition.
    pub fn force_leave(self: &Arc<Self>, name: &str) -> Result<()> {
        let node = self
            .swim
            .node_state(name)
            .ok_or_else(|| Error::State(format!("Unknown node '{}'", name)))?;
        info!("Force-leaving node '{}'.", name);
        self.swim.dead_node(codec::Dead {
            ltime: self.swim.clock.increment(),
            incarnation: node.incarnation,
            node: name.to_string(),
            from: self.swim.config.node_name.clone(),
        });
        Ok(())
    }

    /// Publishes a user event to the mesh.
    pub fn user_event(
        self: &Arc<Self>,
        name: impl Into<String>,
        payload: Vec<u8>,
        coalesce: bool,
    ) -> Result<()> {
        let name = name.into();
        if name.len() + payload.len() > self.config.user_event_size_limit {
            return Err(Error::State(format!(
                "User event exceeds the {} byte limit",
                self.config.user_event_size_limit
            )));
        }
        let msg = UserEventMsg {
            ltime: self.event_clock.increment(),
            name,
            payload: ByteBuf::from(payload),
            cc: coalesce,
        };
        Metrics::incr(&self.metrics.events_sent);
        self.handle_user_event_msg(msg);
        Ok(())
    }

    /// Applies a user event received from the mesh (or published
    /// locally): witness, staleness and duplicate checks, re-broadcast,
    /// then delivery to subscribers.
    pub(crate) fn handle_user_event_msg(&self, msg: UserEventMsg) -> bool {
        self.event_clock.witness(msg.ltime);

        let mut memory = self.event_memory.lock();
        let min_time = self
            .event_clock
            .time()
            .saturating_sub(memory.capacity() as u64);
        if msg.ltime < min_time {
            Metrics::incr(&self.metrics.events_stale);
            return false;
        }
        if !memory.witness(msg.ltime, &msg.name, &msg.payload, msg.cc) {
            return false;
        }
        drop(memory);
        Metrics::incr(&self.metrics.events_received);

        if let Ok(bytes) = codec::encode(MessageType::UserEvent, &msg) {
            let (key, ltime, cc) = (
                format!("user-event:{}", msg.name),
                msg.ltime,
                msg.cc,
            );
            let queue_key = key.clone();
            self.broadcasts.queue_broadcast(
                key,
                ltime,
                bytes,
                // Coalesced events supersede older queued versions with
                // the same name; plain events always coexist.
                move |other| cc && other.key == queue_key && other.ltime < ltime,
                None,
            );
        }

        self.dispatch(Event::User(UserEvent {
            ltime: msg.ltime,
            name: msg.name,
            payload: msg.payload.into_vec(),
            coalesce: msg.cc,
        }));
        true
    }

    pub(crate) fn handle_leave_intent_msg(&self, intent: LeaveIntent) {
        self.swim.clock.witness(intent.ltime);
        if self.members.handle_leave_intent(&intent.node, intent.ltime) {
            debug!("Node '{}' intends to leave.", intent.node);
            if let Ok(bytes) = codec::encode(MessageType::Leave, &intent) {
                let key = format!("leave-intent:{}", intent.node);
                let queue_key = key.clone();
                let ltime = intent.ltime;
                self.broadcasts.queue_broadcast(
                    key,
                    ltime,
                    bytes,
                    move |other| other.key == queue_key && other.ltime <= ltime,
                    None,
                );
            }
        }
    }

    /// Merges or deletes tags on the local node and gossips the change.
    pub fn set_tags(
        self: &Arc<Self>,
        merge: HashMap<String, String>,
        delete: &[String],
    ) -> Result<()> {
        let mut tags = codec::decode_tags(&self.swim.local_tags());
        for (key, value) in merge {
            tags.insert(key, value);
        }
        for key in delete {
            tags.remove(key);
        }
        let encoded = codec::encode_tags(&tags)?;
        self.swim.update_tags(encoded);

        // Our own alive broadcast does not come back to us, so update
        // the member table and subscribers directly.
        let local = self.swim.local_node_state();
        if let Some(member) = self.members.handle_update(&local) {
            self.dispatch(Event::Member(MemberEventKind::Update, vec![member]));
        }
        Ok(())
    }

    // -- Membership callbacks (via the delegate) ---------------------------

    pub(crate) fn handle_node_join(&self, node: &NodeState) {
        if let Some(member) = self.members.handle_join(node) {
            if let Some(tx) = &self.snapshot_tx {
                send_snapshot(
                    tx,
                    SnapEvent::Alive(member.name.clone(), member.socket_addr()),
                );
            }
            self.dispatch(Event::Member(MemberEventKind::Join, vec![member]));
        }
    }

    pub(crate) fn handle_node_leave(&self, node: &NodeState) {
        if let Some(member) = self.members.handle_leave(node) {
            let kind = match member.status {
                MemberStatus::Left => MemberEventKind::Leave,
                _ => MemberEventKind::Failed,
            };
            if let Some(tx) = &self.snapshot_tx {
                send_snapshot(tx, SnapEvent::NotAlive(member.name.clone()));
            }
            self.dispatch(Event::Member(kind, vec![member]));
        }
    }

    pub(crate) fn handle_node_update(&self, node: &NodeState) {
        if let Some(member) = self.members.handle_update(node) {
            self.dispatch(Event::Member(MemberEventKind::Update, vec![member]));
        }
    }

    /// Another node claims our name: put it to a cluster-wide vote and
    /// shut down if the majority sides with the other claimant.
    pub(crate) fn handle_node_conflict(self: &Arc<Self>, existing: &NodeState, other: &Alive) {
        if existing.name != self.swim.config.node_name {
            return;
        }
        warn!(
            "Resolving name conflict: {}:{} also claims '{}'.",
            other.addr, other.port, existing.name
        );

        let cluster = self.clone();
        let name = existing.name.clone();
        tokio::spawn(async move {
            let handle = cluster.query(
                format!("{}conflict", INTERNAL_QUERY_PREFIX),
                name.clone().into_bytes(),
                Default::default(),
            );
            let mut handle = match handle {
                Ok(handle) => handle,
                Err(err) => {
                    error!("Failed to start conflict resolution: {}", err);
                    return;
                }
            };

            let (mut votes_for_us, mut votes_total) = (0usize, 0usize);
            while let Some(response) = handle.response_rx.recv().await {
                if let Ok(MessageType::ConflictResponse) = codec::message_type(&response.payload)
                {
                    if let Ok(view) = codec::decode::<ConflictResponseMsg>(&response.payload) {
                        votes_total += 1;
                        if view.addr == cluster.swim.advertise.ip()
                            && view.port == cluster.swim.advertise.port()
                        {
                            votes_for_us += 1;
                        }
                    }
                }
            }

            if votes_total > 0 && votes_for_us * 2 < votes_total {
                error!(
                    "Lost the name conflict vote ({} of {}), shutting down.",
                    votes_for_us, votes_total
                );
                cluster.shutdown();
            } else {
                info!(
                    "Won the name conflict vote ({} of {}).",
                    votes_for_us, votes_total
                );
            }
        });
    }

    pub(crate) fn handle_ping_complete(&self, node: &NodeState, rtt: Duration, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        if let Ok(remote) = rmp_serde::from_slice::<Coordinate>(payload) {
            self.coord_client.update(&remote, rtt);
            self.peer_coords.write().insert(node.name.clone(), remote);
        }
    }

    // -- Push/pull user state ---------------------------------------------

    pub(crate) fn encode_user_state(&self) -> Vec<u8> {
        let events = self
            .event_memory
            .lock()
            .snapshot()
            .into_iter()
            .map(|(ltime, name, payload, cc)| UserEventMsg {
                ltime,
                name,
                payload: ByteBuf::from(payload),
                cc,
            })
            .collect();
        rmp_serde::to_vec(&UserStateSnapshot {
            event_ltime: self.event_clock.time(),
            query_ltime: self.query_clock.time(),
            events,
        })
        .unwrap_or_default()
    }

    pub(crate) fn merge_user_state(&self, buf: &[u8]) {
        let remote: UserStateSnapshot = match rmp_serde::from_slice(buf) {
            Ok(remote) => remote,
            Err(err) => {
                debug!("Failed to decode push/pull user state: {}", err);
                Metrics::incr(&self.metrics.protocol_errors);
                return;
            }
        };
        self.event_clock.witness(remote.event_ltime);
        self.query_clock.witness(remote.query_ltime);
        for event in remote.events {
            self.handle_user_event_msg(event);
        }
    }

    // -- Subscriptions -----------------------------------------------------

    /// Raw event stream matching the given filters.
    pub fn subscribe(&self, filters: Vec<EventFilter>) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().push(EventSubscription {
            id,
            filters,
            tx,
        });
        (id, rx)
    }

    /// Event stream with member and coalescable user events collapsed.
    pub fn subscribe_coalesced(&self, filters: Vec<EventFilter>) -> (u64, mpsc::Receiver<Event>) {
        let (id, rx) = self.subscribe(filters);
        (
            id,
            coalesced_events(rx, self.config.coalesce_period, self.config.quiescent_period),
        )
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscriptions.lock().retain(|sub| sub.id != id);
    }

    /// Fans an event out to the snapshotter and every matching
    /// subscriber. Subscriber channels never block dispatch; on
    /// overflow the newest event is dropped and counted.
    pub(crate) fn dispatch(&self, event: Event) {
        if let Some(tx) = &self.snapshot_tx {
            if let Event::Member(kind, members) = &event {
                for member in members {
                    match kind {
                        MemberEventKind::Join => send_snapshot(
                            tx,
                            SnapEvent::Alive(member.name.clone(), member.socket_addr()),
                        ),
                        MemberEventKind::Leave | MemberEventKind::Failed => {
                            send_snapshot(tx, SnapEvent::NotAlive(member.name.clone()));
                        }
                        MemberEventKind::Update | MemberEventKind::Reap => (),
                    }
                }
            }
        }

        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|sub| !sub.tx.is_closed());
        for sub in subscriptions.iter() {
            if sub.filters.iter().any(|filter| filter.matches(&event)) {
                if sub.tx.try_send(event.clone()).is_err() {
                    Metrics::incr(&self.metrics.events_dropped);
                }
            }
        }
    }

    // -- Housekeeping ------------------------------------------------------

    fn spawn_reaper(self: &Arc<Self>) {
        let cluster = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cluster.config.reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let reaped = cluster.members.reap(
                            cluster.config.reconnect_timeout,
                            cluster.config.tombstone_timeout,
                        );
                        cluster.swim.reap_nodes(
                            cluster.config.reconnect_timeout,
                            cluster.config.tombstone_timeout,
                        );
                        if !reaped.is_empty() {
                            cluster.dispatch(Event::Member(MemberEventKind::Reap, reaped));
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Member reaper shutting down.");
                        break;
                    }
                }
            }
        });
    }

    // -- Coordinates and stats ---------------------------------------------

    /// This node's estimate of a peer's network coordinate.
    pub fn get_coordinate(&self, node: &str) -> Option<Coordinate> {
        if node == self.swim.config.node_name {
            Some(self.coord_client.get())
        } else {
            self.peer_coords.read().get(node).cloned()
        }
    }

    pub fn stats(&self) -> HashMap<String, HashMap<String, String>> {
        let mut stats = self.metrics.stats();
        let members = self.members();
        let alive = members
            .iter()
            .filter(|m| m.status == MemberStatus::Alive)
            .count();
        stats.insert(
            "agent".to_string(),
            HashMap::from_iter([
                ("name".to_string(), self.swim.config.node_name.clone()),
                ("members".to_string(), members.len().to_string()),
                ("alive_members".to_string(), alive.to_string()),
                ("member_time".to_string(), self.swim.clock.time().to_string()),
                ("event_time".to_string(), self.event_clock.time().to_string()),
                ("query_time".to_string(), self.query_clock.time().to_string()),
                (
                    "encrypted".to_string(),
                    self.swim.encryption_enabled().to_string(),
                ),
            ]),
        );
        stats
    }

    /// Stops every task of both tiers. Does not broadcast a departure;
    /// call [`Cluster::leave`] first for a graceful exit.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if *state == ClusterState::Shutdown {
            return;
        }
        *state = ClusterState::Shutdown;
        drop(state);
        info!("Shutting down.");
        self.shutdown_tx.send(true).ok();
        self.swim.shutdown();
    }
}

/// Forwards an event to the snapshotter. This is the one path that may
/// apply backpressure; when the queue is momentarily full the send is
/// completed from a task instead of being dropped.
fn send_snapshot(tx: &mpsc::Sender<SnapEvent>, event: SnapEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        let tx = tx.clone();
        tokio::spawn(async move {
            tx.send(event).await.ok();
        });
    }
}
