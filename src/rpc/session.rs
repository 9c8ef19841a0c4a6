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

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use regex::Regex;
use serde_bytes::ByteBuf;
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    net::TcpStream,
    sync::Mutex,
    time,
};
use tracing::debug;

use crate::{
    cluster::{
        event::{Event, EventFilter},
        query::{QueryParams, QueryResponseHandle},
        Cluster,
    },
    error::{Error, Result},
    logger::LogBroadcaster,
    metrics::Metrics,
    swim::codec::QueryFilter,
};

use super::serialize::{write_frame, FrameReader};
use super::*;

/// Shared writable half of the session socket. A single lock serializes
/// every frame so streaming tasks and command replies cannot interleave
/// bytes.
type SessionWriter = Arc<Mutex<OwnedWriteHalf>>;

struct StreamHandle {
    task: tokio::task::JoinHandle<()>,
    subscription: Option<u64>,
}

/// One connected RPC client: a single-threaded reader driving the
/// command state machine, plus any number of streaming writer tasks.
pub(crate) struct Session {
    cluster: Arc<Cluster>,
    logger: Arc<LogBroadcaster>,
    auth_key: Option<String>,
    peer: SocketAddr,
    reader: FrameReader<OwnedReadHalf>,
    writer: SessionWriter,
    handshaked: bool,
    authenticated: bool,
    streams: HashMap<u64, StreamHandle>,
}

impl Session {
    pub(crate) fn new(
        cluster: Arc<Cluster>,
        logger: Arc<LogBroadcaster>,
        auth_key: Option<String>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        Session {
            cluster,
            logger,
            auth_key,
            peer,
            reader: FrameReader::new(read_half),
            writer: Arc::new(Mutex::new(write_half)),
            handshaked: false,
            authenticated: false,
            streams: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut shutdown_rx = self.cluster.shutdown_rx.clone();
        loop {
            tokio::select! {
                header = self.reader.read_value::<RequestHeader>() => {
                    match header {
                        Ok(Some(header)) => {
                            Metrics::incr(&self.cluster.metrics.rpc_requests);
                            if let Err(err) = self.handle_command(header).await {
                                // A malformed frame terminates only this
                                // session.
                                debug!("RPC session with {} failed: {}", self.peer, err);
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!("RPC session with {} closed.", self.peer);
                            break;
                        }
                        Err(err) => {
                            debug!("RPC session with {} failed: {}", self.peer, err);
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("RPC session with {} shutting down.", self.peer);
                    break;
                }
            }
        }

        for (_, stream) in self.streams.drain() {
            stream.task.abort();
            if let Some(id) = stream.subscription {
                self.cluster.unsubscribe(id);
            }
        }
    }

    /// Dispatches one command. Body decoding errors and transport
    /// failures bubble up and end the session; handler failures are
    /// reported in the response header and the session continues.
    async fn handle_command(&mut self, header: RequestHeader) -> Result<()> {
        let seq = header.seq;
        match header.command.as_str() {
            "handshake" => {
                let body: HandshakeRequest = self.body().await?;
                let error = if self.handshaked {
                    ERR_DUPLICATE_HANDSHAKE
                } else if body.version > MAX_RPC_VERSION {
                    ERR_INVALID_VERSION
                } else {
                    self.handshaked = true;
                    ""
                };
                self.respond_empty(seq, error).await
            }
            "auth" => {
                let body: AuthRequest = self.body().await?;
                let error = if !self.handshaked {
                    ERR_HANDSHAKE_REQUIRED
                } else if self.auth_key.as_deref() == Some(body.auth_key.as_str()) {
                    self.authenticated = true;
                    ""
                } else {
                    ERR_INVALID_AUTH
                };
                self.respond_empty(seq, error).await
            }
            "members" => {
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                let members = self
                    .cluster
                    .members()
                    .iter()
                    .map(RpcMember::from)
                    .collect();
                self.respond(seq, "", Some(&MembersResponse { members })).await
            }
            "members-filtered" => {
                let body: MembersFilteredRequest = self.body().await?;
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                match filter_members(&self.cluster, &body) {
                    Ok(members) => {
                        self.respond(seq, "", Some(&MembersResponse { members })).await
                    }
                    Err(err) => self.respond_empty(seq, &err.to_string()).await,
                }
            }
            "join" => {
                let body: JoinRequest = self.body().await?;
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                match resolve_addrs(&body.existing) {
                    Ok(addrs) => match self.cluster.join(&addrs).await {
                        Ok(num) => {
                            self.respond(seq, "", Some(&JoinResponse { num: num as u32 }))
                                .await
                        }
                        Err(err) => self.respond_empty(seq, &err.to_string()).await,
                    },
                    Err(err) => self.respond_empty(seq, &err.to_string()).await,
                }
            }
            "leave" => {
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                match self.cluster.leave().await {
                    Ok(()) => self.respond_empty(seq, "").await,
                    Err(err) => self.respond_empty(seq, &err.to_string()).await,
                }
            }
            "force-leave" => {
                let body: ForceLeaveRequest = self.body().await?;
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                match self.cluster.force_leave(&body.node) {
                    Ok(()) => self.respond_empty(seq, "").await,
                    Err(err) => self.respond_empty(seq, &err.to_string()).await,
                }
            }
            "event" => {
                let body: EventRequest = self.body().await?;
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                match self
                    .cluster
                    .user_event(body.name, body.payload.into_vec(), body.coalesce)
                {
                    Ok(()) => self.respond_empty(seq, "").await,
                    Err(err) => self.respond_empty(seq, &err.to_string()).await,
                }
            }
            "tags" => {
                let body: TagsRequest = self.body().await?;
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                match self.cluster.set_tags(body.tags, &body.delete_tags) {
                    Ok(()) => self.respond_empty(seq, "").await,
                    Err(err) => self.respond_empty(seq, &err.to_string()).await,
                }
            }
            "query" => {
                let body: QueryRequest = self.body().await?;
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                self.handle_query(seq, body).await
            }
            "stats" => {
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                let stats = self.cluster.stats();
                self.respond(seq, "", Some(&stats)).await
            }
            "get-coordinate" => {
                let body: CoordinateRequest = self.body().await?;
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                let response = match self.cluster.get_coordinate(&body.node) {
                    Some(coord) => CoordinateResponse { ok: true, coord },
                    None => CoordinateResponse {
                        ok: false,
                        coord: crate::cluster::coordinate::Coordinate::new(
                            &Default::default(),
                        ),
                    },
                };
                self.respond(seq, "", Some(&response)).await
            }
            "monitor" => {
                let body: MonitorRequest = self.body().await?;
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                self.handle_monitor(seq, body).await
            }
            "stream" => {
                let body: StreamRequest = self.body().await?;
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                self.handle_stream(seq, body).await
            }
            "stop" => {
                let body: StopRequest = self.body().await?;
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                if let Some(stream) = self.streams.remove(&body.stop) {
                    stream.task.abort();
                    if let Some(id) = stream.subscription {
                        self.cluster.unsubscribe(id);
                    }
                }
                self.respond_empty(seq, "").await
            }
            "install-key" | "use-key" | "remove-key" => {
                let body: KeyRequestBody = self.body().await?;
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                let result = match header.command.as_str() {
                    "install-key" => self.cluster.install_key(&body.key).await,
                    "use-key" => self.cluster.use_key(&body.key).await,
                    _ => self.cluster.remove_key(&body.key).await,
                };
                self.respond_keys(seq, result).await
            }
            "list-keys" => {
                if let Some(error) = self.access_error() {
                    return self.respond_empty(seq, error).await;
                }
                let result = self.cluster.list_keys().await;
                self.respond_keys(seq, result).await
            }
            _ => {
                Metrics::incr(&self.cluster.metrics.rpc_errors);
                self.respond_empty(seq, ERR_INVALID_COMMAND).await
            }
        }
    }

    /// Pre-command access checks, in order: handshake, then (when an
    /// auth key is configured) authentication.
    fn access_error(&self) -> Option<&'static str> {
        if !self.handshaked {
            Some(ERR_HANDSHAKE_REQUIRED)
        } else if self.auth_key.is_some() && !self.authenticated {
            Some(ERR_AUTH_REQUIRED)
        } else {
            None
        }
    }

    async fn body<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        match self.reader.read_value().await? {
            Some(body) => Ok(body),
            None => Err(Error::Protocol(
                "Connection closed before the request body".to_string(),
            )),
        }
    }

    async fn respond_empty(&self, seq: u64, error: &str) -> Result<()> {
        if !error.is_empty() {
            Metrics::incr(&self.cluster.metrics.rpc_errors);
        }
        self.respond::<()>(seq, error, None).await
    }

    async fn respond<B: serde::Serialize>(
        &self,
        seq: u64,
        error: &str,
        body: Option<&B>,
    ) -> Result<()> {
        let header = ResponseHeader {
            seq,
            error: error.to_string(),
        };
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &header, body).await
    }

    async fn respond_keys(
        &self,
        seq: u64,
        result: Result<crate::cluster::key_manager::KeyResponse>,
    ) -> Result<()> {
        match result {
            Ok(response) => {
                let body = KeyResponseBody {
                    messages: response.messages,
                    keys: response.keys,
                    primary_keys: response.primary_keys,
                    num_nodes: response.num_nodes,
                    num_resp: response.num_resp,
                    num_err: response.num_err,
                };
                self.respond(seq, "", Some(&body)).await
            }
            Err(err) => self.respond_empty(seq, &err.to_string()).await,
        }
    }

    /// Starts a query and streams `QueryRecord` frames under the query's
    /// own sequence number until the deadline, closing with one `done`.
    async fn handle_query(&mut self, seq: u64, body: QueryRequest) -> Result<()> {
        let mut filters = Vec::new();
        if let Some(name) = body.filter_name {
            filters.push(QueryFilter::NodeName(name));
        }
        for (tag, expr) in body.filter_tags {
            filters.push(QueryFilter::Tag(tag, expr));
        }
        let params = QueryParams {
            filters,
            request_ack: body.request_ack,
            relay_factor: body.relay_factor,
            timeout: (body.timeout_ms > 0)
                .then(|| std::time::Duration::from_millis(body.timeout_ms)),
        };

        let handle = match self.cluster.query(body.name, body.payload.into_vec(), params) {
            Ok(handle) => handle,
            Err(err) => {
                // The error form carries no body at all.
                return self.respond_empty(seq, &err.to_string()).await;
            }
        };
        self.respond(seq, "", Some(&QueryIdResponse { id: handle.id }))
            .await?;

        let writer = self.writer.clone();
        let task = tokio::spawn(stream_query(writer, seq, handle));
        self.streams.insert(
            seq,
            StreamHandle {
                task,
                subscription: None,
            },
        );
        Ok(())
    }

    async fn handle_monitor(&mut self, seq: u64, body: MonitorRequest) -> Result<()> {
        let level = match LogBroadcaster::parse_level(&body.log_level) {
            Some(level) => level,
            None => return self.respond_empty(seq, "Invalid log level").await,
        };
        if self.streams.contains_key(&seq) {
            return self.respond_empty(seq, ERR_DUPLICATE_STREAM).await;
        }
        self.respond_empty(seq, "").await?;

        let (backlog, mut rx) = self.logger.subscribe(level);
        let writer = self.writer.clone();
        let task = tokio::spawn(async move {
            for line in backlog {
                if send_record(&writer, seq, &line.line).await.is_err() {
                    return;
                }
            }
            while let Ok(line) = rx.recv().await {
                if line.level <= level {
                    if send_record(&writer, seq, &line.line).await.is_err() {
                        return;
                    }
                }
            }
        });
        self.streams.insert(
            seq,
            StreamHandle {
                task,
                subscription: None,
            },
        );
        Ok(())
    }

    async fn handle_stream(&mut self, seq: u64, body: StreamRequest) -> Result<()> {
        let filters = match EventFilter::parse(&body.event_type) {
            Some(filters) => filters,
            None => return self.respond_empty(seq, "Invalid event filter").await,
        };
        if self.streams.contains_key(&seq) {
            return self.respond_empty(seq, ERR_DUPLICATE_STREAM).await;
        }
        self.respond_empty(seq, "").await?;

        let (subscription, mut rx) = self.cluster.subscribe(filters);
        let writer = self.writer.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = match &event {
                    Event::Member(kind, members) => {
                        send_record(
                            &writer,
                            seq,
                            &StreamMemberEvent {
                                event: kind.as_str().to_string(),
                                members: members.iter().map(RpcMember::from).collect(),
                            },
                        )
                        .await
                    }
                    Event::User(user) => {
                        send_record(
                            &writer,
                            seq,
                            &StreamUserEvent {
                                event: "user".to_string(),
                                ltime: user.ltime,
                                name: user.name.clone(),
                                payload: ByteBuf::from(user.payload.clone()),
                                coalesce: user.coalesce,
                            },
                        )
                        .await
                    }
                    Event::Query(query) => {
                        send_record(
                            &writer,
                            seq,
                            &StreamQueryEvent {
                                event: "query".to_string(),
                                ltime: query.ltime,
                                name: query.name.clone(),
                                payload: query.payload.clone().into(),
                                id: query.id,
                                source: query.source_node.clone(),
                            },
                        )
                        .await
                    }
                };
                if result.is_err() {
                    return;
                }
            }
        });
        self.streams.insert(
            seq,
            StreamHandle {
                task,
                subscription: Some(subscription),
            },
        );
        Ok(())
    }
}

/// Forwards acks and responses to the client, then exactly one `done`
/// record once the deadline passes or the channels close.
async fn stream_query(writer: SessionWriter, seq: u64, mut handle: QueryResponseHandle) {
    let deadline = time::Instant::from_std(handle.deadline);
    let mut acks_open = true;
    let mut responses_open = true;

    while acks_open || responses_open {
        tokio::select! {
            ack = handle.ack_rx.recv(), if acks_open => {
                match ack {
                    Some(from) => {
                        let record = QueryRecord {
                            record_type: QUERY_RECORD_ACK.to_string(),
                            from,
                            payload: ByteBuf::new(),
                        };
                        if send_record(&writer, seq, &record).await.is_err() {
                            return;
                        }
                    }
                    None => acks_open = false,
                }
            }
            response = handle.response_rx.recv(), if responses_open => {
                match response {
                    Some(response) => {
                        let record = QueryRecord {
                            record_type: QUERY_RECORD_RESPONSE.to_string(),
                            from: response.from,
                            payload: ByteBuf::from(response.payload),
                        };
                        if send_record(&writer, seq, &record).await.is_err() {
                            return;
                        }
                    }
                    None => responses_open = false,
                }
            }
            _ = time::sleep_until(deadline) => break,
        }
    }

    let done = QueryRecord {
        record_type: QUERY_RECORD_DONE.to_string(),
        from: String::new(),
        payload: ByteBuf::new(),
    };
    send_record(&writer, seq, &done).await.ok();
}

async fn send_record<B: serde::Serialize>(
    writer: &SessionWriter,
    seq: u64,
    body: &B,
) -> Result<()> {
    let header = ResponseHeader {
        seq,
        error: String::new(),
    };
    let mut writer = writer.lock().await;
    write_frame(&mut *writer, &header, Some(body)).await
}

fn resolve_addrs(existing: &[String]) -> Result<Vec<SocketAddr>> {
    use std::net::ToSocketAddrs;
    let mut addrs = Vec::with_capacity(existing.len());
    for host in existing {
        let resolved = host
            .to_socket_addrs()
            .map_err(|err| Error::State(format!("Failed to resolve '{}': {}", host, err)))?
            .next()
            .ok_or_else(|| Error::State(format!("Failed to resolve '{}'", host)))?;
        addrs.push(resolved);
    }
    Ok(addrs)
}

fn filter_members(
    cluster: &Cluster,
    request: &MembersFilteredRequest,
) -> Result<Vec<RpcMember>> {
    let name_re = compile(request.name.as_deref())?;
    let status_re = compile(request.status.as_deref())?;
    let mut tag_res = Vec::with_capacity(request.tags.len());
    for (tag, expr) in &request.tags {
        tag_res.push((tag.clone(), compile(Some(expr))?.unwrap()));
    }

    Ok(cluster
        .members()
        .iter()
        .filter(|member| {
            name_re
                .as_ref()
                .map_or(true, |re| re.is_match(&member.name))
                && status_re
                    .as_ref()
                    .map_or(true, |re| re.is_match(member.status.as_str()))
                && tag_res.iter().all(|(tag, re)| {
                    member
                        .tags
                        .get(tag)
                        .map_or(false, |value| re.is_match(value))
                })
        })
        .map(RpcMember::from)
        .collect())
}

fn compile(expr: Option<&str>) -> Result<Option<Regex>> {
    match expr {
        Some(expr) => Regex::new(&format!("^(?:{})$", expr))
            .map(Some)
            .map_err(|err| Error::State(format!("Invalid filter '{}': {}", expr, err))),
        None => Ok(None),
    }
}
