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
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use futures::SinkExt;
use ipnetwork::IpNetwork;
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{mpsc, watch},
    time,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error};

use crate::{
    error::{Error, Result},
    metrics::Metrics,
};

use super::IPC_CHANNEL_BUFFER;

const UDP_RECV_BUFFER: usize = 65535;
const MAX_STREAM_FRAME: usize = 10 * 1024 * 1024;

#[derive(Debug)]
pub struct Packet {
    pub from: SocketAddr,
    pub bytes: Vec<u8>,
    pub arrival: Instant,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bind_addr: SocketAddr,
    /// Source networks allowed to talk to us; packets from anywhere else
    /// are discarded before any decode or decrypt work.
    pub allowed_cidrs: Vec<IpNetwork>,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn is_allowed(&self, addr: &SocketAddr) -> bool {
        self.allowed_cidrs.is_empty()
            || self.allowed_cidrs.iter().any(|net| net.contains(addr.ip()))
    }
}

/// One UDP socket and one TCP listener sharing the bind address. Outbound
/// datagrams go through a queue drained by a writer task so callers never
/// block on socket I/O; inbound packets and streams are handed to the
/// membership layer over bounded channels that drop the newest entry when
/// full.
pub struct Transport {
    config: TransportConfig,
    socket: Arc<UdpSocket>,
    out_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    pub local_addr: SocketAddr,
    metrics: Arc<Metrics>,
}

impl Transport {
    pub async fn bind(
        config: TransportConfig,
        metrics: Arc<Metrics>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(Transport, mpsc::Receiver<Packet>, mpsc::Receiver<(TcpStream, SocketAddr)>)> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await.map_err(|err| {
            Error::Configuration(format!(
                "Failed to bind UDP socket on '{}': {}",
                config.bind_addr, err
            ))
        })?);
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|err| {
            Error::Configuration(format!(
                "Failed to bind TCP listener on '{}': {}",
                config.bind_addr, err
            ))
        })?;
        let local_addr = socket.local_addr()?;

        let (out_tx, mut out_rx) = mpsc::channel::<(SocketAddr, Vec<u8>)>(IPC_CHANNEL_BUFFER);
        let (packet_tx, packet_rx) = mpsc::channel(IPC_CHANNEL_BUFFER);
        let (stream_tx, stream_rx) = mpsc::channel(IPC_CHANNEL_BUFFER);

        // Datagram writer.
        let write_socket = socket.clone();
        let write_metrics = metrics.clone();
        tokio::spawn(async move {
            while let Some((addr, bytes)) = out_rx.recv().await {
                match write_socket.send_to(&bytes, &addr).await {
                    Ok(_) => {
                        Metrics::incr(&write_metrics.udp_sent);
                    }
                    Err(err) => {
                        // Best effort only; the failure detector handles
                        // unreachable peers.
                        debug!("Failed to send UDP packet to {}: {}", addr, err);
                    }
                }
            }
        });

        // Datagram reader.
        let read_socket = socket.clone();
        let read_metrics = metrics.clone();
        let read_config = config.clone();
        let mut read_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_RECV_BUFFER];
            loop {
                tokio::select! {
                    packet = read_socket.recv_from(&mut buf) => {
                        match packet {
                            Ok((size, from)) => {
                                if !read_config.is_allowed(&from) {
                                    Metrics::incr(&read_metrics.udp_rejected);
                                    continue;
                                }
                                Metrics::incr(&read_metrics.udp_received);
                                let packet = Packet {
                                    from,
                                    bytes: buf[..size].to_vec(),
                                    arrival: Instant::now(),
                                };
                                if packet_tx.try_send(packet).is_err() {
                                    read_metrics.udp_rejected.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            Err(err) => {
                                error!("Gossip listener ended, recv_from() failed: {}", err);
                                break;
                            }
                        }
                    },
                    _ = read_shutdown.changed() => {
                        debug!("Gossip listener shutting down.");
                        break;
                    }
                }
            }
        });

        // Stream acceptor.
        let accept_metrics = metrics.clone();
        let accept_config = config.clone();
        let mut accept_shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    stream = listener.accept() => {
                        match stream {
                            Ok((stream, from)) => {
                                if !accept_config.is_allowed(&from) {
                                    Metrics::incr(&accept_metrics.udp_rejected);
                                    continue;
                                }
                                Metrics::incr(&accept_metrics.tcp_accepted);
                                if stream_tx.try_send((stream, from)).is_err() {
                                    debug!("Dropped inbound stream from {}: queue full.", from);
                                }
                            }
                            Err(err) => {
                                error!("Failed to accept TCP connection: {}", err);
                            }
                        }
                    },
                    _ = accept_shutdown.changed() => {
                        debug!("Stream listener shutting down.");
                        break;
                    }
                }
            }
        });

        Ok((
            Transport {
                config,
                socket,
                out_tx,
                local_addr,
                metrics,
            },
            packet_rx,
            stream_rx,
        ))
    }

    /// Unreliable best-effort datagram write; fails silently on I/O
    /// errors and when the writer queue is full.
    pub fn send_packet(&self, addr: SocketAddr, bytes: Vec<u8>) {
        if self.out_tx.try_send((addr, bytes)).is_err() {
            debug!("Outbound packet queue full, dropping packet to {}.", addr);
        }
    }

    /// Opens a TCP connection, writes a single length-prefixed message
    /// and closes.
    pub async fn send_reliable(&self, addr: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        let stream = self.connect(addr).await?;
        let mut frames = stream_frames(stream);
        frames.send(bytes.into()).await?;
        frames.close().await.ok();
        Ok(())
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Connection to {} timed out", addr),
                ))
            })?
            .map_err(Error::Transport)?;
        Metrics::incr(&self.metrics.tcp_connects);
        Ok(stream)
    }

    pub fn local_socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

/// Length-prefixed framing (`u32` big-endian) for membership streams.
pub fn stream_frames(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_STREAM_FRAME)
        .new_framed(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_allow_list() {
        let config = TransportConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            allowed_cidrs: vec!["10.0.0.0/8".parse().unwrap(), "127.0.0.1/32".parse().unwrap()],
            connect_timeout: Duration::from_secs(10),
        };
        assert!(config.is_allowed(&"10.1.2.3:7946".parse().unwrap()));
        assert!(config.is_allowed(&"127.0.0.1:7946".parse().unwrap()));
        assert!(!config.is_allowed(&"192.168.1.1:7946".parse().unwrap()));

        // An empty list allows everything.
        let open = TransportConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            allowed_cidrs: Vec::new(),
            connect_timeout: Duration::from_secs(10),
        };
        assert!(open.is_allowed(&"192.168.1.1:7946".parse().unwrap()));
    }

    #[tokio::test]
    async fn stream_frame_round_trip() {
        use futures::StreamExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut frames = stream_frames(stream);
            frames.next().await.unwrap().unwrap()
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let mut frames = stream_frames(client);
        frames.send(b"push-pull".to_vec().into()).await.unwrap();
        assert_eq!(&server.await.unwrap()[..], b"push-pull");
    }
}
