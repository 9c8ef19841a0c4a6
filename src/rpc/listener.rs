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

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::{
    cluster::Cluster,
    error::{Error, Result},
    logger::LogBroadcaster,
    metrics::Metrics,
};

use super::{session::Session, RpcConfig};

/// Starts the RPC listener and returns the bound address. Each accepted
/// client runs as its own session task until disconnect or shutdown.
pub async fn spawn_rpc(
    cluster: Arc<Cluster>,
    logger: Arc<LogBroadcaster>,
    config: RpcConfig,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(config.bind_addr).await.map_err(|err| {
        Error::Configuration(format!(
            "Failed to bind RPC listener to {}: {}",
            config.bind_addr, err
        ))
    })?;
    let local_addr = listener.local_addr()?;
    info!("Starting RPC server at {}...", local_addr);

    let mut shutdown_rx = cluster.shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                stream = listener.accept() => {
                    match stream {
                        Ok((stream, peer)) => {
                            Metrics::incr(&cluster.metrics.rpc_sessions);
                            debug!("Accepted RPC connection from {}.", peer);
                            let session = Session::new(
                                cluster.clone(),
                                logger.clone(),
                                config.auth_key.clone(),
                                stream,
                                peer,
                            );
                            tokio::spawn(session.run());
                        }
                        Err(err) => {
                            error!("Failed to accept RPC connection: {}", err);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("RPC listener shutting down.");
                    break;
                }
            }
        }
    });

    Ok(local_addr)
}
