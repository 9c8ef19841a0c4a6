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

use std::{collections::HashMap, sync::Arc};

use serde_bytes::ByteBuf;

use crate::{
    error::{Error, Result},
    swim::codec::{self, KeyRequestMsg, KeyResponseMsg, MessageType},
};

use super::{query::QueryParams, Cluster, INTERNAL_QUERY_PREFIX};

/// Aggregated outcome of a cluster-wide keyring operation.
#[derive(Debug, Default)]
pub struct KeyResponse {
    /// Per-node error or status messages.
    pub messages: HashMap<String, String>,
    pub num_nodes: usize,
    pub num_resp: usize,
    pub num_err: usize,
    /// Installed keys (base64) and how many nodes reported each.
    pub keys: HashMap<String, usize>,
    /// Primary keys (base64) and how many nodes reported each.
    pub primary_keys: HashMap<String, usize>,
}

impl Cluster {
    /// Installs a new key on every node's keyring.
    pub async fn install_key(self: &Arc<Self>, key: &str) -> Result<KeyResponse> {
        self.key_query("install-key", Some(decode_key(key)?)).await
    }

    /// Changes the primary (encrypting) key cluster-wide.
    pub async fn use_key(self: &Arc<Self>, key: &str) -> Result<KeyResponse> {
        self.key_query("use-key", Some(decode_key(key)?)).await
    }

    /// Removes a non-primary key from every node's keyring.
    pub async fn remove_key(self: &Arc<Self>, key: &str) -> Result<KeyResponse> {
        self.key_query("remove-key", Some(decode_key(key)?)).await
    }

    /// Collects the keys installed across the cluster.
    pub async fn list_keys(self: &Arc<Self>) -> Result<KeyResponse> {
        self.key_query("list-keys", None).await
    }

    async fn key_query(self: &Arc<Self>, op: &str, key: Option<Vec<u8>>) -> Result<KeyResponse> {
        if !self.swim.encryption_enabled() {
            return Err(Error::State(
                "Encryption is not enabled on this node".to_string(),
            ));
        }

        let payload = match key {
            Some(key) => codec::encode(
                MessageType::KeyRequest,
                &KeyRequestMsg {
                    key: ByteBuf::from(key),
                },
            )?,
            None => Vec::new(),
        };

        let mut handle = self.query(
            format!("{}{}", INTERNAL_QUERY_PREFIX, op),
            payload,
            QueryParams::default(),
        )?;

        let mut response = KeyResponse {
            num_nodes: self.swim.num_nodes(),
            ..Default::default()
        };

        while let Some(node_response) = handle.response_rx.recv().await {
            response.num_resp += 1;
            let from = node_response.from;

            let parsed: Option<KeyResponseMsg> = match codec::message_type(&node_response.payload) {
                Ok(MessageType::KeyResponse) => codec::decode(&node_response.payload).ok(),
                _ => None,
            };
            match parsed {
                Some(parsed) => {
                    if !parsed.result {
                        response.num_err += 1;
                    }
                    if !parsed.message.is_empty() {
                        response.messages.insert(from, parsed.message);
                    }
                    for key in parsed.keys {
                        *response.keys.entry(key).or_insert(0) += 1;
                    }
                    if !parsed.primary_key.is_empty() {
                        *response
                            .primary_keys
                            .entry(parsed.primary_key)
                            .or_insert(0) += 1;
                    }
                }
                None => {
                    response.num_err += 1;
                    response
                        .messages
                        .insert(from, "unparseable key response".to_string());
                }
            }
        }

        Ok(response)
    }
}

fn decode_key(key: &str) -> Result<Vec<u8>> {
    base64::decode(key)
        .map_err(|err| Error::State(format!("Invalid base64 key material: {}", err)))
}
