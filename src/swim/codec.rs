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

use std::net::IpAddr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{
    error::{Error, Result},
    lamport::LamportTime,
};

/// Every packet starts with a one-byte message type followed by a
/// MsgPack payload with positional field keys. Types below `Leave` are
/// consumed by the membership layer itself; the rest ride as opaque user
/// messages and are routed to the delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    IndirectPing = 1,
    Ack = 2,
    Nack = 3,
    Suspect = 4,
    Alive = 5,
    Dead = 6,
    PushPull = 7,
    Compound = 8,
    UserMsg = 9,

    Leave = 10,
    UserEvent = 11,
    UserEventBatch = 12,
    Query = 13,
    QueryResponse = 14,
    Relay = 15,
    KeyRequest = 16,
    KeyResponse = 17,
    ConflictResponse = 18,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageType::Ping),
            1 => Some(MessageType::IndirectPing),
            2 => Some(MessageType::Ack),
            3 => Some(MessageType::Nack),
            4 => Some(MessageType::Suspect),
            5 => Some(MessageType::Alive),
            6 => Some(MessageType::Dead),
            7 => Some(MessageType::PushPull),
            8 => Some(MessageType::Compound),
            9 => Some(MessageType::UserMsg),
            10 => Some(MessageType::Leave),
            11 => Some(MessageType::UserEvent),
            12 => Some(MessageType::UserEventBatch),
            13 => Some(MessageType::Query),
            14 => Some(MessageType::QueryResponse),
            15 => Some(MessageType::Relay),
            16 => Some(MessageType::KeyRequest),
            17 => Some(MessageType::KeyResponse),
            18 => Some(MessageType::ConflictResponse),
            _ => None,
        }
    }
}

pub fn encode<T: Serialize>(message_type: MessageType, message: &T) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(message)?;
    let mut bytes = Vec::with_capacity(payload.len() + 1);
    bytes.push(message_type as u8);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes.get(1..).unwrap_or_default()).map_err(Into::into)
}

pub fn message_type(bytes: &[u8]) -> Result<MessageType> {
    bytes
        .first()
        .and_then(|b| MessageType::from_u8(*b))
        .ok_or_else(|| Error::Protocol("Unknown message type".to_string()))
}

/// Packs multiple encoded messages into a single datagram.
pub fn encode_compound(messages: &[Vec<u8>]) -> Result<Vec<u8>> {
    let parts = messages
        .iter()
        .map(|m| ByteBuf::from(m.clone()))
        .collect::<Vec<_>>();
    encode(MessageType::Compound, &parts)
}

pub fn decode_compound(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let parts: Vec<ByteBuf> = decode(bytes)?;
    Ok(parts.into_iter().map(|p| p.into_vec()).collect())
}

// -- Membership messages --------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub seq: u32,
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndirectPing {
    pub seq: u32,
    pub node: String,
    pub addr: IpAddr,
    pub port: u16,
    pub nack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub seq: u32,
    /// Opaque delegate payload; carries the responder's network
    /// coordinate back to the prober.
    pub payload: ByteBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nack {
    pub seq: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alive {
    pub ltime: LamportTime,
    pub incarnation: u64,
    pub node: String,
    pub addr: IpAddr,
    pub port: u16,
    /// Wire-encoded tag map, opaque at this layer.
    pub tags: ByteBuf,
    /// Protocol and delegate version triplets: {min, max, cur} x 2.
    pub vsn: [u8; 6],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspect {
    pub ltime: LamportTime,
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dead {
    pub ltime: LamportTime,
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPull {
    pub join: bool,
    pub ltime: LamportTime,
    pub nodes: Vec<PushNodeState>,
    pub user_state: ByteBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNodeState {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub tags: ByteBuf,
    pub incarnation: u64,
    pub ltime: LamportTime,
    pub state: u8,
    pub vsn: [u8; 6],
}

// -- Upper-tier messages, carried as user messages ------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveIntent {
    pub ltime: LamportTime,
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEventMsg {
    pub ltime: LamportTime,
    pub name: String,
    pub payload: ByteBuf,
    pub cc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueryFilter {
    /// Regular expression matched against node names.
    NodeName(String),
    /// Tag name plus a regular expression matched against its value.
    Tag(String, String),
}

pub const QUERY_FLAG_ACK: u32 = 1;
pub const QUERY_FLAG_NO_BROADCAST: u32 = 2;
pub const RESPONSE_FLAG_ACK: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMsg {
    pub ltime: LamportTime,
    pub id: u32,
    pub source_node: String,
    pub source_addr: IpAddr,
    pub source_port: u16,
    pub filters: Vec<QueryFilter>,
    pub flags: u32,
    pub relay_factor: u8,
    pub timeout_ms: u64,
    pub name: String,
    pub payload: ByteBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponseMsg {
    pub ltime: LamportTime,
    pub id: u32,
    pub from: String,
    pub flags: u32,
    pub payload: ByteBuf,
}

/// Wraps a raw query so a peer can forward it once; forwarded copies are
/// never relayed again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMsg {
    pub node: String,
    pub payload: ByteBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequestMsg {
    pub key: ByteBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyResponseMsg {
    pub result: bool,
    pub message: String,
    pub keys: Vec<String>,
    pub primary_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResponseMsg {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
}

/// Encodes the tag map the way it travels inside `Alive` messages.
pub fn encode_tags(tags: &std::collections::HashMap<String, String>) -> Result<Vec<u8>> {
    let mut pairs = tags
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<Vec<_>>();
    pairs.sort();
    rmp_serde::to_vec(&pairs).map_err(Into::into)
}

pub fn decode_tags(bytes: &[u8]) -> std::collections::HashMap<String, String> {
    rmp_serde::from_slice::<Vec<(String, String)>>(bytes)
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn message_round_trip() {
        let alive = Alive {
            ltime: 7,
            incarnation: 3,
            node: "node-a".to_string(),
            addr: "127.0.0.1".parse().unwrap(),
            port: 7946,
            tags: ByteBuf::from(encode_tags(&HashMap::from_iter([(
                "role".to_string(),
                "api".to_string(),
            )]))
            .unwrap()),
            vsn: [1, 1, 1, 1, 1, 1],
        };

        let bytes = encode(MessageType::Alive, &alive).unwrap();
        assert_eq!(message_type(&bytes).unwrap(), MessageType::Alive);
        let decoded: Alive = decode(&bytes).unwrap();
        assert_eq!(decoded.node, alive.node);
        assert_eq!(decoded.incarnation, 3);
        assert_eq!(decoded.ltime, 7);
        assert_eq!(
            decode_tags(&decoded.tags).get("role").map(String::as_str),
            Some("api")
        );
    }

    #[test]
    fn query_round_trip() {
        let query = QueryMsg {
            ltime: 11,
            id: 99,
            source_node: "node-a".to_string(),
            source_addr: "10.0.0.1".parse().unwrap(),
            source_port: 7946,
            filters: vec![
                QueryFilter::NodeName("^node-".to_string()),
                QueryFilter::Tag("role".to_string(), "^api$".to_string()),
            ],
            flags: QUERY_FLAG_ACK,
            relay_factor: 2,
            timeout_ms: 1000,
            name: "health".to_string(),
            payload: ByteBuf::from(b"ping".to_vec()),
        };

        let bytes = encode(MessageType::Query, &query).unwrap();
        let decoded: QueryMsg = decode(&bytes).unwrap();
        assert_eq!(decoded.id, 99);
        assert_eq!(decoded.filters.len(), 2);
        assert_eq!(decoded.flags & QUERY_FLAG_ACK, QUERY_FLAG_ACK);
        assert_eq!(&decoded.payload[..], b"ping");
    }

    #[test]
    fn compound_round_trip() {
        let ping = encode(MessageType::Ping, &Ping {
            seq: 1,
            node: "b".to_string(),
        })
        .unwrap();
        let nack = encode(MessageType::Nack, &Nack { seq: 2 }).unwrap();

        let packed = encode_compound(&[ping.clone(), nack.clone()]).unwrap();
        assert_eq!(message_type(&packed).unwrap(), MessageType::Compound);

        let parts = decode_compound(&packed).unwrap();
        assert_eq!(parts, vec![ping, nack]);
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        assert!(message_type(&[200, 0, 0]).is_err());
        assert!(message_type(&[]).is_err());
    }

    #[test]
    fn tags_are_order_independent() {
        let mut tags = HashMap::new();
        tags.insert("b".to_string(), "2".to_string());
        tags.insert("a".to_string(), "1".to_string());
        let one = encode_tags(&tags).unwrap();
        let two = encode_tags(&tags.clone()).unwrap();
        assert_eq!(one, two);
        assert_eq!(decode_tags(&one), tags);
    }
}
