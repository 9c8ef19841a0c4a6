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

pub mod listener;
pub mod serialize;
pub mod session;

use std::{collections::HashMap, net::IpAddr, net::SocketAddr};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::cluster::{coordinate::Coordinate, member::Member};

pub const DEFAULT_RPC_PORT: u16 = 7373;
pub const MAX_RPC_VERSION: u32 = 1;

pub const ERR_HANDSHAKE_REQUIRED: &str = "Handshake required";
pub const ERR_AUTH_REQUIRED: &str = "Authentication required";
pub const ERR_DUPLICATE_HANDSHAKE: &str = "Handshake already performed";
pub const ERR_INVALID_AUTH: &str = "Invalid authentication token";
pub const ERR_INVALID_VERSION: &str = "Unsupported protocol version";
pub const ERR_INVALID_COMMAND: &str = "Invalid command";
pub const ERR_DUPLICATE_STREAM: &str = "Duplicate sequence number";

/// Every request is `[header, body?]`; every response mirrors it. The
/// client assigns sequence numbers and the server echoes them, including
/// on every streamed record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    pub command: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub seq: u64,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthRequest {
    pub auth_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMember {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub tags: HashMap<String, String>,
    pub status: String,
    pub protocol_min: u8,
    pub protocol_max: u8,
    pub protocol_cur: u8,
    pub delegate_min: u8,
    pub delegate_max: u8,
    pub delegate_cur: u8,
}

impl From<&Member> for RpcMember {
    fn from(member: &Member) -> Self {
        RpcMember {
            name: member.name.clone(),
            addr: member.addr,
            port: member.port,
            tags: member.tags.clone(),
            status: member.status.as_str().to_string(),
            protocol_min: member.vsn[0],
            protocol_max: member.vsn[1],
            protocol_cur: member.vsn[2],
            delegate_min: member.vsn[3],
            delegate_max: member.vsn[4],
            delegate_cur: member.vsn[5],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MembersResponse {
    pub members: Vec<RpcMember>,
}

/// Regular expressions matched against member names, statuses and tag
/// values; all given filters must match.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MembersFilteredRequest {
    pub name: Option<String>,
    pub status: Option<String>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub existing: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub num: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForceLeaveRequest {
    pub node: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventRequest {
    pub name: String,
    pub payload: ByteBuf,
    pub coalesce: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagsRequest {
    pub tags: HashMap<String, String>,
    pub delete_tags: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Regex on node names, if any.
    pub filter_name: Option<String>,
    /// Tag name to value-regex.
    pub filter_tags: HashMap<String, String>,
    pub request_ack: bool,
    pub relay_factor: u8,
    /// Zero picks the cluster-size-scaled default.
    pub timeout_ms: u64,
    pub name: String,
    pub payload: ByteBuf,
}

/// Initial response to `query`: a positional body carrying only the id.
/// On error the body is omitted entirely.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryIdResponse {
    pub id: u32,
}

pub const QUERY_RECORD_ACK: &str = "ack";
pub const QUERY_RECORD_RESPONSE: &str = "response";
pub const QUERY_RECORD_DONE: &str = "done";

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRecord {
    pub record_type: String,
    pub from: String,
    pub payload: ByteBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CoordinateRequest {
    pub node: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CoordinateResponse {
    pub ok: bool,
    pub coord: Coordinate,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MonitorRequest {
    pub log_level: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamRequest {
    pub event_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopRequest {
    pub stop: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyRequestBody {
    pub key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyResponseBody {
    pub messages: HashMap<String, String>,
    pub keys: HashMap<String, usize>,
    pub primary_keys: HashMap<String, usize>,
    pub num_nodes: usize,
    pub num_resp: usize,
    pub num_err: usize,
}

/// Records streamed by the `stream` command; the leading `event` field
/// tells the client which shape follows.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamMemberEvent {
    pub event: String,
    pub members: Vec<RpcMember>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamUserEvent {
    pub event: String,
    pub ltime: u64,
    pub name: String,
    pub payload: ByteBuf,
    pub coalesce: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamQueryEvent {
    pub event: String,
    pub ltime: u64,
    pub name: String,
    pub payload: ByteBuf,
    pub id: u32,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub bind_addr: SocketAddr,
    pub auth_key: Option<String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_RPC_PORT)),
            auth_key: None,
        }
    }
}
