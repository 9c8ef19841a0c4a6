use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use serde_bytes::ByteBuf;
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};

use crate::{
    cluster::Cluster,
    logger::LogBroadcaster,
    rpc::{
        listener::spawn_rpc,
        serialize::{write_frame, FrameReader},
        AuthRequest, CoordinateRequest, CoordinateResponse, EventRequest, HandshakeRequest,
        MembersResponse, QueryIdResponse, QueryRecord, QueryRequest, RequestHeader,
        ResponseHeader, RpcConfig, StopRequest, StreamRequest, StreamUserEvent,
        ERR_AUTH_REQUIRED, ERR_HANDSHAKE_REQUIRED, ERR_INVALID_AUTH, QUERY_RECORD_DONE,
    },
    tests::utils::*,
};

struct TestClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    seq: u64,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        TestClient {
            reader: FrameReader::new(read_half),
            writer: write_half,
            seq: 0,
        }
    }

    async fn send<B: Serialize>(&mut self, command: &str, body: Option<&B>) -> u64 {
        self.seq += 1;
        let header = RequestHeader {
            command: command.to_string(),
            seq: self.seq,
        };
        write_frame(&mut self.writer, &header, body).await.unwrap();
        self.seq
    }

    async fn read_header(&mut self) -> ResponseHeader {
        self.reader
            .read_value()
            .await
            .unwrap()
            .expect("server closed the session")
    }

    async fn read_body<T: DeserializeOwned>(&mut self) -> T {
        self.reader
            .read_value()
            .await
            .unwrap()
            .expect("server closed the session")
    }

    async fn handshake(&mut self) {
        self.send("handshake", Some(&HandshakeRequest { version: 1 }))
            .await;
        let header = self.read_header().await;
        assert_eq!(header.error, "");
    }
}

async fn start_rpc_node(auth_key: Option<&str>) -> (Arc<Cluster>, SocketAddr) {
    let cluster = start_node("rpc-node").await;
    let addr = spawn_rpc(
        cluster.clone(),
        Arc::new(LogBroadcaster::default()),
        RpcConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            auth_key: auth_key.map(str::to_string),
        },
    )
    .await
    .unwrap();
    (cluster, addr)
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_require_a_handshake_first() {
    let (cluster, addr) = start_rpc_node(None).await;
    let mut client = TestClient::connect(addr).await;

    client.send::<()>("members", None).await;
    let header = client.read_header().await;
    assert_eq!(header.error, ERR_HANDSHAKE_REQUIRED);

    client.handshake().await;
    client.send::<()>("members", None).await;
    let header = client.read_header().await;
    assert_eq!(header.error, "");
    let members: MembersResponse = client.read_body().await;
    assert_eq!(members.members.len(), 1);
    assert_eq!(members.members[0].name, "rpc-node");
    assert_eq!(members.members[0].status, "alive");

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_gate_enforces_the_token() {
    let (cluster, addr) = start_rpc_node(Some("sekrit")).await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send::<()>("members", None).await;
    assert_eq!(client.read_header().await.error, ERR_AUTH_REQUIRED);

    client
        .send(
            "auth",
            Some(&AuthRequest {
                auth_key: "wrong".to_string(),
            }),
        )
        .await;
    assert_eq!(client.read_header().await.error, ERR_INVALID_AUTH);

    client
        .send(
            "auth",
            Some(&AuthRequest {
                auth_key: "sekrit".to_string(),
            }),
        )
        .await;
    assert_eq!(client.read_header().await.error, "");

    client.send::<()>("members", None).await;
    assert_eq!(client.read_header().await.error, "");
    let _members: MembersResponse = client.read_body().await;

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn members_filtered_applies_regexes() {
    use crate::rpc::MembersFilteredRequest;

    let (cluster, addr) = start_rpc_node(None).await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client
        .send(
            "members-filtered",
            Some(&MembersFilteredRequest {
                name: Some("rpc-.*".to_string()),
                status: Some("alive".to_string()),
                tags: HashMap::new(),
            }),
        )
        .await;
    assert_eq!(client.read_header().await.error, "");
    let members: MembersResponse = client.read_body().await;
    assert_eq!(members.members.len(), 1);

    client
        .send(
            "members-filtered",
            Some(&MembersFilteredRequest {
                name: None,
                status: Some("failed".to_string()),
                tags: HashMap::new(),
            }),
        )
        .await;
    assert_eq!(client.read_header().await.error, "");
    let members: MembersResponse = client.read_body().await;
    assert!(members.members.is_empty());

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn events_reach_stream_subscribers() {
    let (cluster, addr) = start_rpc_node(None).await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    let stream_seq = client
        .send(
            "stream",
            Some(&StreamRequest {
                event_type: "user:deploy".to_string(),
            }),
        )
        .await;
    assert_eq!(client.read_header().await.error, "");

    client
        .send(
            "event",
            Some(&EventRequest {
                name: "deploy".to_string(),
                payload: ByteBuf::from(b"v1".to_vec()),
                coalesce: false,
            }),
        )
        .await;
    assert_eq!(client.read_header().await.error, "");

    // The streamed record is tagged with the subscription's sequence.
    let header = client.read_header().await;
    assert_eq!(header.seq, stream_seq);
    let record: StreamUserEvent = client.read_body().await;
    assert_eq!(record.event, "user");
    assert_eq!(record.name, "deploy");
    assert_eq!(&record.payload[..], b"v1");

    client
        .send("stop", Some(&StopRequest { stop: stream_seq }))
        .await;
    assert_eq!(client.read_header().await.error, "");

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn query_streams_end_with_exactly_one_done() {
    let (cluster, addr) = start_rpc_node(None).await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    let query_seq = client
        .send(
            "query",
            Some(&QueryRequest {
                filter_name: Some("nobody".to_string()),
                filter_tags: HashMap::new(),
                request_ack: false,
                relay_factor: 0,
                timeout_ms: 1000,
                name: "health".to_string(),
                payload: ByteBuf::new(),
            }),
        )
        .await;

    // Initial response carries only the query id.
    let header = client.read_header().await;
    assert_eq!(header.error, "");
    let id: QueryIdResponse = client.read_body().await;
    assert!(id.id > 0);

    let header = tokio::time::timeout(Duration::from_secs(5), client.read_header())
        .await
        .expect("no done record before the deadline");
    assert_eq!(header.seq, query_seq);
    let record: QueryRecord = client.read_body().await;
    assert_eq!(record.record_type, QUERY_RECORD_DONE);

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_and_coordinates_are_exposed() {
    let (cluster, addr) = start_rpc_node(None).await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send::<()>("stats", None).await;
    assert_eq!(client.read_header().await.error, "");
    let stats: HashMap<String, HashMap<String, String>> = client.read_body().await;
    assert_eq!(
        stats.get("agent").and_then(|agent| agent.get("name")),
        Some(&"rpc-node".to_string())
    );

    client
        .send(
            "get-coordinate",
            Some(&CoordinateRequest {
                node: "rpc-node".to_string(),
            }),
        )
        .await;
    assert_eq!(client.read_header().await.error, "");
    let response: CoordinateResponse = client.read_body().await;
    assert!(response.ok);

    client
        .send(
            "get-coordinate",
            Some(&CoordinateRequest {
                node: "stranger".to_string(),
            }),
        )
        .await;
    assert_eq!(client.read_header().await.error, "");
    let response: CoordinateResponse = client.read_body().await;
    assert!(!response.ok);

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_frames_end_only_the_offending_session() {
    use tokio::io::AsyncWriteExt;

    let (cluster, addr) = start_rpc_node(None).await;

    // Feed garbage; the server should drop this session.
    let mut bad = TcpStream::connect(addr).await.unwrap();
    bad.write_all(&[0xc1, 0xc1, 0xc1, 0xc1]).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), async {
        use tokio::io::AsyncReadExt;
        bad.read(&mut buf).await
    })
    .await
    .expect("server left the bad session open");
    assert!(matches!(read, Ok(0) | Err(_)));

    // A well-behaved session still works.
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;
    client.send::<()>("members", None).await;
    assert_eq!(client.read_header().await.error, "");
    let _members: MembersResponse = client.read_body().await;

    cluster.shutdown();
}
