//! Relay calls over a supervised TCP channel, against an in-process relay.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use chainrelay_core::error::TransportError;
use chainrelay_core::events::ErrorSink;
use chainrelay_core::relay::{AuthService, CallMetadata, Role, SearcherService};
use chainrelay_core::result::BundleResult;
use chainrelay_core::transaction::{Packet, Pubkey, Signature, Transaction};
use chainrelay_transport::wire::{
    GENERATE_AUTH_CHALLENGE, GENERATE_AUTH_TOKENS, SEND_BUNDLE, SUBSCRIBE_BUNDLE_RESULTS,
};
use chainrelay_transport::{
    Connection, Connector, RelayStub, RequestFrame, SupervisorConfig, TcpConnector,
    TransportSupervisor,
};

const HANG: &str = "/test.Hang";
const DROP_CONNECTION: &str = "/test.DropConnection";

// ─── Fake relay ───────────────────────────────────────────────────────────────

struct FakeRelay {
    addr: String,
    requests: Arc<Mutex<Vec<RequestFrame>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeRelay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = Self {
            addr: listener.local_addr().unwrap().to_string(),
            requests: Arc::default(),
            connections: Arc::default(),
        };
        let requests = relay.requests.clone();
        let connections = relay.connections.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(sock, requests.clone()));
            }
        });
        relay
    }

    fn methods(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.method.clone())
            .collect()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn token(value: &str) -> Value {
    json!({"value": value, "expires_at": "2030-01-01T00:00:00Z"})
}

async fn serve(sock: TcpStream, requests: Arc<Mutex<Vec<RequestFrame>>>) {
    let (reader, mut writer) = sock.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let frame: RequestFrame = serde_json::from_str(&line).unwrap();
        requests.lock().unwrap().push(frame.clone());
        let id = frame.id;
        let replies = match frame.method.as_str() {
            GENERATE_AUTH_CHALLENGE => vec![json!({"id": id, "result": {"challenge": "nonce"}})],
            GENERATE_AUTH_TOKENS => vec![json!({
                "id": id,
                "result": {"access_token": token("access-1"), "refresh_token": token("refresh-1")}
            })],
            SEND_BUNDLE => match frame.metadata.get("authorization").map(String::as_str) {
                Some("Bearer ok") => vec![json!({"id": id, "result": {"uuid": "bundle-1"}})],
                _ => vec![json!({"id": id, "error": {"code": 16, "message": "unauthenticated"}})],
            },
            SUBSCRIBE_BUNDLE_RESULTS => vec![json!({
                "id": id,
                "item": {"bundle_id": "b1", "outcome": {"status": "accepted", "slot": 7}}
            })],
            DROP_CONNECTION => return,
            _ => Vec::new(),
        };
        for reply in replies {
            let mut bytes = serde_json::to_vec(&reply).unwrap();
            bytes.push(b'\n');
            writer.write_all(&bytes).await.unwrap();
        }
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

async fn connect(
    addr: &str,
    connector: Arc<TcpConnector>,
    cancel: &CancellationToken,
) -> Connection {
    TransportSupervisor::connect(
        addr,
        connector,
        SupervisorConfig::default(),
        cancel.clone(),
        ErrorSink::discard(),
    )
    .await
    .unwrap()
}

fn packets() -> Vec<Packet> {
    vec![Packet::from(&Transaction::new(
        vec![Signature([1; 64])],
        vec![1; 10],
    ))]
}

async fn within<F: std::future::Future>(f: F) -> F::Output {
    timeout(Duration::from_secs(5), f).await.expect("timed out")
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_and_submission_travel_over_the_channel() {
    let relay = FakeRelay::start().await;
    let cancel = CancellationToken::new();
    let stub = RelayStub::new(connect(&relay.addr, Arc::default(), &cancel).await);

    let pubkey = Pubkey([4; 32]);
    let challenge = within(stub.generate_auth_challenge(Role::Searcher, &pubkey))
        .await
        .unwrap();
    assert_eq!(challenge, "nonce");
    let tokens = within(stub.generate_auth_tokens("x-nonce", &[9; 64], &pubkey))
        .await
        .unwrap();
    assert_eq!(tokens.access.value, "access-1");
    assert_eq!(tokens.refresh.value, "refresh-1");

    let id = within(stub.send_bundle(&CallMetadata::bearer("ok"), packets()))
        .await
        .unwrap();
    assert_eq!(id, "bundle-1");

    let err = within(stub.send_bundle(&CallMetadata::new(), packets()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Rpc(e) if e.code == 16));

    assert_eq!(
        relay.methods(),
        vec![GENERATE_AUTH_CHALLENGE, GENERATE_AUTH_TOKENS, SEND_BUNDLE, SEND_BUNDLE]
    );
    let frames = relay.requests.lock().unwrap().clone();
    assert_eq!(frames[0].params["role"], "searcher");
    assert_eq!(frames[0].params["pubkey"], pubkey.to_string());
    assert!(frames[0].metadata.is_empty());
    assert_eq!(frames[2].metadata["authorization"], "Bearer ok");
    assert_eq!(frames[2].params["packets"].as_array().unwrap().len(), 1);
    assert_eq!(relay.connections(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn lost_connection_fails_calls_and_streams_in_flight() {
    let relay = FakeRelay::start().await;
    let cancel = CancellationToken::new();
    let conn = connect(&relay.addr, Arc::default(), &cancel).await;
    let stub = RelayStub::new(conn.clone());

    let mut results = within(stub.subscribe_bundle_results(&CallMetadata::new()))
        .await
        .unwrap();
    let first = within(results.next()).await.unwrap().unwrap();
    assert_eq!(first, BundleResult::accepted("b1", 7));

    let hanging = {
        let channel = conn.channel();
        tokio::spawn(async move { channel.call(HANG, &CallMetadata::new(), Value::Null).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let dropped = within(conn.channel().call(DROP_CONNECTION, &CallMetadata::new(), Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(dropped, TransportError::Closed));
    assert!(matches!(
        within(hanging).await.unwrap(),
        Err(TransportError::Closed)
    ));
    assert!(matches!(
        within(results.next()).await,
        Some(Err(TransportError::Stream(_)))
    ));
    assert!(within(results.next()).await.is_none());
    cancel.cancel();
}

#[tokio::test]
async fn cancelling_the_connection_fails_calls_in_flight() {
    let relay = FakeRelay::start().await;
    let cancel = CancellationToken::new();
    let conn = connect(&relay.addr, Arc::default(), &cancel).await;
    let stub = RelayStub::new(conn.clone());

    let hanging = {
        let channel = conn.channel();
        tokio::spawn(async move { channel.call(HANG, &CallMetadata::new(), Value::Null).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    assert!(matches!(
        within(hanging).await.unwrap(),
        Err(TransportError::Closed)
    ));
    let err = within(stub.send_bundle(&CallMetadata::bearer("ok"), packets()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Closed));
}

#[tokio::test]
async fn reconnect_moves_calls_to_the_redialed_channel() {
    let relay = FakeRelay::start().await;
    let cancel = CancellationToken::new();
    let mut conn = connect(&relay.addr, Arc::default(), &cancel).await;
    let stub = RelayStub::new(conn.clone());

    within(stub.send_bundle(&CallMetadata::bearer("ok"), packets()))
        .await
        .unwrap();
    let before = conn.channel();

    conn.reconnect();
    assert!(within(conn.redialed()).await);
    within(stub.send_bundle(&CallMetadata::bearer("ok"), packets()))
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&before, &conn.channel()));
    assert_eq!(relay.connections(), 2);
    cancel.cancel();
}

/// A one-shot `CONNECT` proxy tunnelling to `upstream`; yields the request head.
async fn tunnel_proxy(upstream: String) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (mut client, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        let mut server = TcpStream::connect(upstream).await.unwrap();
        tokio::spawn(async move {
            let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
        });
        String::from_utf8(head).unwrap()
    });
    (addr, handle)
}

#[tokio::test]
async fn rotated_proxy_carries_the_next_connection() {
    let relay = FakeRelay::start().await;
    let cancel = CancellationToken::new();
    let connector = Arc::new(TcpConnector::default());
    let mut conn = connect(&relay.addr, connector.clone(), &cancel).await;
    let stub = RelayStub::new(conn.clone());
    within(stub.send_bundle(&CallMetadata::bearer("ok"), packets()))
        .await
        .unwrap();

    let (proxy_addr, request) = tunnel_proxy(relay.addr.clone()).await;
    connector
        .set_proxy(format!("{proxy_addr}:alice:s3cret").parse().unwrap())
        .unwrap();
    conn.reconnect();
    assert!(within(conn.redialed()).await);

    let id = within(stub.send_bundle(&CallMetadata::bearer("ok"), packets()))
        .await
        .unwrap();
    assert_eq!(id, "bundle-1");
    let head = within(request).await.unwrap();
    assert!(head.starts_with(&format!("CONNECT {} HTTP/1.1\r\n", relay.addr)));
    assert_eq!(relay.connections(), 2);
    cancel.cancel();
}
