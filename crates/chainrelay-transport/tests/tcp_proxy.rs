//! TCP channel and proxy tunnel against in-process listeners.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use chainrelay_core::error::TransportError;
use chainrelay_core::events::ErrorSink;
use chainrelay_transport::{
    Channel, ConnectivityState, Connector, ProxyConfig, ProxyTunnel, SupervisorConfig, TcpConfig,
    TcpConnector, TransportSupervisor,
};

// ─── Helpers ──────────────────────────────────────────────────────────────────

async fn wait_for(channel: &dyn Channel, want: ConnectivityState) {
    loop {
        let state = channel.state();
        if state == want {
            return;
        }
        timeout(Duration::from_secs(5), channel.wait_for_state_change(state))
            .await
            .unwrap_or_else(|_| panic!("stuck in {state}, wanted {want}"));
    }
}

async fn read_head(sock: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        sock.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// A one-shot forward proxy that answers `status_line` and, on 200, tunnels
/// to `upstream`. Returns the proxy address and the request it received.
async fn fake_proxy(
    status_line: &'static str,
    upstream: Option<String>,
) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (mut client, _) = listener.accept().await.unwrap();
        let head = read_head(&mut client).await;
        client
            .write_all(format!("{status_line}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        if let Some(upstream) = upstream {
            let mut server = TcpStream::connect(upstream).await.unwrap();
            tokio::spawn(async move {
                let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
            });
        }
        head
    });
    (addr, handle)
}

fn proxy_config(addr: &str) -> ProxyConfig {
    format!("{addr}:alice:s3cret").parse().unwrap()
}

// ─── TCP channel ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn tcp_channel_becomes_ready_and_notices_peer_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let channel = TcpConnector::default().dial(&addr).await.unwrap();
    let (sock, _) = listener.accept().await.unwrap();
    wait_for(&*channel, ConnectivityState::Ready).await;

    // No listener to come back to, so reconnects fail.
    drop(listener);
    drop(sock);
    wait_for(&*channel, ConnectivityState::TransientFailure).await;

    channel.close();
    assert_eq!(channel.state(), ConnectivityState::Shutdown);
}

#[tokio::test]
async fn reset_connect_backoff_retries_immediately() {
    let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = spare.local_addr().unwrap();
    drop(spare);

    let connector = TcpConnector::new(TcpConfig {
        backoff_initial_ms: 60_000,
        ..TcpConfig::default()
    });
    let channel = connector.dial(&addr.to_string()).await.unwrap();
    wait_for(&*channel, ConnectivityState::TransientFailure).await;

    let listener = TcpListener::bind(addr).await.unwrap();
    channel.reset_connect_backoff();
    let _accepted = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("backoff was not cut short")
        .unwrap();
    wait_for(&*channel, ConnectivityState::Ready).await;
    channel.close();
}

#[tokio::test]
async fn supervisor_over_tcp_reports_ready() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();

    let conn = TransportSupervisor::connect(
        addr.clone(),
        std::sync::Arc::new(TcpConnector::default()),
        SupervisorConfig::default(),
        cancel.clone(),
        ErrorSink::discard(),
    )
    .await
    .unwrap();
    let _accepted = listener.accept().await.unwrap();
    wait_for(&*conn.channel(), ConnectivityState::Ready).await;
    assert_eq!(conn.target(), addr);

    cancel.cancel();
    wait_for(&*conn.channel(), ConnectivityState::Shutdown).await;
}

// ─── Proxy tunnel ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_request_carries_basic_auth_and_tunnels_bytes() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        sock.write_all(b"pong").await.unwrap();
    });

    let (proxy_addr, request) =
        fake_proxy("HTTP/1.1 200 Connection established", Some(upstream_addr.clone())).await;
    let mut stream = ProxyTunnel::new(proxy_config(&proxy_addr))
        .connect(&upstream_addr)
        .await
        .unwrap();

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    let request = request.await.unwrap();
    assert!(request.starts_with(&format!("CONNECT {upstream_addr} HTTP/1.1\r\n")));
    assert!(request.contains(&format!("Host: {upstream_addr}\r\n")));
    assert!(request.contains("Proxy-Authorization: Basic YWxpY2U6czNjcmV0\r\n"));
}

#[tokio::test]
async fn non_200_proxy_response_is_an_error() {
    let (proxy_addr, _request) = fake_proxy("HTTP/1.1 407 Proxy Authentication Required", None).await;
    let err = ProxyTunnel::new(proxy_config(&proxy_addr))
        .connect("relay.example:443")
        .await
        .unwrap_err();
    match err {
        TransportError::Proxy(msg) => assert!(msg.contains("407"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn tcp_channel_dials_through_proxy() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap().to_string();
    let (proxy_addr, _request) =
        fake_proxy("HTTP/1.1 200 Connection established", Some(upstream_addr.clone())).await;

    let channel = TcpConnector::default()
        .with_proxy(proxy_config(&proxy_addr))
        .dial(&upstream_addr)
        .await
        .unwrap();
    let _accepted = timeout(Duration::from_secs(5), upstream.accept())
        .await
        .unwrap()
        .unwrap();
    wait_for(&*channel, ConnectivityState::Ready).await;
    channel.close();
}
