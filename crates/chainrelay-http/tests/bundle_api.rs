//! HTTP bundle API, ledger lookup and poller against a wiremock relay.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chainrelay_core::bundle::Bundle;
use chainrelay_core::error::{RelayError, TransportError, ValidationError};
use chainrelay_core::ledger::{ConfirmationStatus, SignatureStatusLookup};
use chainrelay_core::policy::RetryConfig;
use chainrelay_core::proxy::ProxyConfig;
use chainrelay_core::relay::{CallMetadata, SearcherService};
use chainrelay_core::result::{BundleOutcome, BundleResultSource};
use chainrelay_core::transaction::{Encoding, Signature, Transaction};
use chainrelay_http::{
    BundleApi, BundleApiConfig, HttpClientConfig, HttpSearcher, InflightStatusPoller,
    PollerConfig, RpcLedger,
};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn api(server: &MockServer) -> BundleApi {
    BundleApi::new(BundleApiConfig {
        url: server.uri(),
        http: HttpClientConfig {
            retry: RetryConfig::linear(2, Duration::from_millis(10)),
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap()
}

fn ok(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "result": result, "id": 1 }))
}

fn tx(n: u8) -> Transaction {
    Transaction::new(vec![Signature([n; 64])], vec![n; 40])
}

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("b{i}")).collect()
}

async fn bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

fn inflight(bundle_id: &str, status: &str, landed_slot: Option<u64>) -> Value {
    json!({
        "context": { "slot": 500 },
        "value": [{ "bundle_id": bundle_id, "status": status, "landed_slot": landed_slot }]
    })
}

// ─── sendBundle ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn send_bundle_base58_body_is_exact() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ok(json!("bundle-abc")))
        .expect(1)
        .mount(&server)
        .await;

    let bundle = Bundle::assemble(vec![tx(1), tx(2)]).unwrap();
    let id = api(&server).send_bundle(&bundle, Encoding::Base58).await.unwrap();
    assert_eq!(id, "bundle-abc");

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    let expected = format!(
        r#"{{"jsonrpc":"2.0","id":1,"method":"sendBundle","params":[["{}","{}"]]}}"#,
        tx(1).encode(Encoding::Base58),
        tx(2).encode(Encoding::Base58),
    );
    assert_eq!(body, expected);
}

#[tokio::test]
async fn send_bundle_base64_declares_encoding() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "params": [[tx(3).encode(Encoding::Base64)], { "encoding": "base64" }] })))
        .respond_with(ok(json!("bundle-b64")))
        .expect(1)
        .mount(&server)
        .await;

    let bundle = Bundle::assemble(vec![tx(3)]).unwrap();
    let id = api(&server).send_bundle(&bundle, Encoding::Base64).await.unwrap();
    assert_eq!(id, "bundle-b64");
}

#[tokio::test]
async fn default_user_agent_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("user-agent", concat!("chainrelay/", env!("CARGO_PKG_VERSION"))))
        .respond_with(ok(json!("bundle-ua")))
        .expect(1)
        .mount(&server)
        .await;

    let bundle = Bundle::assemble(vec![tx(1)]).unwrap();
    api(&server).send_bundle(&bundle, Encoding::Base58).await.unwrap();
}

#[tokio::test]
async fn rpc_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "error": { "code": -32602, "message": "bundle contains an already processed transaction" },
            "id": 1
        })))
        .expect(1)
        .mount(&server)
        .await;

    let bundle = Bundle::assemble(vec![tx(1)]).unwrap();
    let err = api(&server).send_bundle(&bundle, Encoding::Base58).await.unwrap_err();
    match err {
        TransportError::Rpc(e) => assert_eq!(e.code, -32602),
        other => panic!("unexpected {other}"),
    }
}

#[tokio::test]
async fn server_errors_are_retried_then_succeed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ok(json!("bundle-late")))
        .mount(&server)
        .await;

    let bundle = Bundle::assemble(vec![tx(1)]).unwrap();
    let id = api(&server).send_bundle(&bundle, Encoding::Base58).await.unwrap();
    assert_eq!(id, "bundle-late");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

// ─── Status calls ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn more_than_five_ids_are_rejected_before_any_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ok(json!(null)))
        .expect(0)
        .mount(&server)
        .await;

    let err = api(&server).get_bundle_statuses(&ids(6)).await.unwrap_err();
    assert!(matches!(
        err,
        RelayError::Validation(ValidationError::TooManyBundleIds { count: 6, max: 5 })
    ));
    let err = api(&server)
        .get_inflight_bundle_statuses(&ids(6))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
}

#[tokio::test]
async fn batch_status_chunks_by_five_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ok(json!({ "context": { "slot": 1 }, "value": [] })))
        .mount(&server)
        .await;

    let out = api(&server).batch_get_bundle_statuses(&ids(12)).await.unwrap();
    assert_eq!(out.len(), 3);

    let params: Vec<Value> = bodies(&server).await.into_iter().map(|b| b["params"][0].clone()).collect();
    assert_eq!(params[0], json!(["b0", "b1", "b2", "b3", "b4"]));
    assert_eq!(params[1], json!(["b5", "b6", "b7", "b8", "b9"]));
    assert_eq!(params[2], json!(["b10", "b11"]));
    assert!(bodies(&server).await.iter().all(|b| b["method"] == "getBundleStatuses"));
}

#[tokio::test]
async fn batch_stops_at_first_failing_chunk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "params": [["b5", "b6", "b7", "b8", "b9"]] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "error": { "code": -32600, "message": "rate limited" },
            "id": 1
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ok(json!({ "context": { "slot": 1 }, "value": [] })))
        .mount(&server)
        .await;

    let err = api(&server)
        .batch_get_inflight_bundle_statuses(&ids(12))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Transport(TransportError::Rpc(_))));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ledger_lookup_maps_statuses_in_order() {
    let server = MockServer::start().await;
    let sigs = [Signature([1; 64]), Signature([2; 64])];
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "getSignatureStatuses",
            "params": [[sigs[0].to_string(), sigs[1].to_string()], { "searchTransactionHistory": false }]
        })))
        .respond_with(ok(json!({
            "context": { "slot": 82 },
            "value": [
                { "slot": 72, "confirmations": 10, "err": null, "status": { "Ok": null }, "confirmationStatus": "confirmed" },
                null
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ledger = RpcLedger::http(server.uri()).unwrap();
    let statuses = ledger.get_signature_statuses(&sigs).await.unwrap();
    assert_eq!(statuses.len(), 2);
    let first = statuses[0].as_ref().unwrap();
    assert_eq!(first.slot, 72);
    assert_eq!(first.status(), ConfirmationStatus::Confirmed);
    assert!(statuses[1].is_none());
}

// ─── Poller and searcher ──────────────────────────────────────────────────────

#[tokio::test]
async fn poller_waits_out_pending_then_accepts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ok(inflight("b1", "Pending", None)))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ok(inflight("b1", "Landed", Some(499))))
        .mount(&server)
        .await;

    let poller = InflightStatusPoller::new(api(&server), PollerConfig { poll_interval_ms: 10 });
    let result = poller.next_result("b1").await.unwrap();
    assert_eq!(result.outcome, BundleOutcome::Accepted { slot: 499, validator_identity: None });
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    assert!(bodies(&server)
        .await
        .iter()
        .all(|b| b["method"] == "getInflightBundleStatuses" && b["params"] == json!([["b1"]])));
}

#[tokio::test]
async fn poller_reports_failed_bundle_as_dropped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ok(inflight("b1", "Failed", None)))
        .mount(&server)
        .await;

    let poller = InflightStatusPoller::new(api(&server), PollerConfig::default());
    let result = poller.next_result("b1").await.unwrap();
    assert!(matches!(result.outcome, BundleOutcome::Rejected(_)));
}

#[tokio::test]
async fn http_searcher_sends_packets_and_cannot_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "sendBundle" })))
        .respond_with(ok(json!("bundle-http")))
        .expect(1)
        .mount(&server)
        .await;

    let searcher = HttpSearcher::new(api(&server));
    let bundle = Bundle::assemble(vec![tx(1), tx(2)]).unwrap();
    let id = searcher
        .send_bundle(&CallMetadata::new(), bundle.packets())
        .await
        .unwrap();
    assert_eq!(id, "bundle-http");

    let sent = bodies(&server).await;
    assert_eq!(
        sent[0]["params"][0],
        json!([tx(1).encode(Encoding::Base58), tx(2).encode(Encoding::Base58)])
    );

    let err = searcher
        .subscribe_bundle_results(&CallMetadata::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::Unsupported(_)));
}

// ─── sendTransaction ──────────────────────────────────────────────────────────

fn api_at(url: String) -> BundleApi {
    BundleApi::new(BundleApiConfig {
        url,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn bundle_only_transaction_reports_its_bundle_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/transactions"))
        .and(query_param("bundleOnly", "true"))
        .and(body_partial_json(json!({ "method": "sendTransaction" })))
        .respond_with(ok(json!("5sig")).insert_header("x-bundle-id", "bundle-tx-1"))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_at(format!("{}/api/v1/bundles", server.uri()));
    let receipt = api
        .send_transaction(&tx(3), Encoding::Base64, true)
        .await
        .unwrap();
    assert_eq!(receipt.signature, "5sig");
    assert_eq!(receipt.bundle_id.as_deref(), Some("bundle-tx-1"));

    let body = &bodies(&server).await[0];
    assert_eq!(body["params"][0], json!(tx(3).encode(Encoding::Base64)));
    assert_eq!(body["params"][1], json!({ "encoding": "base64" }));
}

#[tokio::test]
async fn plain_transaction_has_no_query_and_no_bundle_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/transactions"))
        .respond_with(ok(json!("5sig")))
        .mount(&server)
        .await;

    let api = api_at(format!("{}/api/v1/bundles", server.uri()));
    let receipt = api
        .send_transaction(&tx(3), Encoding::Base58, false)
        .await
        .unwrap();
    assert_eq!(receipt.bundle_id, None);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].url.query(), None);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["params"], json!([tx(3).encode(Encoding::Base58)]));
}

// ─── Proxy ────────────────────────────────────────────────────────────────────

/// A one-request forward proxy that answers itself; yields the request head.
async fn answering_proxy(result: &'static str) -> (ProxyConfig, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = format!("{}:alice:s3cret", listener.local_addr().unwrap())
        .parse()
        .unwrap();
    let handle = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            sock.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        let length: usize = head
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.trim().parse().unwrap())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        sock.read_exact(&mut body).await.unwrap();

        let reply = json!({ "jsonrpc": "2.0", "result": result, "id": 1 }).to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
            reply.len()
        );
        sock.write_all(response.as_bytes()).await.unwrap();
        head
    });
    (proxy, handle)
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim())
}

#[tokio::test]
async fn requests_go_through_the_configured_proxy_and_its_replacement() {
    let (first, first_head) = answering_proxy("via-first").await;
    let api = BundleApi::new(BundleApiConfig {
        url: "http://relay.test/api/v1/bundles".into(),
        http: HttpClientConfig {
            retry: RetryConfig::linear(0, Duration::from_millis(10)),
            proxy: Some(first),
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();

    let bundle = Bundle::assemble(vec![tx(1)]).unwrap();
    let id = api.send_bundle(&bundle, Encoding::Base58).await.unwrap();
    assert_eq!(id, "via-first");
    let head = first_head.await.unwrap();
    assert!(
        head.starts_with("POST http://relay.test/api/v1/bundles HTTP/1.1\r\n"),
        "{head}"
    );
    // base64("alice:s3cret")
    assert_eq!(header_value(&head, "proxy-authorization"), Some("Basic YWxpY2U6czNjcmV0"));

    let (second, second_head) = answering_proxy("via-second").await;
    api.rotate_proxy(Some(second)).unwrap();
    let id = api.send_bundle(&bundle, Encoding::Base58).await.unwrap();
    assert_eq!(id, "via-second");
    assert!(second_head.await.unwrap().starts_with("POST http://relay.test/"));
}

#[tokio::test]
async fn custom_transports_cannot_rotate_proxies_or_send_transactions() {
    let server = MockServer::start().await;
    let client = chainrelay_http::HttpRpcClient::default_for(server.uri()).unwrap();
    let api = BundleApi::with_transport(std::sync::Arc::new(client));

    assert!(matches!(api.rotate_proxy(None), Err(TransportError::Unsupported(_))));
    assert!(matches!(
        api.send_transaction(&tx(1), Encoding::Base58, true).await,
        Err(TransportError::Unsupported(_))
    ));
    assert!(server.received_requests().await.unwrap().is_empty());
}
