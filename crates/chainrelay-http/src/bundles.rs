//! The relay's JSON-RPC bundle API: `sendBundle`, `getBundleStatuses` and
//! `getInflightBundleStatuses`, plus `sendTransaction` on the sibling
//! `/transactions` endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chainrelay_core::bundle::{Bundle, MAX_BUNDLE_LEN};
use chainrelay_core::error::{RelayError, TransportError, ValidationError};
use chainrelay_core::ledger::ConfirmationStatus;
use chainrelay_core::proxy::ProxyConfig;
use chainrelay_core::request::JsonRpcRequest;
use chainrelay_core::transaction::{Encoding, Transaction};
use chainrelay_core::transport::RpcTransport;

use crate::client::{HttpClientConfig, HttpRpcClient};

pub const DEFAULT_BUNDLES_URL: &str = "https://mainnet.block-engine.jito.wtf/api/v1/bundles";

/// Response header carrying the id of the bundle a transaction was wrapped in.
pub const BUNDLE_ID_HEADER: &str = "x-bundle-id";

/// Most bundle ids one status call accepts.
pub const MAX_STATUS_IDS: usize = 5;

fn default_url() -> String {
    DEFAULT_BUNDLES_URL.to_string()
}

fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "User-Agent".to_string(),
        concat!("chainrelay/", env!("CARGO_PKG_VERSION")).to_string(),
    )])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleApiConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Merged over the HTTP client's own headers.
    #[serde(default = "default_headers")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub http: HttpClientConfig,
}

impl Default for BundleApiConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            headers: default_headers(),
            http: HttpClientConfig::default(),
        }
    }
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RpcContext {
    pub slot: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleStatus {
    pub bundle_id: String,
    /// Signatures of the bundle's transactions, base58.
    pub transactions: Vec<String>,
    pub slot: u64,
    pub confirmation_status: ConfirmationStatus,
    #[serde(default)]
    pub err: Value,
}

/// `getBundleStatuses` result; `None` for ids the relay does not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleStatuses {
    pub context: RpcContext,
    pub value: Vec<Option<BundleStatus>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InflightStatus {
    Invalid,
    Pending,
    Failed,
    Landed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InflightBundleStatus {
    pub bundle_id: String,
    pub status: InflightStatus,
    #[serde(default)]
    pub landed_slot: Option<u64>,
}

/// `getInflightBundleStatuses` result; covers roughly the last five minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InflightBundleStatuses {
    pub context: RpcContext,
    pub value: Vec<InflightBundleStatus>,
}

impl InflightBundleStatuses {
    pub fn find(&self, bundle_id: &str) -> Option<&InflightBundleStatus> {
        self.value.iter().find(|s| s.bundle_id == bundle_id)
    }
}

/// `sendTransaction` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    /// First signature of the transaction, base58.
    pub signature: String,
    /// Set when the relay wrapped the transaction in a bundle.
    pub bundle_id: Option<String>,
}

/// `.../api/v1/bundles` -> `.../api/v1/transactions`.
fn transactions_url(bundles_url: &str) -> String {
    let trimmed = bundles_url.trim_end_matches('/');
    let base = trimmed.strip_suffix("/bundles").unwrap_or(trimmed);
    format!("{base}/transactions")
}

// ─── Client ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BundleApi {
    transport: Arc<dyn RpcTransport>,
    /// Present when built over our own HTTP client.
    http: Option<Arc<HttpRpcClient>>,
}

impl BundleApi {
    /// Build over a fresh HTTP client for `config.url`.
    pub fn new(config: BundleApiConfig) -> Result<Self, TransportError> {
        let mut http = config.http;
        http.headers.extend(config.headers);
        let client = Arc::new(HttpRpcClient::new(config.url, http)?);
        Ok(Self {
            transport: client.clone(),
            http: Some(client),
        })
    }

    pub fn with_transport(transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            transport,
            http: None,
        }
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    fn http_client(&self, what: &str) -> Result<&HttpRpcClient, TransportError> {
        self.http
            .as_deref()
            .ok_or_else(|| TransportError::Unsupported(format!("{what} needs the built-in HTTP client")))
    }

    /// Route later requests through `proxy`, or directly when `None`.
    pub fn rotate_proxy(&self, proxy: Option<ProxyConfig>) -> Result<(), TransportError> {
        self.http_client("proxy rotation")?.rotate_proxy(proxy)
    }

    /// Submit one transaction. With `bundle_only` the relay only forwards it
    /// inside a bundle and reports that bundle's id. Not retried.
    pub async fn send_transaction(
        &self,
        tx: &Transaction,
        encoding: Encoding,
        bundle_only: bool,
    ) -> Result<TransactionReceipt, TransportError> {
        let http = self.http_client("sendTransaction")?;
        let mut url = transactions_url(self.url());
        if bundle_only {
            url.push_str("?bundleOnly=true");
        }
        let encoded = tx.encode(encoding);
        let params = match encoding {
            Encoding::Base58 => vec![json!(encoded)],
            Encoding::Base64 => vec![json!(encoded), json!({ "encoding": "base64" })],
        };

        let (headers, resp) = http
            .post(&url, &JsonRpcRequest::new(1, "sendTransaction", params))
            .await?;
        let result = resp.into_result().map_err(TransportError::Rpc)?;
        let signature: String = serde_json::from_value(result)?;
        let bundle_id = headers
            .get(BUNDLE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        tracing::info!(%signature, ?bundle_id, bundle_only, %encoding, "transaction sent over HTTP");
        Ok(TransactionReceipt {
            signature,
            bundle_id,
        })
    }

    /// Submit a validated bundle; returns the relay-assigned bundle id.
    pub async fn send_bundle(
        &self,
        bundle: &Bundle,
        encoding: Encoding,
    ) -> Result<String, TransportError> {
        let txs: Vec<String> = bundle
            .transactions()
            .iter()
            .map(|tx| tx.encode(encoding))
            .collect();
        let params = match encoding {
            Encoding::Base58 => vec![json!(txs)],
            Encoding::Base64 => vec![json!(txs), json!({ "encoding": "base64" })],
        };
        let bundle_id: String = self.call("sendBundle", params).await?;
        tracing::info!(%bundle_id, transactions = bundle.len(), %encoding, "bundle sent over HTTP");
        Ok(bundle_id)
    }

    pub async fn get_bundle_statuses(&self, ids: &[String]) -> Result<BundleStatuses, RelayError> {
        check_id_count(ids)?;
        Ok(self.call("getBundleStatuses", vec![json!(ids)]).await?)
    }

    pub async fn get_inflight_bundle_statuses(
        &self,
        ids: &[String],
    ) -> Result<InflightBundleStatuses, RelayError> {
        check_id_count(ids)?;
        Ok(self.call("getInflightBundleStatuses", vec![json!(ids)]).await?)
    }

    /// `get_bundle_statuses` over groups of five, in order. Stops at the
    /// first failing group.
    pub async fn batch_get_bundle_statuses(
        &self,
        ids: &[String],
    ) -> Result<Vec<BundleStatuses>, RelayError> {
        let mut out = Vec::with_capacity(ids.len().div_ceil(MAX_STATUS_IDS));
        for chunk in ids.chunks(MAX_STATUS_IDS) {
            out.push(self.get_bundle_statuses(chunk).await?);
        }
        Ok(out)
    }

    pub async fn batch_get_inflight_bundle_statuses(
        &self,
        ids: &[String],
    ) -> Result<Vec<InflightBundleStatuses>, RelayError> {
        let mut out = Vec::with_capacity(ids.len().div_ceil(MAX_STATUS_IDS));
        for chunk in ids.chunks(MAX_STATUS_IDS) {
            out.push(self.get_inflight_bundle_statuses(chunk).await?);
        }
        Ok(out)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError> {
        let resp = self.transport.send(JsonRpcRequest::new(1, method, params)).await?;
        let result = resp.into_result().map_err(TransportError::Rpc)?;
        Ok(serde_json::from_value(result)?)
    }
}

fn check_id_count(ids: &[String]) -> Result<(), ValidationError> {
    if ids.len() > MAX_STATUS_IDS {
        return Err(ValidationError::TooManyBundleIds {
            count: ids.len(),
            max: MAX_STATUS_IDS,
        });
    }
    Ok(())
}

// Bundles and status calls share the same cap.
const _: () = assert!(MAX_STATUS_IDS == MAX_BUNDLE_LEN);
