//! chainrelay-http: the relay's HTTP JSON-RPC surface.
//!
//! # Features
//! - [`HttpRpcClient`]: `reqwest` JSON-RPC transport with retry and default headers
//! - [`BundleApi`]: `sendBundle`, `getBundleStatuses`, `getInflightBundleStatuses`
//!   and their batched forms, `sendTransaction` with `bundleOnly`, and proxy
//!   rotation
//! - [`RpcLedger`]: `getSignatureStatuses` lookup for ledger confirmation
//! - [`HttpSearcher`] + [`InflightStatusPoller`]: a stream-free searcher and
//!   result source, so a bundle pipeline can run entirely over HTTP

pub mod bundles;
pub mod client;
pub mod ledger;
pub mod poller;
pub mod searcher;

pub use bundles::{
    BundleApi, BundleApiConfig, BundleStatus, BundleStatuses, InflightBundleStatus,
    InflightBundleStatuses, InflightStatus, RpcContext, TransactionReceipt, BUNDLE_ID_HEADER,
    DEFAULT_BUNDLES_URL, MAX_STATUS_IDS,
};
pub use client::{HttpClientConfig, HttpRpcClient};
pub use ledger::RpcLedger;
pub use poller::{InflightStatusPoller, PollerConfig};
pub use searcher::HttpSearcher;
