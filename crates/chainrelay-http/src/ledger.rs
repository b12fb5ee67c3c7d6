//! `getSignatureStatuses` against a ledger JSON-RPC node.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use chainrelay_core::error::TransportError;
use chainrelay_core::ledger::{SignatureStatus, SignatureStatusLookup};
use chainrelay_core::request::JsonRpcRequest;
use chainrelay_core::transaction::Signature;
use chainrelay_core::transport::RpcTransport;

use crate::client::HttpRpcClient;

#[derive(Debug, Deserialize)]
struct StatusesResult {
    value: Vec<Option<SignatureStatus>>,
}

pub struct RpcLedger {
    transport: Arc<dyn RpcTransport>,
}

impl RpcLedger {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self { transport }
    }

    /// Ledger lookup over a default HTTP client for `url`.
    pub fn http(url: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self::new(Arc::new(HttpRpcClient::default_for(url)?)))
    }
}

#[async_trait]
impl SignatureStatusLookup for RpcLedger {
    async fn get_signature_statuses(
        &self,
        signatures: &[Signature],
    ) -> Result<Vec<Option<SignatureStatus>>, TransportError> {
        let sigs: Vec<String> = signatures.iter().map(ToString::to_string).collect();
        let req = JsonRpcRequest::new(
            1,
            "getSignatureStatuses",
            vec![json!(sigs), json!({ "searchTransactionHistory": false })],
        );
        let result = self
            .transport
            .send(req)
            .await?
            .into_result()
            .map_err(TransportError::Rpc)?;
        let statuses: StatusesResult = serde_json::from_value(result)?;

        if statuses.value.len() != signatures.len() {
            return Err(TransportError::Other(format!(
                "getSignatureStatuses returned {} entries for {} signatures",
                statuses.value.len(),
                signatures.len()
            )));
        }
        tracing::debug!(
            requested = signatures.len(),
            seen = statuses.value.iter().flatten().count(),
            "signature statuses fetched"
        );
        Ok(statuses.value)
    }
}
