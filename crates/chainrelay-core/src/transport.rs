//! The `RpcTransport` trait: the abstraction the HTTP bundle API and the
//! ledger lookup are written against.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// An async JSON-RPC transport.
///
/// Implementations must be `Send + Sync` for use across Tokio tasks; the
/// trait is object-safe and can be stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Return the transport's identifier (URL or name).
    fn url(&self) -> &str;

    /// Convenience: call a method and deserialize the result.
    async fn call<T: DeserializeOwned>(
        &self,
        id: u64,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError>
    where
        Self: Sized,
    {
        let req = JsonRpcRequest::new(id, method, params);
        let resp = self.send(req).await?;
        let result = resp.into_result().map_err(TransportError::Rpc)?;
        serde_json::from_value(result).map_err(TransportError::Deserialization)
    }
}

#[async_trait]
impl<T: RpcTransport + ?Sized> RpcTransport for std::sync::Arc<T> {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        (**self).send(req).await
    }

    fn url(&self) -> &str {
        (**self).url()
    }
}
