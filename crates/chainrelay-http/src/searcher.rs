//! `SearcherService` over the HTTP bundle API.
//!
//! HTTP has no result stream: `subscribe_bundle_results` fails with
//! `TransportError::Unsupported`. Pair this with `InflightStatusPoller` as the
//! pipeline's result source.

use async_trait::async_trait;

use chainrelay_core::bundle::Bundle;
use chainrelay_core::error::TransportError;
use chainrelay_core::relay::{BundleResultStream, CallMetadata, SearcherService};
use chainrelay_core::transaction::{Encoding, Packet, Transaction};

use crate::bundles::BundleApi;

pub struct HttpSearcher {
    api: BundleApi,
    encoding: Encoding,
}

impl HttpSearcher {
    pub fn new(api: BundleApi) -> Self {
        Self {
            api,
            encoding: Encoding::default(),
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }
}

#[async_trait]
impl SearcherService for HttpSearcher {
    async fn send_bundle(
        &self,
        _metadata: &CallMetadata,
        packets: Vec<Packet>,
    ) -> Result<String, TransportError> {
        let transactions = packets
            .iter()
            .map(Transaction::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransportError::Other(format!("undecodable packet: {e}")))?;
        let bundle = Bundle::assemble(transactions)
            .map_err(|e| TransportError::Other(format!("invalid bundle: {e}")))?;
        self.api.send_bundle(&bundle, self.encoding).await
    }

    async fn subscribe_bundle_results(
        &self,
        _metadata: &CallMetadata,
    ) -> Result<BundleResultStream, TransportError> {
        Err(TransportError::Unsupported(
            "bundle result streaming over HTTP".into(),
        ))
    }
}
