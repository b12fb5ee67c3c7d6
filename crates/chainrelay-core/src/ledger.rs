//! Read-only view of on-ledger signature status.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;
use crate::transaction::Signature;

/// Commitment level a signature has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    #[default]
    Unknown,
    Processed,
    Confirmed,
    Finalized,
}

impl ConfirmationStatus {
    /// `Finalized` implies `Confirmed`, so it counts too.
    pub fn is_landed(self) -> bool {
        matches!(self, Self::Processed | Self::Confirmed | Self::Finalized)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub slot: u64,
    #[serde(default)]
    pub confirmation_status: Option<ConfirmationStatus>,
    /// Execution error, if the transaction landed but failed.
    #[serde(default)]
    pub err: Option<Value>,
}

impl SignatureStatus {
    pub fn status(&self) -> ConfirmationStatus {
        self.confirmation_status.unwrap_or_default()
    }
}

/// `GetSignatureStatuses` against some ledger node.
#[async_trait]
pub trait SignatureStatusLookup: Send + Sync + 'static {
    /// One entry per requested signature, in order; `None` when the node has
    /// not seen it.
    async fn get_signature_statuses(
        &self,
        signatures: &[Signature],
    ) -> Result<Vec<Option<SignatureStatus>>, TransportError>;
}

/// `true` when there is a status for every signature and each one has landed.
pub fn all_landed(statuses: &[Option<SignatureStatus>]) -> bool {
    !statuses.is_empty()
        && statuses
            .iter()
            .all(|s| s.as_ref().is_some_and(|s| s.status().is_landed()))
}
