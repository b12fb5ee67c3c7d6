//! Bundles: ordered groups of signed transactions executed atomically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::transaction::{Packet, Signature, Transaction, PACKET_DATA_SIZE};

/// Most transactions the relay accepts in one bundle.
pub const MAX_BUNDLE_LEN: usize = 5;

/// A validated bundle. Only constructible through [`Bundle::assemble`], so
/// every instance satisfies the size limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    transactions: Vec<Transaction>,
}

impl Bundle {
    /// Validate `transactions` and wrap them. Pure; never touches the network.
    pub fn assemble(transactions: Vec<Transaction>) -> Result<Self, ValidationError> {
        if transactions.is_empty() {
            return Err(ValidationError::EmptyBundle);
        }
        if transactions.len() > MAX_BUNDLE_LEN {
            return Err(ValidationError::TooManyTransactions {
                count: transactions.len(),
                max: MAX_BUNDLE_LEN,
            });
        }
        for (index, tx) in transactions.iter().enumerate() {
            let size = tx.serialized_len();
            if size > PACKET_DATA_SIZE {
                return Err(ValidationError::TransactionTooLarge {
                    index,
                    size,
                    max: PACKET_DATA_SIZE,
                });
            }
            if tx.signature().is_none() {
                return Err(ValidationError::MissingSignature { index });
            }
        }
        Ok(Self { transactions })
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// First signature of each transaction, in bundle order.
    pub fn signatures(&self) -> Vec<Signature> {
        self.transactions
            .iter()
            .filter_map(|tx| tx.signature().copied())
            .collect()
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.transactions.iter().map(Packet::from).collect()
    }
}

/// The relay's immediate answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub bundle_id: String,
    pub submitted_at: DateTime<Utc>,
}
