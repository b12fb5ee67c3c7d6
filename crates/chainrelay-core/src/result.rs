//! Bundle outcomes as reported by the relay.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// The relay's verdict on one submitted bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleResult {
    pub bundle_id: String,
    pub outcome: BundleOutcome,
}

impl BundleResult {
    pub fn accepted(bundle_id: impl Into<String>, slot: u64) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            outcome: BundleOutcome::Accepted {
                slot,
                validator_identity: None,
            },
        }
    }

    pub fn rejected(bundle_id: impl Into<String>, reason: RejectionReason) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            outcome: BundleOutcome::Rejected(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BundleOutcome {
    /// Forwarded to the leader; landing still has to be checked on-ledger.
    Accepted {
        slot: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validator_identity: Option<String>,
    },
    Rejected(RejectionReason),
}

/// Why the relay refused a bundle. Closed set; match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// A transaction failed simulation.
    SimulationFailure { tx_signature: String, msg: String },
    /// Lost the state auction for its write-locked accounts.
    StateAuctionBidRejected {
        auction_id: String,
        simulated_bid_lamports: u64,
    },
    /// Won the state auction but lost the global auction.
    WinningBatchBidRejected {
        auction_id: String,
        simulated_bid_lamports: u64,
    },
    InternalError { msg: String },
    /// Expired, or the leader never received it.
    DroppedBundle { msg: String },
}

impl RejectionReason {
    /// `true` when resubmitting with a higher tip may win next time.
    pub fn should_bump_tip(&self) -> bool {
        matches!(
            self,
            Self::StateAuctionBidRejected { .. } | Self::WinningBatchBidRejected { .. }
        )
    }

    /// `true` when resubmitting the same transactions unchanged is pointless.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::SimulationFailure { .. })
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SimulationFailure { tx_signature, msg } => {
                write!(f, "bundle simulation failure on tx {tx_signature}, message: {msg}")
            }
            Self::StateAuctionBidRejected {
                auction_id,
                simulated_bid_lamports,
            } => write!(
                f,
                "bundle lost state auction, auction: {auction_id}, tip {simulated_bid_lamports} lamports"
            ),
            Self::WinningBatchBidRejected {
                auction_id,
                simulated_bid_lamports,
            } => write!(
                f,
                "bundle won state auction but failed global auction, auction {auction_id}, tip {simulated_bid_lamports} lamports"
            ),
            Self::InternalError { msg } => write!(f, "internal error {msg}"),
            Self::DroppedBundle { msg } => write!(f, "bundle dropped {msg}"),
        }
    }
}

/// Where a bundle is in its confirmation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmPhase {
    Submitted,
    AwaitingResult,
    AwaitingLedgerConfirmation,
    Confirmed,
    Rejected,
    TimedOut,
}

impl ConfirmPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected | Self::TimedOut)
    }
}

impl fmt::Display for ConfirmPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::AwaitingResult => "awaiting result",
            Self::AwaitingLedgerConfirmation => "awaiting ledger confirmation",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// Anything that can deliver the verdict for a given bundle id: the streaming
/// result feed, or a polling fallback over HTTP.
#[async_trait]
pub trait BundleResultSource: Send + Sync + 'static {
    /// Wait for the result of `bundle_id`. Returns a transport error if the
    /// source failed before the verdict arrived; callers may retry.
    async fn next_result(&self, bundle_id: &str) -> Result<BundleResult, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auction_rejections_suggest_tip_bump() {
        let lost = RejectionReason::StateAuctionBidRejected {
            auction_id: "a-42".into(),
            simulated_bid_lamports: 10_000,
        };
        assert!(lost.should_bump_tip());
        assert!(!lost.is_permanent());
        assert_eq!(
            lost.to_string(),
            "bundle lost state auction, auction: a-42, tip 10000 lamports"
        );

        let sim = RejectionReason::SimulationFailure {
            tx_signature: "SIG1".into(),
            msg: "insufficient funds".into(),
        };
        assert!(!sim.should_bump_tip());
        assert!(sim.is_permanent());
    }

    #[test]
    fn outcome_json_shape() {
        let r = BundleResult::rejected(
            "b1",
            RejectionReason::DroppedBundle {
                msg: "expired".into(),
            },
        );
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["outcome"]["status"], "rejected");
        assert_eq!(v["outcome"]["kind"], "dropped_bundle");
        assert_eq!(v["outcome"]["msg"], "expired");
    }

    #[test]
    fn terminal_phases() {
        assert!(ConfirmPhase::TimedOut.is_terminal());
        assert!(!ConfirmPhase::AwaitingResult.is_terminal());
        assert_eq!(
            ConfirmPhase::AwaitingLedgerConfirmation.to_string(),
            "awaiting ledger confirmation"
        );
    }
}
