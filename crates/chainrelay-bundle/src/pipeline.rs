//! Bundle submission and confirmation.
//!
//! ```text
//! Submitted -> AwaitingResult -+-> Accepted -> AwaitingLedgerConfirmation -> Confirmed
//!                              |                          |
//!                              +-> Rejected               +-> TimedOut
//! ```
//!
//! `AwaitingResult` retries transient receive errors a bounded number of times
//! and is capped by `result_timeout`. `AwaitingLedgerConfirmation` sleeps one
//! poll interval, then looks up every signature; it succeeds once all of them
//! have landed and times out once the elapsed wait reaches the bound, even if
//! a lookup is still running. Ledger lookup errors, and lookups that do not
//! answer for every signature, are returned as-is, without retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use chainrelay_core::bundle::{Bundle, SubmissionReceipt};
use chainrelay_core::error::{
    ConfirmError, RejectionError, RelayError, TimeoutError, TransportError, ValidationError,
};
use chainrelay_core::ledger::{all_landed, SignatureStatus, SignatureStatusLookup};
use chainrelay_core::policy::{RetryConfig, RetryPolicy};
use chainrelay_core::relay::{CallCredentials, SearcherService};
use chainrelay_core::result::{BundleOutcome, BundleResult, BundleResultSource, ConfirmPhase};
use chainrelay_core::transaction::Transaction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bound on `AwaitingLedgerConfirmation`.
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bound on `AwaitingResult`, across all receive retries.
    #[serde(default = "default_result_timeout_ms")]
    pub result_timeout_ms: u64,
    /// Retry policy for transient errors while receiving the result.
    #[serde(default = "default_result_retry")]
    pub result_retry: RetryConfig,
}

fn default_confirm_timeout_ms() -> u64 {
    15_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_result_timeout_ms() -> u64 {
    30_000
}
fn default_result_retry() -> RetryConfig {
    RetryConfig::default()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: default_confirm_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            result_timeout_ms: default_result_timeout_ms(),
            result_retry: default_result_retry(),
        }
    }
}

impl PipelineConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }
}

/// A bundle that landed.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub bundle_id: String,
    /// Slot the relay reported when accepting the bundle.
    pub accepted_slot: u64,
    /// Ledger status of each signature, in bundle order.
    pub statuses: Vec<SignatureStatus>,
    /// Time spent in `AwaitingLedgerConfirmation`.
    pub ledger_wait: Duration,
}

pub struct BundlePipeline {
    searcher: Arc<dyn SearcherService>,
    credentials: Arc<dyn CallCredentials>,
    results: Arc<dyn BundleResultSource>,
    ledger: Arc<dyn SignatureStatusLookup>,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl BundlePipeline {
    pub fn new(
        searcher: Arc<dyn SearcherService>,
        credentials: Arc<dyn CallCredentials>,
        results: Arc<dyn BundleResultSource>,
        ledger: Arc<dyn SignatureStatusLookup>,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            searcher,
            credentials,
            results,
            ledger,
            config,
            cancel,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate transactions into a bundle. Never touches the network.
    pub fn assemble(&self, transactions: Vec<Transaction>) -> Result<Bundle, ValidationError> {
        Bundle::assemble(transactions)
    }

    /// Send the bundle's packets in one call and return the relay's receipt.
    pub async fn submit(&self, bundle: &Bundle) -> Result<SubmissionReceipt, TransportError> {
        let metadata = self.credentials.metadata();
        let bundle_id = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
            r = self.searcher.send_bundle(&metadata, bundle.packets()) => r?,
        };
        tracing::info!(%bundle_id, transactions = bundle.len(), "bundle submitted");
        Ok(SubmissionReceipt {
            bundle_id,
            submitted_at: Utc::now(),
        })
    }

    /// Drive a submitted bundle to a terminal state. `timeout` overrides the
    /// configured ledger confirmation bound.
    pub async fn confirm(
        &self,
        bundle: &Bundle,
        receipt: &SubmissionReceipt,
        timeout: Option<Duration>,
    ) -> Result<Confirmation, ConfirmError> {
        let bundle_id = receipt.bundle_id.as_str();
        tracing::debug!(bundle_id, phase = %ConfirmPhase::AwaitingResult, "confirming bundle");

        let result = self.await_result(bundle_id).await?;
        let slot = match result.outcome {
            BundleOutcome::Accepted { slot, .. } => slot,
            BundleOutcome::Rejected(reason) => {
                tracing::info!(bundle_id, %reason, phase = %ConfirmPhase::Rejected, "bundle rejected");
                return Err(RejectionError {
                    bundle_id: bundle_id.to_string(),
                    reason,
                }
                .into());
            }
        };

        tracing::debug!(
            bundle_id,
            slot,
            phase = %ConfirmPhase::AwaitingLedgerConfirmation,
            "bundle accepted"
        );
        let bound = timeout.unwrap_or_else(|| self.config.confirm_timeout());
        let (statuses, ledger_wait) = self.await_ledger(bundle_id, bundle, bound).await?;
        tracing::info!(bundle_id, ?ledger_wait, phase = %ConfirmPhase::Confirmed, "bundle landed");

        Ok(Confirmation {
            bundle_id: bundle_id.to_string(),
            accepted_slot: slot,
            statuses,
            ledger_wait,
        })
    }

    /// `assemble`, `submit` and `confirm` in one call.
    pub async fn send_and_confirm(
        &self,
        transactions: Vec<Transaction>,
    ) -> Result<Confirmation, RelayError> {
        let bundle = self.assemble(transactions)?;
        let receipt = self.submit(&bundle).await?;
        Ok(self.confirm(&bundle, &receipt, None).await?)
    }

    async fn await_result(&self, bundle_id: &str) -> Result<BundleResult, ConfirmError> {
        let bound = self.config.result_timeout();
        let deadline = Instant::now() + bound;
        let timed_out = || TimeoutError {
            bundle_id: bundle_id.to_string(),
            phase: ConfirmPhase::AwaitingResult,
            bound,
        };
        let policy = RetryPolicy::new(self.config.result_retry.clone());
        let mut attempt: u32 = 0;

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConfirmError::Cancelled),
                r = tokio::time::timeout_at(deadline, self.results.next_result(bundle_id)) => r,
            };
            let err = match received {
                Err(_) => return Err(timed_out().into()),
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(e)) => e,
            };

            attempt += 1;
            let delay = match policy.next_delay(attempt) {
                Some(delay) if err.is_retryable() => delay,
                _ => {
                    tracing::error!(bundle_id, error = %err, attempt, "giving up on bundle result");
                    return Err(ConfirmError::Result(err));
                }
            };
            tracing::warn!(bundle_id, error = %err, attempt, ?delay, "bundle result receive failed, retrying");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConfirmError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(timed_out().into()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn await_ledger(
        &self,
        bundle_id: &str,
        bundle: &Bundle,
        bound: Duration,
    ) -> Result<(Vec<SignatureStatus>, Duration), ConfirmError> {
        let signatures = bundle.signatures();
        let interval = self.config.poll_interval();
        let started = Instant::now();
        let deadline = started + bound;
        let timed_out = |polls: u32| {
            tracing::warn!(bundle_id, polls, ?bound, phase = %ConfirmPhase::TimedOut, "ledger confirmation timed out");
            ConfirmError::from(TimeoutError {
                bundle_id: bundle_id.to_string(),
                phase: ConfirmPhase::AwaitingLedgerConfirmation,
                bound,
            })
        };
        let mut polls: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConfirmError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }

            // A lookup still running at the deadline counts as not landed.
            let looked_up = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConfirmError::Cancelled),
                r = tokio::time::timeout_at(deadline, self.ledger.get_signature_statuses(&signatures)) => r,
            };
            polls += 1;
            let statuses = match looked_up {
                Err(_) => return Err(timed_out(polls)),
                Ok(r) => r.map_err(ConfirmError::Ledger)?,
            };
            if statuses.len() != signatures.len() {
                return Err(ConfirmError::Ledger(TransportError::Other(format!(
                    "ledger returned {} statuses for {} signatures",
                    statuses.len(),
                    signatures.len()
                ))));
            }

            if all_landed(&statuses) {
                return Ok((statuses.into_iter().flatten().collect(), started.elapsed()));
            }

            let elapsed = started.elapsed();
            if elapsed >= bound {
                return Err(timed_out(polls));
            }
            tracing::debug!(bundle_id, polls, ?elapsed, "signatures not landed yet");
        }
    }
}
