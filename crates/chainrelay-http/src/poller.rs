//! Bundle results by polling `getInflightBundleStatuses`, for pipelines that
//! have no result stream.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chainrelay_core::error::{RelayError, TransportError};
use chainrelay_core::result::{BundleResult, BundleResultSource, RejectionReason};

use crate::bundles::{BundleApi, InflightBundleStatuses, InflightStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PollerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub struct InflightStatusPoller {
    api: BundleApi,
    config: PollerConfig,
}

impl InflightStatusPoller {
    pub fn new(api: BundleApi, config: PollerConfig) -> Self {
        Self { api, config }
    }
}

/// `None` while the bundle is still pending or not yet visible.
fn classify(statuses: &InflightBundleStatuses, bundle_id: &str) -> Option<BundleResult> {
    let status = statuses.find(bundle_id)?;
    match status.status {
        InflightStatus::Pending => None,
        InflightStatus::Landed => Some(BundleResult::accepted(
            bundle_id,
            status.landed_slot.unwrap_or(statuses.context.slot),
        )),
        InflightStatus::Failed => Some(BundleResult::rejected(
            bundle_id,
            RejectionReason::DroppedBundle {
                msg: "bundle failed to land".into(),
            },
        )),
        InflightStatus::Invalid => Some(BundleResult::rejected(
            bundle_id,
            RejectionReason::DroppedBundle {
                msg: "bundle is invalid".into(),
            },
        )),
    }
}

#[async_trait]
impl BundleResultSource for InflightStatusPoller {
    /// Polls until the bundle leaves `Pending`. Runs until a verdict or an
    /// error; callers bound it with their own timeout.
    async fn next_result(&self, bundle_id: &str) -> Result<BundleResult, TransportError> {
        let ids = [bundle_id.to_string()];
        let mut polls: u32 = 0;
        loop {
            let statuses = self
                .api
                .get_inflight_bundle_statuses(&ids)
                .await
                .map_err(|e| match e {
                    RelayError::Transport(e) => e,
                    other => TransportError::Other(other.to_string()),
                })?;
            polls += 1;

            if let Some(result) = classify(&statuses, bundle_id) {
                tracing::debug!(bundle_id, polls, outcome = ?result.outcome, "in-flight status resolved");
                return Ok(result);
            }
            tracing::debug!(bundle_id, polls, "bundle still pending");
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}
