//! chainrelay-bundle: bundle submission, result tracking and ledger
//! confirmation.
//!
//! # Overview
//!
//! - [`BundlePipeline`]: `assemble` → `submit` → `confirm`, classifying the
//!   relay's verdict and reconciling it against ledger state
//! - [`ResultFeed`]: background subscription to the relay's result stream,
//!   routing each result to the caller waiting on that bundle
//! - [`RelayClient`]: composes supervisor, session, feed and pipeline under a
//!   single cancellation token

pub mod client;
pub mod pipeline;
pub mod results;

pub use client::{ClientConfig, RelayClient, RelayParts};
pub use pipeline::{BundlePipeline, Confirmation, PipelineConfig};
pub use results::{ResultFeed, ResultFeedConfig};
