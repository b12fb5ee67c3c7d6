//! Retry policy for the reconnect, refresh and result-receive loops.

pub mod retry;

pub use retry::{Backoff, RetryConfig, RetryPolicy};
