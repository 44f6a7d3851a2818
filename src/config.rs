//! Configuration options.
//!
//! Plain option structs constructed by the embedder — loading them from a
//! CLI or config file is out of scope for this crate.

use std::time::Duration;

/// Options governing the [`crate::check_cache::CheckCache`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOptions {
    /// Soft cap on cache entries. `0` disables the cache entirely.
    pub num_entries: usize,
    /// Expiration window applied to cache entries lacking a narrower
    /// server-supplied `valid_duration`.
    pub expiration_ms: u64,
    /// On RPC failure, whether to fail open (grant) or closed (deny).
    pub network_fail_open: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            num_entries: 10_000,
            expiration_ms: 1_000,
            network_fail_open: false,
        }
    }
}

impl CheckOptions {
    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }
}

/// Options governing the [`crate::quota::cache::QuotaCache`] and each
/// [`crate::quota::QuotaPrefetch`] instance it creates.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaOptions {
    pub num_entries: usize,
    pub expiration_ms: u64,
    /// Lower bound on a speculative prefetch amount, avoiding chatter on
    /// low-rate quotas.
    pub prefetch_min: i64,
    /// Sliding window (grant count) used to estimate server rate.
    pub prefetch_window: usize,
}

impl Default for QuotaOptions {
    fn default() -> Self {
        Self {
            num_entries: 10_000,
            expiration_ms: 1_000,
            prefetch_min: 10,
            prefetch_window: 10,
        }
    }
}

impl QuotaOptions {
    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }
}

/// Options governing the [`crate::report::ReportBatch`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportOptions {
    pub max_batch_entries: usize,
    pub max_batch_time_ms: u64,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            max_batch_entries: 1_000,
            max_batch_time_ms: 1_000,
        }
    }
}

impl ReportOptions {
    pub fn max_batch_time(&self) -> Duration {
        Duration::from_millis(self.max_batch_time_ms)
    }
}

/// Top-level options bundle for constructing a [`crate::Client`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientOptions {
    pub check: CheckOptions,
    pub quota: QuotaOptions,
    pub report: ReportOptions,
}
