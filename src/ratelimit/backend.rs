//! Bucket backend trait for abstracting local and distributed stores.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::bucket::{BucketState, TokenBucketConfig};
use super::key::ScopeKey;

/// Errors a backend reports instead of a decision.
///
/// Every variant means the store could not be trusted for this call; the
/// limiter treats them all as "unavailable" and falls back.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
    #[error("unexpected backend reply: {0}")]
    Protocol(String),
}

/// Outcome of one atomic consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    /// Whether the cost was taken
    pub allowed: bool,
    /// Tokens left in the bucket after the call
    pub tokens_remaining: f64,
}

/// Trait for bucket store implementations.
///
/// Implementations decide where state lives and how a single key is kept
/// from interleaving; the math always comes from `bucket::apply` and
/// `bucket::refund` (or a script that mirrors them exactly).
#[async_trait]
pub trait BucketBackend: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &'static str;

    /// Whether operations cross the network.
    fn is_shared(&self) -> bool {
        false
    }

    /// Refill the bucket at `key` and try to take `cost` from it, atomically.
    ///
    /// Missing or unreadable state starts out as a full bucket.
    async fn try_consume(
        &self,
        key: &ScopeKey,
        config: &TokenBucketConfig,
        cost: f64,
        now_ms: u64,
    ) -> Result<ConsumeOutcome, BackendError>;

    /// Atomically add `amount` tokens to the bucket at `key`, clamped to capacity.
    ///
    /// A missing bucket is left missing; it already reads as full.
    async fn add_tokens(
        &self,
        key: &ScopeKey,
        amount: f64,
        config: &TokenBucketConfig,
        now_ms: u64,
    ) -> Result<(), BackendError>;

    /// Read the stored state without changing it.
    async fn peek(&self, key: &ScopeKey) -> Result<Option<BucketState>, BackendError>;
}
