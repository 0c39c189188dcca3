//! In-process bucket store.
//!
//! This is the leaf of the fallback chain: it never reports unavailable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{BackendError, BucketBackend, ConsumeOutcome};
use super::bucket::{self, BucketState, TokenBucketConfig};
use super::key::ScopeKey;
use crate::clock::Clock;

/// Default idle time after which a local bucket is dropped.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(3600);

/// Bucket store backed by a sharded concurrent map.
///
/// Every operation on a key runs while holding that key's map entry, so two
/// operations on the same key never interleave.
#[derive(Debug)]
pub struct LocalBackend {
    /// Bucket state indexed by scope key
    buckets: DashMap<ScopeKey, BucketState>,
    /// Idle time after which a bucket may be evicted
    idle_ttl: Duration,
}

impl LocalBackend {
    /// Create a new local backend with the default idle TTL.
    pub fn new() -> Self {
        Self::with_idle_ttl(DEFAULT_IDLE_TTL)
    }

    /// Create a new local backend that evicts buckets idle for `idle_ttl`.
    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            idle_ttl,
        }
    }

    /// Refill and consume against the bucket at `key`.
    pub fn consume(
        &self,
        key: &ScopeKey,
        config: &TokenBucketConfig,
        cost: f64,
        now_ms: u64,
    ) -> ConsumeOutcome {
        let applied = match self.buckets.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let applied = bucket::apply(entry.get(), config, now_ms, cost);
                entry.insert(applied.next);
                applied
            }
            Entry::Vacant(entry) => {
                debug!(key = %key, capacity = config.capacity, "Creating local bucket");
                let applied = bucket::apply(&BucketState::full(config, now_ms), config, now_ms, cost);
                entry.insert(applied.next);
                applied
            }
        };

        trace!(
            key = %key,
            allowed = applied.allowed,
            tokens = applied.next.tokens,
            "Local consume"
        );

        ConsumeOutcome {
            allowed: applied.allowed,
            tokens_remaining: applied.next.tokens,
        }
    }

    /// Return `amount` tokens to the bucket at `key`, if it exists.
    pub fn refund(&self, key: &ScopeKey, amount: f64, config: &TokenBucketConfig) {
        if let Some(mut state) = self.buckets.get_mut(key) {
            let next = bucket::refund(&state, config, amount);
            *state = next;
            trace!(key = %key, tokens = state.tokens, "Local refund");
        }
    }

    /// Get a copy of the stored state for `key`.
    pub fn state(&self, key: &ScopeKey) -> Option<BucketState> {
        self.buckets.get(key).map(|state| *state)
    }

    /// Drop buckets that have not been refilled for longer than the idle TTL.
    ///
    /// Returns the number of evicted buckets.
    pub fn evict_idle(&self, now_ms: u64) -> usize {
        let ttl_ms = u64::try_from(self.idle_ttl.as_millis()).unwrap_or(u64::MAX);
        let before = self.buckets.len();
        self.buckets
            .retain(|_, state| now_ms.saturating_sub(state.last_refill_ms) < ttl_ms);
        let evicted = before.saturating_sub(self.buckets.len());

        if evicted > 0 {
            debug!(evicted = evicted, remaining = self.buckets.len(), "Evicted idle local buckets");
        }
        evicted
    }

    /// Periodically evict idle buckets on the tokio runtime.
    pub fn spawn_sweeper(self: Arc<Self>, clock: Arc<dyn Clock>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.evict_idle(clock.now_millis());
            }
        })
    }

    /// Number of tracked buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no buckets are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    #[cfg(test)]
    pub(crate) fn seed(&self, key: &ScopeKey, state: BucketState) {
        self.buckets.insert(key.clone(), state);
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn try_consume(
        &self,
        key: &ScopeKey,
        config: &TokenBucketConfig,
        cost: f64,
        now_ms: u64,
    ) -> Result<ConsumeOutcome, BackendError> {
        Ok(self.consume(key, config, cost, now_ms))
    }

    async fn add_tokens(
        &self,
        key: &ScopeKey,
        amount: f64,
        config: &TokenBucketConfig,
        _now_ms: u64,
    ) -> Result<(), BackendError> {
        self.refund(key, amount, config);
        Ok(())
    }

    async fn peek(&self, key: &ScopeKey) -> Result<Option<BucketState>, BackendError> {
        Ok(self.state(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn free_org() -> TokenBucketConfig {
        TokenBucketConfig::new(30.0, 5.0)
    }

    #[test]
    fn test_local_backend_creation() {
        let backend = LocalBackend::new();
        assert!(backend.is_empty());
        assert_eq!(backend.name(), "local");
        assert!(!backend.is_shared());
    }

    #[test]
    fn test_first_consume_starts_full() {
        let backend = LocalBackend::new();
        let key = ScopeKey::organization("acme");

        let outcome = backend.consume(&key, &free_org(), 1.0, 1_000);
        assert!(outcome.allowed);
        assert_eq!(outcome.tokens_remaining, 29.0);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_consume_matches_bucket_math() {
        let backend = LocalBackend::new();
        let cfg = TokenBucketConfig::new(4.0, 2.0);
        let key = ScopeKey::region("acme", "eu");

        let mut state = BucketState::full(&cfg, 0);
        for (now, cost) in [(0, 3.0), (100, 2.0), (700, 1.0), (700, 0.5), (5_000, 4.0), (4_000, 1.0)] {
            let expected = bucket::apply(&state, &cfg, now, cost);
            state = expected.next;

            let outcome = backend.consume(&key, &cfg, cost, now);
            assert_eq!(outcome.allowed, expected.allowed);
            assert_eq!(outcome.tokens_remaining, expected.next.tokens);
            assert_eq!(backend.state(&key), Some(expected.next));
        }
    }

    #[test]
    fn test_separate_keys_have_separate_buckets() {
        let backend = LocalBackend::new();
        let cfg = TokenBucketConfig::new(2.0, 0.0);

        backend.consume(&ScopeKey::organization("a"), &cfg, 2.0, 0);
        let outcome = backend.consume(&ScopeKey::organization("b"), &cfg, 2.0, 0);

        assert!(outcome.allowed);
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn test_refund_restores_tokens() {
        let backend = LocalBackend::new();
        let key = ScopeKey::organization("acme");

        backend.consume(&key, &free_org(), 5.0, 0);
        backend.refund(&key, 5.0, &free_org());
        assert_eq!(backend.state(&key).unwrap().tokens, 30.0);

        // Refunds never overflow capacity
        backend.refund(&key, 5.0, &free_org());
        assert_eq!(backend.state(&key).unwrap().tokens, 30.0);
    }

    #[test]
    fn test_refund_missing_bucket_is_noop() {
        let backend = LocalBackend::new();
        let key = ScopeKey::organization("ghost");

        backend.refund(&key, 1.0, &free_org());
        assert!(backend.state(&key).is_none());
        assert!(backend.is_empty());
    }

    #[test]
    fn test_trait_calls_go_through_same_state() {
        let backend = LocalBackend::new();
        let key = ScopeKey::organization("acme");
        let cfg = free_org();

        let outcome = tokio_test::block_on(backend.try_consume(&key, &cfg, 10.0, 0)).unwrap();
        assert_eq!(outcome.tokens_remaining, 20.0);

        tokio_test::block_on(backend.add_tokens(&key, 4.0, &cfg, 0)).unwrap();
        let state = tokio_test::block_on(backend.peek(&key)).unwrap().unwrap();
        assert_eq!(state.tokens, 24.0);
    }

    #[test]
    fn test_evict_idle() {
        let backend = LocalBackend::with_idle_ttl(Duration::from_secs(60));
        let cfg = free_org();

        backend.consume(&ScopeKey::organization("stale"), &cfg, 1.0, 0);
        backend.consume(&ScopeKey::organization("fresh"), &cfg, 1.0, 50_000);

        assert_eq!(backend.evict_idle(59_999), 0);
        assert_eq!(backend.evict_idle(60_000), 1);
        assert!(backend.state(&ScopeKey::organization("stale")).is_none());
        assert!(backend.state(&ScopeKey::organization("fresh")).is_some());

        // An evicted bucket comes back full
        let outcome = backend.consume(&ScopeKey::organization("stale"), &cfg, 1.0, 60_000);
        assert_eq!(outcome.tokens_remaining, 29.0);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_in_background() {
        let backend = Arc::new(LocalBackend::with_idle_ttl(Duration::from_millis(10)));
        let clock = Arc::new(ManualClock::new(0));

        backend.consume(&ScopeKey::organization("acme"), &free_org(), 1.0, 0);
        clock.set(1_000);

        let handle = backend
            .clone()
            .spawn_sweeper(clock.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(backend.is_empty());
    }

    #[test]
    fn test_clear() {
        let backend = LocalBackend::new();
        backend.consume(&ScopeKey::organization("acme"), &free_org(), 1.0, 0);
        backend.clear();
        assert!(backend.is_empty());
    }
}
