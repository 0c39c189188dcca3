//! Token bucket state and the refill/consume math.
//!
//! Every backend funnels its reads and writes through [`apply`] and
//! [`refund`]. The Redis scripts in `distributed` mirror these two functions
//! operation for operation, so a given input history produces the same
//! decisions no matter where the bucket lives.

use serde::{Deserialize, Serialize};

/// Retry-After returned when a bucket never refills.
pub const RETRY_AFTER_FALLBACK_SECS: u64 = 60;

/// Capacity and refill rate of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens the bucket can hold
    pub capacity: f64,
    /// Tokens added per second of elapsed time
    pub refill_per_sec: f64,
}

impl TokenBucketConfig {
    /// Create a new bucket configuration.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// Milliseconds an empty bucket needs to become full again.
    ///
    /// Returns `None` when the bucket never refills.
    pub fn full_refill_ms(&self) -> Option<u64> {
        if self.refill_per_sec > 0.0 && self.refill_per_sec.is_finite() {
            Some((self.capacity / self.refill_per_sec * 1000.0).ceil() as u64)
        } else {
            None
        }
    }
}

/// Stored state of one bucket.
///
/// Serializes to the shared-store record layout `{"tokens":..,"lastRefillMs":..}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketState {
    /// Tokens available as of `last_refill_ms`
    pub tokens: f64,
    /// Epoch milliseconds of the last refill
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A freshly created bucket, full to capacity.
    pub fn full(config: &TokenBucketConfig, now_ms: u64) -> Self {
        Self {
            tokens: config.capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Parse a stored record.
    ///
    /// Anything that does not decode to a finite token count reads as absent,
    /// which callers turn into a full bucket.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        // Only objects; serde would otherwise accept `[tokens, lastRefillMs]`.
        let value: serde_json::Value = serde_json::from_slice(raw).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value::<BucketState>(value)
            .ok()
            .filter(|state| state.tokens.is_finite())
    }
}

/// Result of running [`apply`] once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Applied {
    /// Whether the cost was taken from the bucket
    pub allowed: bool,
    /// State to store back
    pub next: BucketState,
}

/// Refill `state` up to `now_ms` and try to take `cost` tokens from it.
///
/// A denied call still stores the refill; it just consumes nothing.
pub fn apply(state: &BucketState, config: &TokenBucketConfig, now_ms: u64, cost: f64) -> Applied {
    let elapsed_ms = now_ms.saturating_sub(state.last_refill_ms);
    let refill = (elapsed_ms as f64 / 1000.0) * config.refill_per_sec;
    let refilled = config.capacity.min(state.tokens.max(0.0) + refill);

    let (allowed, tokens) = if refilled >= cost {
        (true, refilled - cost)
    } else {
        (false, refilled)
    };

    Applied {
        allowed,
        next: BucketState {
            tokens,
            // A clock that stepped backwards must not rewind the bucket.
            last_refill_ms: state.last_refill_ms.max(now_ms),
        },
    }
}

/// Give `amount` tokens back to a bucket, clamped to `[0, capacity]`.
///
/// The refill timestamp is left alone.
pub fn refund(state: &BucketState, config: &TokenBucketConfig, amount: f64) -> BucketState {
    BucketState {
        tokens: config.capacity.min(state.tokens.max(0.0) + amount).max(0.0),
        last_refill_ms: state.last_refill_ms,
    }
}

/// Whole seconds until a bucket holding `tokens_remaining` can cover `cost`.
///
/// Never returns less than 1, so a denied caller never retries immediately.
pub fn retry_after(tokens_remaining: f64, cost: f64, refill_per_sec: f64) -> u64 {
    if refill_per_sec <= 0.0 || !refill_per_sec.is_finite() {
        return RETRY_AFTER_FALLBACK_SECS;
    }

    let deficit = (cost - tokens_remaining).max(0.0);
    let secs = (deficit / refill_per_sec).ceil();
    (secs as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: f64, refill_per_sec: f64) -> TokenBucketConfig {
        TokenBucketConfig::new(capacity, refill_per_sec)
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let cfg = config(10.0, 2.5);
        let mut state = BucketState::full(&cfg, 0);
        let mut now = 0u64;
        let mut seed = 0x2545_f491_u64;

        for _ in 0..2_000 {
            // xorshift keeps the sequence reproducible without a rand dependency
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            now += seed % 900;
            let cost = (seed % 4) as f64;

            state = apply(&state, &cfg, now, cost).next;
            assert!(state.tokens >= 0.0, "tokens went negative: {}", state.tokens);
            assert!(state.tokens <= cfg.capacity, "tokens exceeded capacity: {}", state.tokens);
        }
    }

    #[test]
    fn test_burst_then_deplete() {
        let cfg = config(7.5, 1.0);
        let mut state = BucketState::full(&cfg, 5_000);
        let mut allowed = 0;

        for _ in 0..12 {
            let applied = apply(&state, &cfg, 5_000, 1.0);
            state = applied.next;
            if applied.allowed {
                allowed += 1;
            } else {
                assert!(retry_after(state.tokens, 1.0, cfg.refill_per_sec) >= 1);
            }
        }

        assert_eq!(allowed, 7);
    }

    #[test]
    fn test_full_refill_after_idle() {
        let cfg = config(30.0, 5.0);
        let drained = BucketState {
            tokens: 0.0,
            last_refill_ms: 1_000,
        };
        let now = 1_000 + cfg.full_refill_ms().unwrap();

        let mut state = drained;
        for i in 0..30 {
            let applied = apply(&state, &cfg, now, 1.0);
            assert!(applied.allowed, "request {} should be allowed", i + 1);
            state = applied.next;
        }
        assert!(!apply(&state, &cfg, now, 1.0).allowed);
    }

    #[test]
    fn test_denied_call_keeps_refill() {
        let cfg = config(10.0, 2.0);
        let state = BucketState {
            tokens: 0.0,
            last_refill_ms: 0,
        };

        let applied = apply(&state, &cfg, 250, 1.0);
        assert!(!applied.allowed);
        assert_eq!(applied.next.tokens, 0.5);
        assert_eq!(applied.next.last_refill_ms, 250);
    }

    #[test]
    fn test_backwards_clock_does_not_rewind() {
        let cfg = config(10.0, 1.0);
        let state = BucketState {
            tokens: 3.0,
            last_refill_ms: 10_000,
        };

        let applied = apply(&state, &cfg, 4_000, 1.0);
        assert!(applied.allowed);
        assert_eq!(applied.next.tokens, 2.0);
        assert_eq!(applied.next.last_refill_ms, 10_000);
    }

    #[test]
    fn test_refund_clamps_to_capacity() {
        let cfg = config(5.0, 1.0);
        let state = BucketState {
            tokens: 4.5,
            last_refill_ms: 42,
        };

        let refunded = refund(&state, &cfg, 3.0);
        assert_eq!(refunded.tokens, 5.0);
        assert_eq!(refunded.last_refill_ms, 42);

        let refunded = refund(&BucketState { tokens: 1.0, last_refill_ms: 42 }, &cfg, 1.0);
        assert_eq!(refunded.tokens, 2.0);
    }

    #[test]
    fn test_retry_after() {
        assert_eq!(retry_after(0.0, 1.0, 3.0), 1);
        assert_eq!(retry_after(0.0, 10.0, 3.0), 4);
        assert_eq!(retry_after(0.5, 1.0, 0.25), 2);
        // Enough tokens yet denied elsewhere still waits at least a second
        assert_eq!(retry_after(5.0, 1.0, 3.0), 1);
        assert_eq!(retry_after(0.0, 1.0, 0.0), RETRY_AFTER_FALLBACK_SECS);
    }

    #[test]
    fn test_full_refill_ms() {
        assert_eq!(config(30.0, 5.0).full_refill_ms(), Some(6_000));
        assert_eq!(config(15.0, 3.0).full_refill_ms(), Some(5_000));
        assert_eq!(config(10.0, 0.0).full_refill_ms(), None);
    }

    #[test]
    fn test_state_record_layout() {
        let state = BucketState {
            tokens: 12.5,
            last_refill_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"tokens":12.5,"lastRefillMs":1700000000000}"#);

        assert_eq!(BucketState::decode(json.as_bytes()), Some(state));
    }

    #[test]
    fn test_decode_keeps_full_precision() {
        // Records written with 17 significant digits must read back bit-exact.
        let raw = br#"{"tokens":6.8289999999999988,"lastRefillMs":1700000000123}"#;
        let state = BucketState::decode(raw).unwrap();
        assert_eq!(state.tokens, "6.8289999999999988".parse::<f64>().unwrap());
        assert_eq!(state.last_refill_ms, 1_700_000_000_123);

        for tokens in [1.0 / 3.0, 0.1 + 0.2, 14.999999999999998, 2999.0000000000005] {
            let raw = format!(r#"{{"tokens":{:.16e},"lastRefillMs":0}}"#, tokens);
            assert_eq!(BucketState::decode(raw.as_bytes()).unwrap().tokens, tokens);
        }
    }

    #[test]
    fn test_corrupt_state_reads_as_absent() {
        assert_eq!(BucketState::decode(b"not json"), None);
        assert_eq!(BucketState::decode(br#"{"tokens":"many"}"#), None);
        assert_eq!(BucketState::decode(br#"{"tokens":1.0}"#), None);
        assert_eq!(BucketState::decode(b""), None);
        assert_eq!(BucketState::decode(b"[1.0, 2]"), None);
    }
}
