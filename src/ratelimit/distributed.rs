//! Distributed bucket store backed by Redis.
//!
//! Each operation runs as one Lua script on the Redis server, so concurrent
//! gateway processes working on the same key are linearized by Redis itself
//! and never race on a read-modify-write. The consume script is a line for
//! line port of `bucket::apply`; the refund script mirrors `bucket::refund`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Script;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::backend::{BackendError, BucketBackend, ConsumeOutcome};
use super::bucket::{BucketState, TokenBucketConfig};
use super::key::ScopeKey;
use crate::config::BackendConfig;
use crate::error::{GatekeeperError, Result};

/// Refill-and-consume against one record.
///
/// KEYS[1] = record key
/// ARGV = capacity, refill_per_sec, now_ms, cost, idle_ttl_ms
/// Returns `{allowed (0|1), tokens_remaining (string)}`.
const CONSUME_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_per_sec = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local tokens = capacity
local last_refill = now
local raw = redis.call('GET', key)
if raw then
  local ok, state = pcall(cjson.decode, raw)
  if ok and type(state) == 'table'
      and type(state.tokens) == 'number'
      and type(state.lastRefillMs) == 'number' then
    tokens = state.tokens
    last_refill = state.lastRefillMs
  end
end

local elapsed = math.max(0, now - last_refill)
local refilled = math.min(capacity, math.max(0, tokens) + (elapsed / 1000) * refill_per_sec)

local allowed = 0
if refilled >= cost then
  allowed = 1
  refilled = refilled - cost
end

local record = string.format('{"tokens":%.17g,"lastRefillMs":%.0f}', refilled, math.max(last_refill, now))
redis.call('SET', key, record, 'PX', ARGV[5])
return { allowed, string.format('%.17g', refilled) }
"#;

/// Add tokens to an existing record, clamped to capacity.
///
/// KEYS[1] = record key
/// ARGV = amount, capacity, idle_ttl_ms
/// Returns 1 if a record was updated, 0 if it was absent or unreadable.
const REFUND_SCRIPT: &str = r#"
local key = KEYS[1]
local amount = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])

local raw = redis.call('GET', key)
if not raw then
  return 0
end

local ok, state = pcall(cjson.decode, raw)
if not (ok and type(state) == 'table'
    and type(state.tokens) == 'number'
    and type(state.lastRefillMs) == 'number') then
  return 0
end

local tokens = math.max(0, math.min(capacity, math.max(0, state.tokens) + amount))
local record = string.format('{"tokens":%.17g,"lastRefillMs":%.0f}', tokens, state.lastRefillMs)
redis.call('SET', key, record, 'PX', ARGV[3])
return 1
"#;

/// Default time to skip connect attempts after one failed.
pub const DEFAULT_RECONNECT_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Default)]
struct ConnectionState {
    /// Managed connection, created on first successful connect
    manager: Option<ConnectionManager>,
    /// When the last connect attempt failed
    failed_at: Option<Instant>,
}

/// Bucket store shared by every gateway process through Redis.
pub struct DistributedBackend {
    /// Redis client used to (re)establish the managed connection
    client: redis::Client,
    connection: Mutex<ConnectionState>,
    consume_script: Script,
    refund_script: Script,
    /// Upper bound on connecting and on each script call
    timeout: Duration,
    /// While this long has not passed since a failed connect, calls fail at once
    reconnect_cooldown: Duration,
    /// Records expire after this long without a write
    idle_ttl: Duration,
    /// Prefix prepended to every scope key
    key_prefix: String,
}

impl std::fmt::Debug for DistributedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedBackend")
            .field("timeout", &self.timeout)
            .field("idle_ttl", &self.idle_ttl)
            .field("key_prefix", &self.key_prefix)
            .field("reconnect_cooldown", &self.reconnect_cooldown)
            .field("connected", &self.connection.lock().manager.is_some())
            .finish()
    }
}

impl DistributedBackend {
    /// Create a backend for the Redis server at `redis_url`.
    ///
    /// No connection is made until the first call, so a store that is down at
    /// startup only shows up as `Unavailable` results. A failed connect is not
    /// retried for [`DEFAULT_RECONNECT_COOLDOWN`].
    pub fn new(
        redis_url: &str,
        timeout: Duration,
        idle_ttl: Duration,
        key_prefix: impl Into<String>,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GatekeeperError::Config(format!("Invalid redis_url: {}", e)))?;

        Ok(Self {
            client,
            connection: Mutex::new(ConnectionState::default()),
            consume_script: Script::new(CONSUME_SCRIPT),
            refund_script: Script::new(REFUND_SCRIPT),
            timeout,
            reconnect_cooldown: DEFAULT_RECONNECT_COOLDOWN,
            idle_ttl,
            key_prefix: key_prefix.into(),
        })
    }

    /// Create a backend from configuration.
    ///
    /// Returns `Ok(None)` when no Redis URL is configured.
    pub fn from_config(config: &BackendConfig) -> Result<Option<Self>> {
        config
            .redis_url
            .as_deref()
            .map(|url| {
                Self::new(
                    url,
                    Duration::from_millis(config.timeout_ms),
                    Duration::from_secs(config.idle_ttl_secs),
                    config.key_prefix.clone(),
                )
                .map(|backend| {
                    backend.with_reconnect_cooldown(Duration::from_millis(config.reconnect_cooldown_ms))
                })
            })
            .transpose()
    }

    /// Skip connect attempts for `cooldown` after one fails. Zero tries on every call.
    pub fn with_reconnect_cooldown(mut self, cooldown: Duration) -> Self {
        self.reconnect_cooldown = cooldown;
        self
    }

    /// Key of the Redis record holding `key`.
    pub fn record_key(&self, key: &ScopeKey) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn idle_ttl_ms(&self) -> u64 {
        u64::try_from(self.idle_ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    /// Get the managed connection, connecting on first use.
    ///
    /// The connect is a single attempt bounded by the timeout. Its failure is
    /// remembered, and until the cooldown passes later calls fail without
    /// touching the network.
    async fn connection(&self) -> std::result::Result<ConnectionManager, BackendError> {
        {
            let state = self.connection.lock();
            if let Some(conn) = &state.manager {
                return Ok(conn.clone());
            }
            if let Some(failed_at) = state.failed_at {
                if failed_at.elapsed() < self.reconnect_cooldown {
                    return Err(BackendError::Unavailable(
                        "not reconnecting yet after a failed connect".to_string(),
                    ));
                }
            }
        }

        let config = ConnectionManagerConfig::new().set_number_of_retries(0);
        let connect = ConnectionManager::new_with_config(self.client.clone(), config);
        let result = match tokio::time::timeout(self.timeout, connect).await {
            Ok(result) => result.map_err(redis_error),
            Err(_) => Err(BackendError::Timeout(self.timeout)),
        };

        let mut state = self.connection.lock();
        match result {
            Ok(conn) => {
                state.manager = Some(conn.clone());
                state.failed_at = None;
                info!(key_prefix = %self.key_prefix, "Connected to shared bucket store");
                Ok(conn)
            }
            Err(err) => {
                state.failed_at = Some(Instant::now());
                debug!(error = %err, cooldown = ?self.reconnect_cooldown, "Connect to shared bucket store failed");
                Err(err)
            }
        }
    }

    /// Run `op` under the configured timeout.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> std::result::Result<T, BackendError>
    where
        F: Future<Output = std::result::Result<T, BackendError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                debug!(op = op, timeout = ?self.timeout, "Shared bucket store timed out");
                Err(BackendError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl BucketBackend for DistributedBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_shared(&self) -> bool {
        true
    }

    async fn try_consume(
        &self,
        key: &ScopeKey,
        config: &TokenBucketConfig,
        cost: f64,
        now_ms: u64,
    ) -> std::result::Result<ConsumeOutcome, BackendError> {
        let record_key = self.record_key(key);

        let mut conn = self.connection().await?;

        let (allowed, tokens): (i64, String) = self
            .bounded("consume", async {

                let mut invocation = self.consume_script.key(&record_key);
                invocation.arg(config.capacity);
                invocation.arg(config.refill_per_sec);
                invocation.arg(now_ms);
                invocation.arg(cost);
                invocation.arg(self.idle_ttl_ms());

                invocation.invoke_async(&mut conn).await.map_err(redis_error)
            })
            .await?;

        let outcome = parse_consume_reply(allowed, &tokens)?;
        trace!(
            key = %record_key,
            allowed = outcome.allowed,
            tokens = outcome.tokens_remaining,
            "Shared consume"
        );
        Ok(outcome)
    }

    async fn add_tokens(
        &self,
        key: &ScopeKey,
        amount: f64,
        config: &TokenBucketConfig,
        _now_ms: u64,
    ) -> std::result::Result<(), BackendError> {
        let record_key = self.record_key(key);

        let mut conn = self.connection().await?;

        let updated: i64 = self
            .bounded("refund", async {

                let mut invocation = self.refund_script.key(&record_key);
                invocation.arg(amount);
                invocation.arg(config.capacity);
                invocation.arg(self.idle_ttl_ms());

                invocation.invoke_async(&mut conn).await.map_err(redis_error)
            })
            .await?;

        trace!(key = %record_key, amount = amount, updated = updated == 1, "Shared refund");
        Ok(())
    }

    async fn peek(&self, key: &ScopeKey) -> std::result::Result<Option<BucketState>, BackendError> {
        let record_key = self.record_key(key);

        let mut conn = self.connection().await?;

        let raw: Option<Vec<u8>> = self
            .bounded("peek", async {
                redis::cmd("GET")
                    .arg(&record_key)
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_error)
            })
            .await?;

        Ok(raw.as_deref().and_then(BucketState::decode))
    }
}

/// Map a Redis client error onto the backend taxonomy.
fn redis_error(err: redis::RedisError) -> BackendError {
    match err.kind() {
        redis::ErrorKind::ResponseError | redis::ErrorKind::TypeError => {
            BackendError::Protocol(err.to_string())
        }
        _ => BackendError::Unavailable(err.to_string()),
    }
}

/// Decode the consume script's `{allowed, tokens}` reply.
fn parse_consume_reply(
    allowed: i64,
    tokens: &str,
) -> std::result::Result<ConsumeOutcome, BackendError> {
    let allowed = match allowed {
        0 => false,
        1 => true,
        other => {
            return Err(BackendError::Protocol(format!(
                "consume returned allowed={}",
                other
            )))
        }
    };

    let tokens_remaining = tokens
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
        .ok_or_else(|| BackendError::Protocol(format!("consume returned tokens={:?}", tokens)))?;

    Ok(ConsumeOutcome {
        allowed,
        tokens_remaining,
    })
}
