//! Two-stage (organization, then region) admission control.
//!
//! A request must draw `cost` tokens from the tenant-wide organization bucket
//! and then from its region bucket. The two draws are separate atomic
//! operations, so a region denial hands the organization tokens back.
//!
//! Both stages of one check always run on the same backend. If the shared
//! store becomes unavailable at any point, the whole check starts over on the
//! local backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, instrument, trace, warn, Instrument};

use super::backend::{BackendError, BucketBackend};
use super::bucket::{self, TokenBucketConfig};
use super::distributed::DistributedBackend;
use super::key::{ScopeKey, TenantKey};
use super::local::LocalBackend;
use super::plans::{Plan, PlanLimits, PlanTable};
use crate::clock::{Clock, SystemClock};
use crate::config::GatekeeperConfig;
use crate::error::Result;
use crate::metrics::MetricsRegistry;
use crate::tenant::{RequestMetadata, TenantResolver};

/// Which bucket made the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Organization,
    Region,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Organization => f.write_str("organization"),
            Scope::Region => f.write_str("region"),
        }
    }
}

/// The result of one admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    /// Pass the request through.
    Allowed {
        /// Tokens left in the region bucket
        remaining: f64,
        /// Region bucket capacity
        capacity: f64,
    },
    /// Reject with a rate-limit status and `Retry-After`.
    Denied {
        /// Seconds to wait, always at least 1
        retry_after_secs: u64,
        /// The stage that denied
        scope: Scope,
    },
}

impl Decision {
    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Seconds to wait before retrying, if denied.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
        }
    }

    /// Response headers the calling middleware should attach.
    pub fn rate_limit_headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Decision::Allowed {
                remaining,
                capacity,
            } => vec![
                ("X-RateLimit-Limit", format!("{}", capacity.floor() as u64)),
                ("X-RateLimit-Remaining", format!("{}", remaining.floor() as u64)),
            ],
            Decision::Denied {
                retry_after_secs, ..
            } => vec![("Retry-After", retry_after_secs.to_string())],
        }
    }
}

/// A decision plus the figures of the bucket that made it.
#[derive(Debug, Clone)]
struct Verdict {
    decision: Decision,
    capacity: f64,
    remaining: f64,
}

impl Verdict {
    fn allowed(region: &TokenBucketConfig, remaining: f64) -> Self {
        Self {
            decision: Decision::Allowed {
                remaining,
                capacity: region.capacity,
            },
            capacity: region.capacity,
            remaining,
        }
    }

    fn denied(scope: Scope, config: &TokenBucketConfig, remaining: f64, cost: f64) -> Self {
        Self {
            decision: Decision::Denied {
                retry_after_secs: bucket::retry_after(remaining, cost, config.refill_per_sec),
                scope,
            },
            capacity: config.capacity,
            remaining,
        }
    }
}

/// Hierarchical, multi-tenant admission controller.
///
/// Each instance owns its local buckets and metrics; nothing is shared
/// between instances except what lives in the distributed store.
pub struct HierarchicalLimiter {
    /// Bucket sizes per plan
    plans: PlanTable,
    /// Preferred shared backend, if configured
    distributed: Option<Arc<dyn BucketBackend>>,
    /// Always-available fallback
    local: Arc<LocalBackend>,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    resolver: TenantResolver,
    /// Number of checks that fell back to the local backend
    fallbacks: AtomicU64,
}

impl std::fmt::Debug for HierarchicalLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalLimiter")
            .field("plans", &self.plans)
            .field("distributed", &self.distributed.as_ref().map(|b| b.name()))
            .field("local_buckets", &self.local.len())
            .field("fallbacks", &self.fallbacks.load(Ordering::Relaxed))
            .finish()
    }
}

impl HierarchicalLimiter {
    /// Start building a limiter for the given plan table.
    pub fn builder(plans: PlanTable) -> LimiterBuilder {
        LimiterBuilder::new(plans)
    }

    /// Create a limiter from configuration.
    ///
    /// Wires the Redis backend when `backend.redis_url` is set; no
    /// connection is attempted until the first check.
    pub fn from_config(config: &GatekeeperConfig) -> Result<Self> {
        config.validate()?;

        let local = Arc::new(LocalBackend::with_idle_ttl(Duration::from_secs(
            config.local.idle_ttl_secs,
        )));
        let mut builder = Self::builder(config.plans.clone())
            .local(local)
            .resolver(TenantResolver::new(config.tenant.clone()));

        if let Some(shared) = DistributedBackend::from_config(&config.backend)? {
            builder = builder.distributed(Arc::new(shared));
        }

        Ok(builder.build())
    }

    /// Decide whether a request from `tenant` on `plan` costing `cost` tokens is admitted.
    ///
    /// Always returns a decision; backend failures only reduce precision.
    #[instrument(
        skip_all,
        fields(
            organization_id = %tenant.organization_id,
            region = %tenant.region,
            plan = %plan,
            cost = cost
        )
    )]
    pub async fn check(&self, tenant: &TenantKey, plan: Plan, cost: u32) -> Decision {
        let limits = *self.plans.limits(plan);
        let cost = f64::from(cost);
        let now_ms = self.clock.now_millis();

        let verdict = match &self.distributed {
            Some(shared) => match self.run_stages(shared.clone(), tenant, &limits, cost, now_ms).await {
                Ok(verdict) => verdict,
                Err(err) => {
                    self.note_fallback(shared.name(), &err);
                    self.check_local(tenant, &limits, cost, now_ms).await
                }
            },
            None => self.check_local(tenant, &limits, cost, now_ms).await,
        };

        self.metrics.bump(
            tenant,
            verdict.decision.is_allowed(),
            verdict.capacity,
            verdict.remaining,
        );

        if let Decision::Denied {
            retry_after_secs,
            scope,
        } = &verdict.decision
        {
            debug!(
                scope = %scope,
                retry_after_secs = retry_after_secs,
                remaining = verdict.remaining,
                "Request throttled"
            );
        }

        verdict.decision
    }

    /// Resolve the tenant of a request and check it.
    pub async fn admit(&self, metadata: &RequestMetadata, cost: u32) -> Decision {
        let tenant = self.resolver.resolve(metadata);
        self.check(&tenant.key, tenant.plan, cost).await
    }

    /// Metrics fed by this limiter.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// The in-process fallback backend.
    pub fn local(&self) -> &Arc<LocalBackend> {
        &self.local
    }

    /// The shared backend, if one is configured.
    pub fn distributed(&self) -> Option<&Arc<dyn BucketBackend>> {
        self.distributed.as_ref()
    }

    /// The clock used for refill math.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The plan table.
    pub fn plans(&self) -> &PlanTable {
        &self.plans
    }

    /// Number of checks that had to fall back to the local backend.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    async fn check_local(
        &self,
        tenant: &TenantKey,
        limits: &PlanLimits,
        cost: f64,
        now_ms: u64,
    ) -> Verdict {
        let local: Arc<dyn BucketBackend> = self.local.clone();
        match self.run_stages(local, tenant, limits, cost, now_ms).await {
            Ok(verdict) => verdict,
            Err(err) => {
                // The local backend has no failure modes today; admit rather than block.
                error!(error = %err, "Local backend failed; admitting request");
                Verdict::allowed(&limits.region, limits.region.capacity)
            }
        }
    }

    /// Run both stages against one backend.
    async fn run_stages(
        &self,
        backend: Arc<dyn BucketBackend>,
        tenant: &TenantKey,
        limits: &PlanLimits,
        cost: f64,
        now_ms: u64,
    ) -> std::result::Result<Verdict, BackendError> {
        let org_key = tenant.organization_scope();
        let org = backend
            .try_consume(&org_key, &limits.organization, cost, now_ms)
            .await?;
        trace!(
            backend = backend.name(),
            key = %org_key,
            allowed = org.allowed,
            tokens = org.tokens_remaining,
            "Organization stage"
        );

        if !org.allowed {
            return Ok(Verdict::denied(
                Scope::Organization,
                &limits.organization,
                org.tokens_remaining,
                cost,
            ));
        }

        let region_key = tenant.region_scope();
        let region = backend
            .try_consume(&region_key, &limits.region, cost, now_ms)
            .await?;
        trace!(
            backend = backend.name(),
            key = %region_key,
            allowed = region.allowed,
            tokens = region.tokens_remaining,
            "Region stage"
        );

        if !region.allowed {
            Self::compensate(backend, org_key, cost, limits.organization, now_ms).await;
            return Ok(Verdict::denied(
                Scope::Region,
                &limits.region,
                region.tokens_remaining,
                cost,
            ));
        }

        Ok(Verdict::allowed(&limits.region, region.tokens_remaining))
    }

    /// Hand back organization tokens taken by a request the region stage rejected.
    ///
    /// Best effort: failures are logged and dropped. Against a shared backend
    /// the refund runs detached so it never holds up the response.
    async fn compensate(
        backend: Arc<dyn BucketBackend>,
        key: ScopeKey,
        cost: f64,
        config: TokenBucketConfig,
        now_ms: u64,
    ) {
        let detached = backend.is_shared();
        let refund = async move {
            if let Err(err) = backend.add_tokens(&key, cost, &config, now_ms).await {
                warn!(
                    backend = backend.name(),
                    key = %key,
                    error = %err,
                    "Dropping failed organization refund"
                );
            }
        };

        if detached {
            tokio::spawn(refund.in_current_span());
        } else {
            refund.await;
        }
    }

    fn note_fallback(&self, backend: &'static str, err: &BackendError) {
        let n = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 || n % 100 == 0 {
            warn!(
                backend = backend,
                error = %err,
                fallbacks = n,
                "Shared bucket store unavailable; falling back to local buckets"
            );
        }
    }
}

/// Builder for [`HierarchicalLimiter`].
pub struct LimiterBuilder {
    plans: PlanTable,
    distributed: Option<Arc<dyn BucketBackend>>,
    local: Option<Arc<LocalBackend>>,
    metrics: Option<Arc<MetricsRegistry>>,
    clock: Option<Arc<dyn Clock>>,
    resolver: TenantResolver,
}

impl LimiterBuilder {
    fn new(plans: PlanTable) -> Self {
        Self {
            plans,
            distributed: None,
            local: None,
            metrics: None,
            clock: None,
            resolver: TenantResolver::default(),
        }
    }

    /// Prefer `backend` for both stages while it is available.
    pub fn distributed(mut self, backend: Arc<dyn BucketBackend>) -> Self {
        self.distributed = Some(backend);
        self
    }

    /// Use an existing local backend as the fallback.
    pub fn local(mut self, backend: Arc<LocalBackend>) -> Self {
        self.local = Some(backend);
        self
    }

    /// Report decisions into an existing registry.
    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Use `clock` for refill math.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `resolver` for [`HierarchicalLimiter::admit`].
    pub fn resolver(mut self, resolver: TenantResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn build(self) -> HierarchicalLimiter {
        HierarchicalLimiter {
            plans: self.plans,
            distributed: self.distributed,
            local: self.local.unwrap_or_default(),
            metrics: self.metrics.unwrap_or_default(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            resolver: self.resolver,
            fallbacks: AtomicU64::new(0),
        }
    }
}
