//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod distributed;
mod key;
mod limiter;
mod local;
mod plans;

pub use backend::{BackendError, BucketBackend, ConsumeOutcome};
pub use bucket::{apply, refund, retry_after, Applied, BucketState, TokenBucketConfig};
pub use distributed::DistributedBackend;
pub use key::{ScopeKey, TenantKey};
pub use limiter::{Decision, HierarchicalLimiter, LimiterBuilder, Scope};
pub use local::LocalBackend;
pub use plans::{Plan, PlanLimits, PlanTable};
