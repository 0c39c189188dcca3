//! Subscription plans and the bucket sizes they map to.
//!
//! Each plan carries two bucket configurations: the tenant-wide organization
//! bucket and the smaller per-region bucket nested under it.

use serde::{Deserialize, Serialize};

use super::bucket::TokenBucketConfig;
use crate::error::{GatekeeperError, Result};

/// Subscription tier of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl Plan {
    /// Parse a plan name. Unknown and empty values fall back to `Free`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "enterprise" => Plan::Enterprise,
            "pro" => Plan::Pro,
            _ => Plan::Free,
        }
    }

    /// Lowercase plan name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket configurations for one plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Tenant-wide ceiling
    pub organization: TokenBucketConfig,
    /// Per-region share of the tenant allowance
    pub region: TokenBucketConfig,
}

impl PlanLimits {
    /// Create limits from organization and region configurations.
    pub fn new(organization: TokenBucketConfig, region: TokenBucketConfig) -> Self {
        Self {
            organization,
            region,
        }
    }

    fn validate(&self, plan: Plan) -> Result<()> {
        for (scope, cfg) in [("organization", &self.organization), ("region", &self.region)] {
            if !(cfg.capacity.is_finite() && cfg.capacity > 0.0) {
                return Err(GatekeeperError::Config(format!(
                    "{} {} capacity must be a positive number, got {}",
                    plan, scope, cfg.capacity
                )));
            }
            if !(cfg.refill_per_sec.is_finite() && cfg.refill_per_sec >= 0.0) {
                return Err(GatekeeperError::Config(format!(
                    "{} {} refill_per_sec must be a non-negative number, got {}",
                    plan, scope, cfg.refill_per_sec
                )));
            }
        }

        // No single region may be able to drain the whole tenant allowance.
        if self.region.capacity >= self.organization.capacity {
            return Err(GatekeeperError::Config(format!(
                "{} region capacity ({}) must be smaller than organization capacity ({})",
                plan, self.region.capacity, self.organization.capacity
            )));
        }
        if self.region.refill_per_sec > self.organization.refill_per_sec {
            return Err(GatekeeperError::Config(format!(
                "{} region refill ({}/s) exceeds organization refill ({}/s)",
                plan, self.region.refill_per_sec, self.organization.refill_per_sec
            )));
        }

        Ok(())
    }
}

/// Limits for every plan, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTable {
    #[serde(default = "default_free")]
    pub free: PlanLimits,
    #[serde(default = "default_pro")]
    pub pro: PlanLimits,
    #[serde(default = "default_enterprise")]
    pub enterprise: PlanLimits,
}

impl Default for PlanTable {
    fn default() -> Self {
        Self {
            free: default_free(),
            pro: default_pro(),
            enterprise: default_enterprise(),
        }
    }
}

fn default_free() -> PlanLimits {
    PlanLimits::new(TokenBucketConfig::new(30.0, 5.0), TokenBucketConfig::new(15.0, 3.0))
}

fn default_pro() -> PlanLimits {
    PlanLimits::new(TokenBucketConfig::new(300.0, 50.0), TokenBucketConfig::new(150.0, 25.0))
}

fn default_enterprise() -> PlanLimits {
    PlanLimits::new(
        TokenBucketConfig::new(3000.0, 500.0),
        TokenBucketConfig::new(1500.0, 250.0),
    )
}

impl PlanTable {
    /// Limits for a plan.
    pub fn limits(&self, plan: Plan) -> &PlanLimits {
        match plan {
            Plan::Free => &self.free,
            Plan::Pro => &self.pro,
            Plan::Enterprise => &self.enterprise,
        }
    }

    /// Iterate over every plan and its limits.
    pub fn iter(&self) -> impl Iterator<Item = (Plan, &PlanLimits)> {
        [Plan::Free, Plan::Pro, Plan::Enterprise]
            .into_iter()
            .map(move |plan| (plan, self.limits(plan)))
    }

    /// Longest time any configured bucket needs to refill from empty.
    ///
    /// `None` if some bucket never refills.
    pub fn max_full_refill_ms(&self) -> Option<u64> {
        self.iter()
            .flat_map(|(_, limits)| [limits.organization, limits.region])
            .map(|cfg| cfg.full_refill_ms())
            .try_fold(0u64, |acc, ms| ms.map(|ms| acc.max(ms)))
    }

    /// Check every plan's limits for consistency.
    pub fn validate(&self) -> Result<()> {
        self.iter().try_for_each(|(plan, limits)| limits.validate(plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_from_name() {
        assert_eq!(Plan::from_name("enterprise"), Plan::Enterprise);
        assert_eq!(Plan::from_name(" Pro "), Plan::Pro);
        assert_eq!(Plan::from_name("free"), Plan::Free);
        assert_eq!(Plan::from_name("platinum"), Plan::Free);
        assert_eq!(Plan::from_name(""), Plan::Free);
    }

    #[test]
    fn test_default_table_is_valid() {
        let table = PlanTable::default();
        table.validate().unwrap();

        let free = table.limits(Plan::Free);
        assert_eq!(free.organization, TokenBucketConfig::new(30.0, 5.0));
        assert_eq!(free.region, TokenBucketConfig::new(15.0, 3.0));
        assert_eq!(table.max_full_refill_ms(), Some(6_000));
    }

    #[test]
    fn test_parse_plan_table() {
        let yaml = r#"
pro:
  organization:
    capacity: 100
    refill_per_sec: 10
  region:
    capacity: 40
    refill_per_sec: 4
"#;
        let table: PlanTable = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(table.pro.organization.capacity, 100.0);
        assert_eq!(table.pro.region.refill_per_sec, 4.0);
        // Omitted plans keep their defaults
        assert_eq!(table.free, PlanTable::default().free);
        table.validate().unwrap();
    }

    #[test]
    fn test_region_must_be_smaller_than_organization() {
        let mut table = PlanTable::default();
        table.pro.region.capacity = table.pro.organization.capacity;

        let err = table.validate().unwrap_err();
        assert!(err.to_string().contains("pro region capacity"));
    }

    #[test]
    fn test_region_refill_cannot_exceed_organization() {
        let mut table = PlanTable::default();
        table.free.region.refill_per_sec = 6.0;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_invalid_capacity_rejected() {
        let mut table = PlanTable::default();
        table.enterprise.organization.capacity = f64::NAN;
        assert!(table.validate().is_err());

        let mut table = PlanTable::default();
        table.free.region.capacity = 0.0;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_never_refilling_bucket_has_no_refill_time() {
        let mut table = PlanTable::default();
        table.free.region.refill_per_sec = 0.0;
        table.validate().unwrap();
        assert_eq!(table.max_full_refill_ms(), None);
    }
}
