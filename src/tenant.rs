//! Tenant identity extraction from request metadata.
//!
//! Resolution is total: missing or malformed metadata falls back to defaults
//! so that every request still gets an admission decision.

use std::collections::HashMap;

use tracing::trace;

use crate::config::TenantConfig;
use crate::ratelimit::{Plan, TenantKey};

/// Request-scoped values handed over by the authentication stage.
///
/// Header names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    headers: HashMap<String, String>,
    plan_claim: Option<String>,
}

impl RequestMetadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert_header(name, value);
        self
    }

    /// Attach the plan claim of an already-verified identity.
    pub fn with_plan_claim(mut self, plan: impl Into<String>) -> Self {
        self.plan_claim = Some(plan.into());
        self
    }

    /// Add a header in place.
    pub fn insert_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Look up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The plan claim, if an identity carried one.
    pub fn plan_claim(&self) -> Option<&str> {
        self.plan_claim.as_deref()
    }

    /// First non-blank, trimmed value among `names`.
    fn first_present<'a>(&'a self, names: &[String]) -> Option<&'a str> {
        names
            .iter()
            .filter_map(|name| self.header(name))
            .map(str::trim)
            .find(|value| !value.is_empty())
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for RequestMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = RequestMetadata::new();
        for (name, value) in iter {
            metadata.insert_header(name, value);
        }
        metadata
    }
}

/// A resolved tenant: where the request comes from and which plan it is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub key: TenantKey,
    pub plan: Plan,
}

/// Derives tenant identity from request metadata.
#[derive(Debug, Clone, Default)]
pub struct TenantResolver {
    config: TenantConfig,
}

impl TenantResolver {
    /// Create a resolver reading the headers named in `config`.
    pub fn new(config: TenantConfig) -> Self {
        Self { config }
    }

    /// Resolve the tenant of a request. Never fails.
    pub fn resolve(&self, metadata: &RequestMetadata) -> Tenant {
        let organization_id = metadata
            .first_present(&self.config.organization_headers)
            .unwrap_or(&self.config.default_organization)
            .to_string();

        // Regions are the last segment of a region scope key, so one holding
        // the delimiter could alias another organization's bucket.
        let region = metadata
            .header(&self.config.region_header)
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty() && !r.contains(':'))
            .unwrap_or_else(|| self.config.default_region.clone());

        // A verified identity's claim outranks a client-supplied header.
        let plan = metadata
            .plan_claim()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .or_else(|| metadata.first_present(&self.config.plan_headers))
            .map(Plan::from_name)
            .unwrap_or_default();

        trace!(
            organization_id = %organization_id,
            region = %region,
            plan = %plan,
            "Resolved tenant"
        );

        Tenant {
            key: TenantKey::new(organization_id, region),
            plan,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ScopeKey;

    #[test]
    fn test_resolve_full_metadata() {
        let resolver = TenantResolver::default();
        let metadata = RequestMetadata::new()
            .with_header("X-Organization-Id", "acme")
            .with_header("X-Region", "  EU-West ")
            .with_header("X-Plan", "enterprise");

        let tenant = resolver.resolve(&metadata);
        assert_eq!(tenant.key, TenantKey::new("acme", "eu-west"));
        assert_eq!(tenant.plan, Plan::Enterprise);
    }

    #[test]
    fn test_resolve_defaults() {
        let resolver = TenantResolver::default();
        let tenant = resolver.resolve(&RequestMetadata::new());

        assert_eq!(tenant.key, TenantKey::new("anonymous", "global"));
        assert_eq!(tenant.plan, Plan::Free);
    }

    #[test]
    fn test_first_non_empty_organization_header_wins() {
        let resolver = TenantResolver::default();
        let metadata: RequestMetadata = [
            ("x-organization-id", "  "),
            ("x-org-id", ""),
            ("x-tenant-id", "globex"),
        ]
        .into_iter()
        .collect();

        assert_eq!(resolver.resolve(&metadata).key.organization_id, "globex");

        let metadata = metadata.with_header("x-org-id", "initech");
        assert_eq!(resolver.resolve(&metadata).key.organization_id, "initech");
    }

    #[test]
    fn test_blank_region_uses_default() {
        let resolver = TenantResolver::default();
        let metadata = RequestMetadata::new().with_header("x-region", "   ");
        assert_eq!(resolver.resolve(&metadata).key.region, "global");
    }

    #[test]
    fn test_region_with_delimiter_uses_default() {
        let resolver = TenantResolver::default();

        let first = resolver.resolve(
            &RequestMetadata::new()
                .with_header("x-organization-id", "a:b")
                .with_header("x-region", "c"),
        );
        let second = resolver.resolve(
            &RequestMetadata::new()
                .with_header("x-organization-id", "a")
                .with_header("x-region", "b:c"),
        );

        assert_eq!(second.key, TenantKey::new("a", "global"));
        assert_ne!(first.key.region_scope(), second.key.region_scope());
        assert_eq!(
            ScopeKey::parse(first.key.region_scope().as_str()),
            Some(first.key.region_scope())
        );
    }

    #[test]
    fn test_unknown_plan_is_free() {
        let resolver = TenantResolver::default();
        let metadata = RequestMetadata::new().with_header("x-tier", "platinum");
        assert_eq!(resolver.resolve(&metadata).plan, Plan::Free);

        let metadata = RequestMetadata::new().with_header("x-tier", "PRO");
        assert_eq!(resolver.resolve(&metadata).plan, Plan::Pro);
    }

    #[test]
    fn test_plan_claim_outranks_header() {
        let resolver = TenantResolver::default();
        let metadata = RequestMetadata::new()
            .with_header("x-plan", "enterprise")
            .with_plan_claim("pro");
        assert_eq!(resolver.resolve(&metadata).plan, Plan::Pro);

        // A blank claim does not hide the header
        let metadata = RequestMetadata::new()
            .with_header("x-plan", "enterprise")
            .with_plan_claim(" ");
        assert_eq!(resolver.resolve(&metadata).plan, Plan::Enterprise);
    }

    #[test]
    fn test_custom_header_names() {
        let config = TenantConfig {
            organization_headers: vec!["x-account".to_string()],
            region_header: "x-edge-pop".to_string(),
            default_region: "earth".to_string(),
            ..TenantConfig::default()
        };
        let resolver = TenantResolver::new(config);

        let metadata = RequestMetadata::new()
            .with_header("x-organization-id", "ignored")
            .with_header("X-Account", "umbrella");
        let tenant = resolver.resolve(&metadata);

        assert_eq!(tenant.key, TenantKey::new("umbrella", "earth"));
    }
}
