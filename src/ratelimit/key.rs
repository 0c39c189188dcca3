//! Tenant and bucket scope keys.

use serde::{Deserialize, Serialize};

/// An (organization, region) pair identifying where a request comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantKey {
    /// The organization (tenant) identifier
    pub organization_id: String,
    /// The traffic-origin region, lowercased
    pub region: String,
}

impl TenantKey {
    /// Create a new tenant key.
    pub fn new(organization_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            region: region.into(),
        }
    }

    /// Key of the tenant-wide organization bucket.
    pub fn organization_scope(&self) -> ScopeKey {
        ScopeKey::organization(&self.organization_id)
    }

    /// Key of the per-region bucket nested under the organization.
    pub fn region_scope(&self) -> ScopeKey {
        ScopeKey::region(&self.organization_id, &self.region)
    }

    /// Label used for metrics entries: `{organization_id}:{region}`.
    pub fn metrics_label(&self) -> String {
        format!("{}:{}", self.organization_id, self.region)
    }
}

impl std::fmt::Display for TenantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.organization_id, self.region)
    }
}

/// Key identifying one bucket in a backend.
///
/// Format: `org:{organization_id}` or `region:{organization_id}:{region}`.
/// The organization id may itself contain `:`, so parsing splits the region
/// off from the right. Regions must not contain `:`; otherwise `("a:b", "c")`
/// and `("a", "b:c")` would share a bucket. `TenantResolver` never produces
/// such a region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey(String);

const ORG_PREFIX: &str = "org:";
const REGION_PREFIX: &str = "region:";

impl ScopeKey {
    /// Key of an organization bucket.
    pub fn organization(organization_id: &str) -> Self {
        Self(format!("{}{}", ORG_PREFIX, organization_id))
    }

    /// Key of a region bucket.
    pub fn region(organization_id: &str, region: &str) -> Self {
        Self(format!("{}{}:{}", REGION_PREFIX, organization_id, region))
    }

    /// Parse a key produced by [`ScopeKey::organization`] or [`ScopeKey::region`].
    pub fn parse(key: &str) -> Option<Self> {
        if let Some(org) = key.strip_prefix(ORG_PREFIX) {
            return (!org.is_empty()).then(|| Self::organization(org));
        }

        let rest = key.strip_prefix(REGION_PREFIX)?;
        let (org, region) = rest.rsplit_once(':')?;
        if org.is_empty() || region.is_empty() {
            return None;
        }
        Some(Self::region(org, region))
    }

    /// The raw key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is an organization bucket key.
    pub fn is_organization(&self) -> bool {
        self.0.starts_with(ORG_PREFIX)
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ScopeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
