//! Multi-tenant namespacing.
//!
//! A [`TenantId`] is a validated string prefixed onto every storage key and
//! partition: event logs, tag indexes, state-cache keys, snapshot records,
//! and blob offload keys. The same tag string under two different tenants
//! resolves to two fully independent event sets and states. Tenancy is a
//! thin cross-cutting concern -- nothing below the storage-key layer knows
//! about it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// The tenant used by deployments that do not care about multi-tenancy.
const DEFAULT_TENANT: &str = "default";

/// A validated tenant namespace.
///
/// Tenant ids must be 1-64 characters of lowercase alphanumerics and
/// hyphens, with no surrounding whitespace.
///
/// # Examples
///
/// ```
/// use tagfold::TenantId;
///
/// let tenant = TenantId::new("acme-corp").unwrap();
/// assert_eq!(tenant.storage_prefix(), "acme-corp/");
/// assert!(TenantId::new("Acme Corp").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id after validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if the id is empty, longer than
    /// 64 characters, or contains anything outside `[a-z0-9-]`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// The single-tenant default namespace.
    #[must_use]
    pub fn default_tenant() -> Self {
        Self(DEFAULT_TENANT.to_string())
    }

    /// The prefix applied to storage keys owned by this tenant.
    #[must_use]
    pub fn storage_prefix(&self) -> String {
        format!("{}/", self.0)
    }

    /// The tenant id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(StoreError::validation("tenant id cannot be empty"));
        }
        if id.len() > 64 {
            return Err(StoreError::validation(format!(
                "tenant id '{id}' is too long (maximum 64 characters)"
            )));
        }
        if id.trim() != id {
            return Err(StoreError::validation(format!(
                "tenant id '{id}' has surrounding whitespace"
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(StoreError::validation(format!(
                "tenant id '{id}' must contain only lowercase letters, digits, and hyphens"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
