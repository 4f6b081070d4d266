//! # Tenant Identity
//!
//! Every persisted entity belongs to exactly one tenant (`store_id`). This
//! module holds the identifier itself and the outcome of resolving it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  TenantScope                                                            │
//! │                                                                         │
//! │  Resolved(TenantId) ──► reads filtered to store_id, writes allowed      │
//! │  Unresolved         ──► reads see every tenant, writes FAIL FAST        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is deliberately no "default tenant": a tenant id is only ever
//! taken from the caller, the session or the remote store.

use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};

// =============================================================================
// Tenant Id
// =============================================================================

/// Opaque tenant/store identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TenantId(String);

impl TenantId {
    /// Wraps a store id, rejecting blank values.
    pub fn new(id: impl Into<String>) -> CoreResult<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::Required {
                field: "store_id".to_string(),
            }
            .into());
        }
        Ok(TenantId(trimmed.to_string()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fails with `TenantMismatch` when `store_id` is not this tenant.
    pub fn ensure_owns(&self, store_id: &str) -> CoreResult<()> {
        if self.0 == store_id {
            Ok(())
        } else {
            Err(CoreError::TenantMismatch {
                expected: self.0.clone(),
                found: store_id.to_string(),
            })
        }
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Tenant Scope
// =============================================================================

/// Result of tenant resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "kind", content = "store_id", rename_all = "snake_case")]
#[ts(export)]
pub enum TenantScope {
    Resolved(TenantId),
    /// Read-all mode. Every write must fail with `TenantUnresolved`.
    Unresolved,
}

impl TenantScope {
    #[inline]
    pub fn tenant(&self) -> Option<&TenantId> {
        match self {
            TenantScope::Resolved(id) => Some(id),
            TenantScope::Unresolved => None,
        }
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        matches!(self, TenantScope::Resolved(_))
    }

    /// The tenant a write may target.
    pub fn require(&self) -> CoreResult<&TenantId> {
        self.tenant().ok_or(CoreError::TenantUnresolved)
    }

    /// SQL filter value: `None` disables tenant filtering.
    #[inline]
    pub fn store_filter(&self) -> Option<&str> {
        self.tenant().map(TenantId::as_str)
    }
}

impl From<TenantId> for TenantScope {
    fn from(id: TenantId) -> Self {
        TenantScope::Resolved(id)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_tenant_rejected() {
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("   ").is_err());
        assert_eq!(TenantId::new(" store-1 ").unwrap().as_str(), "store-1");
    }

    #[test]
    fn test_unresolved_scope_refuses_writes() {
        let scope = TenantScope::Unresolved;
        assert!(matches!(scope.require(), Err(CoreError::TenantUnresolved)));
        assert_eq!(scope.store_filter(), None);
    }

    #[test]
    fn test_ensure_owns() {
        let tenant = TenantId::new("store-a").unwrap();
        assert!(tenant.ensure_owns("store-a").is_ok());
        assert!(matches!(
            tenant.ensure_owns("store-b"),
            Err(CoreError::TenantMismatch { .. })
        ));
    }
}
