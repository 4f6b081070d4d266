//! # Tenant Context
//!
//! Resolves the `store_id` that scopes every cache read and write.
//!
//! ## Resolution Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  resolve_with(explicit)                                                 │
//! │       │                                                                 │
//! │       ├─► caller context / configured store_id ──────────► Resolved     │
//! │       ├─► cached value (younger than the TTL) ──────────► Resolved      │
//! │       ├─► device session (local database) ───────────────► Resolved*    │
//! │       ├─► remote sample row (last resort, warn!) ────────► Resolved*    │
//! │       └─► nothing ───────────────────────────────────────► Unresolved   │
//! │                                                                         │
//! │  * stored in the cache                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The context never invents a tenant. `Unresolved` makes reads span every
//! tenant and makes writes fail with `TenantUnresolved`.
//!
//! One `TenantContext` is built at startup and shared as an `Arc` with every
//! component that needs it.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tally_core::{TenantId, TenantScope};
use tally_db::Database;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteGateway;

// =============================================================================
// Session Source
// =============================================================================

/// Where the signed-in store of this device is persisted.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn session_store_id(&self) -> SyncResult<Option<String>>;
}

#[async_trait]
impl SessionSource for Database {
    async fn session_store_id(&self) -> SyncResult<Option<String>> {
        self.device_session()
            .current_store()
            .await
            .map_err(SyncError::from)
    }
}

// =============================================================================
// Tenant Context
// =============================================================================

#[derive(Debug, Clone)]
struct CachedTenant {
    tenant: TenantId,
    resolved_at: Instant,
}

/// TTL-cached tenant resolver.
pub struct TenantContext {
    /// Configured store id; wins over everything but a caller's tenant.
    configured: Option<TenantId>,
    ttl: Duration,
    cached: Mutex<Option<CachedTenant>>,
    session: Arc<dyn SessionSource>,
    remote: Option<RemoteGateway>,
}

impl std::fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantContext")
            .field("configured", &self.configured)
            .field("ttl", &self.ttl)
            .field("remote_fallback", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}

impl TenantContext {
    pub fn new(session: Arc<dyn SessionSource>, ttl: Duration) -> Self {
        TenantContext {
            configured: None,
            ttl,
            cached: Mutex::new(None),
            session,
            remote: None,
        }
    }

    /// Pins the tenant, e.g. from `[tenant] store_id` in the config file.
    pub fn with_configured(mut self, tenant: Option<TenantId>) -> Self {
        self.configured = tenant;
        self
    }

    /// Enables the remote sample-row lookup as the last resort.
    pub fn with_remote_fallback(mut self, remote: RemoteGateway) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Resolves the current tenant.
    pub async fn resolve(&self) -> TenantScope {
        self.resolve_with(None).await
    }

    /// Resolves the current tenant, preferring a caller-supplied one.
    pub async fn resolve_with(&self, explicit: Option<&TenantId>) -> TenantScope {
        if let Some(tenant) = explicit.or(self.configured.as_ref()) {
            return TenantScope::Resolved(tenant.clone());
        }

        if let Some(tenant) = self.cached() {
            return TenantScope::Resolved(tenant);
        }

        match self.session.session_store_id().await {
            Ok(Some(raw)) => match TenantId::new(raw) {
                Ok(tenant) => {
                    debug!(store_id = %tenant, "Tenant resolved from device session");
                    self.remember(&tenant);
                    return TenantScope::Resolved(tenant);
                }
                Err(e) => warn!(error = %e, "Device session holds an unusable store id"),
            },
            Ok(None) => debug!("No device session"),
            Err(e) => warn!(error = %e, "Device session lookup failed"),
        }

        if let Some(remote) = &self.remote {
            match remote.sample_store_id().await {
                Ok(Some(raw)) => {
                    if let Ok(tenant) = TenantId::new(raw) {
                        warn!(
                            store_id = %tenant,
                            "Tenant inferred from a remote sample row; sign in to pin it"
                        );
                        self.remember(&tenant);
                        return TenantScope::Resolved(tenant);
                    }
                }
                Ok(None) => debug!("Remote has no rows to infer a tenant from"),
                Err(e) => warn!(error = %e, "Remote tenant lookup failed"),
            }
        }

        warn!("Tenant unresolved; reads span all tenants and writes are refused");
        TenantScope::Unresolved
    }

    /// Resolves the tenant or fails with `TenantUnresolved`.
    pub async fn require(&self) -> SyncResult<TenantId> {
        match self.resolve().await {
            TenantScope::Resolved(tenant) => Ok(tenant),
            TenantScope::Unresolved => Err(SyncError::TenantUnresolved),
        }
    }

    /// Forgets the cached tenant (tenant switch, sign-out).
    pub fn invalidate(&self) {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = cached.take() {
            info!(store_id = %previous.tenant, "Tenant cache invalidated");
        }
    }

    fn cached(&self) -> Option<TenantId> {
        let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        cached
            .as_ref()
            .filter(|c| c.resolved_at.elapsed() < self.ttl)
            .map(|c| c.tenant.clone())
    }

    fn remember(&self, tenant: &TenantId) {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        *cached = Some(CachedTenant {
            tenant: tenant.clone(),
            resolved_at: Instant::now(),
        });
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
