//! # POS Core
//!
//! The facade a register UI or an HTTP layer talks to.
//!
//! ## Wiring
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  PosCore::new(config, db, remote)                                       │
//! │                                                                         │
//! │        ┌──────────────── Arc<TenantContext> ────────────────┐           │
//! │        │                    │                  │            │           │
//! │        ▼                    ▼                  ▼            ▼           │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌───────────┐  ┌───────────┐    │
//! │  │ Reconcile   │  │ AtomicSale       │  │ SyncQueue │  │ Cash      │    │
//! │  │ Engine      │  │ Coordinator      │  │           │  │ Drawer    │    │
//! │  └──────┬──────┘  └────────┬─────────┘  └─────┬─────┘  └─────┬─────┘    │
//! │         │                  │                  │              │          │
//! │         └────────── RemoteGateway ────────────┘      local only         │
//! │                            │                                            │
//! │                    Arc<dyn RemoteClient>                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every method returns a typed `SyncResult`; business outcomes such as a
//! stock shortage are variants of the payload, not errors.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tally_core::validation::validate_product;
use tally_core::{MovementReason, Product, Role, SaleRequest, SyncEntity, SyncState, TenantId};
use tally_db::{Database, StockUpdate};
use tracing::info;

use crate::cash::CashDrawer;
use crate::config::CoreConfig;
use crate::error::{SyncError, SyncResult};
use crate::queue::{DrainReport, ProductDeletionPayload, SyncQueue};
use crate::reconcile::{PullReport, ReconciliationEngine};
use crate::remote::{Capabilities, RemoteClient, RemoteGateway};
use crate::sale::{AtomicSaleCoordinator, CancelResult, SaleResult};
use crate::tenant::TenantContext;

/// Queue counters and backend facts for a status bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOverview {
    pub store_id: String,
    pub pending: i64,
    pub failed: i64,
    pub synced: i64,
    pub capabilities: Capabilities,
}

/// One device's consistency core.
#[derive(Debug)]
pub struct PosCore {
    config: CoreConfig,
    db: Database,
    tenant: Arc<TenantContext>,
    remote: RemoteGateway,
    reconciler: ReconciliationEngine,
    sales: AtomicSaleCoordinator,
    queue: Arc<SyncQueue>,
    cash: CashDrawer,
}

impl PosCore {
    pub fn new(config: CoreConfig, db: Database, remote: Arc<dyn RemoteClient>) -> Self {
        let gateway = RemoteGateway::from_settings(remote, &config.remote);
        let configured = config.store_id().and_then(|raw| TenantId::new(raw).ok());
        let tenant = Arc::new(
            TenantContext::new(
                Arc::new(db.clone()),
                Duration::from_secs(config.tenant.cache_ttl_secs),
            )
            .with_configured(configured)
            .with_remote_fallback(gateway.clone()),
        );
        let device_id = config.device_id().to_string();

        PosCore {
            reconciler: ReconciliationEngine::new(db.clone(), tenant.clone(), gateway.clone()),
            sales: AtomicSaleCoordinator::new(
                db.clone(),
                tenant.clone(),
                gateway.clone(),
                device_id.clone(),
            ),
            queue: Arc::new(SyncQueue::new(
                db.clone(),
                tenant.clone(),
                gateway.clone(),
                config.queue.clone(),
                &device_id,
            )),
            cash: CashDrawer::new(db.clone(), tenant.clone(), device_id),
            remote: gateway,
            tenant,
            db,
            config,
        }
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Pins this device to a store and seeds the store on first use.
    pub async fn sign_in(&self, store_id: &str, staff_id: Option<&str>) -> SyncResult<bool> {
        let tenant = TenantId::new(store_id)?;
        self.db
            .device_session()
            .set(tenant.as_str(), staff_id)
            .await?;
        self.tenant.invalidate();
        info!(store_id = %tenant, device_id = %self.config.device_id(), "Signed in");
        self.initialize().await
    }

    pub async fn sign_out(&self) -> SyncResult<()> {
        self.db.device_session().clear().await?;
        self.tenant.invalidate();
        info!(device_id = %self.config.device_id(), "Signed out");
        Ok(())
    }

    /// First-use setup for the current tenant. Returns `true` if it ran now.
    pub async fn initialize(&self) -> SyncResult<bool> {
        let tenant = self.tenant.require().await?;
        Ok(self.db.cache(tenant.into()).initialize().await?)
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Lists products of the current tenant, or of every tenant when none
    /// can be resolved.
    pub async fn list_products(&self) -> SyncResult<Vec<Product>> {
        let scope = self.tenant.resolve().await;
        let mut products: Vec<Product> = self.db.cache(scope).get().await?;
        products.sort_by(|a, b| a.sku.cmp(&b.sku));
        Ok(products)
    }

    pub async fn find_product_by_sku(&self, sku: &str) -> SyncResult<Option<Product>> {
        let scope = self.tenant.resolve().await;
        Ok(self.db.cache(scope).find_product_by_sku(sku.trim()).await?)
    }

    /// Creates or edits a product locally and queues the push.
    pub async fn save_product(&self, mut product: Product) -> SyncResult<Product> {
        validate_product(&product)?;
        let tenant = self.tenant.require().await?;
        tenant.ensure_owns(&product.store_id)?;
        product.updated_at = Utc::now();

        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        writer.put(&product).await?;
        writer
            .enqueue(SyncEntity::Product, &product.id, &product)
            .await?;
        writer.commit().await?;

        info!(store_id = %tenant, product_id = %product.id, sku = %product.sku, "Product saved");
        Ok(product)
    }

    /// Deletes a product locally and queues the remote deletion.
    pub async fn remove_product(&self, product_id: &str) -> SyncResult<()> {
        let tenant = self.tenant.require().await?;
        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        if !writer.delete::<Product>(product_id).await? {
            return Err(SyncError::NotFound(format!("product {product_id}")));
        }
        let payload = ProductDeletionPayload {
            product_id: product_id.to_string(),
        };
        writer
            .enqueue(SyncEntity::ProductDeletion, product_id, &payload)
            .await?;
        writer.commit().await?;

        info!(store_id = %tenant, product_id, "Product removed");
        Ok(())
    }

    // =========================================================================
    // Sales & stock
    // =========================================================================

    pub async fn create_sale(&self, request: SaleRequest) -> SyncResult<SaleResult> {
        self.sales.create_sale(request).await
    }

    pub async fn cancel_sale(&self, sale_id: &str, actor: Role) -> SyncResult<CancelResult> {
        self.sales.cancel_sale(sale_id, actor).await
    }

    pub async fn record_restock(&self, product_id: &str, quantity: i64) -> SyncResult<StockUpdate> {
        self.sales.record_restock(product_id, quantity).await
    }

    pub async fn adjust_stock(
        &self,
        product_id: &str,
        delta: i64,
        reason: MovementReason,
    ) -> SyncResult<StockUpdate> {
        self.sales.adjust_stock(product_id, delta, reason).await
    }

    // =========================================================================
    // Sync
    // =========================================================================

    pub async fn pull_catalog(&self) -> SyncResult<PullReport> {
        self.reconciler.pull_catalog().await
    }

    pub async fn pull_expenses(&self) -> SyncResult<PullReport> {
        self.reconciler.pull_expenses().await
    }

    /// Drains the sync queue once.
    pub async fn push_pending(&self) -> SyncResult<DrainReport> {
        self.queue.drain().await
    }

    pub async fn sync_overview(&self) -> SyncResult<SyncOverview> {
        let tenant = self.tenant.require().await?;
        let repo = self.db.sync_queue();
        Ok(SyncOverview {
            store_id: tenant.as_str().to_string(),
            pending: repo.count(tenant.as_str(), SyncState::Pending).await?,
            failed: repo.count(tenant.as_str(), SyncState::Failed).await?,
            synced: repo.count(tenant.as_str(), SyncState::Synced).await?,
            capabilities: self.remote.capabilities(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn cash(&self) -> &CashDrawer {
        &self.cash
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn tenant(&self) -> &Arc<TenantContext> {
        &self.tenant
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use tally_core::{PaymentMethod, SaleRequestLine};
    use tally_db::DbConfig;

    async fn core(remote: MemoryRemote) -> PosCore {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut config = CoreConfig::default();
        config.device.id = "device-1".into();
        PosCore::new(config, db, Arc::new(remote))
    }

    #[tokio::test]
    async fn test_writes_refused_before_sign_in() {
        let core = core(MemoryRemote::new()).await;

        let request = SaleRequest::new(vec![SaleRequestLine::by_sku("A", 1)], PaymentMethod::Cash);
        let err = core.create_sale(request).await.unwrap_err();

        assert!(matches!(err, SyncError::TenantUnresolved));
        assert!(core.list_products().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sign_in_seeds_once() {
        let core = core(MemoryRemote::new()).await;

        assert!(core.sign_in("store-1", None).await.unwrap());
        assert!(!core.initialize().await.unwrap());
    }

    #[tokio::test]
    async fn test_save_product_rejects_foreign_store() {
        let core = core(MemoryRemote::new()).await;
        core.sign_in("store-1", None).await.unwrap();
        let foreign = TenantId::new("store-2").unwrap();

        let product = Product::new_local(&foreign, "A", "A", 1, 1, 2);
        assert!(core.save_product(product).await.is_err());
    }

    #[tokio::test]
    async fn test_save_and_remove_queue_pushes() {
        let remote = MemoryRemote::new();
        let core = core(remote.clone()).await;
        core.sign_in("store-1", None).await.unwrap();
        let store = TenantId::new("store-1").unwrap();

        let product = core
            .save_product(Product::new_local(&store, "ABC-1", "Shirt", 4, 100, 250))
            .await
            .unwrap();
        core.remove_product(&product.id).await.unwrap();
        let overview = core.sync_overview().await.unwrap();
        assert_eq!(overview.pending, 2);

        let report = core.push_pending().await.unwrap();
        assert_eq!(report.synced, 2);
        assert!(remote.product("store-1", &product.id).is_none());
    }
}
