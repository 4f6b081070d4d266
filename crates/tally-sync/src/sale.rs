//! # Atomic Sale Coordinator
//!
//! Idempotent, stock-safe sale creation and cancellation.
//!
//! ## create_sale
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SaleRequest ──► validate ──► key = idempotency_key(tenant)             │
//! │                                   │                                     │
//! │              receipt(key) confirmed? ──yes──► Confirmed { replay }      │
//! │                                   │ no                                  │
//! │              normalize lines from the cache (SKU first)                 │
//! │                                   │                                     │
//! │              remote.submit_sale   (no writer held, timeout-bounded)     │
//! │        ┌──────────────┬───────────┴────────┬──────────────────┐         │
//! │        ▼              ▼                    ▼                  ▼         │
//! │   ok/already     insufficient_stock      error            Network       │
//! │        │              │                    │                  │         │
//! │  writer: decrement    ▼                    ▼     OfflineTolerant: writer│
//! │  once per key,   InsufficientStock     Remote    decrement + enqueue    │
//! │  receipt both    (cache untouched)               → Queued               │
//! │  flags set                                       cached stock short or  │
//! │  → Confirmed                                     Synchronous → error    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Exactly-Once Local Decrement
//! The receipt's `local_applied` flag is read and written inside the same
//! writer transaction as the decrement. A replayed `already_exists`, a queue
//! drain after an offline sale, and two racing calls with one key all see the
//! flag and skip the second decrement.
//!
//! ## Network Errors Are Never Rejections
//! A call that timed out may have committed remotely. When the cache says
//! stock is short, the offline path returns the `Network` error instead of
//! `InsufficientStock`; the caller retries with the same request and the
//! remote answers `already_exists` or decides the shortage itself.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_core::validation::{validate_quantity, validate_sale_request};
use tally_core::{
    Confirmation, MovementReason, Product, Role, Sale, SaleLine, SaleReceipt, SaleRequest,
    SaleRequestLine, StockShortage, SyncEntity, SyncState, TenantId,
};
use tally_db::{CacheWriter, Database, DbError, LocalCacheStore, StockUpdate};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::remote::{AtomicSaleResponse, AtomicSaleStatus, CancelSaleStatus, RemoteGateway};
use crate::tenant::TenantContext;

// =============================================================================
// Results
// =============================================================================

/// Outcome of `create_sale`. Expected business outcomes are variants, not
/// errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SaleResult {
    /// The remote holds the sale. `replay` is set when it already existed.
    Confirmed { sale: Sale, replay: bool },
    /// Accepted locally while the remote was unreachable. `entry_id` is
    /// `None` when an earlier call with the same key already queued it.
    Queued { sale: Sale, entry_id: Option<i64> },
    InsufficientStock(StockShortage),
}

impl SaleResult {
    pub fn sale(&self) -> Option<&Sale> {
        match self {
            SaleResult::Confirmed { sale, .. } | SaleResult::Queued { sale, .. } => Some(sale),
            SaleResult::InsufficientStock(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelResult {
    Cancelled(Sale),
    AlreadyCancelled(Sale),
    Queued { sale: Sale, entry_id: i64 },
}

/// Queue payload of a cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPayload {
    pub sale_id: String,
    pub external_id: String,
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Debug, Clone)]
pub struct AtomicSaleCoordinator {
    db: Database,
    tenant: Arc<TenantContext>,
    remote: RemoteGateway,
    device_id: String,
}

impl AtomicSaleCoordinator {
    pub fn new(
        db: Database,
        tenant: Arc<TenantContext>,
        remote: RemoteGateway,
        device_id: impl Into<String>,
    ) -> Self {
        AtomicSaleCoordinator {
            db,
            tenant,
            remote,
            device_id: device_id.into(),
        }
    }

    // -------------------------------------------------------------------------
    // Sales
    // -------------------------------------------------------------------------

    pub async fn create_sale(&self, request: SaleRequest) -> SyncResult<SaleResult> {
        validate_sale_request(&request)?;
        let tenant = self.tenant.require().await?;
        let store = self.db.cache(tenant.clone().into());
        let external_id = request.idempotency_key(&tenant);

        if let Some(receipt) = store.receipt(&external_id).await? {
            if receipt.local_applied || receipt.remote_confirmed {
                let sale = store
                    .get_by_id::<Sale>(&receipt.sale_id)
                    .await?
                    .ok_or_else(|| {
                        SyncError::Integrity(format!(
                            "receipt for '{external_id}' points at missing sale {}",
                            receipt.sale_id
                        ))
                    })?;
                debug!(
                    store_id = %tenant,
                    external_id = %external_id,
                    remote_confirmed = receipt.remote_confirmed,
                    "Sale replayed from receipt"
                );
                return Ok(if receipt.remote_confirmed {
                    SaleResult::Confirmed { sale, replay: true }
                } else {
                    SaleResult::Queued {
                        sale,
                        entry_id: None,
                    }
                });
            }
        }

        let mut lines = Vec::with_capacity(request.lines.len());
        for line in &request.lines {
            let product = resolve_line(&store, line).await?;
            if !product.active {
                return Err(SyncError::Validation(format!(
                    "product '{}' is inactive",
                    product.sku
                )));
            }
            lines.push(SaleLine {
                product_id: product.id,
                sku: product.sku,
                name: product.name,
                quantity: line.quantity,
                unit_price_cents: product.sale_price_cents,
            });
        }

        let session_id = store.open_session(&self.device_id).await?.map(|s| s.id);
        let sale = Sale::finalized(
            &tenant,
            external_id,
            lines,
            request.payment_method,
            session_id,
            request.created_at,
        );

        match self.remote.submit_sale(&sale).await {
            Ok(response) => self.handle_response(&tenant, sale, response).await,
            Err(e) if e.is_retryable() => match request.confirmation {
                Confirmation::Synchronous => {
                    warn!(
                        store_id = %tenant,
                        external_id = %sale.external_id,
                        error = %e,
                        "Remote unreachable for a synchronous sale"
                    );
                    Err(e)
                }
                Confirmation::OfflineTolerant => self.accept_offline(&tenant, sale, e).await,
            },
            Err(e) => Err(e),
        }
    }

    async fn handle_response(
        &self,
        tenant: &TenantId,
        sale: Sale,
        response: AtomicSaleResponse,
    ) -> SyncResult<SaleResult> {
        match response.status {
            AtomicSaleStatus::Ok | AtomicSaleStatus::AlreadyExists => {
                let replay = response.status == AtomicSaleStatus::AlreadyExists;
                let sale = record_confirmation(&self.db, tenant, sale, response.sale_id).await?;
                info!(
                    store_id = %tenant,
                    sale_id = %sale.id,
                    external_id = %sale.external_id,
                    total_cents = sale.total_cents,
                    replay,
                    "Sale confirmed"
                );
                Ok(SaleResult::Confirmed { sale, replay })
            }
            AtomicSaleStatus::InsufficientStock => {
                let shortage = shortage_from_response(&response, &sale);
                info!(
                    store_id = %tenant,
                    product_id = %shortage.product_id,
                    available = shortage.available,
                    required = shortage.required,
                    "Sale rejected for insufficient stock"
                );
                Ok(SaleResult::InsufficientStock(shortage))
            }
            AtomicSaleStatus::Error => Err(SyncError::Remote(
                response
                    .message
                    .unwrap_or_else(|| "sale procedure failed".to_string()),
            )),
        }
    }

    /// Offline path: checks cached stock, applies the sale locally and queues
    /// it, all in one writer transaction. `cause` is returned untouched when
    /// the cache cannot cover the sale.
    async fn accept_offline(
        &self,
        tenant: &TenantId,
        sale: Sale,
        cause: SyncError,
    ) -> SyncResult<SaleResult> {
        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;

        if let Some(receipt) = writer.receipt(&sale.external_id).await? {
            if receipt.local_applied {
                let existing = writer
                    .get_by_id::<Sale>(&receipt.sale_id)
                    .await?
                    .unwrap_or(sale);
                return Ok(SaleResult::Queued {
                    sale: existing,
                    entry_id: None,
                });
            }
        }

        for (product_id, quantity) in sale.quantities() {
            let product = writer
                .get_by_id::<Product>(&product_id)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("product {product_id}")))?;
            if product.stock < quantity {
                warn!(
                    store_id = %tenant,
                    external_id = %sale.external_id,
                    product_id = %product_id,
                    cached_stock = product.stock,
                    required = quantity,
                    error = %cause,
                    "Remote unreachable and cached stock is short; sale not queued"
                );
                return Err(cause);
            }
        }

        for (product_id, quantity) in sale.quantities() {
            writer
                .apply_stock_delta(&product_id, -quantity, MovementReason::Sale, Some(&sale.id))
                .await?;
        }
        writer.put(&sale).await?;
        writer
            .put_receipt(&SaleReceipt {
                store_id: tenant.as_str().to_string(),
                external_id: sale.external_id.clone(),
                sale_id: sale.id.clone(),
                local_applied: true,
                remote_confirmed: false,
                created_at: Utc::now(),
            })
            .await?;
        let entry_id = writer.enqueue(SyncEntity::Sale, &sale.id, &sale).await?;
        writer.commit().await?;

        warn!(
            store_id = %tenant,
            sale_id = %sale.id,
            external_id = %sale.external_id,
            entry_id,
            "Remote unreachable; sale accepted offline and queued"
        );
        Ok(SaleResult::Queued {
            sale,
            entry_id: Some(entry_id),
        })
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancels a finalized sale and restores its stock.
    pub async fn cancel_sale(&self, sale_id: &str, actor: Role) -> SyncResult<CancelResult> {
        if !actor.can_cancel_sales() {
            return Err(SyncError::Forbidden(format!(
                "role {actor:?} cannot cancel sales"
            )));
        }

        let tenant = self.tenant.require().await?;
        let store = self.db.cache(tenant.clone().into());
        let sale = store
            .get_by_id::<Sale>(sale_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("sale {sale_id}")))?;
        if sale.is_cancelled() {
            return Ok(CancelResult::AlreadyCancelled(sale));
        }

        let remote_confirmed = store
            .receipt(&sale.external_id)
            .await?
            .is_some_and(|r| r.remote_confirmed);

        if !remote_confirmed {
            // The sale itself is still queued; the cancellation follows it.
            return self.cancel_locally(&tenant, sale_id, true).await;
        }

        match self.remote.cancel_sale(tenant.as_str(), sale_id).await {
            Ok(response) => match response.status {
                CancelSaleStatus::Ok | CancelSaleStatus::AlreadyCancelled => {
                    self.cancel_locally(&tenant, sale_id, false).await
                }
                CancelSaleStatus::NotFound => {
                    Err(SyncError::NotFound(format!("remote sale {sale_id}")))
                }
                CancelSaleStatus::Error => Err(SyncError::Remote(
                    response
                        .message
                        .unwrap_or_else(|| "cancel procedure failed".to_string()),
                )),
            },
            Err(e) if e.is_retryable() => {
                warn!(store_id = %tenant, sale_id = %sale_id, error = %e, "Cancelling offline");
                self.cancel_locally(&tenant, sale_id, true).await
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_locally(
        &self,
        tenant: &TenantId,
        sale_id: &str,
        enqueue: bool,
    ) -> SyncResult<CancelResult> {
        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        let mut sale = writer
            .get_by_id::<Sale>(sale_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("sale {sale_id}")))?;
        if sale.is_cancelled() {
            return Ok(CancelResult::AlreadyCancelled(sale));
        }

        sale.cancel(Utc::now())?;
        for (product_id, quantity) in sale.quantities() {
            apply_or_skip(
                &mut writer,
                &product_id,
                quantity,
                MovementReason::Cancellation,
                &sale.id,
            )
            .await?;
        }
        writer.put(&sale).await?;

        let result = if enqueue {
            let payload = CancellationPayload {
                sale_id: sale.id.clone(),
                external_id: sale.external_id.clone(),
            };
            let entry_id = writer
                .enqueue(SyncEntity::SaleCancellation, &sale.id, &payload)
                .await?;
            CancelResult::Queued {
                sale: sale.clone(),
                entry_id,
            }
        } else {
            writer
                .set_sync_status(SyncEntity::SaleCancellation, &sale.id, SyncState::Synced, None)
                .await?;
            CancelResult::Cancelled(sale.clone())
        };
        writer.commit().await?;

        info!(
            store_id = %tenant,
            sale_id = %sale.id,
            queued = enqueue,
            "Sale cancelled"
        );
        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Stock Adjustments
    // -------------------------------------------------------------------------

    /// Adds received units to a product.
    pub async fn record_restock(&self, product_id: &str, quantity: i64) -> SyncResult<StockUpdate> {
        validate_quantity(quantity)?;
        self.adjust_stock(product_id, quantity, MovementReason::Restock)
            .await
    }

    /// Applies a manual stock change and queues its movement for the remote.
    ///
    /// Sale, cancellation and correction movements are produced by the core
    /// itself and are refused here.
    pub async fn adjust_stock(
        &self,
        product_id: &str,
        delta: i64,
        reason: MovementReason,
    ) -> SyncResult<StockUpdate> {
        if !matches!(reason, MovementReason::Restock | MovementReason::Adjustment) {
            return Err(SyncError::Validation(format!(
                "'{}' movements cannot be recorded manually",
                reason.as_str()
            )));
        }
        if delta == 0 {
            return Err(SyncError::Validation("stock delta must not be zero".into()));
        }

        let tenant = self.tenant.require().await?;
        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        let update = writer
            .apply_stock_delta(product_id, delta, reason, None)
            .await?;
        // Only the primary movement travels; the remote floors on its own.
        if let Some(primary) = update.movements.first() {
            writer
                .enqueue(SyncEntity::StockMovement, &primary.id, primary)
                .await?;
        }
        writer.commit().await?;

        info!(
            store_id = %tenant,
            product_id = %product_id,
            delta,
            reason = reason.as_str(),
            new_stock = update.product.stock,
            "Stock adjusted"
        );
        Ok(update)
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

async fn resolve_line(
    store: &LocalCacheStore,
    line: &SaleRequestLine,
) -> SyncResult<Product> {
    if let Some(sku) = line.sku.as_deref().filter(|s| !s.trim().is_empty()) {
        if let Some(product) = store.find_product_by_sku(sku).await? {
            return Ok(product);
        }
    }
    if let Some(id) = line.product_id.as_deref().filter(|s| !s.trim().is_empty()) {
        if let Some(product) = store.get_by_id::<Product>(id).await? {
            return Ok(product);
        }
    }
    let key = line
        .sku
        .as_deref()
        .or(line.product_id.as_deref())
        .unwrap_or_default();
    Err(SyncError::NotFound(format!("product {key}")))
}

pub(crate) fn shortage_from_response(response: &AtomicSaleResponse, sale: &Sale) -> StockShortage {
    let product_id = response.product_id.clone().unwrap_or_default();
    let requested = sale
        .quantities()
        .into_iter()
        .find(|(id, _)| *id == product_id)
        .map(|(_, qty)| qty)
        .unwrap_or_default();
    StockShortage {
        sku: sale
            .items
            .iter()
            .find(|line| line.product_id == product_id)
            .map(|line| line.sku.clone()),
        available: response.available_stock.unwrap_or_default(),
        required: response.required_quantity.unwrap_or(requested),
        product_id,
    }
}

/// Applies a stock delta, logging instead of failing when the product has
/// since left the catalog.
async fn apply_or_skip(
    writer: &mut CacheWriter,
    product_id: &str,
    delta: i64,
    reason: MovementReason,
    sale_id: &str,
) -> SyncResult<()> {
    match writer
        .apply_stock_delta(product_id, delta, reason, Some(sale_id))
        .await
    {
        Ok(_) => Ok(()),
        Err(DbError::NotFound { .. }) => {
            warn!(
                store_id = %writer.tenant(),
                product_id = %product_id,
                sale_id = %sale_id,
                reason = reason.as_str(),
                "Product no longer cached; stock change skipped"
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Records a remote confirmation locally: decrements stock unless this key
/// was already applied, re-keys the sale when the remote chose another id,
/// and marks the receipt confirmed.
pub(crate) async fn record_confirmation(
    db: &Database,
    tenant: &TenantId,
    sale: Sale,
    remote_sale_id: Option<String>,
) -> SyncResult<Sale> {
    let mut writer = db.cache(tenant.clone().into()).begin_write().await?;
    let sale = confirm_in(&mut writer, sale, remote_sale_id).await?;
    writer.commit().await?;
    Ok(sale)
}

/// `record_confirmation` inside a caller's writer, so a queue drain can mark
/// its entry synced in the same transaction.
pub(crate) async fn confirm_in(
    writer: &mut CacheWriter,
    sale: Sale,
    remote_sale_id: Option<String>,
) -> SyncResult<Sale> {
    let tenant = writer.tenant().clone();
    let receipt = writer.receipt(&sale.external_id).await?;
    let confirmed_id = remote_sale_id.unwrap_or_else(|| sale.id.clone());

    let sale = match receipt.as_ref().filter(|r| r.local_applied) {
        Some(receipt) => {
            let mut stored = writer
                .get_by_id::<Sale>(&receipt.sale_id)
                .await?
                .unwrap_or(sale);
            if stored.id != confirmed_id {
                debug!(
                    store_id = %tenant,
                    local_id = %stored.id,
                    remote_id = %confirmed_id,
                    "Re-keying sale to the remote id"
                );
                writer.delete::<Sale>(&stored.id).await?;
                stored.id = confirmed_id;
            }
            writer.put(&stored).await?;
            stored
        }
        None => {
            let mut sale = sale;
            sale.id = confirmed_id;
            for (product_id, quantity) in sale.quantities() {
                apply_or_skip(
                    writer,
                    &product_id,
                    -quantity,
                    MovementReason::Sale,
                    &sale.id,
                )
                .await?;
            }
            writer.put(&sale).await?;
            sale
        }
    };

    writer
        .put_receipt(&SaleReceipt {
            store_id: tenant.as_str().to_string(),
            external_id: sale.external_id.clone(),
            sale_id: sale.id.clone(),
            local_applied: true,
            remote_confirmed: true,
            created_at: receipt.map(|r| r.created_at).unwrap_or_else(Utc::now),
        })
        .await?;
    writer
        .set_sync_status(SyncEntity::Sale, &sale.id, SyncState::Synced, None)
        .await?;
    Ok(sale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::tenant::SessionSource;
    use async_trait::async_trait;
    use std::time::Duration;
    use tally_core::PaymentMethod;
    use tally_db::DbConfig;

    struct NoSession;

    #[async_trait]
    impl SessionSource for NoSession {
        async fn session_store_id(&self) -> SyncResult<Option<String>> {
            Ok(None)
        }
    }

    fn store_id() -> TenantId {
        TenantId::new("store-1").unwrap()
    }

    async fn setup(stock: i64) -> (AtomicSaleCoordinator, MemoryRemote, Database, Product) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = MemoryRemote::new();
        let mut product = Product::new_local(&store_id(), "ABC-1", "Shirt", stock, 500, 1000);
        remote.seed_product(product.clone());
        product.provenance = tally_core::Provenance::Remote;
        db.cache(store_id().into()).put(&product).await.unwrap();

        let tenant = Arc::new(
            TenantContext::new(Arc::new(NoSession), Duration::from_secs(300))
                .with_configured(Some(store_id())),
        );
        let gateway = RemoteGateway::new(Arc::new(remote.clone()), Duration::from_secs(5), false);
        let coordinator = AtomicSaleCoordinator::new(db.clone(), tenant, gateway, "device-1");
        (coordinator, remote, db, product)
    }

    async fn cached_stock(db: &Database, product_id: &str) -> i64 {
        db.cache(store_id().into())
            .get_by_id::<Product>(product_id)
            .await
            .unwrap()
            .unwrap()
            .stock
    }

    #[tokio::test]
    async fn test_unknown_sku_is_not_found() {
        let (coordinator, _, _, _) = setup(5).await;
        let request = SaleRequest::new(vec![SaleRequestLine::by_sku("NOPE", 1)], PaymentMethod::Cash);

        let err = coordinator.create_sale(request).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sku_preferred_over_stale_id() {
        let (coordinator, _, db, product) = setup(5).await;
        let line = SaleRequestLine {
            product_id: Some("stale-id".into()),
            sku: Some("ABC-1".into()),
            quantity: 1,
        };
        let request = SaleRequest::new(vec![line], PaymentMethod::Card);

        let result = coordinator.create_sale(request).await.unwrap();

        let sale = result.sale().unwrap();
        assert_eq!(sale.items[0].product_id, product.id);
        assert_eq!(sale.items[0].unit_price_cents, 1000);
        assert_eq!(cached_stock(&db, &product.id).await, 4);
    }

    #[tokio::test]
    async fn test_synchronous_sale_fails_offline() {
        let (coordinator, remote, db, product) = setup(5).await;
        remote.set_offline(true);
        let request = SaleRequest::new(vec![SaleRequestLine::by_sku("ABC-1", 1)], PaymentMethod::Cash)
            .with_confirmation(Confirmation::Synchronous);

        let err = coordinator.create_sale(request).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(cached_stock(&db, &product.id).await, 5);
    }

    #[tokio::test]
    async fn test_offline_short_stock_surfaces_network_error() {
        let (coordinator, remote, db, product) = setup(1).await;
        remote.set_offline(true);
        let request = SaleRequest::new(vec![SaleRequestLine::by_sku("ABC-1", 2)], PaymentMethod::Cash);

        let err = coordinator.create_sale(request).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(cached_stock(&db, &product.id).await, 1);
        let pending = db.sync_queue().count("store-1", SyncState::Pending).await.unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_cashier_cannot_cancel() {
        let (coordinator, _, _, _) = setup(5).await;
        let err = coordinator.cancel_sale("any", Role::Cashier).await.unwrap_err();
        assert!(matches!(err, SyncError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_cancel_restores_stock_once() {
        let (coordinator, remote, db, product) = setup(5).await;
        let request = SaleRequest::new(vec![SaleRequestLine::by_sku("ABC-1", 2)], PaymentMethod::Cash);
        let sale = coordinator.create_sale(request).await.unwrap().sale().cloned().unwrap();

        let first = coordinator.cancel_sale(&sale.id, Role::Manager).await.unwrap();
        let second = coordinator.cancel_sale(&sale.id, Role::Admin).await.unwrap();

        assert!(matches!(first, CancelResult::Cancelled(_)));
        assert!(matches!(second, CancelResult::AlreadyCancelled(_)));
        assert_eq!(cached_stock(&db, &product.id).await, 5);
        assert_eq!(remote.product("store-1", &product.id).unwrap().stock, 5);
    }

    #[tokio::test]
    async fn test_adjust_rejects_system_reasons() {
        let (coordinator, _, _, product) = setup(5).await;
        for reason in [MovementReason::Sale, MovementReason::Correction] {
            let err = coordinator.adjust_stock(&product.id, 1, reason).await.unwrap_err();
            assert!(matches!(err, SyncError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn test_restock_queues_movement() {
        let (coordinator, _, db, product) = setup(5).await;

        let update = coordinator.record_restock(&product.id, 3).await.unwrap();

        assert_eq!(update.product.stock, 8);
        let entries = db.sync_queue().entries("store-1", Some(SyncState::Pending)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity_type, SyncEntity::StockMovement);
        assert_eq!(entries[0].entity_id, update.movements[0].id);
    }
}
