//! # Reconciliation Engine
//!
//! Pulls remote snapshots into the local cache.
//!
//! ## Pull Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  pull_catalog()                                                         │
//! │                                                                         │
//! │  1. tenant.require()              Unresolved → TenantUnresolved         │
//! │  2. remote.fetch_products(store)  NO WRITER HELD; error → return it,    │
//! │                                   cache untouched                       │
//! │  3. ┌──────────── writer ────────────┐                                  │
//! │     │ local = get::<Product>()       │                                  │
//! │     │ outcome = reconcile(remote,    │  pure merge in tally-core        │
//! │     │                     local)     │                                  │
//! │     │ replay pending stock changes   │  queued sales, cancellations     │
//! │     │                                │  and movements the remote has    │
//! │     │                                │  not seen yet                    │
//! │     │ replace_all(outcome.merged)    │                                  │
//! │     └──────────── commit ────────────┘                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Catalog data is "last reconciliation wins": remote fields replace local
//! ones, upstream deletions are honoured, and never-pushed local rows stay.
//! Stock is the exception: the remote value is the base, and every stock
//! change still pending in the sync queue is applied on top of it, floored
//! at zero. Once such an entry is pushed, the receipt's `local_applied` flag
//! keeps the decrement from being applied twice.

use std::collections::HashMap;
use std::sync::Arc;
use tally_core::{
    reconcile, Expense, MergeOutcome, Product, Reconcilable, Sale, StockChange, StockMovement,
    SyncEntity, TenantId,
};
use tally_db::{CacheEntity, CacheWriter, Database};
use tracing::{debug, error, info};

use crate::error::SyncResult;
use crate::remote::RemoteGateway;
use crate::sale::CancellationPayload;
use crate::tenant::TenantContext;

/// What one pull changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub store_id: String,
    /// Rows in the remote snapshot.
    pub fetched: usize,
    /// Rows in the cache after the merge.
    pub merged: usize,
    /// Local ids removed because they were deleted upstream.
    pub dropped_upstream: Vec<String>,
    /// Local-only ids kept for a later push.
    pub kept_local: Vec<String>,
    /// Local ids replaced by a remote row with the same SKU.
    pub collapsed: Vec<String>,
    /// Products whose remote stock was adjusted by queued changes.
    pub replayed: Vec<String>,
}

/// Merges remote snapshots into the tenant's cache.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    db: Database,
    tenant: Arc<TenantContext>,
    remote: RemoteGateway,
}

impl ReconciliationEngine {
    pub fn new(db: Database, tenant: Arc<TenantContext>, remote: RemoteGateway) -> Self {
        ReconciliationEngine { db, tenant, remote }
    }

    /// Refreshes the product catalog from the remote.
    pub async fn pull_catalog(&self) -> SyncResult<PullReport> {
        let tenant = self.tenant.require().await?;
        let snapshot = self.remote.fetch_products(tenant.as_str()).await?;
        let fetched = snapshot.len();
        let remote = own_rows(&tenant, snapshot);

        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        let local = writer.get::<Product>().await?;
        let mut outcome = reconcile(remote, local);
        let replayed = replay_pending_stock(&mut writer, &mut outcome.merged).await?;
        writer.replace_all(&outcome.merged).await?;
        writer.commit().await?;

        Ok(report::<Product>(&tenant, fetched, outcome, replayed))
    }

    /// Refreshes expenses from the remote.
    pub async fn pull_expenses(&self) -> SyncResult<PullReport> {
        let tenant = self.tenant.require().await?;
        let snapshot: Vec<Expense> = self.remote.fetch_expenses(tenant.as_str()).await?;
        let fetched = snapshot.len();
        let remote = own_rows(&tenant, snapshot);

        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        let local = writer.get::<Expense>().await?;
        let outcome = reconcile(remote, local);
        writer.replace_all(&outcome.merged).await?;
        writer.commit().await?;

        Ok(report::<Expense>(&tenant, fetched, outcome, Vec::new()))
    }
}

/// Keeps the snapshot rows of `tenant`, logging any others.
fn own_rows<T: CacheEntity>(tenant: &TenantId, snapshot: Vec<T>) -> Vec<T> {
    let (own, foreign): (Vec<T>, Vec<T>) = snapshot
        .into_iter()
        .partition(|entity| entity.store_id() == tenant.as_str());
    if !foreign.is_empty() {
        error!(
            store_id = %tenant,
            collection = T::COLLECTION,
            count = foreign.len(),
            "Remote snapshot contained rows of another tenant; ignored"
        );
    }
    own
}

/// Net stock delta per product of the stock changes still in the queue.
async fn pending_stock_deltas(writer: &mut CacheWriter) -> SyncResult<HashMap<String, i64>> {
    let mut deltas: HashMap<String, i64> = HashMap::new();
    for entry in writer.pending_entries().await? {
        match entry.entity_type {
            SyncEntity::Sale => {
                let sale: Sale = serde_json::from_str(&entry.payload)?;
                for (product_id, quantity) in sale.quantities() {
                    *deltas.entry(product_id).or_default() -= quantity;
                }
            }
            SyncEntity::SaleCancellation => {
                let payload: CancellationPayload = serde_json::from_str(&entry.payload)?;
                if let Some(sale) = writer.get_by_id::<Sale>(&payload.sale_id).await? {
                    for (product_id, quantity) in sale.quantities() {
                        *deltas.entry(product_id).or_default() += quantity;
                    }
                }
            }
            SyncEntity::StockMovement => {
                let movement: StockMovement = serde_json::from_str(&entry.payload)?;
                *deltas.entry(movement.product_id).or_default() += movement.delta;
            }
            _ => {}
        }
    }
    deltas.retain(|_, delta| *delta != 0);
    Ok(deltas)
}

/// Applies queued stock changes over the merged remote stock. Returns the
/// ids of the products it touched.
async fn replay_pending_stock(
    writer: &mut CacheWriter,
    merged: &mut [Product],
) -> SyncResult<Vec<String>> {
    let deltas = pending_stock_deltas(writer).await?;
    if deltas.is_empty() {
        return Ok(Vec::new());
    }

    let mut replayed = Vec::new();
    for product in merged.iter_mut() {
        let Some(&delta) = deltas.get(&product.id) else {
            continue;
        };
        let change = StockChange::compute(product.stock, delta);
        debug!(
            store_id = %writer.tenant(),
            product_id = %product.id,
            remote_stock = change.previous_stock,
            pending_delta = delta,
            new_stock = change.new_stock,
            "Replaying queued stock changes over remote stock"
        );
        product.stock = change.new_stock;
        replayed.push(product.id.clone());
    }
    Ok(replayed)
}

fn report<T: CacheEntity>(
    tenant: &TenantId,
    fetched: usize,
    outcome: MergeOutcome<T>,
    replayed: Vec<String>,
) -> PullReport {
    let report = PullReport {
        store_id: tenant.as_str().to_string(),
        fetched,
        merged: outcome.merged.len(),
        dropped_upstream: outcome.dropped_upstream,
        kept_local: outcome.kept_local,
        collapsed: outcome.collapsed_duplicates,
        replayed,
    };

    info!(
        store_id = %tenant,
        collection = T::COLLECTION,
        fetched = report.fetched,
        merged = report.merged,
        dropped = report.dropped_upstream.len(),
        kept_local = report.kept_local.len(),
        collapsed = report.collapsed.len(),
        replayed = report.replayed.len(),
        "Reconciliation complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::remote::MemoryRemote;
    use crate::tenant::SessionSource;
    use async_trait::async_trait;
    use std::time::Duration;
    use tally_core::Provenance;
    use tally_db::DbConfig;

    struct NoSession;

    #[async_trait]
    impl SessionSource for NoSession {
        async fn session_store_id(&self) -> SyncResult<Option<String>> {
            Ok(None)
        }
    }

    fn store() -> TenantId {
        TenantId::new("store-1").unwrap()
    }

    async fn engine(remote: MemoryRemote) -> (ReconciliationEngine, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let tenant = Arc::new(
            TenantContext::new(Arc::new(NoSession), Duration::from_secs(300))
                .with_configured(Some(store())),
        );
        let gateway = RemoteGateway::new(Arc::new(remote), Duration::from_secs(5), false);
        (ReconciliationEngine::new(db.clone(), tenant, gateway), db)
    }

    #[tokio::test]
    async fn test_fetch_error_leaves_cache_untouched() {
        let remote = MemoryRemote::new();
        let (engine, db) = engine(remote.clone()).await;
        let cache = db.cache(store().into());
        let local = Product::new_local(&store(), "LOCAL-1", "Local", 3, 10, 20);
        cache.put(&local).await.unwrap();

        remote.set_offline(true);
        let err = engine.pull_catalog().await.unwrap_err();

        assert!(matches!(err, SyncError::Network(_)));
        let products: Vec<Product> = cache.get().await.unwrap();
        assert_eq!(products, vec![local]);
    }

    #[tokio::test]
    async fn test_pull_stamps_remote_provenance() {
        let remote = MemoryRemote::new();
        remote.seed_product(Product::new_local(&store(), "ABC-1", "Shirt", 5, 100, 200));
        let (engine, db) = engine(remote).await;

        let report = engine.pull_catalog().await.unwrap();

        assert_eq!(report.fetched, 1);
        assert_eq!(report.merged, 1);
        let products: Vec<Product> = db.cache(store().into()).get().await.unwrap();
        assert_eq!(products[0].provenance, Provenance::Remote);
    }

    #[tokio::test]
    async fn test_pull_replays_queued_movements() {
        let remote = MemoryRemote::new();
        let mut product = Product::new_local(&store(), "ABC-1", "Shirt", 5, 100, 200);
        remote.seed_product(product.clone());
        let (engine, db) = engine(remote).await;
        let cache = db.cache(store().into());
        product.provenance = Provenance::Remote;
        cache.put(&product).await.unwrap();

        let mut writer = cache.begin_write().await.unwrap();
        let update = writer
            .apply_stock_delta(&product.id, 3, tally_core::MovementReason::Restock, None)
            .await
            .unwrap();
        writer
            .enqueue(SyncEntity::StockMovement, &update.movements[0].id, &update.movements[0])
            .await
            .unwrap();
        writer.commit().await.unwrap();

        let report = engine.pull_catalog().await.unwrap();

        assert_eq!(report.replayed, vec![product.id.clone()]);
        let cached: Product = cache.get_by_id(&product.id).await.unwrap().unwrap();
        assert_eq!(cached.stock, 8);
    }

    #[tokio::test]
    async fn test_pull_expenses_keeps_unpushed() {
        let remote = MemoryRemote::new();
        let (engine, db) = engine(remote).await;
        let cache = db.cache(store().into());
        let expense = Expense::new_local(&store(), "Coffee", None, 450, None);
        cache.put(&expense).await.unwrap();

        let report = engine.pull_expenses().await.unwrap();

        assert_eq!(report.kept_local, vec![expense.id.clone()]);
        let expenses: Vec<Expense> = cache.get().await.unwrap();
        assert_eq!(expenses.len(), 1);
    }
}
