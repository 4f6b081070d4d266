//! # Local Cache Store
//!
//! The device's working copy of tenant data: catalog, sales, expenses, cash
//! sessions, closures and staff, each stored as a versioned JSON document in
//! `cache_documents`, namespaced by `store_id`.
//!
//! ## Read / Write Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        LocalCacheStore                                  │
//! │                                                                         │
//! │  READS (pool, no lock)                                                  │
//! │    get::<T>() / get_by_id / find_product_by_sku / movements / receipt  │
//! │    scope = Resolved(s)  ──► WHERE store_id = s                         │
//! │    scope = Unresolved   ──► every tenant (read-all mode)               │
//! │                                                                         │
//! │  WRITES (single writer per tenant)                                      │
//! │    begin_write() ──► tenant mutex ──► BEGIN IMMEDIATE ──► CacheWriter  │
//! │                                  ... put / delete / stock / enqueue    │
//! │                      commit() ──► COMMIT ──► mutex released            │
//! │    put / delete / replace_all are one-shot wrappers over begin_write   │
//! │                                                                         │
//! │    scope = Unresolved   ──► begin_write() FAILS (TenantUnresolved)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `CacheWriter` owns a pooled connection for its whole lifetime. Code
//! holding one reads through the writer, never through the store, and never
//! awaits a remote call.
//!
//! Writers take SQLite's write lock up front (`BEGIN IMMEDIATE`). A deferred
//! transaction that read first would fail with `SQLITE_BUSY_SNAPSHOT` once
//! another connection committed in between, and the busy handler does not
//! retry that case.

pub mod writer;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Executor, Sqlite, SqlitePool};
use std::sync::Arc;
use tally_core::{
    CashClosure, CashSession, Expense, Product, Sale, SaleReceipt, StaffMember, StockMovement,
    SyncEntity, SyncStatusRecord, TenantScope,
};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use writer::{CacheWriter, WriterRegistry};

/// Body layout version written by this build.
pub const CURRENT_DOC_VERSION: i64 = 2;

// =============================================================================
// Cache Entity
// =============================================================================

/// A type stored as a document in `cache_documents`.
pub trait CacheEntity: Serialize + DeserializeOwned + Send + Sync + Unpin {
    /// Collection name; also the discriminator in the table.
    const COLLECTION: &'static str;

    fn id(&self) -> &str;

    fn store_id(&self) -> &str;

    /// Per-tenant unique business key, if the collection has one.
    fn natural_key(&self) -> Option<String> {
        None
    }
}

impl CacheEntity for Product {
    const COLLECTION: &'static str = "product";

    fn id(&self) -> &str {
        &self.id
    }

    fn store_id(&self) -> &str {
        &self.store_id
    }

    fn natural_key(&self) -> Option<String> {
        Some(self.sku.trim().to_string())
    }
}

impl CacheEntity for Sale {
    const COLLECTION: &'static str = "sale";

    fn id(&self) -> &str {
        &self.id
    }

    fn store_id(&self) -> &str {
        &self.store_id
    }

    fn natural_key(&self) -> Option<String> {
        Some(self.external_id.clone())
    }
}

impl CacheEntity for Expense {
    const COLLECTION: &'static str = "expense";

    fn id(&self) -> &str {
        &self.id
    }

    fn store_id(&self) -> &str {
        &self.store_id
    }
}

impl CacheEntity for CashSession {
    const COLLECTION: &'static str = "cash_session";

    fn id(&self) -> &str {
        &self.id
    }

    fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Only open sessions carry a key, which makes "one open session per
    /// tenant and device" a unique index.
    fn natural_key(&self) -> Option<String> {
        self.is_open().then(|| open_session_key(&self.device_id))
    }
}

impl CacheEntity for CashClosure {
    const COLLECTION: &'static str = "cash_closure";

    fn id(&self) -> &str {
        &self.id
    }

    fn store_id(&self) -> &str {
        &self.store_id
    }

    fn natural_key(&self) -> Option<String> {
        Some(self.cash_session_id.clone())
    }
}

impl CacheEntity for StaffMember {
    const COLLECTION: &'static str = "staff";

    fn id(&self) -> &str {
        &self.id
    }

    fn store_id(&self) -> &str {
        &self.store_id
    }
}

pub(crate) fn open_session_key(device_id: &str) -> String {
    format!("open:{device_id}")
}

// =============================================================================
// Shared Queries
// =============================================================================
// Used by both the store (pool) and the writer (its own transaction).

pub(crate) async fn fetch_all<'c, T, E>(executor: E, store: Option<&str>) -> DbResult<Vec<T>>
where
    T: CacheEntity,
    E: Executor<'c, Database = Sqlite>,
{
    let bodies: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT body FROM cache_documents
        WHERE collection = ?1 AND (?2 IS NULL OR store_id = ?2)
        ORDER BY store_id, natural_key, id
        "#,
    )
    .bind(T::COLLECTION)
    .bind(store)
    .fetch_all(executor)
    .await?;

    bodies
        .iter()
        .map(|b| serde_json::from_str::<T>(b).map_err(DbError::from))
        .collect()
}

pub(crate) async fn fetch_by_id<'c, T, E>(
    executor: E,
    store: Option<&str>,
    id: &str,
) -> DbResult<Option<T>>
where
    T: CacheEntity,
    E: Executor<'c, Database = Sqlite>,
{
    let body: Option<String> = sqlx::query_scalar(
        r#"
        SELECT body FROM cache_documents
        WHERE collection = ?1 AND id = ?2 AND (?3 IS NULL OR store_id = ?3)
        LIMIT 1
        "#,
    )
    .bind(T::COLLECTION)
    .bind(id)
    .bind(store)
    .fetch_optional(executor)
    .await?;

    body.map(|b| serde_json::from_str::<T>(&b).map_err(DbError::from))
        .transpose()
}

pub(crate) async fn fetch_by_natural_key<'c, T, E>(
    executor: E,
    store: Option<&str>,
    key: &str,
) -> DbResult<Option<T>>
where
    T: CacheEntity,
    E: Executor<'c, Database = Sqlite>,
{
    let body: Option<String> = sqlx::query_scalar(
        r#"
        SELECT body FROM cache_documents
        WHERE collection = ?1 AND natural_key = ?2 AND (?3 IS NULL OR store_id = ?3)
        LIMIT 1
        "#,
    )
    .bind(T::COLLECTION)
    .bind(key)
    .bind(store)
    .fetch_optional(executor)
    .await?;

    body.map(|b| serde_json::from_str::<T>(&b).map_err(DbError::from))
        .transpose()
}

pub(crate) async fn fetch_receipt<'c, E>(
    executor: E,
    store: Option<&str>,
    external_id: &str,
) -> DbResult<Option<SaleReceipt>>
where
    E: Executor<'c, Database = Sqlite>,
{
    let receipt = sqlx::query_as::<_, SaleReceipt>(
        r#"
        SELECT store_id, external_id, sale_id, local_applied, remote_confirmed, created_at
        FROM sale_receipts
        WHERE external_id = ?1 AND (?2 IS NULL OR store_id = ?2)
        LIMIT 1
        "#,
    )
    .bind(external_id)
    .bind(store)
    .fetch_optional(executor)
    .await?;

    Ok(receipt)
}

// =============================================================================
// Local Cache Store
// =============================================================================

/// Tenant-scoped handle on the local cache.
#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    pool: SqlitePool,
    writers: Arc<WriterRegistry>,
    scope: TenantScope,
}

impl LocalCacheStore {
    pub(crate) fn new(pool: SqlitePool, writers: Arc<WriterRegistry>, scope: TenantScope) -> Self {
        LocalCacheStore {
            pool,
            writers,
            scope,
        }
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// All entities of a collection visible in this scope.
    pub async fn get<T: CacheEntity>(&self) -> DbResult<Vec<T>> {
        fetch_all(&self.pool, self.scope.store_filter()).await
    }

    pub async fn get_by_id<T: CacheEntity>(&self, id: &str) -> DbResult<Option<T>> {
        fetch_by_id(&self.pool, self.scope.store_filter(), id).await
    }

    pub async fn find_product_by_sku(&self, sku: &str) -> DbResult<Option<Product>> {
        fetch_by_natural_key(&self.pool, self.scope.store_filter(), sku.trim()).await
    }

    /// The open cash session of a device, if any.
    pub async fn open_session(&self, device_id: &str) -> DbResult<Option<CashSession>> {
        fetch_by_natural_key(
            &self.pool,
            self.scope.store_filter(),
            &open_session_key(device_id),
        )
        .await
    }

    pub async fn receipt(&self, external_id: &str) -> DbResult<Option<SaleReceipt>> {
        fetch_receipt(&self.pool, self.scope.store_filter(), external_id).await
    }

    /// Stock movements of one product, oldest first.
    pub async fn movements(&self, product_id: &str) -> DbResult<Vec<StockMovement>> {
        let movements = sqlx::query_as::<_, StockMovement>(
            r#"
            SELECT id, store_id, product_id, delta, previous_stock, new_stock,
                   reason, sale_id, created_at
            FROM stock_movements
            WHERE product_id = ?1 AND (?2 IS NULL OR store_id = ?2)
            ORDER BY rowid ASC
            "#,
        )
        .bind(product_id)
        .bind(self.scope.store_filter())
        .fetch_all(&self.pool)
        .await?;

        Ok(movements)
    }

    pub async fn sync_status(
        &self,
        entity_type: SyncEntity,
        entity_id: &str,
    ) -> DbResult<Option<SyncStatusRecord>> {
        let record = sqlx::query_as::<_, SyncStatusRecord>(
            r#"
            SELECT entity_type, entity_id, status, last_error, updated_at
            FROM sync_status
            WHERE entity_type = ?1 AND entity_id = ?2 AND (?3 IS NULL OR store_id = ?3)
            LIMIT 1
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(self.scope.store_filter())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Queue entries still waiting for delivery.
    pub async fn pending_sync_count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sync_queue
            WHERE status = 'pending' AND (?1 IS NULL OR store_id = ?1)
            "#,
        )
        .bind(self.scope.store_filter())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Takes this tenant's writer and opens a transaction.
    ///
    /// Concurrent callers for the same tenant queue here. Dropping the
    /// writer without `commit()` rolls everything back.
    pub async fn begin_write(&self) -> DbResult<CacheWriter> {
        let tenant = self.scope.require()?.clone();
        let lock = self.writers.lock_for(&tenant);
        let guard = lock.lock_owned().await;
        let tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
        debug!(store_id = %tenant, "Writer acquired");
        Ok(CacheWriter::new(tx, tenant, guard))
    }

    /// Inserts or replaces one entity.
    pub async fn put<T: CacheEntity>(&self, entity: &T) -> DbResult<()> {
        let mut writer = self.begin_write().await?;
        writer.put(entity).await?;
        writer.commit().await
    }

    /// Removes one entity. Returns whether it existed.
    pub async fn delete<T: CacheEntity>(&self, id: &str) -> DbResult<bool> {
        let mut writer = self.begin_write().await?;
        let existed = writer.delete::<T>(id).await?;
        writer.commit().await?;
        Ok(existed)
    }

    /// Atomically replaces the whole collection for this tenant.
    pub async fn replace_all<T: CacheEntity>(&self, entities: &[T]) -> DbResult<()> {
        let mut writer = self.begin_write().await?;
        writer.replace_all(entities).await?;
        writer.commit().await
    }

    /// First-use initialization: seeds the bootstrap admin exactly once per
    /// tenant. Returns `true` when the seed ran now.
    pub async fn initialize(&self) -> DbResult<bool> {
        let mut writer = self.begin_write().await?;
        let seeded = writer.mark_once("bootstrap_admin").await?;
        if seeded {
            let admin = StaffMember::bootstrap_admin(writer.tenant());
            writer.put(&admin).await?;
            info!(store_id = %writer.tenant(), staff_id = %admin.id, "Seeded bootstrap admin");
        }
        writer.commit().await?;
        Ok(seeded)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use tally_core::{Provenance, TenantId};

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let db = db().await;
        let store = db.cache(tenant("s1").into());
        let product = Product::new_local(&tenant("s1"), "ABC-1", "Shirt", 5, 100, 200);

        store.put(&product).await.unwrap();

        let loaded: Option<Product> = store.get_by_id(&product.id).await.unwrap();
        assert_eq!(loaded, Some(product.clone()));
        let by_sku = store.find_product_by_sku("ABC-1").await.unwrap();
        assert_eq!(by_sku.map(|p| p.id), Some(product.id));
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let db = db().await;
        let a = db.cache(tenant("a").into());
        let b = db.cache(tenant("b").into());
        a.put(&Product::new_local(&tenant("a"), "X", "A's", 1, 1, 1))
            .await
            .unwrap();
        b.put(&Product::new_local(&tenant("b"), "X", "B's", 1, 1, 1))
            .await
            .unwrap();

        let from_a: Vec<Product> = a.get().await.unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].name, "A's");

        let all: Vec<Product> = db.cache(TenantScope::Unresolved).get().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_unresolved_scope_rejects_writes() {
        let db = db().await;
        let store = db.cache(TenantScope::Unresolved);
        let product = Product::new_local(&tenant("s1"), "ABC-1", "Shirt", 5, 100, 200);

        let err = store.put(&product).await.unwrap_err();
        assert!(matches!(err, DbError::TenantUnresolved));
    }

    #[tokio::test]
    async fn test_cross_tenant_write_rejected() {
        let db = db().await;
        let store = db.cache(tenant("a").into());
        let foreign = Product::new_local(&tenant("b"), "ABC-1", "Shirt", 5, 100, 200);

        let err = store.put(&foreign).await.unwrap_err();
        assert!(matches!(err, DbError::TenantMismatch { .. }));
    }

    #[tokio::test]
    async fn test_sku_unique_within_tenant() {
        let db = db().await;
        let store = db.cache(tenant("s1").into());
        store
            .put(&Product::new_local(&tenant("s1"), "ABC-1", "One", 1, 1, 1))
            .await
            .unwrap();

        let err = store
            .put(&Product::new_local(&tenant("s1"), "ABC-1", "Two", 1, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_replace_all_is_atomic_per_tenant() {
        let db = db().await;
        let s1 = db.cache(tenant("s1").into());
        let s2 = db.cache(tenant("s2").into());
        s1.put(&Product::new_local(&tenant("s1"), "OLD", "Old", 1, 1, 1))
            .await
            .unwrap();
        s2.put(&Product::new_local(&tenant("s2"), "KEEP", "Keep", 1, 1, 1))
            .await
            .unwrap();

        let mut fresh = Product::new_local(&tenant("s1"), "NEW", "New", 3, 1, 1);
        fresh.provenance = Provenance::Remote;
        s1.replace_all(&[fresh.clone()]).await.unwrap();

        let s1_products: Vec<Product> = s1.get().await.unwrap();
        assert_eq!(s1_products, vec![fresh]);
        let s2_products: Vec<Product> = s2.get().await.unwrap();
        assert_eq!(s2_products.len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_admin_seeded_once() {
        let db = db().await;
        let store = db.cache(tenant("s1").into());

        assert!(store.initialize().await.unwrap());
        assert!(!store.initialize().await.unwrap());

        let staff: Vec<StaffMember> = store.get().await.unwrap();
        assert_eq!(staff.len(), 1);
        assert_eq!(staff[0].role, tally_core::Role::Admin);
    }

    #[tokio::test]
    async fn test_one_open_session_per_device() {
        let db = db().await;
        let store = db.cache(tenant("s1").into());
        let first = CashSession::open(&tenant("s1"), "till-1", "admin", 0);
        store.put(&first).await.unwrap();

        let second = CashSession::open(&tenant("s1"), "till-1", "admin", 0);
        assert!(store.put(&second).await.is_err());

        let other_device = CashSession::open(&tenant("s1"), "till-2", "admin", 0);
        assert!(store.put(&other_device).await.is_ok());

        let open = store.open_session("till-1").await.unwrap();
        assert_eq!(open.map(|s| s.id), Some(first.id));
    }
}
