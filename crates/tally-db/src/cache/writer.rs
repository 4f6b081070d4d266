//! # Cache Writer
//!
//! The only way to mutate a tenant's namespace. A writer is the pair
//! (tenant mutex guard, SQLite transaction); everything done through it
//! commits or rolls back together.
//!
//! ## Outbox In One Transaction
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  let mut w = store.begin_write().await?;                               │
//! │                                                                         │
//! │  w.apply_stock_delta(product, -2, Sale, sale_id)   ─┐                  │
//! │  w.put(&sale)                                        │ SAME             │
//! │  w.put_receipt(&receipt)                             │ TRANSACTION      │
//! │  w.enqueue(SyncEntity::Sale, &sale.id, &payload)    ─┘                  │
//! │                                                                         │
//! │  w.commit().await?;     ← all four or none                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tally_core::{
    CashSession, MovementReason, Product, Provenance, Reconcilable, SaleReceipt,
    StockChange, StockMovement, SyncEntity, SyncQueueEntry, SyncState, TenantId,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

use super::{
    fetch_all, fetch_by_id, fetch_by_natural_key, fetch_receipt, open_session_key, CacheEntity,
    CURRENT_DOC_VERSION,
};
use crate::error::{DbError, DbResult};

// =============================================================================
// Writer Registry
// =============================================================================

/// One async mutex per tenant namespace.
#[derive(Debug, Default)]
pub struct WriterRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl WriterRegistry {
    pub(crate) fn lock_for(&self, tenant: &TenantId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(tenant.as_str().to_string()).or_default().clone()
    }
}

// =============================================================================
// Stock Update
// =============================================================================

/// What `apply_stock_delta` did.
#[derive(Debug, Clone)]
pub struct StockUpdate {
    pub product: Product,
    pub change: StockChange,
    pub movements: Vec<StockMovement>,
}

// =============================================================================
// Cache Writer
// =============================================================================

/// Exclusive, transactional access to one tenant's namespace.
///
/// Field order matters: the transaction is dropped (rolled back) before the
/// tenant mutex is released.
pub struct CacheWriter {
    tx: Transaction<'static, Sqlite>,
    tenant: TenantId,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for CacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWriter")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl CacheWriter {
    pub(crate) fn new(
        tx: Transaction<'static, Sqlite>,
        tenant: TenantId,
        guard: OwnedMutexGuard<()>,
    ) -> Self {
        CacheWriter {
            tx,
            tenant,
            _guard: guard,
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Commits and releases the tenant's writer.
    pub async fn commit(self) -> DbResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
        debug!(store_id = %self.tenant, "Writer committed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Documents
    // -------------------------------------------------------------------------

    pub async fn get<T: CacheEntity>(&mut self) -> DbResult<Vec<T>> {
        fetch_all(&mut *self.tx, Some(self.tenant.as_str())).await
    }

    pub async fn get_by_id<T: CacheEntity>(&mut self, id: &str) -> DbResult<Option<T>> {
        fetch_by_id(&mut *self.tx, Some(self.tenant.as_str()), id).await
    }

    pub async fn find_product_by_sku(&mut self, sku: &str) -> DbResult<Option<Product>> {
        fetch_by_natural_key(&mut *self.tx, Some(self.tenant.as_str()), sku.trim()).await
    }

    pub async fn open_session(&mut self, device_id: &str) -> DbResult<Option<CashSession>> {
        fetch_by_natural_key(
            &mut *self.tx,
            Some(self.tenant.as_str()),
            &open_session_key(device_id),
        )
        .await
    }

    /// Inserts or replaces one entity at the current document version.
    pub async fn put<T: CacheEntity>(&mut self, entity: &T) -> DbResult<()> {
        self.tenant.ensure_owns(entity.store_id())?;
        let body = serde_json::to_string(entity)?;
        let natural_key = entity.natural_key();

        sqlx::query(
            r#"
            INSERT INTO cache_documents (
                store_id, collection, id, natural_key, body, doc_version, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (store_id, collection, id) DO UPDATE SET
                natural_key = excluded.natural_key,
                body = excluded.body,
                doc_version = excluded.doc_version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(self.tenant.as_str())
        .bind(T::COLLECTION)
        .bind(entity.id())
        .bind(natural_key.as_deref())
        .bind(&body)
        .bind(CURRENT_DOC_VERSION)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { .. } => DbError::duplicate(
                format!("{} key", T::COLLECTION),
                natural_key.clone().unwrap_or_default(),
            ),
            other => other,
        })?;

        Ok(())
    }

    /// Removes one entity. Returns whether it existed.
    pub async fn delete<T: CacheEntity>(&mut self, id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "DELETE FROM cache_documents WHERE store_id = ?1 AND collection = ?2 AND id = ?3",
        )
        .bind(self.tenant.as_str())
        .bind(T::COLLECTION)
        .bind(id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Replaces the whole collection for this tenant.
    pub async fn replace_all<T: CacheEntity>(&mut self, entities: &[T]) -> DbResult<()> {
        let removed = sqlx::query(
            "DELETE FROM cache_documents WHERE store_id = ?1 AND collection = ?2",
        )
        .bind(self.tenant.as_str())
        .bind(T::COLLECTION)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        for entity in entities {
            self.put(entity).await?;
        }

        debug!(
            store_id = %self.tenant,
            collection = T::COLLECTION,
            removed,
            inserted = entities.len(),
            "Collection replaced"
        );
        Ok(())
    }

    /// Flips an entity's provenance to `Remote` after a confirmed push.
    pub async fn mark_remote<T>(&mut self, id: &str) -> DbResult<bool>
    where
        T: CacheEntity + Reconcilable,
    {
        match self.get_by_id::<T>(id).await? {
            Some(mut entity) if entity.provenance() != Provenance::Remote => {
                entity.set_provenance(Provenance::Remote);
                self.put(&entity).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // -------------------------------------------------------------------------
    // Stock
    // -------------------------------------------------------------------------

    /// Applies a signed delta to a cached product's stock, floored at zero,
    /// and appends the explaining movements.
    pub async fn apply_stock_delta(
        &mut self,
        product_id: &str,
        delta: i64,
        reason: MovementReason,
        sale_id: Option<&str>,
    ) -> DbResult<StockUpdate> {
        let mut product = self
            .get_by_id::<Product>(product_id)
            .await?
            .ok_or_else(|| DbError::not_found("Product", product_id))?;

        let change = StockChange::compute(product.stock, delta);
        if change.is_clamped() {
            error!(
                store_id = %self.tenant,
                product_id = %product_id,
                previous_stock = change.previous_stock,
                delta,
                shortfall = change.shortfall,
                "Stock would go negative; clamped to zero"
            );
        }

        product.stock = change.new_stock;
        product.updated_at = Utc::now();
        self.put(&product).await?;

        let movements = StockMovement::for_change(
            self.tenant.as_str(),
            product_id,
            &change,
            reason,
            sale_id,
        );
        for movement in &movements {
            self.append_movement(movement).await?;
        }

        Ok(StockUpdate {
            product,
            change,
            movements,
        })
    }

    /// Appends one immutable movement.
    pub async fn append_movement(&mut self, movement: &StockMovement) -> DbResult<()> {
        self.tenant.ensure_owns(&movement.store_id)?;
        sqlx::query(
            r#"
            INSERT INTO stock_movements (
                id, store_id, product_id, delta, previous_stock, new_stock,
                reason, sale_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&movement.id)
        .bind(&movement.store_id)
        .bind(&movement.product_id)
        .bind(movement.delta)
        .bind(movement.previous_stock)
        .bind(movement.new_stock)
        .bind(movement.reason)
        .bind(movement.sale_id.as_deref())
        .bind(movement.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Receipts
    // -------------------------------------------------------------------------

    pub async fn receipt(&mut self, external_id: &str) -> DbResult<Option<SaleReceipt>> {
        fetch_receipt(&mut *self.tx, Some(self.tenant.as_str()), external_id).await
    }

    pub async fn put_receipt(&mut self, receipt: &SaleReceipt) -> DbResult<()> {
        self.tenant.ensure_owns(&receipt.store_id)?;
        sqlx::query(
            r#"
            INSERT INTO sale_receipts (
                store_id, external_id, sale_id, local_applied, remote_confirmed, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (store_id, external_id) DO UPDATE SET
                sale_id = excluded.sale_id,
                local_applied = MAX(sale_receipts.local_applied, excluded.local_applied),
                remote_confirmed = MAX(sale_receipts.remote_confirmed, excluded.remote_confirmed)
            "#,
        )
        .bind(&receipt.store_id)
        .bind(&receipt.external_id)
        .bind(&receipt.sale_id)
        .bind(receipt.local_applied)
        .bind(receipt.remote_confirmed)
        .bind(receipt.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sync Bookkeeping
    // -------------------------------------------------------------------------

    pub async fn set_sync_status(
        &mut self,
        entity_type: SyncEntity,
        entity_id: &str,
        status: SyncState,
        last_error: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_status (store_id, entity_type, entity_id, status, last_error, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (store_id, entity_type, entity_id) DO UPDATE SET
                status = excluded.status,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(self.tenant.as_str())
        .bind(entity_type)
        .bind(entity_id)
        .bind(status)
        .bind(last_error)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Appends a mutation to the outbox and marks the entity pending.
    /// Returns the entry id.
    pub async fn enqueue<P: Serialize>(
        &mut self,
        entity_type: SyncEntity,
        entity_id: &str,
        payload: &P,
    ) -> DbResult<i64> {
        let payload = serde_json::to_string(payload)?;
        let id = sqlx::query(
            r#"
            INSERT INTO sync_queue (store_id, entity_type, entity_id, payload, status, created_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
            "#,
        )
        .bind(self.tenant.as_str())
        .bind(entity_type)
        .bind(entity_id)
        .bind(&payload)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?
        .last_insert_rowid();

        self.set_sync_status(entity_type, entity_id, SyncState::Pending, None)
            .await?;

        debug!(
            store_id = %self.tenant,
            entry_id = id,
            entity_type = entity_type.as_str(),
            entity_id = %entity_id,
            "Queued for sync"
        );
        Ok(id)
    }

    /// Pending entries of this tenant, oldest first. Claimed entries are
    /// included.
    pub async fn pending_entries(&mut self) -> DbResult<Vec<SyncQueueEntry>> {
        let entries = sqlx::query_as::<_, SyncQueueEntry>(
            r#"
            SELECT id, store_id, entity_type, entity_id, payload, attempts,
                   last_attempt, last_error, status, created_at
            FROM sync_queue
            WHERE store_id = ?1 AND status = 'pending'
            ORDER BY id ASC
            "#,
        )
        .bind(self.tenant.as_str())
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(entries)
    }

    /// Tries to claim a pending entry for `token`.
    ///
    /// Succeeds when the entry is unclaimed, already claimed by `token`, or
    /// its claim is older than `stale_before_ms` (unix millis). One
    /// conditional UPDATE, so two processes sharing the file cannot both win.
    pub async fn claim_entry(
        &mut self,
        entry_id: i64,
        token: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET claimed_by = ?3, claimed_at = ?4
            WHERE id = ?1
              AND store_id = ?2
              AND status = 'pending'
              AND (claimed_by IS NULL OR claimed_by = ?3 OR claimed_at < ?5)
            "#,
        )
        .bind(entry_id)
        .bind(self.tenant.as_str())
        .bind(token)
        .bind(now_ms)
        .bind(stale_before_ms)
        .execute(&mut *self.tx)
        .await?;

        let claimed = result.rows_affected() == 1;
        debug!(store_id = %self.tenant, entry_id, claimed, "Claim attempted");
        Ok(claimed)
    }

    /// Marks a delivered entry synced and releases its claim.
    pub async fn mark_entry_synced(&mut self, entry: &SyncQueueEntry) -> DbResult<()> {
        self.tenant.ensure_owns(&entry.store_id)?;
        sqlx::query(
            r#"
            UPDATE sync_queue SET
                status = 'synced',
                last_attempt = ?3,
                last_error = NULL,
                claimed_by = NULL,
                claimed_at = NULL
            WHERE id = ?1 AND store_id = ?2
            "#,
        )
        .bind(entry.id)
        .bind(self.tenant.as_str())
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;

        self.set_sync_status(entry.entity_type, &entry.entity_id, SyncState::Synced, None)
            .await
    }

    /// Records a failed delivery: increments `attempts`, and turns the entry
    /// terminal when `terminal` is set or `max_attempts` is reached.
    ///
    /// Returns the entry's new state and attempt count.
    pub async fn record_entry_failure(
        &mut self,
        entry: &SyncQueueEntry,
        error_message: &str,
        max_attempts: u32,
        terminal: bool,
    ) -> DbResult<(SyncState, i64)> {
        self.tenant.ensure_owns(&entry.store_id)?;
        let (status, attempts): (SyncState, i64) = sqlx::query_as(
            r#"
            UPDATE sync_queue SET
                attempts = attempts + 1,
                last_attempt = ?3,
                last_error = ?4,
                status = CASE
                    WHEN ?5 OR attempts + 1 >= ?6 THEN 'failed'
                    ELSE 'pending'
                END,
                claimed_by = NULL,
                claimed_at = NULL
            WHERE id = ?1 AND store_id = ?2
            RETURNING status, attempts
            "#,
        )
        .bind(entry.id)
        .bind(self.tenant.as_str())
        .bind(Utc::now())
        .bind(error_message)
        .bind(terminal)
        .bind(i64::from(max_attempts))
        .fetch_one(&mut *self.tx)
        .await?;

        if status == SyncState::Failed {
            warn!(
                store_id = %self.tenant,
                entry_id = entry.id,
                entity_type = entry.entity_type.as_str(),
                attempts,
                error = %error_message,
                "Sync entry is terminally failed"
            );
        }

        self.set_sync_status(entry.entity_type, &entry.entity_id, status, Some(error_message))
            .await?;
        Ok((status, attempts))
    }

    /// Manual intervention: puts a terminally failed entry back in line for
    /// one more attempt. `attempts` is kept.
    pub async fn retry_failed(&mut self, entry_id: i64) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET status = 'pending', claimed_by = NULL, claimed_at = NULL
            WHERE id = ?1 AND store_id = ?2 AND status = 'failed'
            "#,
        )
        .bind(entry_id)
        .bind(self.tenant.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes synced entries last attempted before `older_than`.
    ///
    /// ## Returns
    /// Number of deleted entries.
    pub async fn purge_synced(&mut self, older_than: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_queue
            WHERE store_id = ?1
              AND status = 'synced'
              AND julianday(last_attempt) < julianday(?2)
            "#,
        )
        .bind(self.tenant.as_str())
        .bind(older_than)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    // -------------------------------------------------------------------------
    // Meta
    // -------------------------------------------------------------------------

    /// Sets a per-tenant flag. Returns `true` only the first time.
    pub async fn mark_once(&mut self, key: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO cache_meta (store_id, key, value) VALUES (?1, ?2, ?3)",
        )
        .bind(self.tenant.as_str())
        .bind(key)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
