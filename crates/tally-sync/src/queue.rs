//! # Sync Queue
//!
//! Drains the durable outbox to the remote.
//!
//! ## Drain Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  drain()                                                                │
//! │   │                                                                     │
//! │   ├─ drain_lock.try_lock()   busy → DrainReport { busy: true }          │
//! │   ├─ pending(store, batch)   FIFO by id                                 │
//! │   │                                                                     │
//! │   └─ for each entry:                                                    │
//! │        type blocked this pass? ───────────────► deferred                │
//! │        backoff not elapsed?    ──► block type ► deferred                │
//! │        writer: claim(id, token, ttl) lost? ► block type ► deferred      │
//! │        push to remote (no writer held)                                  │
//! │          ├─ ok       → writer: local follow-up + mark synced            │
//! │          ├─ business → writer: failed (terminal)                        │
//! │          └─ other    → writer: attempts+1, block type                   │
//! │                        (terminal once attempts reach max_attempts)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! State is committed after every entry, so an interrupted drain loses no
//! progress. A remote that applied a change whose answer got lost sees the
//! same entry again; every push is idempotent on the remote side.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    CashClosure, CashSession, Expense, Product, Sale, StockMovement, SyncEntity, SyncQueueEntry,
    SyncState, TenantId,
};
use tally_db::Database;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::error::{SyncError, SyncResult};
use crate::remote::{AtomicSaleStatus, CancelSaleStatus, RemoteGateway};
use crate::sale::{confirm_in, shortage_from_response, CancellationPayload};
use crate::tenant::TenantContext;

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Another drain was running; nothing was attempted.
    pub busy: bool,
    pub synced: usize,
    /// Failed this pass, will be retried.
    pub retried: usize,
    /// Turned terminal this pass.
    pub failed: usize,
    /// Not attempted this pass (backoff, claimed elsewhere, or blocked
    /// behind an earlier entry of the same type).
    pub deferred: usize,
}

impl DrainReport {
    fn busy() -> Self {
        DrainReport {
            busy: true,
            ..Default::default()
        }
    }
}

/// Queue payload of a product deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDeletionPayload {
    pub product_id: String,
}

/// What a successful push leaves to do locally.
enum Delivered {
    Done,
    Sale {
        sale: Sale,
        remote_id: Option<String>,
    },
}

// =============================================================================
// Sync Queue
// =============================================================================

pub struct SyncQueue {
    db: Database,
    tenant: Arc<TenantContext>,
    remote: RemoteGateway,
    settings: QueueSettings,
    drain_lock: Mutex<()>,
    /// Claim token of this process.
    token: String,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("token", &self.token)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SyncQueue {
    pub fn new(
        db: Database,
        tenant: Arc<TenantContext>,
        remote: RemoteGateway,
        settings: QueueSettings,
        device_id: &str,
    ) -> Self {
        SyncQueue {
            db,
            tenant,
            remote,
            settings,
            drain_lock: Mutex::new(()),
            token: format!("{device_id}:{}", Uuid::new_v4()),
        }
    }

    /// Queues a mutation for the current tenant.
    pub async fn enqueue<P: Serialize + Sync>(
        &self,
        entity_type: SyncEntity,
        entity_id: &str,
        payload: &P,
    ) -> SyncResult<i64> {
        let tenant = self.tenant.require().await?;
        let mut writer = self.db.cache(tenant.into()).begin_write().await?;
        let id = writer.enqueue(entity_type, entity_id, payload).await?;
        writer.commit().await?;
        Ok(id)
    }

    /// Entries of the current tenant, optionally filtered by state.
    pub async fn entries(&self, status: Option<SyncState>) -> SyncResult<Vec<SyncQueueEntry>> {
        let tenant = self.tenant.require().await?;
        Ok(self
            .db
            .sync_queue()
            .entries(tenant.as_str(), status)
            .await?)
    }

    /// Puts a terminally failed entry back in line for one more attempt.
    pub async fn retry_failed(&self, entry_id: i64) -> SyncResult<bool> {
        let tenant = self.tenant.require().await?;
        let Some(entry) = self.db.sync_queue().get(entry_id).await? else {
            return Ok(false);
        };
        if entry.store_id != tenant.as_str() {
            return Err(SyncError::NotFound(format!("sync entry {entry_id}")));
        }

        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        let reset = writer.retry_failed(entry_id).await?;
        if reset {
            writer
                .set_sync_status(entry.entity_type, &entry.entity_id, SyncState::Pending, None)
                .await?;
        }
        writer.commit().await?;

        if reset {
            info!(
                store_id = %tenant,
                entry_id,
                attempts = entry.attempts,
                "Failed entry re-queued"
            );
        }
        Ok(reset)
    }

    /// Deletes synced entries older than `older_than`.
    pub async fn purge_synced(&self, older_than: DateTime<Utc>) -> SyncResult<u64> {
        let tenant = self.tenant.require().await?;
        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        let purged = writer.purge_synced(older_than).await?;
        writer.commit().await?;
        debug!(store_id = %tenant, purged, "Purged synced entries");
        Ok(purged)
    }

    // -------------------------------------------------------------------------
    // Drain
    // -------------------------------------------------------------------------

    /// Pushes pending entries of the current tenant.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already running");
            return Ok(DrainReport::busy());
        };

        let tenant = self.tenant.require().await?;
        let repo = self.db.sync_queue();
        let entries = repo
            .pending(tenant.as_str(), self.settings.batch_size)
            .await?;
        if entries.is_empty() {
            return Ok(DrainReport::default());
        }

        let claim_ttl_ms = (self.settings.claim_ttl_secs * 1000) as i64;
        let mut blocked: HashSet<SyncEntity> = HashSet::new();
        let mut report = DrainReport::default();

        for entry in entries {
            if blocked.contains(&entry.entity_type) {
                report.deferred += 1;
                continue;
            }

            let now = Utc::now();
            if !self.is_due(&entry, now) {
                debug!(entry_id = entry.id, attempts = entry.attempts, "Entry backing off");
                blocked.insert(entry.entity_type);
                report.deferred += 1;
                continue;
            }

            if !self.claim(&tenant, &entry, now, claim_ttl_ms).await? {
                debug!(entry_id = entry.id, "Entry claimed by another process");
                blocked.insert(entry.entity_type);
                report.deferred += 1;
                continue;
            }

            match self.deliver(&tenant, &entry).await {
                Ok(delivered) => {
                    self.complete(&tenant, &entry, delivered).await?;
                    report.synced += 1;
                }
                Err(e) => {
                    let terminal = e.is_business_rejection();
                    let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
                    let (state, attempts) = writer
                        .record_entry_failure(
                            &entry,
                            &e.to_string(),
                            self.settings.max_attempts,
                            terminal,
                        )
                        .await?;
                    writer.commit().await?;

                    if state == SyncState::Failed {
                        report.failed += 1;
                    } else {
                        warn!(
                            store_id = %tenant,
                            entry_id = entry.id,
                            entity_type = entry.entity_type.as_str(),
                            attempts,
                            error = %e,
                            "Sync entry failed; will retry"
                        );
                        blocked.insert(entry.entity_type);
                        report.retried += 1;
                    }
                }
            }
        }

        info!(
            store_id = %tenant,
            synced = report.synced,
            retried = report.retried,
            failed = report.failed,
            deferred = report.deferred,
            "Drain pass complete"
        );
        Ok(report)
    }

    /// Claims one entry for this process. The writer is released before the
    /// push.
    async fn claim(
        &self,
        tenant: &TenantId,
        entry: &SyncQueueEntry,
        now: DateTime<Utc>,
        claim_ttl_ms: i64,
    ) -> SyncResult<bool> {
        let now_ms = now.timestamp_millis();
        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        let claimed = writer
            .claim_entry(entry.id, &self.token, now_ms, now_ms - claim_ttl_ms)
            .await?;
        writer.commit().await?;
        Ok(claimed)
    }

    /// Whether the backoff delay after the last failure has elapsed.
    fn is_due(&self, entry: &SyncQueueEntry, now: DateTime<Utc>) -> bool {
        let Some(last_attempt) = entry.last_attempt else {
            return true;
        };
        if entry.attempts <= 0 {
            return true;
        }

        let delay = retry_delay(&self.settings, entry.attempts);
        match chrono::Duration::from_std(delay) {
            Ok(delay) => now >= last_attempt + delay,
            Err(_) => false,
        }
    }

    /// Pushes one entry. Holds no writer.
    async fn deliver(&self, tenant: &TenantId, entry: &SyncQueueEntry) -> SyncResult<Delivered> {
        let store = self.db.cache(tenant.clone().into());

        match entry.entity_type {
            SyncEntity::Sale => {
                let sale: Sale = serde_json::from_str(&entry.payload)?;
                tenant.ensure_owns(&sale.store_id)?;
                let response = self.remote.submit_sale(&sale).await?;
                match response.status {
                    AtomicSaleStatus::Ok | AtomicSaleStatus::AlreadyExists => Ok(Delivered::Sale {
                        remote_id: response.sale_id,
                        sale,
                    }),
                    AtomicSaleStatus::InsufficientStock => {
                        Err(shortage_from_response(&response, &sale).into())
                    }
                    AtomicSaleStatus::Error => Err(SyncError::Remote(
                        response
                            .message
                            .unwrap_or_else(|| "sale procedure failed".to_string()),
                    )),
                }
            }
            SyncEntity::SaleCancellation => {
                let payload: CancellationPayload = serde_json::from_str(&entry.payload)?;
                let response = self
                    .remote
                    .cancel_sale(tenant.as_str(), &payload.sale_id)
                    .await?;
                match response.status {
                    CancelSaleStatus::Ok | CancelSaleStatus::AlreadyCancelled => Ok(Delivered::Done),
                    // The sale itself may still be queued behind this entry.
                    CancelSaleStatus::NotFound => {
                        Err(SyncError::NotFound(format!("remote sale {}", payload.sale_id)))
                    }
                    CancelSaleStatus::Error => Err(SyncError::Remote(
                        response
                            .message
                            .unwrap_or_else(|| "cancel procedure failed".to_string()),
                    )),
                }
            }
            SyncEntity::StockMovement => {
                let movement: StockMovement = serde_json::from_str(&entry.payload)?;
                tenant.ensure_owns(&movement.store_id)?;
                self.remote.apply_stock_movement(&movement).await?;
                Ok(Delivered::Done)
            }
            SyncEntity::Product => {
                let queued: Product = serde_json::from_str(&entry.payload)?;
                let product = store
                    .get_by_id::<Product>(&queued.id)
                    .await?
                    .unwrap_or(queued);
                tenant.ensure_owns(&product.store_id)?;
                self.remote.upsert_product(&product).await?;
                Ok(Delivered::Done)
            }
            SyncEntity::ProductDeletion => {
                let payload: ProductDeletionPayload = serde_json::from_str(&entry.payload)?;
                let existed = self
                    .remote
                    .delete_product(tenant.as_str(), &payload.product_id)
                    .await?;
                debug!(product_id = %payload.product_id, existed, "Remote product deleted");
                Ok(Delivered::Done)
            }
            SyncEntity::Expense => {
                let queued: Expense = serde_json::from_str(&entry.payload)?;
                let expense = store
                    .get_by_id::<Expense>(&queued.id)
                    .await?
                    .unwrap_or(queued);
                tenant.ensure_owns(&expense.store_id)?;
                self.remote.upsert_expense(&expense).await?;
                Ok(Delivered::Done)
            }
            SyncEntity::CashSession => {
                let queued: CashSession = serde_json::from_str(&entry.payload)?;
                let session = store
                    .get_by_id::<CashSession>(&queued.id)
                    .await?
                    .unwrap_or(queued);
                tenant.ensure_owns(&session.store_id)?;
                self.remote.upsert_cash_session(&session).await?;
                Ok(Delivered::Done)
            }
            SyncEntity::CashClosure => {
                let closure: CashClosure = serde_json::from_str(&entry.payload)?;
                tenant.ensure_owns(&closure.store_id)?;
                self.remote.upsert_cash_closure(&closure).await?;
                Ok(Delivered::Done)
            }
        }
    }

    /// Applies the local follow-up of a successful push and marks the entry
    /// synced, in one transaction.
    async fn complete(
        &self,
        tenant: &TenantId,
        entry: &SyncQueueEntry,
        delivered: Delivered,
    ) -> SyncResult<()> {
        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        match delivered {
            Delivered::Sale { sale, remote_id } => {
                confirm_in(&mut writer, sale, remote_id).await?;
            }
            Delivered::Done => match entry.entity_type {
                SyncEntity::Product => {
                    writer.mark_remote::<Product>(&entry.entity_id).await?;
                }
                SyncEntity::Expense => {
                    writer.mark_remote::<Expense>(&entry.entity_id).await?;
                }
                _ => {}
            },
        }
        writer.mark_entry_synced(entry).await?;
        writer.commit().await?;

        debug!(
            store_id = %tenant,
            entry_id = entry.id,
            entity_type = entry.entity_type.as_str(),
            entity_id = %entry.entity_id,
            "Sync entry delivered"
        );
        Ok(())
    }
}

/// Delay before the next attempt after `attempts` failures.
fn retry_delay(settings: &QueueSettings, attempts: i64) -> Duration {
    let initial = Duration::from_millis(settings.initial_backoff_ms);
    let mut backoff = ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        max_interval: Duration::from_secs(settings.max_backoff_secs),
        multiplier: 2.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..Default::default()
    };
    let mut delay = initial;
    for _ in 0..attempts {
        if let Some(next) = backoff.next_backoff() {
            delay = next;
        }
    }
    delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::tenant::SessionSource;
    use async_trait::async_trait;
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

    async fn queue_with(remote: MemoryRemote, settings: QueueSettings) -> (SyncQueue, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let tenant = Arc::new(
            TenantContext::new(Arc::new(NoSession), Duration::from_secs(300))
                .with_configured(Some(store())),
        );
        let gateway = RemoteGateway::new(Arc::new(remote), Duration::from_secs(5), false);
        (
            SyncQueue::new(db.clone(), tenant, gateway, settings, "device-1"),
            db,
        )
    }

    fn immediate(max_attempts: u32) -> QueueSettings {
        QueueSettings {
            max_attempts,
            initial_backoff_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let settings = QueueSettings {
            initial_backoff_ms: 1000,
            max_backoff_secs: 5,
            ..Default::default()
        };

        let millis = |attempts| retry_delay(&settings, attempts).as_millis();
        assert_eq!(millis(1), 1000);
        assert_eq!(millis(2), 2000);
        assert_eq!(millis(3), 4000);
        assert_eq!(millis(4), 5000);
    }

    #[tokio::test]
    async fn test_product_push_flips_provenance() {
        let remote = MemoryRemote::new();
        let (queue, db) = queue_with(remote.clone(), immediate(3)).await;
        let product = Product::new_local(&store(), "NEW-1", "New", 4, 10, 20);
        db.cache(store().into()).put(&product).await.unwrap();
        queue
            .enqueue(SyncEntity::Product, &product.id, &product)
            .await
            .unwrap();

        let report = queue.drain().await.unwrap();

        assert_eq!(report.synced, 1);
        assert!(remote.product("store-1", &product.id).is_some());
        let cached: Product = db
            .cache(store().into())
            .get_by_id(&product.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.provenance, Provenance::Remote);
    }

    #[tokio::test]
    async fn test_retryable_failure_blocks_same_type_only() {
        let remote = MemoryRemote::new();
        let (queue, db) = queue_with(remote.clone(), immediate(5)).await;
        let cache = db.cache(store().into());
        let a = Product::new_local(&store(), "A-1", "A", 1, 1, 1);
        let b = Product::new_local(&store(), "B-1", "B", 1, 1, 1);
        let expense = Expense::new_local(&store(), "Tape", None, 300, None);
        for p in [&a, &b] {
            cache.put(p).await.unwrap();
            queue.enqueue(SyncEntity::Product, &p.id, p).await.unwrap();
        }
        cache.put(&expense).await.unwrap();
        queue
            .enqueue(SyncEntity::Expense, &expense.id, &expense)
            .await
            .unwrap();

        remote.fail_next(1);
        let report = queue.drain().await.unwrap();

        assert_eq!(report.retried, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(remote.expenses("store-1").len(), 1);
        assert!(remote.products("store-1").is_empty());
    }

    #[tokio::test]
    async fn test_business_rejection_is_terminal() {
        let remote = MemoryRemote::new();
        remote.seed_product(Product::new_local(&store(), "DUP-1", "Remote", 1, 1, 1));
        let (queue, db) = queue_with(remote, immediate(5)).await;
        let local = Product::new_local(&store(), "DUP-1", "Local", 1, 1, 1);
        db.cache(store().into()).put(&local).await.unwrap();
        queue
            .enqueue(SyncEntity::Product, &local.id, &local)
            .await
            .unwrap();

        let report = queue.drain().await.unwrap();

        assert_eq!(report.failed, 1);
        let failed = queue.entries(Some(SyncState::Failed)).await.unwrap();
        assert_eq!(failed[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_drain_reports_busy() {
        let remote = MemoryRemote::new();
        let (queue, _db) = queue_with(remote, immediate(5)).await;

        let _held = queue.drain_lock.lock().await;
        let report = queue.drain().await.unwrap();

        assert!(report.busy);
    }
}
