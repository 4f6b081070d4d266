//! # Sync Queue Repository
//!
//! Reads over the durable outbox.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  LOCAL OPERATION (e.g. a sale taken while offline)                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────── ONE WRITER ─────────────────────────┐    │
//! │  │  cache_documents  ← sale + product stock                        │    │
//! │  │  stock_movements  ← sale movements                              │    │
//! │  │  sync_queue       ← ('sale', sale_id, <full sale JSON>)         │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │       │ COMMIT                                                          │
//! │       ▼                                                                 │
//! │  DRAIN (tally-sync)                                                     │
//! │   1. pending(store, limit)         ORDER BY id  (FIFO)                  │
//! │   2. writer.claim_entry(id, token) one process per entry                │
//! │   3. push to remote                no writer held                       │
//! │   4. writer: mark synced / record failure, release claim                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything that changes a row (claims, results, purges) goes through the
//! tenant's `CacheWriter`; this repository only reads.

use sqlx::SqlitePool;
use tally_core::{SyncQueueEntry, SyncState};

use crate::error::DbResult;

const ENTRY_COLUMNS: &str = r#"
    id, store_id, entity_type, entity_id, payload, attempts,
    last_attempt, last_error, status, created_at
"#;

/// Repository for sync queue reads.
#[derive(Debug, Clone)]
pub struct SyncQueueRepository {
    pool: SqlitePool,
}

impl SyncQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncQueueRepository { pool }
    }

    /// Pending entries of a tenant, oldest first.
    pub async fn pending(&self, store_id: &str, limit: u32) -> DbResult<Vec<SyncQueueEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue
             WHERE store_id = ?1 AND status = 'pending'
             ORDER BY id ASC
             LIMIT ?2"
        );
        let entries = sqlx::query_as::<_, SyncQueueEntry>(&sql)
            .bind(store_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(entries)
    }

    /// Entries of a tenant in the given state (all states when `None`).
    pub async fn entries(
        &self,
        store_id: &str,
        status: Option<SyncState>,
    ) -> DbResult<Vec<SyncQueueEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue
             WHERE store_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY id ASC"
        );
        let entries = sqlx::query_as::<_, SyncQueueEntry>(&sql)
            .bind(store_id)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;

        Ok(entries)
    }

    pub async fn get(&self, id: i64) -> DbResult<Option<SyncQueueEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1");
        let entry = sqlx::query_as::<_, SyncQueueEntry>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(entry)
    }

    pub async fn count(&self, store_id: &str, status: SyncState) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE store_id = ?1 AND status = ?2")
                .bind(store_id)
                .bind(status)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

}

// =============================================================================
// Unit Tests
// =============================================================================
