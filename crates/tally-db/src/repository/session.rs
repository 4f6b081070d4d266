//! Persisted device session: which tenant this device last signed in to.
//!
//! Tenant resolution reads it after the in-memory cache misses.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};

use crate::error::DbResult;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DeviceSession {
    pub store_id: String,
    pub staff_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Repository for the single-row `device_session` table.
#[derive(Debug, Clone)]
pub struct DeviceSessionRepository {
    pool: SqlitePool,
}

impl DeviceSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DeviceSessionRepository { pool }
    }

    pub async fn current(&self) -> DbResult<Option<DeviceSession>> {
        let session = sqlx::query_as::<_, DeviceSession>(
            "SELECT store_id, staff_id, updated_at FROM device_session WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    /// The signed-in tenant, if any. Blank values count as absent.
    pub async fn current_store(&self) -> DbResult<Option<String>> {
        Ok(self
            .current()
            .await?
            .map(|s| s.store_id)
            .filter(|s| !s.trim().is_empty()))
    }

    pub async fn set(&self, store_id: &str, staff_id: Option<&str>) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO device_session (id, store_id, staff_id, updated_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT (id) DO UPDATE SET
                store_id = excluded.store_id,
                staff_id = excluded.staff_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(store_id)
        .bind(staff_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        info!(store_id = %store_id, "Device session set");
        Ok(())
    }

    /// Signs the device out.
    pub async fn clear(&self) -> DbResult<()> {
        sqlx::query("DELETE FROM device_session")
            .execute(&self.pool)
            .await?;
        debug!("Device session cleared");
        Ok(())
    }
}
