//! # Cash Drawer
//!
//! Cash sessions, expenses and end-of-session closures for one device.
//!
//! ```text
//!  open_session ──► [open] ──record_expense──► … ──close_session──► [closed]
//!                     │                                   │
//!                     └── sales taken meanwhile carry     └── CashClosure:
//!                         the session id                      expected = opening
//!                                                                + cash sales
//!                                                                − expenses
//! ```
//!
//! Everything is written locally first and queued for the remote.

use chrono::Utc;
use std::sync::Arc;
use tally_core::validation::{validate_amount_cents, validate_cash_count, validate_name};
use tally_core::{
    CashClosure, CashSession, Expense, Money, PaymentMethod, Sale, SaleStatus, SessionStatus,
    SyncEntity,
};
use tally_db::Database;
use tracing::info;

use crate::error::{SyncError, SyncResult};
use crate::tenant::TenantContext;

#[derive(Debug, Clone)]
pub struct CashDrawer {
    db: Database,
    tenant: Arc<TenantContext>,
    device_id: String,
}

impl CashDrawer {
    pub fn new(db: Database, tenant: Arc<TenantContext>, device_id: impl Into<String>) -> Self {
        CashDrawer {
            db,
            tenant,
            device_id: device_id.into(),
        }
    }

    /// Opens a session on this device. Only one may be open at a time.
    pub async fn open_session(&self, opened_by: &str, opening_cents: i64) -> SyncResult<CashSession> {
        validate_name("opened_by", opened_by)?;
        validate_cash_count("opening_cents", opening_cents)?;

        let tenant = self.tenant.require().await?;
        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        if let Some(open) = writer.open_session(&self.device_id).await? {
            return Err(SyncError::Conflict(format!(
                "cash session {} is already open on device {}",
                open.id, self.device_id
            )));
        }

        let session = CashSession::open(&tenant, &self.device_id, opened_by, opening_cents);
        writer.put(&session).await?;
        writer
            .enqueue(SyncEntity::CashSession, &session.id, &session)
            .await?;
        writer.commit().await?;

        info!(
            store_id = %tenant,
            session_id = %session.id,
            device_id = %self.device_id,
            opening_cents,
            "Cash session opened"
        );
        Ok(session)
    }

    pub async fn current_session(&self) -> SyncResult<Option<CashSession>> {
        let tenant = self.tenant.require().await?;
        Ok(self
            .db
            .cache(tenant.into())
            .open_session(&self.device_id)
            .await?)
    }

    /// Records an expense, attached to the open session if there is one.
    pub async fn record_expense(
        &self,
        description: &str,
        category: Option<String>,
        amount_cents: i64,
    ) -> SyncResult<Expense> {
        validate_name("description", description)?;
        validate_amount_cents("amount_cents", amount_cents)?;

        let tenant = self.tenant.require().await?;
        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        let session_id = writer.open_session(&self.device_id).await?.map(|s| s.id);
        let expense = Expense::new_local(
            &tenant,
            description.trim(),
            category,
            amount_cents,
            session_id,
        );
        writer.put(&expense).await?;
        writer
            .enqueue(SyncEntity::Expense, &expense.id, &expense)
            .await?;
        writer.commit().await?;

        info!(
            store_id = %tenant,
            expense_id = %expense.id,
            amount_cents,
            "Expense recorded"
        );
        Ok(expense)
    }

    /// Closes the open session and computes the drawer difference.
    pub async fn close_session(&self, closed_by: &str, counted_cents: i64) -> SyncResult<CashClosure> {
        validate_name("closed_by", closed_by)?;
        validate_cash_count("counted_cents", counted_cents)?;

        let tenant = self.tenant.require().await?;
        let mut writer = self.db.cache(tenant.clone().into()).begin_write().await?;
        let mut session = writer
            .open_session(&self.device_id)
            .await?
            .ok_or_else(|| {
                SyncError::NotFound(format!("open cash session on device {}", self.device_id))
            })?;

        let cash_sales: Money = writer
            .get::<Sale>()
            .await?
            .iter()
            .filter(|s| s.cash_session_id.as_deref() == Some(session.id.as_str()))
            .filter(|s| s.status == SaleStatus::Finalized && s.payment_method == PaymentMethod::Cash)
            .map(Sale::total)
            .sum();
        let expenses: Money = writer
            .get::<Expense>()
            .await?
            .iter()
            .filter(|e| e.cash_session_id.as_deref() == Some(session.id.as_str()))
            .map(|e| Money::from_cents(e.amount_cents))
            .sum();

        let closure = CashClosure::compute(
            &session,
            cash_sales,
            expenses,
            Money::from_cents(counted_cents),
            closed_by,
        );

        session.status = SessionStatus::Closed;
        session.closing_cents = Some(counted_cents);
        session.closed_at = Some(Utc::now());
        writer.put(&session).await?;
        writer.put(&closure).await?;
        writer
            .enqueue(SyncEntity::CashSession, &session.id, &session)
            .await?;
        writer
            .enqueue(SyncEntity::CashClosure, &closure.id, &closure)
            .await?;
        writer.commit().await?;

        info!(
            store_id = %tenant,
            session_id = %session.id,
            expected_cents = closure.expected_cents,
            counted_cents,
            difference_cents = closure.difference_cents,
            "Cash session closed"
        );
        Ok(closure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::SessionSource;
    use async_trait::async_trait;
    use std::time::Duration;
    use tally_core::{SaleLine, TenantId};
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

    async fn drawer() -> (CashDrawer, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let tenant = Arc::new(
            TenantContext::new(Arc::new(NoSession), Duration::from_secs(300))
                .with_configured(Some(store())),
        );
        (CashDrawer::new(db.clone(), tenant, "device-1"), db)
    }

    fn sale(session_id: &str, cents: i64, method: PaymentMethod) -> Sale {
        let line = SaleLine {
            product_id: "p1".into(),
            sku: "A".into(),
            name: "A".into(),
            quantity: 1,
            unit_price_cents: cents,
        };
        Sale::finalized(
            &store(),
            tally_core::new_id(),
            vec![line],
            method,
            Some(session_id.into()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_second_open_session_conflicts() {
        let (drawer, _) = drawer().await;
        drawer.open_session("Ana", 10_000).await.unwrap();

        let err = drawer.open_session("Ana", 10_000).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_closure_counts_only_session_cash() {
        let (drawer, db) = drawer().await;
        let session = drawer.open_session("Ana", 10_000).await.unwrap();
        let cache = db.cache(store().into());
        cache.put(&sale(&session.id, 2_500, PaymentMethod::Cash)).await.unwrap();
        cache.put(&sale(&session.id, 9_900, PaymentMethod::Card)).await.unwrap();
        cache.put(&sale("other-session", 700, PaymentMethod::Cash)).await.unwrap();
        drawer.record_expense("Cleaning", None, 1_000).await.unwrap();

        let closure = drawer.close_session("Ana", 11_000).await.unwrap();

        assert_eq!(closure.expected_cents, 11_500);
        assert_eq!(closure.difference_cents, -500);
        assert!(drawer.current_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expense_without_session() {
        let (drawer, _) = drawer().await;
        let expense = drawer.record_expense("Stamps", Some("office".into()), 250).await.unwrap();
        assert!(expense.cash_session_id.is_none());

        let err = drawer.record_expense("Refund", None, 0).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_close_without_session_is_not_found() {
        let (drawer, _) = drawer().await;
        let err = drawer.close_session("Ana", 0).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }
}
