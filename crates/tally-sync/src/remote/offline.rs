//! Remote backend for devices configured without one. Every call fails as a
//! network error, so writes take the offline path and stay queued.

use async_trait::async_trait;
use tally_core::{CashClosure, CashSession, Expense, Product, Sale, StockMovement};

use super::{AtomicSaleResponse, CancelSaleResponse, Capabilities, RemoteClient};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineRemote;

fn disabled<T>() -> SyncResult<T> {
    Err(SyncError::Network("remote disabled".to_string()))
}

#[async_trait]
impl RemoteClient for OfflineRemote {
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn sample_store_id(&self) -> SyncResult<Option<String>> {
        disabled()
    }

    async fn fetch_products(&self, _store_id: &str) -> SyncResult<Vec<Product>> {
        disabled()
    }

    async fn upsert_product(&self, _product: &Product) -> SyncResult<()> {
        disabled()
    }

    async fn delete_product(&self, _store_id: &str, _product_id: &str) -> SyncResult<bool> {
        disabled()
    }

    async fn create_sale_atomic(
        &self,
        _sale: &Sale,
        _external_id: &str,
        _store_id: &str,
    ) -> SyncResult<AtomicSaleResponse> {
        disabled()
    }

    async fn create_sale_best_effort(&self, _sale: &Sale) -> SyncResult<AtomicSaleResponse> {
        disabled()
    }

    async fn cancel_sale_atomic(
        &self,
        _store_id: &str,
        _sale_id: &str,
    ) -> SyncResult<CancelSaleResponse> {
        disabled()
    }

    async fn apply_stock_movement(&self, _movement: &StockMovement) -> SyncResult<()> {
        disabled()
    }

    async fn fetch_expenses(&self, _store_id: &str) -> SyncResult<Vec<Expense>> {
        disabled()
    }

    async fn upsert_expense(&self, _expense: &Expense) -> SyncResult<()> {
        disabled()
    }

    async fn upsert_cash_session(&self, _session: &CashSession) -> SyncResult<()> {
        disabled()
    }

    async fn upsert_cash_closure(&self, _closure: &CashClosure) -> SyncResult<()> {
        disabled()
    }
}
