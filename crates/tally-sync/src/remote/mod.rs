//! # Remote Store
//!
//! The authoritative multi-tenant store behind an async trait.
//!
//! ## Backends
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          RemoteGateway                                  │
//! │          (timeout on every call, sale path selection)                   │
//! │                               │                                         │
//! │                 Arc<dyn RemoteClient>  (chosen once from config)        │
//! │          ┌────────────────────┼────────────────────┐                    │
//! │          ▼                    ▼                    ▼                    │
//! │  ┌───────────────┐   ┌────────────────┐   ┌────────────────┐           │
//! │  │ PgRemoteClient│   │  MemoryRemote  │   │ OfflineRemote  │           │
//! │  │  PL/pgSQL RPC │   │ in-process,    │   │ always Network │           │
//! │  │  atomic sales │   │ fault injection│   │                │           │
//! │  └───────────────┘   └────────────────┘   └────────────────┘           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Error Contract
//! Implementations return `Network` for anything that may have failed in
//! transit (including a call that timed out after the remote committed), and
//! `Remote`/`Conflict` for answers the server actually gave. Because a
//! `Network` failure can hide a success, every mutation is idempotent:
//! sales by `external_id`, movements by id, the rest by upsert.

pub mod memory;
pub mod offline;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{CashClosure, CashSession, Expense, Product, Sale, StockMovement};
use tracing::{debug, warn};

use crate::config::{RemoteMode, RemoteSettings};
use crate::error::{SyncError, SyncResult};

pub use memory::MemoryRemote;
pub use offline::OfflineRemote;
pub use postgres::PgRemoteClient;

// =============================================================================
// Capabilities
// =============================================================================

/// What a backend supports, declared when it is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Server-side single-transaction sale creation and cancellation.
    pub atomic_sales: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities { atomic_sales: true }
    }
}

// =============================================================================
// RPC Responses
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicSaleStatus {
    Ok,
    AlreadyExists,
    InsufficientStock,
    Error,
}

/// Answer of the atomic sale procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicSaleResponse {
    pub status: AtomicSaleStatus,
    #[serde(default)]
    pub sale_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub available_stock: Option<i64>,
    #[serde(default)]
    pub required_quantity: Option<i64>,
}

impl AtomicSaleResponse {
    pub fn ok(sale_id: impl Into<String>) -> Self {
        Self::with_status(AtomicSaleStatus::Ok, Some(sale_id.into()))
    }

    pub fn already_exists(sale_id: impl Into<String>) -> Self {
        Self::with_status(AtomicSaleStatus::AlreadyExists, Some(sale_id.into()))
    }

    pub fn insufficient_stock(product_id: impl Into<String>, available: i64, required: i64) -> Self {
        AtomicSaleResponse {
            product_id: Some(product_id.into()),
            available_stock: Some(available),
            required_quantity: Some(required),
            message: Some("insufficient stock".to_string()),
            ..Self::with_status(AtomicSaleStatus::InsufficientStock, None)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        AtomicSaleResponse {
            message: Some(message.into()),
            ..Self::with_status(AtomicSaleStatus::Error, None)
        }
    }

    fn with_status(status: AtomicSaleStatus, sale_id: Option<String>) -> Self {
        AtomicSaleResponse {
            status,
            sale_id,
            message: None,
            product_id: None,
            available_stock: None,
            required_quantity: None,
        }
    }

    /// `ok` and `already_exists` both mean the sale exists remotely.
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            AtomicSaleStatus::Ok | AtomicSaleStatus::AlreadyExists
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSaleStatus {
    Ok,
    AlreadyCancelled,
    NotFound,
    Error,
}

/// Answer of the atomic cancel procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSaleResponse {
    pub status: CancelSaleStatus,
    #[serde(default)]
    pub sale_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl CancelSaleResponse {
    pub fn new(status: CancelSaleStatus, sale_id: Option<String>) -> Self {
        CancelSaleResponse {
            status,
            sale_id,
            message: None,
        }
    }
}

// =============================================================================
// Remote Client
// =============================================================================

/// The remote store, scoped per call by `store_id`.
#[async_trait]
pub trait RemoteClient: Send + Sync + std::fmt::Debug {
    fn capabilities(&self) -> Capabilities;

    /// Any store id present remotely. Last-resort tenant resolution only.
    async fn sample_store_id(&self) -> SyncResult<Option<String>>;

    // -------------------------------------------------------------------------
    // Catalog
    // -------------------------------------------------------------------------

    async fn fetch_products(&self, store_id: &str) -> SyncResult<Vec<Product>>;

    /// Inserts or updates a product. An existing row keeps its stock; stock
    /// only changes through sales and movements.
    async fn upsert_product(&self, product: &Product) -> SyncResult<()>;

    /// Returns whether the product existed.
    async fn delete_product(&self, store_id: &str, product_id: &str) -> SyncResult<bool>;

    // -------------------------------------------------------------------------
    // Sales
    // -------------------------------------------------------------------------

    /// One server-side transaction: replay check by `external_id`, per-line
    /// stock check and decrement, sale insert.
    async fn create_sale_atomic(
        &self,
        sale: &Sale,
        external_id: &str,
        store_id: &str,
    ) -> SyncResult<AtomicSaleResponse>;

    /// Direct insert followed by per-line stock updates, each clamped at
    /// zero. Not atomic: concurrent devices can oversell.
    async fn create_sale_best_effort(&self, sale: &Sale) -> SyncResult<AtomicSaleResponse>;

    /// Finalized → cancelled and restock, in one server-side transaction.
    async fn cancel_sale_atomic(
        &self,
        store_id: &str,
        sale_id: &str,
    ) -> SyncResult<CancelSaleResponse>;

    // -------------------------------------------------------------------------
    // Stock
    // -------------------------------------------------------------------------

    /// Applies a movement's delta once per movement id. Remote stock is
    /// floored at zero.
    async fn apply_stock_movement(&self, movement: &StockMovement) -> SyncResult<()>;

    // -------------------------------------------------------------------------
    // Cash
    // -------------------------------------------------------------------------

    async fn fetch_expenses(&self, store_id: &str) -> SyncResult<Vec<Expense>>;

    async fn upsert_expense(&self, expense: &Expense) -> SyncResult<()>;

    async fn upsert_cash_session(&self, session: &CashSession) -> SyncResult<()>;

    async fn upsert_cash_closure(&self, closure: &CashClosure) -> SyncResult<()>;
}

/// Builds the backend named by `settings.mode`.
///
/// The Postgres pool connects lazily, so this never blocks on the network.
pub fn connect(settings: &RemoteSettings) -> SyncResult<Arc<dyn RemoteClient>> {
    let client: Arc<dyn RemoteClient> = match settings.mode {
        RemoteMode::Postgres => {
            let url = settings.url.as_deref().ok_or_else(|| {
                SyncError::InvalidConfig("remote.url is required in postgres mode".into())
            })?;
            Arc::new(PgRemoteClient::connect_lazy(
                url,
                settings.max_connections,
                settings.request_timeout(),
            )?)
        }
        RemoteMode::Memory => Arc::new(MemoryRemote::new()),
        RemoteMode::Offline => Arc::new(OfflineRemote),
    };
    debug!(mode = %settings.mode, capabilities = ?client.capabilities(), "Remote client ready");
    Ok(client)
}

// =============================================================================
// Remote Gateway
// =============================================================================

/// The core's only path to the remote: bounds every call with a timeout and
/// picks the sale path from declared capabilities.
#[derive(Debug, Clone)]
pub struct RemoteGateway {
    client: Arc<dyn RemoteClient>,
    timeout: Duration,
    allow_best_effort: bool,
}

impl RemoteGateway {
    pub fn new(client: Arc<dyn RemoteClient>, timeout: Duration, allow_best_effort: bool) -> Self {
        RemoteGateway {
            client,
            timeout,
            allow_best_effort,
        }
    }

    pub fn from_settings(client: Arc<dyn RemoteClient>, settings: &RemoteSettings) -> Self {
        Self::new(
            client,
            settings.request_timeout(),
            settings.allow_best_effort_sales,
        )
    }

    pub fn capabilities(&self) -> Capabilities {
        self.client.capabilities()
    }

    async fn bounded<T, F>(&self, op: &'static str, call: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    op,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Remote call timed out"
                );
                Err(SyncError::Network(format!(
                    "{op} timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    pub async fn sample_store_id(&self) -> SyncResult<Option<String>> {
        self.bounded("sample_store_id", self.client.sample_store_id())
            .await
    }

    pub async fn fetch_products(&self, store_id: &str) -> SyncResult<Vec<Product>> {
        self.bounded("fetch_products", self.client.fetch_products(store_id))
            .await
    }

    pub async fn upsert_product(&self, product: &Product) -> SyncResult<()> {
        self.bounded("upsert_product", self.client.upsert_product(product))
            .await
    }

    pub async fn delete_product(&self, store_id: &str, product_id: &str) -> SyncResult<bool> {
        self.bounded(
            "delete_product",
            self.client.delete_product(store_id, product_id),
        )
        .await
    }

    /// Sends a sale through the atomic procedure, or through the best-effort
    /// path when the backend lacks it and configuration allows the degraded
    /// mode.
    pub async fn submit_sale(&self, sale: &Sale) -> SyncResult<AtomicSaleResponse> {
        if self.capabilities().atomic_sales {
            return self
                .bounded(
                    "create_sale_atomic",
                    self.client
                        .create_sale_atomic(sale, &sale.external_id, &sale.store_id),
                )
                .await;
        }

        if !self.allow_best_effort {
            return Err(SyncError::InvalidConfig(
                "remote has no atomic sale procedure and best-effort sales are disabled".into(),
            ));
        }

        warn!(
            store_id = %sale.store_id,
            external_id = %sale.external_id,
            "Using best-effort sale path; stock is not protected against concurrent devices"
        );
        self.bounded(
            "create_sale_best_effort",
            self.client.create_sale_best_effort(sale),
        )
        .await
    }

    pub async fn cancel_sale(&self, store_id: &str, sale_id: &str) -> SyncResult<CancelSaleResponse> {
        self.bounded(
            "cancel_sale_atomic",
            self.client.cancel_sale_atomic(store_id, sale_id),
        )
        .await
    }

    pub async fn apply_stock_movement(&self, movement: &StockMovement) -> SyncResult<()> {
        self.bounded(
            "apply_stock_movement",
            self.client.apply_stock_movement(movement),
        )
        .await
    }

    pub async fn fetch_expenses(&self, store_id: &str) -> SyncResult<Vec<Expense>> {
        self.bounded("fetch_expenses", self.client.fetch_expenses(store_id))
            .await
    }

    pub async fn upsert_expense(&self, expense: &Expense) -> SyncResult<()> {
        self.bounded("upsert_expense", self.client.upsert_expense(expense))
            .await
    }

    pub async fn upsert_cash_session(&self, session: &CashSession) -> SyncResult<()> {
        self.bounded(
            "upsert_cash_session",
            self.client.upsert_cash_session(session),
        )
        .await
    }

    pub async fn upsert_cash_closure(&self, closure: &CashClosure) -> SyncResult<()> {
        self.bounded(
            "upsert_cash_closure",
            self.client.upsert_cash_closure(closure),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{PaymentMethod, SaleLine, TenantId};

    fn sale(store: &TenantId) -> Sale {
        Sale::finalized(
            store,
            "e1",
            vec![SaleLine {
                product_id: "p1".into(),
                sku: "ABC-1".into(),
                name: "Shirt".into(),
                quantity: 1,
                unit_price_cents: 100,
            }],
            PaymentMethod::Cash,
            None,
            chrono::Utc::now(),
        )
    }

    #[test]
    fn test_response_wire_format() {
        let json = r#"{"status":"insufficient_stock","product_id":"p1","available_stock":1,"required_quantity":2}"#;
        let parsed: AtomicSaleResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.status, AtomicSaleStatus::InsufficientStock);
        assert_eq!(parsed.available_stock, Some(1));
        assert!(!parsed.is_success());
        assert!(AtomicSaleResponse::already_exists("s1").is_success());
    }

    #[tokio::test]
    async fn test_best_effort_requires_opt_in() {
        let store = TenantId::new("s1").unwrap();
        let remote = MemoryRemote::new().without_atomic_sales();
        let gateway = RemoteGateway::new(Arc::new(remote.clone()), Duration::from_secs(1), false);

        let err = gateway.submit_sale(&sale(&store)).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));

        remote.seed_product(Product::new_local(&store, "ABC-1", "Shirt", 3, 50, 100));
        let mut product = remote.products("s1").remove(0);
        let mut s = sale(&store);
        s.items[0].product_id = product.id.clone();
        let gateway = RemoteGateway::new(Arc::new(remote.clone()), Duration::from_secs(1), true);
        let response = gateway.submit_sale(&s).await.unwrap();
        assert_eq!(response.status, AtomicSaleStatus::Ok);
        product = remote.products("s1").remove(0);
        assert_eq!(product.stock, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_remote_is_a_network_error() {
        let remote = MemoryRemote::new();
        remote.set_latency(Some(Duration::from_secs(30)));
        let gateway = RemoteGateway::new(Arc::new(remote), Duration::from_secs(2), false);

        let err = gateway.fetch_products("s1").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
