//! # In-Memory Remote
//!
//! A multi-tenant remote store living in the process, with the same
//! semantics as the Postgres procedures. Every call is serialized by one
//! mutex, which gives the atomic procedures their all-or-nothing behavior.
//!
//! ## Fault Injection
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  set_offline(true)       every call fails with Network                  │
//! │  fail_next(n)            the next n calls fail with Network             │
//! │  lose_next_responses(n)  the next n calls take effect, then report      │
//! │                          Network (a timeout after commit)               │
//! │  set_latency(Some(d))    every call sleeps d before running             │
//! │  without_atomic_sales()  declares no atomic procedure                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Clones share state: tests keep one handle and give another to the core.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tally_core::{
    CashClosure, CashSession, Expense, Product, Provenance, Sale, StockMovement,
};
use tracing::debug;

use super::{
    AtomicSaleResponse, CancelSaleResponse, CancelSaleStatus, Capabilities, RemoteClient,
};
use crate::error::{SyncError, SyncResult};

/// (store_id, id)
type Key = (String, String);

fn key(store_id: &str, id: &str) -> Key {
    (store_id.to_string(), id.to_string())
}

#[derive(Debug, Default)]
struct State {
    products: BTreeMap<Key, Product>,
    sales: BTreeMap<Key, Sale>,
    applied_movements: HashSet<String>,
    expenses: BTreeMap<Key, Expense>,
    sessions: BTreeMap<Key, CashSession>,
    closures: BTreeMap<Key, CashClosure>,

    offline: bool,
    fail_next: u32,
    lose_next: u32,
    latency: Option<Duration>,
    calls: u64,
}

impl State {
    fn in_store<'a, T>(
        map: &'a BTreeMap<Key, T>,
        store_id: &'a str,
    ) -> impl Iterator<Item = &'a T> + 'a {
        map.iter()
            .filter(move |((store, _), _)| store == store_id)
            .map(|(_, v)| v)
    }

    fn sale_by_external_id<'a>(
        &'a self,
        store_id: &'a str,
        external_id: &'a str,
    ) -> Option<&'a Sale> {
        Self::in_store(&self.sales, store_id).find(move |s| s.external_id == external_id)
    }
}

/// In-process remote store.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
    capabilities: Capabilities,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        MemoryRemote {
            state: Arc::new(Mutex::new(State::default())),
            capabilities: Capabilities { atomic_sales: true },
        }
    }

    /// Same store, declared without the atomic sale procedure.
    pub fn without_atomic_sales(self) -> Self {
        MemoryRemote {
            capabilities: Capabilities {
                atomic_sales: false,
            },
            ..self
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Fault Injection
    // -------------------------------------------------------------------------

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn fail_next(&self, calls: u32) {
        self.state().fail_next = calls;
    }

    pub fn lose_next_responses(&self, calls: u32) {
        self.state().lose_next = calls;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Calls received so far, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.state().calls
    }

    /// Runs before every call: latency, then injected failures.
    async fn gate(&self, op: &'static str) -> SyncResult<()> {
        let latency = {
            let mut state = self.state();
            state.calls += 1;
            state.latency
        };
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.offline {
            debug!(op, "Memory remote offline");
            return Err(SyncError::Network(format!("{op}: remote unreachable")));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            debug!(op, remaining = state.fail_next, "Injected remote failure");
            return Err(SyncError::Network(format!("{op}: injected failure")));
        }
        Ok(())
    }

    /// Runs after a call took effect; may swallow the answer.
    fn deliver<T>(&self, op: &'static str, value: T) -> SyncResult<T> {
        let mut state = self.state();
        if state.lose_next > 0 {
            state.lose_next -= 1;
            debug!(op, "Injected lost response");
            return Err(SyncError::Network(format!("{op}: response lost")));
        }
        Ok(value)
    }

    // -------------------------------------------------------------------------
    // Direct Access (test fixtures)
    // -------------------------------------------------------------------------

    /// Inserts a product as if another device had created it.
    pub fn seed_product(&self, mut product: Product) {
        product.provenance = Provenance::Remote;
        self.state()
            .products
            .insert(key(&product.store_id, &product.id), product);
    }

    /// Deletes a product behind the device's back.
    pub fn remove_product(&self, store_id: &str, product_id: &str) -> bool {
        self.state()
            .products
            .remove(&key(store_id, product_id))
            .is_some()
    }

    pub fn products(&self, store_id: &str) -> Vec<Product> {
        State::in_store(&self.state().products, store_id)
            .cloned()
            .collect()
    }

    pub fn product(&self, store_id: &str, product_id: &str) -> Option<Product> {
        self.state().products.get(&key(store_id, product_id)).cloned()
    }

    pub fn sales(&self, store_id: &str) -> Vec<Sale> {
        State::in_store(&self.state().sales, store_id)
            .cloned()
            .collect()
    }

    pub fn expenses(&self, store_id: &str) -> Vec<Expense> {
        State::in_store(&self.state().expenses, store_id)
            .cloned()
            .collect()
    }

    pub fn cash_sessions(&self, store_id: &str) -> Vec<CashSession> {
        State::in_store(&self.state().sessions, store_id)
            .cloned()
            .collect()
    }

    pub fn cash_closures(&self, store_id: &str) -> Vec<CashClosure> {
        State::in_store(&self.state().closures, store_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn sample_store_id(&self) -> SyncResult<Option<String>> {
        self.gate("sample_store_id").await?;
        let store = self
            .state()
            .products
            .keys()
            .next()
            .map(|(store, _)| store.clone());
        self.deliver("sample_store_id", store)
    }

    async fn fetch_products(&self, store_id: &str) -> SyncResult<Vec<Product>> {
        self.gate("fetch_products").await?;
        let products = self.products(store_id);
        self.deliver("fetch_products", products)
    }

    async fn upsert_product(&self, product: &Product) -> SyncResult<()> {
        self.gate("upsert_product").await?;
        {
            let mut state = self.state();
            let duplicate = State::in_store(&state.products, &product.store_id)
                .any(|p| p.sku == product.sku && p.id != product.id);
            if duplicate {
                return Err(SyncError::Conflict(format!(
                    "sku '{}' already exists in store {}",
                    product.sku, product.store_id
                )));
            }

            let k = key(&product.store_id, &product.id);
            let mut incoming = product.clone();
            incoming.provenance = Provenance::Remote;
            if let Some(existing) = state.products.get(&k) {
                incoming.stock = existing.stock;
            }
            state.products.insert(k, incoming);
        }
        self.deliver("upsert_product", ())
    }

    async fn delete_product(&self, store_id: &str, product_id: &str) -> SyncResult<bool> {
        self.gate("delete_product").await?;
        let existed = self.remove_product(store_id, product_id);
        self.deliver("delete_product", existed)
    }

    async fn create_sale_atomic(
        &self,
        sale: &Sale,
        external_id: &str,
        store_id: &str,
    ) -> SyncResult<AtomicSaleResponse> {
        self.gate("create_sale_atomic").await?;
        let response = {
            let mut state = self.state();
            if let Some(existing) = state.sale_by_external_id(store_id, external_id) {
                AtomicSaleResponse::already_exists(existing.id.clone())
            } else {
                let quantities = sale.quantities();
                let mut shortage = None;
                let mut missing = None;
                for (product_id, qty) in &quantities {
                    match state.products.get(&key(store_id, product_id)) {
                        None => {
                            missing = Some(product_id.clone());
                            break;
                        }
                        Some(p) if p.stock < *qty => {
                            shortage = Some(AtomicSaleResponse::insufficient_stock(
                                product_id.clone(),
                                p.stock,
                                *qty,
                            ));
                            break;
                        }
                        Some(_) => {}
                    }
                }

                match (missing, shortage) {
                    (Some(product_id), _) => {
                        AtomicSaleResponse::error(format!("product {product_id} not found"))
                    }
                    (None, Some(rejected)) => rejected,
                    (None, None) => {
                        for (product_id, qty) in &quantities {
                            if let Some(p) = state.products.get_mut(&key(store_id, product_id)) {
                                p.stock -= qty;
                                p.updated_at = Utc::now();
                            }
                        }
                        let mut stored = sale.clone();
                        stored.store_id = store_id.to_string();
                        stored.external_id = external_id.to_string();
                        state.sales.insert(key(store_id, &stored.id), stored);
                        AtomicSaleResponse::ok(sale.id.clone())
                    }
                }
            }
        };
        self.deliver("create_sale_atomic", response)
    }

    async fn create_sale_best_effort(&self, sale: &Sale) -> SyncResult<AtomicSaleResponse> {
        self.gate("create_sale_best_effort").await?;
        let response = {
            let mut state = self.state();
            if let Some(existing) = state.sale_by_external_id(&sale.store_id, &sale.external_id) {
                AtomicSaleResponse::already_exists(existing.id.clone())
            } else {
                state
                    .sales
                    .insert(key(&sale.store_id, &sale.id), sale.clone());
                for (product_id, qty) in sale.quantities() {
                    if let Some(p) = state.products.get_mut(&key(&sale.store_id, &product_id)) {
                        p.stock = (p.stock - qty).max(0);
                        p.updated_at = Utc::now();
                    }
                }
                AtomicSaleResponse::ok(sale.id.clone())
            }
        };
        self.deliver("create_sale_best_effort", response)
    }

    async fn cancel_sale_atomic(
        &self,
        store_id: &str,
        sale_id: &str,
    ) -> SyncResult<CancelSaleResponse> {
        self.gate("cancel_sale_atomic").await?;
        let response = {
            let mut state = self.state();
            let k = key(store_id, sale_id);
            let restock = match state.sales.get_mut(&k) {
                None => None,
                Some(sale) if sale.is_cancelled() => Some(Vec::new()),
                Some(sale) => {
                    sale.cancel(Utc::now())?;
                    Some(sale.quantities())
                }
            };
            match restock {
                None => CancelSaleResponse::new(CancelSaleStatus::NotFound, None),
                Some(lines) if lines.is_empty() => CancelSaleResponse::new(
                    CancelSaleStatus::AlreadyCancelled,
                    Some(sale_id.to_string()),
                ),
                Some(lines) => {
                    for (product_id, qty) in lines {
                        if let Some(p) = state.products.get_mut(&key(store_id, &product_id)) {
                            p.stock += qty;
                            p.updated_at = Utc::now();
                        }
                    }
                    CancelSaleResponse::new(CancelSaleStatus::Ok, Some(sale_id.to_string()))
                }
            }
        };
        self.deliver("cancel_sale_atomic", response)
    }

    async fn apply_stock_movement(&self, movement: &StockMovement) -> SyncResult<()> {
        self.gate("apply_stock_movement").await?;
        {
            let mut state = self.state();
            if !state.applied_movements.contains(&movement.id) {
                let product = state
                    .products
                    .get_mut(&key(&movement.store_id, &movement.product_id))
                    .ok_or_else(|| {
                        SyncError::NotFound(format!("product {}", movement.product_id))
                    })?;
                product.stock = (product.stock + movement.delta).max(0);
                product.updated_at = Utc::now();
                state.applied_movements.insert(movement.id.clone());
            }
        }
        self.deliver("apply_stock_movement", ())
    }

    async fn fetch_expenses(&self, store_id: &str) -> SyncResult<Vec<Expense>> {
        self.gate("fetch_expenses").await?;
        let expenses = self.expenses(store_id);
        self.deliver("fetch_expenses", expenses)
    }

    async fn upsert_expense(&self, expense: &Expense) -> SyncResult<()> {
        self.gate("upsert_expense").await?;
        let mut stored = expense.clone();
        stored.provenance = Provenance::Remote;
        self.state()
            .expenses
            .insert(key(&expense.store_id, &expense.id), stored);
        self.deliver("upsert_expense", ())
    }

    async fn upsert_cash_session(&self, session: &CashSession) -> SyncResult<()> {
        self.gate("upsert_cash_session").await?;
        self.state()
            .sessions
            .insert(key(&session.store_id, &session.id), session.clone());
        self.deliver("upsert_cash_session", ())
    }

    async fn upsert_cash_closure(&self, closure: &CashClosure) -> SyncResult<()> {
        self.gate("upsert_cash_closure").await?;
        {
            let mut state = self.state();
            let duplicate = State::in_store(&state.closures, &closure.store_id)
                .any(|c| c.cash_session_id == closure.cash_session_id && c.id != closure.id);
            if duplicate {
                return Err(SyncError::Conflict(format!(
                    "cash session {} already closed",
                    closure.cash_session_id
                )));
            }
            state
                .closures
                .insert(key(&closure.store_id, &closure.id), closure.clone());
        }
        self.deliver("upsert_cash_closure", ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::AtomicSaleStatus;
    use tally_core::{PaymentMethod, SaleLine, TenantId};

    fn store() -> TenantId {
        TenantId::new("s1").unwrap()
    }

    fn sale_of(product: &Product, qty: i64, external_id: &str) -> Sale {
        Sale::finalized(
            &store(),
            external_id,
            vec![SaleLine {
                product_id: product.id.clone(),
                sku: product.sku.clone(),
                name: product.name.clone(),
                quantity: qty,
                unit_price_cents: product.sale_price_cents,
            }],
            PaymentMethod::Cash,
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_atomic_sale_replay_and_shortage() {
        let remote = MemoryRemote::new();
        let product = Product::new_local(&store(), "ABC-1", "Shirt", 5, 100, 200);
        remote.seed_product(product.clone());

        let first = sale_of(&product, 2, "e1");
        let response = remote.create_sale_atomic(&first, "e1", "s1").await.unwrap();
        assert_eq!(response.status, AtomicSaleStatus::Ok);
        assert_eq!(response.sale_id.as_deref(), Some(first.id.as_str()));

        let retry = sale_of(&product, 2, "e1");
        let response = remote.create_sale_atomic(&retry, "e1", "s1").await.unwrap();
        assert_eq!(response.status, AtomicSaleStatus::AlreadyExists);
        assert_eq!(response.sale_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(remote.product("s1", &product.id).unwrap().stock, 3);

        let greedy = sale_of(&product, 4, "e2");
        let response = remote.create_sale_atomic(&greedy, "e2", "s1").await.unwrap();
        assert_eq!(response.status, AtomicSaleStatus::InsufficientStock);
        assert_eq!(response.available_stock, Some(3));
        assert_eq!(response.required_quantity, Some(4));
        assert_eq!(remote.product("s1", &product.id).unwrap().stock, 3);
    }

    #[tokio::test]
    async fn test_movements_apply_once() {
        let remote = MemoryRemote::new();
        let product = Product::new_local(&store(), "ABC-1", "Shirt", 1, 100, 200);
        remote.seed_product(product.clone());

        let movement = StockMovement::record(
            "s1",
            &product.id,
            1,
            4,
            tally_core::MovementReason::Restock,
            None,
        );
        remote.apply_stock_movement(&movement).await.unwrap();
        remote.apply_stock_movement(&movement).await.unwrap();
        assert_eq!(remote.product("s1", &product.id).unwrap().stock, 5);
    }

    #[tokio::test]
    async fn test_upsert_keeps_remote_stock() {
        let remote = MemoryRemote::new();
        let mut product = Product::new_local(&store(), "ABC-1", "Shirt", 7, 100, 200);
        remote.upsert_product(&product).await.unwrap();

        product.name = "Renamed".into();
        product.stock = 0;
        remote.upsert_product(&product).await.unwrap();

        let stored = remote.product("s1", &product.id).unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.stock, 7);
        assert_eq!(stored.provenance, Provenance::Remote);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let remote = MemoryRemote::new();
        remote.fail_next(2);
        assert!(remote.fetch_products("s1").await.is_err());
        assert!(remote.fetch_products("s1").await.is_err());
        assert!(remote.fetch_products("s1").await.is_ok());

        remote.set_offline(true);
        assert!(matches!(
            remote.sample_store_id().await,
            Err(SyncError::Network(_))
        ));
        remote.set_offline(false);

        let product = Product::new_local(&store(), "ABC-1", "Shirt", 1, 100, 200);
        remote.lose_next_responses(1);
        assert!(remote.upsert_product(&product).await.is_err());
        assert!(remote.product("s1", &product.id).is_some());
        assert_eq!(remote.call_count(), 5);
    }
}
