//! # Postgres Remote
//!
//! `RemoteClient` over a hosted Postgres database. Sales and cancellations go
//! through the PL/pgSQL procedures in `migrations/postgres`; everything else
//! is plain SQL scoped by `store_id`.
//!
//! ## Error Mapping
//! ```text
//! sqlx::Error::Database (23505 unique)   → SyncError::Conflict
//! sqlx::Error::Database (23514 check)    → SyncError::Integrity
//! sqlx::Error::Database (other)          → SyncError::Remote
//! Io / Tls / Protocol / PoolTimedOut ... → SyncError::Network   (retryable)
//! decode failures                        → SyncError::Remote
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tally_core::{
    CashClosure, CashSession, Expense, Product, ProductAttributes, Provenance, Sale,
    StockMovement,
};
use tracing::{debug, info};

use super::{AtomicSaleResponse, CancelSaleResponse, Capabilities, RemoteClient};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Error Mapping
// =============================================================================

fn map_pg_error(err: sqlx::Error) -> SyncError {
    match err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => SyncError::Conflict(db.message().to_string()),
            Some("23514") => SyncError::Integrity(db.message().to_string()),
            _ => SyncError::Remote(db.message().to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SyncError::Network(err.to_string()),
        sqlx::Error::RowNotFound => SyncError::NotFound(err.to_string()),
        other => SyncError::Remote(other.to_string()),
    }
}

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: String,
    store_id: String,
    sku: String,
    name: String,
    stock: i64,
    cost_price_cents: i64,
    sale_price_cents: i64,
    color: Option<String>,
    size: Option<String>,
    model: Option<String>,
    active: bool,
    updated_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            id: row.id,
            store_id: row.store_id,
            sku: row.sku,
            name: row.name,
            stock: row.stock,
            cost_price_cents: row.cost_price_cents,
            sale_price_cents: row.sale_price_cents,
            attributes: ProductAttributes {
                color: row.color,
                size: row.size,
                model: row.model,
            },
            active: row.active,
            updated_at: row.updated_at,
            provenance: Provenance::Remote,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExpenseRow {
    id: String,
    store_id: String,
    description: String,
    category: Option<String>,
    amount_cents: i64,
    cash_session_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<ExpenseRow> for Expense {
    fn from(row: ExpenseRow) -> Self {
        Expense {
            id: row.id,
            store_id: row.store_id,
            description: row.description,
            category: row.category,
            amount_cents: row.amount_cents,
            cash_session_id: row.cash_session_id,
            created_at: row.created_at,
            provenance: Provenance::Remote,
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Postgres-backed remote store.
#[derive(Debug, Clone)]
pub struct PgRemoteClient {
    pool: PgPool,
    capabilities: Capabilities,
}

impl PgRemoteClient {
    /// Builds a pool that connects on first use.
    pub fn connect_lazy(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> SyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)
            .map_err(|e| SyncError::InvalidConfig(format!("remote url: {e}")))?;

        info!(max_connections, "Postgres remote pool configured");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgRemoteClient {
            pool,
            capabilities: Capabilities { atomic_sales: true },
        }
    }

    /// Declares a database where the sale procedures are not installed.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Installs the remote schema and the sale procedures.
    pub async fn run_migrations(&self) -> SyncResult<()> {
        sqlx::migrate!("../../migrations/postgres")
            .run(&self.pool)
            .await
            .map_err(|e| SyncError::Remote(format!("migration failed: {e}")))?;
        info!("Remote migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn existing_sale_id(&self, store_id: &str, external_id: &str) -> SyncResult<String> {
        sqlx::query_scalar::<_, String>(
            "SELECT id FROM sales WHERE store_id = $1 AND external_id = $2",
        )
        .bind(store_id)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_pg_error)
    }
}

#[async_trait]
impl RemoteClient for PgRemoteClient {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn sample_store_id(&self) -> SyncResult<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT store_id FROM products LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(map_pg_error)
    }

    // -------------------------------------------------------------------------
    // Catalog
    // -------------------------------------------------------------------------

    async fn fetch_products(&self, store_id: &str) -> SyncResult<Vec<Product>> {
        let rows = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT id, store_id, sku, name, stock, cost_price_cents, sale_price_cents,
                   color, size, model, active, updated_at
            FROM products
            WHERE store_id = $1
            ORDER BY sku
            "#,
        )
        .bind(store_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_pg_error)?;

        debug!(store_id = %store_id, count = rows.len(), "Fetched remote products");
        Ok(rows.into_iter().map(Product::from).collect())
    }

    async fn upsert_product(&self, product: &Product) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO products (
                id, store_id, sku, name, stock, cost_price_cents, sale_price_cents,
                color, size, model, active, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                sku = EXCLUDED.sku,
                name = EXCLUDED.name,
                cost_price_cents = EXCLUDED.cost_price_cents,
                sale_price_cents = EXCLUDED.sale_price_cents,
                color = EXCLUDED.color,
                size = EXCLUDED.size,
                model = EXCLUDED.model,
                active = EXCLUDED.active,
                updated_at = EXCLUDED.updated_at
            WHERE products.store_id = EXCLUDED.store_id
            "#,
        )
        .bind(&product.id)
        .bind(&product.store_id)
        .bind(product.sku.trim())
        .bind(&product.name)
        .bind(product.stock.max(0))
        .bind(product.cost_price_cents)
        .bind(product.sale_price_cents)
        .bind(product.attributes.color.as_deref())
        .bind(product.attributes.size.as_deref())
        .bind(product.attributes.model.as_deref())
        .bind(product.active)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_pg_error)?;
        Ok(())
    }

    async fn delete_product(&self, store_id: &str, product_id: &str) -> SyncResult<bool> {
        let result = sqlx::query("DELETE FROM products WHERE store_id = $1 AND id = $2")
            .bind(store_id)
            .bind(product_id)
            .execute(&self.pool)
            .await
            .map_err(map_pg_error)?;
        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // Sales
    // -------------------------------------------------------------------------

    async fn create_sale_atomic(
        &self,
        sale: &Sale,
        external_id: &str,
        store_id: &str,
    ) -> SyncResult<AtomicSaleResponse> {
        let Json(response) = sqlx::query_scalar::<_, Json<AtomicSaleResponse>>(
            "SELECT create_sale_atomic($1, $2, $3)",
        )
        .bind(Json(sale))
        .bind(external_id)
        .bind(store_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_pg_error)?;

        debug!(
            store_id = %store_id,
            external_id = %external_id,
            status = ?response.status,
            "create_sale_atomic answered"
        );
        Ok(response)
    }

    async fn create_sale_best_effort(&self, sale: &Sale) -> SyncResult<AtomicSaleResponse> {
        let inserted = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO sales (
                id, store_id, external_id, items, total_cents, payment_method,
                status, cash_session_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 'finalized', $7, $8)
            ON CONFLICT (store_id, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&sale.id)
        .bind(&sale.store_id)
        .bind(&sale.external_id)
        .bind(Json(&sale.items))
        .bind(sale.total_cents)
        .bind(sale.payment_method.as_str())
        .bind(sale.cash_session_id.as_deref())
        .bind(sale.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_pg_error)?;

        let Some(sale_id) = inserted else {
            let existing = self
                .existing_sale_id(&sale.store_id, &sale.external_id)
                .await?;
            return Ok(AtomicSaleResponse::already_exists(existing));
        };

        // Each line is its own statement; another device can interleave.
        for (product_id, qty) in sale.quantities() {
            sqlx::query(
                r#"
                UPDATE products SET stock = GREATEST(stock - $3, 0), updated_at = NOW()
                WHERE store_id = $1 AND id = $2
                "#,
            )
            .bind(&sale.store_id)
            .bind(&product_id)
            .bind(qty)
            .execute(&self.pool)
            .await
            .map_err(map_pg_error)?;
        }

        Ok(AtomicSaleResponse::ok(sale_id))
    }

    async fn cancel_sale_atomic(
        &self,
        store_id: &str,
        sale_id: &str,
    ) -> SyncResult<CancelSaleResponse> {
        let Json(response) = sqlx::query_scalar::<_, Json<CancelSaleResponse>>(
            "SELECT cancel_sale_atomic($1, $2)",
        )
        .bind(store_id)
        .bind(sale_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_pg_error)?;
        Ok(response)
    }

    // -------------------------------------------------------------------------
    // Stock
    // -------------------------------------------------------------------------

    async fn apply_stock_movement(&self, movement: &StockMovement) -> SyncResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_pg_error)?;

        let recorded = sqlx::query(
            r#"
            INSERT INTO stock_movements (
                id, store_id, product_id, delta, previous_stock, new_stock,
                reason, sale_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&movement.id)
        .bind(&movement.store_id)
        .bind(&movement.product_id)
        .bind(movement.delta)
        .bind(movement.previous_stock)
        .bind(movement.new_stock)
        .bind(movement.reason.as_str())
        .bind(movement.sale_id.as_deref())
        .bind(movement.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_pg_error)?
        .rows_affected();

        if recorded == 0 {
            debug!(movement_id = %movement.id, "Movement already applied");
            return Ok(());
        }

        let updated = sqlx::query(
            r#"
            UPDATE products SET stock = GREATEST(stock + $3, 0), updated_at = NOW()
            WHERE store_id = $1 AND id = $2
            "#,
        )
        .bind(&movement.store_id)
        .bind(&movement.product_id)
        .bind(movement.delta)
        .execute(&mut *tx)
        .await
        .map_err(map_pg_error)?
        .rows_affected();

        if updated == 0 {
            return Err(SyncError::NotFound(format!("product {}", movement.product_id)));
        }

        tx.commit().await.map_err(map_pg_error)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cash
    // -------------------------------------------------------------------------

    async fn fetch_expenses(&self, store_id: &str) -> SyncResult<Vec<Expense>> {
        let rows = sqlx::query_as::<_, ExpenseRow>(
            r#"
            SELECT id, store_id, description, category, amount_cents, cash_session_id, created_at
            FROM expenses
            WHERE store_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(store_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_pg_error)?;

        Ok(rows.into_iter().map(Expense::from).collect())
    }

    async fn upsert_expense(&self, expense: &Expense) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO expenses (
                id, store_id, description, category, amount_cents, cash_session_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                description = EXCLUDED.description,
                category = EXCLUDED.category,
                amount_cents = EXCLUDED.amount_cents,
                cash_session_id = EXCLUDED.cash_session_id
            WHERE expenses.store_id = EXCLUDED.store_id
            "#,
        )
        .bind(&expense.id)
        .bind(&expense.store_id)
        .bind(&expense.description)
        .bind(expense.category.as_deref())
        .bind(expense.amount_cents)
        .bind(expense.cash_session_id.as_deref())
        .bind(expense.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_pg_error)?;
        Ok(())
    }

    async fn upsert_cash_session(&self, session: &CashSession) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cash_sessions (
                id, store_id, device_id, opened_by, opening_cents, status,
                closing_cents, opened_at, closed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                closing_cents = EXCLUDED.closing_cents,
                closed_at = EXCLUDED.closed_at
            WHERE cash_sessions.store_id = EXCLUDED.store_id
            "#,
        )
        .bind(&session.id)
        .bind(&session.store_id)
        .bind(&session.device_id)
        .bind(&session.opened_by)
        .bind(session.opening_cents)
        .bind(session.status.as_str())
        .bind(session.closing_cents)
        .bind(session.opened_at)
        .bind(session.closed_at)
        .execute(&self.pool)
        .await
        .map_err(map_pg_error)?;
        Ok(())
    }

    async fn upsert_cash_closure(&self, closure: &CashClosure) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cash_closures (
                id, store_id, cash_session_id, expected_cents, counted_cents,
                difference_cents, closed_by, closed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&closure.id)
        .bind(&closure.store_id)
        .bind(&closure.cash_session_id)
        .bind(closure.expected_cents)
        .bind(closure.counted_cents)
        .bind(closure.difference_cents)
        .bind(&closure.closed_by)
        .bind(closure.closed_at)
        .execute(&self.pool)
        .await
        .map_err(map_pg_error)?;
        Ok(())
    }
}
