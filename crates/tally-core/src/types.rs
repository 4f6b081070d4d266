//! # Domain Types
//!
//! Core domain types used throughout Tally POS.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Product      │   │      Sale       │   │ StockMovement   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  id (UUID)      │   │  append-only    │       │
//! │  │  sku (unique)   │   │  external_id    │   │  delta          │       │
//! │  │  stock ≥ 0      │   │  items[]        │   │  reason         │       │
//! │  │  provenance     │   │  status         │   │  sale_id?       │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ SyncQueueEntry  │   │  CashSession    │   │   Expense /     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  CashClosure    │       │
//! │  │  attempts       │   │  one open per   │   │  StaffMember    │       │
//! │  │  status         │   │  tenant+device  │   │                 │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! Every catalog entity has:
//! - `id`: UUID v4 - immutable, used for relations
//! - Business key: `sku` for products, `external_id` for sales
//!
//! Reconciliation matches on both, so the same logical product carrying two
//! different ids still collapses to a single row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;
use crate::tenant::TenantId;

/// Generates a fresh entity id.
#[inline]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Provenance
// =============================================================================

/// Whether the remote source of truth knows about an entity.
///
/// ## Lifecycle
/// ```text
/// created on device ──► Local ──(push confirmed)──► Remote
/// fetched from remote ─────────────────────────────► Remote
/// ```
///
/// A `Remote` entity missing from a later remote snapshot was deleted
/// upstream. A `Local` one was simply never pushed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Local,
    Remote,
}

impl Default for Provenance {
    fn default() -> Self {
        Provenance::Local
    }
}

// =============================================================================
// Product
// =============================================================================

/// Free-form variant attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ProductAttributes {
    pub color: Option<String>,
    pub size: Option<String>,
    pub model: Option<String>,
}

/// A product in a tenant's catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Product {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Tenant this product belongs to.
    pub store_id: String,

    /// Stock Keeping Unit - unique within the tenant.
    pub sku: String,

    /// Display name shown to cashier and on receipt.
    pub name: String,

    /// Units on hand. Never negative.
    pub stock: i64,

    /// Purchase cost in cents.
    pub cost_price_cents: i64,

    /// Selling price in cents.
    pub sale_price_cents: i64,

    #[serde(default)]
    pub attributes: ProductAttributes,

    /// Inactive products stay in the catalog but cannot be sold.
    pub active: bool,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub provenance: Provenance,
}

impl Product {
    /// Creates a device-local product that has not been pushed yet.
    pub fn new_local(
        store_id: &TenantId,
        sku: impl Into<String>,
        name: impl Into<String>,
        stock: i64,
        cost_price_cents: i64,
        sale_price_cents: i64,
    ) -> Self {
        Product {
            id: new_id(),
            store_id: store_id.as_str().to_string(),
            sku: sku.into(),
            name: name.into(),
            stock: stock.max(0),
            cost_price_cents,
            sale_price_cents,
            attributes: ProductAttributes::default(),
            active: true,
            updated_at: Utc::now(),
            provenance: Provenance::Local,
        }
    }

    #[inline]
    pub fn sale_price(&self) -> Money {
        Money::from_cents(self.sale_price_cents)
    }

    /// Checks the sellable quantity against the local view of stock.
    pub fn can_sell(&self, quantity: i64) -> bool {
        self.active && self.stock >= quantity
    }
}

// =============================================================================
// Stock Arithmetic
// =============================================================================

/// Outcome of applying a signed delta to a stock level.
///
/// Stock is floored at zero. When the floor engages, `shortfall` holds the
/// units that could not be removed; callers record it as a correction.
///
/// ```text
/// previous=1, delta=-3 ──► new_stock=0, shortfall=2
/// previous=5, delta=-2 ──► new_stock=3, shortfall=0
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockChange {
    pub previous_stock: i64,
    pub delta: i64,
    pub new_stock: i64,
    pub shortfall: i64,
}

impl StockChange {
    pub fn compute(previous_stock: i64, delta: i64) -> Self {
        let raw = previous_stock + delta;
        let (new_stock, shortfall) = if raw < 0 { (0, -raw) } else { (raw, 0) };
        StockChange {
            previous_stock,
            delta,
            new_stock,
            shortfall,
        }
    }

    #[inline]
    pub fn is_clamped(&self) -> bool {
        self.shortfall > 0
    }
}

/// The first line of a sale that cannot be covered by stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockShortage {
    pub product_id: String,
    pub sku: Option<String>,
    pub available: i64,
    pub required: i64,
}

impl From<StockShortage> for CoreError {
    fn from(s: StockShortage) -> Self {
        CoreError::InsufficientStock {
            sku: s.sku.unwrap_or_else(|| s.product_id.clone()),
            product_id: s.product_id,
            available: s.available,
            requested: s.required,
        }
    }
}

// =============================================================================
// Stock Movement
// =============================================================================

/// Why a stock level changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MovementReason {
    Sale,
    Cancellation,
    Restock,
    Adjustment,
    /// Logged when a decrement hit the zero floor.
    Correction,
}

impl MovementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementReason::Sale => "sale",
            MovementReason::Cancellation => "cancellation",
            MovementReason::Restock => "restock",
            MovementReason::Adjustment => "adjustment",
            MovementReason::Correction => "correction",
        }
    }
}

/// Immutable audit record of a stock change.
///
/// Movements chain: each `previous_stock` equals the prior movement's
/// `new_stock` for the same product, and the deltas sum to the net change.
/// A clamped sale therefore records its full `-quantity` (with a logical
/// `new_stock` below zero) followed by a `Correction` back to zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct StockMovement {
    pub id: String,
    pub store_id: String,
    pub product_id: String,
    pub delta: i64,
    pub previous_stock: i64,
    pub new_stock: i64,
    pub reason: MovementReason,
    pub sale_id: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn record(
        store_id: &str,
        product_id: &str,
        previous_stock: i64,
        delta: i64,
        reason: MovementReason,
        sale_id: Option<&str>,
    ) -> Self {
        StockMovement {
            id: new_id(),
            store_id: store_id.to_string(),
            product_id: product_id.to_string(),
            delta,
            previous_stock,
            new_stock: previous_stock + delta,
            reason,
            sale_id: sale_id.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    /// Movements that explain `change`: the primary one, plus a
    /// `Correction` when the zero floor engaged.
    pub fn for_change(
        store_id: &str,
        product_id: &str,
        change: &StockChange,
        reason: MovementReason,
        sale_id: Option<&str>,
    ) -> Vec<StockMovement> {
        let primary = StockMovement::record(
            store_id,
            product_id,
            change.previous_stock,
            change.delta,
            reason,
            sale_id,
        );
        if !change.is_clamped() {
            return vec![primary];
        }
        let correction = StockMovement::record(
            store_id,
            product_id,
            primary.new_stock,
            change.shortfall,
            MovementReason::Correction,
            sale_id,
        );
        vec![primary, correction]
    }
}

// =============================================================================
// Sale Status / Payment Method
// =============================================================================

/// The status of a sale. Transitions are one-way: finalized → cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    Finalized,
    Cancelled,
}

impl SaleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleStatus::Finalized => "finalized",
            SaleStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Other => "other",
        }
    }
}

// =============================================================================
// Sale
// =============================================================================

/// A line of a finalized sale.
/// Uses the snapshot pattern: SKU, name and price are frozen at sale time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleLine {
    pub product_id: String,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

impl SaleLine {
    #[inline]
    pub fn line_total(&self) -> Money {
        Money::from_cents(self.unit_price_cents).multiply_quantity(self.quantity)
    }
}

/// A sale transaction. Never hard-deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Sale {
    pub id: String,
    pub store_id: String,
    /// Idempotency key, unique per tenant.
    pub external_id: String,
    pub items: Vec<SaleLine>,
    pub total_cents: i64,
    pub payment_method: PaymentMethod,
    pub status: SaleStatus,
    pub cash_session_id: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Sale {
    /// Builds a finalized sale; the total is derived from the lines.
    pub fn finalized(
        store_id: &TenantId,
        external_id: impl Into<String>,
        items: Vec<SaleLine>,
        payment_method: PaymentMethod,
        cash_session_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let total: Money = items.iter().map(SaleLine::line_total).sum();
        Sale {
            id: new_id(),
            store_id: store_id.as_str().to_string(),
            external_id: external_id.into(),
            items,
            total_cents: total.cents(),
            payment_method,
            status: SaleStatus::Finalized,
            cash_session_id,
            created_at,
            cancelled_at: None,
        }
    }

    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.status == SaleStatus::Cancelled
    }

    /// One-way transition to `Cancelled`.
    pub fn cancel(&mut self, at: DateTime<Utc>) -> CoreResult<()> {
        if self.is_cancelled() {
            return Err(CoreError::InvalidSaleStatus {
                sale_id: self.id.clone(),
                current_status: self.status.as_str().to_string(),
            });
        }
        self.status = SaleStatus::Cancelled;
        self.cancelled_at = Some(at);
        Ok(())
    }

    /// Units sold per product, summing repeated lines.
    pub fn quantities(&self) -> Vec<(String, i64)> {
        let mut out: Vec<(String, i64)> = Vec::new();
        for line in &self.items {
            match out.iter_mut().find(|(id, _)| *id == line.product_id) {
                Some((_, qty)) => *qty += line.quantity,
                None => out.push((line.product_id.clone(), line.quantity)),
            }
        }
        out
    }
}

// =============================================================================
// Sale Request
// =============================================================================

/// How a caller wants a sale confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    /// Fail unless the remote confirms now.
    Synchronous,
    /// Accept locally and queue when the remote is unreachable.
    OfflineTolerant,
}

impl Default for Confirmation {
    fn default() -> Self {
        Confirmation::OfflineTolerant
    }
}

/// A requested line. The SKU is preferred over the raw product id when both
/// are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleRequestLine {
    pub product_id: Option<String>,
    pub sku: Option<String>,
    pub quantity: i64,
}

impl SaleRequestLine {
    pub fn by_sku(sku: impl Into<String>, quantity: i64) -> Self {
        SaleRequestLine {
            product_id: None,
            sku: Some(sku.into()),
            quantity,
        }
    }

    pub fn by_id(product_id: impl Into<String>, quantity: i64) -> Self {
        SaleRequestLine {
            product_id: Some(product_id.into()),
            sku: None,
            quantity,
        }
    }

    fn key(&self) -> &str {
        self.sku
            .as_deref()
            .or(self.product_id.as_deref())
            .unwrap_or_default()
    }
}

/// Input of `create_sale`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleRequest {
    pub external_id: Option<String>,
    pub lines: Vec<SaleRequestLine>,
    pub payment_method: PaymentMethod,
    /// Client-side timestamp; part of the derived idempotency key.
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub confirmation: Confirmation,
}

impl SaleRequest {
    pub fn new(lines: Vec<SaleRequestLine>, payment_method: PaymentMethod) -> Self {
        SaleRequest {
            external_id: None,
            lines,
            payment_method,
            created_at: Utc::now(),
            confirmation: Confirmation::default(),
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_confirmation(mut self, confirmation: Confirmation) -> Self {
        self.confirmation = confirmation;
        self
    }

    /// The caller's external id, or a UUID v5 derived from the tenant, the
    /// client timestamp, the lines and the payment method. Retrying the same
    /// request object always yields the same key.
    pub fn idempotency_key(&self, tenant: &TenantId) -> String {
        if let Some(id) = self.external_id.as_deref().filter(|s| !s.trim().is_empty()) {
            return id.trim().to_string();
        }
        let mut material = format!(
            "{}|{}|{}",
            tenant.as_str(),
            self.created_at.timestamp_nanos_opt().unwrap_or_default(),
            self.payment_method.as_str()
        );
        for line in &self.lines {
            material.push('|');
            material.push_str(line.key());
            material.push('x');
            material.push_str(&line.quantity.to_string());
        }
        Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes()).to_string()
    }
}

// =============================================================================
// Sync Bookkeeping
// =============================================================================

/// Delivery state of a queued mutation or of an entity's last push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    /// Terminal; needs manual intervention.
    Failed,
    Synced,
}

/// Kind of mutation carried by a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncEntity {
    Sale,
    SaleCancellation,
    StockMovement,
    Product,
    ProductDeletion,
    Expense,
    CashSession,
    CashClosure,
}

impl SyncEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEntity::Sale => "sale",
            SyncEntity::SaleCancellation => "sale_cancellation",
            SyncEntity::StockMovement => "stock_movement",
            SyncEntity::Product => "product",
            SyncEntity::ProductDeletion => "product_deletion",
            SyncEntity::Expense => "expense",
            SyncEntity::CashSession => "cash_session",
            SyncEntity::CashClosure => "cash_closure",
        }
    }
}

/// A durable outbox entry.
///
/// `id` is a monotonically increasing sequence, so ordering by id is FIFO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct SyncQueueEntry {
    pub id: i64,
    pub store_id: String,
    pub entity_type: SyncEntity,
    pub entity_id: String,
    /// Full mutation as JSON.
    pub payload: String,
    /// Failed delivery attempts so far. Never decreases.
    pub attempts: i64,
    #[ts(as = "Option<String>")]
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: SyncState,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// Last known sync state of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct SyncStatusRecord {
    pub entity_type: SyncEntity,
    pub entity_id: String,
    pub status: SyncState,
    pub last_error: Option<String>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

/// Idempotency memory for one external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct SaleReceipt {
    pub store_id: String,
    pub external_id: String,
    pub sale_id: String,
    /// Local stock was decremented for this sale.
    pub local_applied: bool,
    /// The remote acknowledged the sale.
    pub remote_confirmed: bool,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Staff
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Cashier,
}

impl Role {
    /// Cancelling restores stock, so it is reserved above the cashier tier.
    pub fn can_cancel_sales(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StaffMember {
    pub id: String,
    pub store_id: String,
    pub name: String,
    pub role: Role,
    pub active: bool,
}

impl StaffMember {
    /// The administrator seeded once for a fresh tenant.
    pub fn bootstrap_admin(store_id: &TenantId) -> Self {
        StaffMember {
            id: new_id(),
            store_id: store_id.as_str().to_string(),
            name: "Administrator".to_string(),
            role: Role::Admin,
            active: true,
        }
    }
}

// =============================================================================
// Cash Management
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
        }
    }
}

/// A cash drawer session on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CashSession {
    pub id: String,
    pub store_id: String,
    pub device_id: String,
    pub opened_by: String,
    pub opening_cents: i64,
    pub status: SessionStatus,
    pub closing_cents: Option<i64>,
    #[ts(as = "String")]
    pub opened_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl CashSession {
    pub fn open(
        store_id: &TenantId,
        device_id: impl Into<String>,
        opened_by: impl Into<String>,
        opening_cents: i64,
    ) -> Self {
        CashSession {
            id: new_id(),
            store_id: store_id.as_str().to_string(),
            device_id: device_id.into(),
            opened_by: opened_by.into(),
            opening_cents,
            status: SessionStatus::Open,
            closing_cents: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }
}

/// Money leaving the drawer (or the business) outside of a sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Expense {
    pub id: String,
    pub store_id: String,
    pub description: String,
    pub category: Option<String>,
    pub amount_cents: i64,
    pub cash_session_id: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub provenance: Provenance,
}

impl Expense {
    pub fn new_local(
        store_id: &TenantId,
        description: impl Into<String>,
        category: Option<String>,
        amount_cents: i64,
        cash_session_id: Option<String>,
    ) -> Self {
        Expense {
            id: new_id(),
            store_id: store_id.as_str().to_string(),
            description: description.into(),
            category,
            amount_cents,
            cash_session_id,
            created_at: Utc::now(),
            provenance: Provenance::Local,
        }
    }
}

/// End-of-session reconciliation of the drawer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CashClosure {
    pub id: String,
    pub store_id: String,
    pub cash_session_id: String,
    /// opening + cash sales - expenses
    pub expected_cents: i64,
    pub counted_cents: i64,
    /// counted - expected; negative means the drawer is short.
    pub difference_cents: i64,
    pub closed_by: String,
    #[ts(as = "String")]
    pub closed_at: DateTime<Utc>,
}

impl CashClosure {
    pub fn compute(
        session: &CashSession,
        cash_sales: Money,
        expenses: Money,
        counted: Money,
        closed_by: impl Into<String>,
    ) -> Self {
        let expected = Money::from_cents(session.opening_cents) + cash_sales - expenses;
        CashClosure {
            id: new_id(),
            store_id: session.store_id.clone(),
            cash_session_id: session.id.clone(),
            expected_cents: expected.cents(),
            counted_cents: counted.cents(),
            difference_cents: (counted - expected).cents(),
            closed_by: closed_by.into(),
            closed_at: Utc::now(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("store-1").unwrap()
    }

    fn line(product_id: &str, qty: i64, price: i64) -> SaleLine {
        SaleLine {
            product_id: product_id.to_string(),
            sku: format!("SKU-{product_id}"),
            name: product_id.to_string(),
            quantity: qty,
            unit_price_cents: price,
        }
    }

    #[test]
    fn test_stock_change_floors_at_zero() {
        let change = StockChange::compute(5, -2);
        assert_eq!(change.new_stock, 3);
        assert!(!change.is_clamped());

        let change = StockChange::compute(1, -3);
        assert_eq!(change.new_stock, 0);
        assert_eq!(change.shortfall, 2);
    }

    #[test]
    fn test_clamped_change_records_correction() {
        let change = StockChange::compute(1, -3);
        let movements =
            StockMovement::for_change("store-1", "p1", &change, MovementReason::Sale, Some("s1"));
        assert_eq!(movements.len(), 2);
        assert_eq!(movements[0].delta, -3);
        assert_eq!(movements[1].reason, MovementReason::Correction);
        assert_eq!(movements[1].new_stock, 0);
        let net: i64 = movements.iter().map(|m| m.delta).sum();
        assert_eq!(net, change.new_stock - change.previous_stock);
    }

    #[test]
    fn test_sale_total_and_quantities() {
        let sale = Sale::finalized(
            &tenant(),
            "e1",
            vec![line("a", 2, 150), line("b", 1, 99), line("a", 1, 150)],
            PaymentMethod::Cash,
            None,
            Utc::now(),
        );
        assert_eq!(sale.total_cents, 549);
        assert_eq!(
            sale.quantities(),
            vec![("a".to_string(), 3), ("b".to_string(), 1)]
        );
    }

    #[test]
    fn test_cancel_is_one_way() {
        let mut sale = Sale::finalized(
            &tenant(),
            "e1",
            vec![line("a", 1, 100)],
            PaymentMethod::Card,
            None,
            Utc::now(),
        );
        assert!(sale.cancel(Utc::now()).is_ok());
        assert!(sale.is_cancelled());
        assert!(sale.cancel(Utc::now()).is_err());
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let request = SaleRequest::new(
            vec![SaleRequestLine::by_sku("ABC-1", 2)],
            PaymentMethod::Cash,
        );
        let first = request.idempotency_key(&tenant());
        let second = request.clone().idempotency_key(&tenant());
        assert_eq!(first, second);

        let other_tenant = TenantId::new("store-2").unwrap();
        assert_ne!(first, request.idempotency_key(&other_tenant));

        let explicit = request.with_external_id("e1");
        assert_eq!(explicit.idempotency_key(&tenant()), "e1");
    }

    #[test]
    fn test_cash_closure_math() {
        let session = CashSession::open(&tenant(), "till-1", "admin", 10_000);
        let closure = CashClosure::compute(
            &session,
            Money::from_cents(5_000),
            Money::from_cents(1_500),
            Money::from_cents(13_000),
            "admin",
        );
        assert_eq!(closure.expected_cents, 13_500);
        assert_eq!(closure.difference_cents, -500);
    }

    #[test]
    fn test_only_managers_cancel() {
        assert!(Role::Admin.can_cancel_sales());
        assert!(Role::Manager.can_cancel_sales());
        assert!(!Role::Cashier.can_cancel_sales());
    }
}
