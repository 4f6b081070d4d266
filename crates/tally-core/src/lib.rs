//! # tally-core: Pure Business Logic for Tally POS
//!
//! This crate is the domain model of the offline-first consistency core.
//! Everything here is a pure function or a plain data type; the local cache
//! (`tally-db`) and the remote plumbing (`tally-sync`) build on it.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            Presentation (dashboards, forms, imports)            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ PosCore API                            │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │  tally-sync: TenantContext, RemoteClient, ReconciliationEngine, │   │
//! │  │              AtomicSaleCoordinator, SyncQueue, CashDrawer       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │  tally-db: LocalCacheStore (SQLite, per-tenant namespaces)      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  tenant   │  │   types   │  │ reconcile │  │ validation│  │   │
//! │  │   │ TenantId  │  │  Product  │  │ merge by  │  │   rules   │  │   │
//! │  │   │  Scope    │  │ Sale, ... │  │ id + SKU  │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`tenant`] - Tenant identifiers and resolution scope
//! - [`types`] - Domain types (Product, Sale, StockMovement, etc.)
//! - [`money`] - Money type with integer arithmetic (no floating point!)
//! - [`reconcile`] - Remote/local catalog merge
//! - [`error`] - Domain error types
//! - [`validation`] - Business rule validation
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::types::StockChange;
//!
//! // Stock never goes below zero; the shortfall is reported instead.
//! let change = StockChange::compute(1, -3);
//! assert_eq!(change.new_stock, 0);
//! assert_eq!(change.shortfall, 2);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod money;
pub mod reconcile;
pub mod tenant;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use reconcile::{reconcile, MergeOutcome, Reconcilable};
pub use tenant::{TenantId, TenantScope};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum lines allowed in a single sale.
///
/// ## Business Reason
/// Prevents runaway tickets and keeps the atomic sale procedure's
/// transaction short.
pub const MAX_SALE_LINES: usize = 100;

/// Maximum quantity of a single line.
///
/// ## Business Reason
/// Prevents accidental over-ordering (e.g., typing 1000 instead of 10)
pub const MAX_ITEM_QUANTITY: i64 = 999;
