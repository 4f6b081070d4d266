//! # tally-db: Local Cache Store for Tally POS
//!
//! The device's working copy of tenant data, kept in SQLite through sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Data Flow                              │
//! │                                                                         │
//! │  tally-sync (coordinators, queue drain, reconciliation)                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │ LocalCacheStore│    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │ + CacheWriter  │    │  + upgrade   │  │   │
//! │  │   │               │    │                │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ per-tenant     │    │ 001..003.sql │  │   │
//! │  │   │ WriterRegistry│    │ documents      │    │ doc_version  │  │   │
//! │  │   └───────────────┘    └────────────────┘    └──────────────┘  │   │
//! │  │                         SyncQueueRepository                      │   │
//! │  │                         DeviceSessionRepository                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  tally.db (WAL)                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`cache`] - Per-tenant document store and its writer
//! - [`migrations`] - Embedded DDL migrations
//! - [`upgrade`] - One-time rewrite of old document bodies
//! - [`repository`] - Sync queue and device session repositories
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/tally.db")).await?;
//! let store = db.cache(TenantId::new("store-1")?.into());
//!
//! let products: Vec<Product> = store.get().await?;
//!
//! let mut writer = store.begin_write().await?;
//! writer.apply_stock_delta(&product_id, 5, MovementReason::Restock, None).await?;
//! writer.commit().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod upgrade;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::writer::{CacheWriter, StockUpdate};
pub use cache::{CacheEntity, LocalCacheStore, CURRENT_DOC_VERSION};
pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::session::{DeviceSession, DeviceSessionRepository};
pub use repository::sync_queue::SyncQueueRepository;
