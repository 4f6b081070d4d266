//! # Repository Module
//!
//! Pool-backed repositories for the tables that live outside the
//! per-tenant document namespace.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Database                                                               │
//! │   ├── cache(scope)      → LocalCacheStore   (documents, writer-guarded) │
//! │   ├── sync_queue()      → SyncQueueRepository                           │
//! │   │      pending / entries / get / count                                │
//! │   └── device_session()  → DeviceSessionRepository                       │
//! │          current_store / set / clear                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Queue writes (claims, synced, failed, retried, purges) are not here: they
//! go through `CacheWriter` so they serialize with every other write of the
//! tenant and commit together with the cache changes they describe.
//!
//! ## Available Repositories
//!
//! - [`SyncQueueRepository`](sync_queue::SyncQueueRepository) - outbox reads
//! - [`DeviceSessionRepository`](session::DeviceSessionRepository) - signed-in tenant

pub mod session;
pub mod sync_queue;
