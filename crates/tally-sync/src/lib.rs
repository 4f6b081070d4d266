//! # tally-sync: Consistency Core for Tally POS
//!
//! Keeps a device's local cache consistent with the remote source of truth
//! while the device keeps selling through outages.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Consistency Core                                 │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   PosCore (collaborator facade)                  │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │     ┌──────────────┬──────────┼───────────┬──────────────┐              │
//! │     ▼              ▼          ▼           ▼              ▼              │
//! │  ┌────────┐  ┌───────────┐ ┌────────┐ ┌──────────┐ ┌────────────┐       │
//! │  │ Tenant │  │ Reconcile │ │ Atomic │ │ Sync     │ │ Cash       │       │
//! │  │ Context│  │ Engine    │ │ Sale   │ │ Queue    │ │ Drawer     │       │
//! │  └────────┘  └─────┬─────┘ └───┬────┘ └────┬─────┘ └────────────┘       │
//! │                    └───────────┼───────────┘                            │
//! │                                ▼                                        │
//! │                  RemoteGateway (timeouts, capabilities)                 │
//! │                                │                                        │
//! │              Postgres  │  in-memory  │  offline                         │
//! │                                                                         │
//! │  SyncAgent: push_pending + pull_catalog on an interval                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - Background push/pull loop
//! - [`cash`] - Cash sessions, expenses and closures
//! - [`config`] - Device configuration (TOML + environment)
//! - [`error`] - Sync error taxonomy
//! - [`pos`] - `PosCore` facade
//! - [`queue`] - Durable outbox drain with backoff and claims
//! - [`reconcile`] - Remote snapshot merge into the cache
//! - [`remote`] - `RemoteClient` trait and its backends
//! - [`sale`] - Idempotent sale creation, cancellation and stock changes
//! - [`tenant`] - Tenant resolution with a TTL cache
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_sync::{remote, CoreConfig, PosCore, SyncAgent};
//!
//! let config = CoreConfig::load(None)?;
//! let client = remote::connect(&config.remote)?;
//! let core = Arc::new(PosCore::new(config, db, client));
//!
//! core.sign_in("store-1", None).await?;
//! let result = core
//!     .create_sale(SaleRequest::new(vec![SaleRequestLine::by_sku("ABC-1", 2)], PaymentMethod::Cash))
//!     .await?;
//!
//! let agent = SyncAgent::spawn(core.clone(), Duration::from_secs(30));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod cash;
pub mod config;
pub mod error;
pub mod pos;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod sale;
pub mod tenant;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentStatus, SyncAgent, SyncAgentHandle};
pub use cash::CashDrawer;
pub use config::{CoreConfig, QueueSettings, RemoteMode, RemoteSettings};
pub use error::{SyncError, SyncResult};
pub use pos::{PosCore, SyncOverview};
pub use queue::{DrainReport, SyncQueue};
pub use reconcile::{PullReport, ReconciliationEngine};
pub use remote::{Capabilities, MemoryRemote, RemoteClient, RemoteGateway};
pub use sale::{AtomicSaleCoordinator, CancelResult, SaleResult};
pub use tenant::{SessionSource, TenantContext};
