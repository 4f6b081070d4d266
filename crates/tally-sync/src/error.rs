//! # Sync Error Types
//!
//! Error types for the consistency core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Transient     │  │ Business        │  │     Fatal               │ │
//! │  │   (retry)       │  │ rejection       │  │                         │ │
//! │  │                 │  │ (never retried) │  │  TenantUnresolved       │ │
//! │  │  Network        │  │  Conflict       │  │  InvalidConfig          │ │
//! │  │                 │  │  InsufficientSt.│  │  Database               │ │
//! │  │                 │  │  Integrity      │  │                         │ │
//! │  │                 │  │  Forbidden      │  │                         │ │
//! │  │                 │  │  Validation     │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Network during a write is recovered by queueing when the caller       │
//! │  accepts offline confirmation. Everything else is surfaced.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Expected business outcomes of a sale (replay, queued, short on stock)
//! are variants of `SaleResult`, not errors.

use tally_core::{CoreError, StockShortage, ValidationError};
use tally_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Error type for every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Tenant Errors
    // =========================================================================
    /// No tenant could be resolved; writes are refused.
    ///
    /// ## When This Occurs
    /// - No explicit store id, no device session, and the remote lookup
    ///   returned nothing or failed
    #[error("Tenant could not be resolved; sign in to a store first")]
    TenantUnresolved,

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The remote could not be reached or did not answer in time.
    ///
    /// Transient: the only retryable variant.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote answered with a server-side failure.
    #[error("Remote error: {0}")]
    Remote(String),

    // =========================================================================
    // Business Rejections
    // =========================================================================
    /// A uniqueness rule or state machine forbids the change.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Not enough stock to cover a sale line.
    #[error("Insufficient stock for {product_id}: available {available}, required {required}")]
    InsufficientStock {
        product_id: String,
        sku: Option<String>,
        available: i64,
        required: i64,
    },

    /// An invariant was violated.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// Entity not found locally or remotely.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The actor may not perform this operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Input failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// Local cache store failure.
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::TenantUnresolved => SyncError::TenantUnresolved,
            DbError::TenantMismatch { expected, found } => SyncError::Integrity(format!(
                "entity of tenant '{found}' written through tenant '{expected}'"
            )),
            DbError::NotFound { entity, id } => SyncError::NotFound(format!("{entity} {id}")),
            DbError::UniqueViolation { field, value } => {
                SyncError::Conflict(format!("{field} '{value}' already exists"))
            }
            DbError::Integrity(msg) => SyncError::Integrity(msg),
            DbError::Serialization(msg) => SyncError::Serialization(msg),
            other => SyncError::Database(other.to_string()),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::TenantUnresolved => SyncError::TenantUnresolved,
            CoreError::TenantMismatch { expected, found } => SyncError::Integrity(format!(
                "entity of tenant '{found}' used in tenant '{expected}'"
            )),
            CoreError::ProductNotFound(id) => SyncError::NotFound(format!("product {id}")),
            CoreError::SaleNotFound(id) => SyncError::NotFound(format!("sale {id}")),
            CoreError::InsufficientStock {
                product_id,
                sku,
                available,
                requested,
            } => SyncError::InsufficientStock {
                product_id,
                sku: Some(sku),
                available,
                required: requested,
            },
            CoreError::InvalidSaleStatus { .. } => SyncError::Conflict(err.to_string()),
            CoreError::Integrity(msg) => SyncError::Integrity(msg),
            CoreError::Validation(_)
            | CoreError::SaleTooLarge { .. }
            | CoreError::QuantityTooLarge { .. } => SyncError::Validation(err.to_string()),
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<StockShortage> for SyncError {
    fn from(s: StockShortage) -> Self {
        SyncError::InsufficientStock {
            product_id: s.product_id,
            sku: s.sku,
            available: s.available,
            required: s.required,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidConfig(format!("invalid URL: {err}"))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation may succeed when simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    /// Returns true if the remote (or a local rule) rejected the change for
    /// good. Queue entries failing this way turn terminal immediately.
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            SyncError::Conflict(_)
                | SyncError::InsufficientStock { .. }
                | SyncError::Integrity(_)
                | SyncError::Forbidden(_)
                | SyncError::Validation(_)
                | SyncError::Serialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_is_retryable() {
        assert!(SyncError::Network("timeout".into()).is_retryable());

        assert!(!SyncError::Remote("boom".into()).is_retryable());
        assert!(!SyncError::Conflict("dup".into()).is_retryable());
        assert!(!SyncError::TenantUnresolved.is_retryable());
    }

    #[test]
    fn test_business_rejections() {
        let err = SyncError::InsufficientStock {
            product_id: "p1".into(),
            sku: Some("ABC-1".into()),
            available: 1,
            required: 2,
        };
        assert!(err.is_business_rejection());
        assert!(err.to_string().contains("available 1"));
        assert!(!SyncError::Network("x".into()).is_business_rejection());
        assert!(!SyncError::NotFound("sale".into()).is_business_rejection());
    }

    #[test]
    fn test_db_errors_keep_their_meaning() {
        let err: SyncError = DbError::TenantUnresolved.into();
        assert!(matches!(err, SyncError::TenantUnresolved));

        let err: SyncError = DbError::duplicate("product key", "ABC-1").into();
        assert!(matches!(err, SyncError::Conflict(_)));

        let err: SyncError = DbError::not_found("Product", "p1").into();
        assert!(matches!(err, SyncError::NotFound(_)));
    }
}
