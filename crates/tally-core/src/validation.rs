//! # Validation Module
//!
//! Input validation utilities for Tally POS.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Presentation (forms, imports)                                │
//! │  └── Immediate user feedback                                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Coordinators (Rust)                                          │
//! │  └── THIS MODULE: Business rule validation                             │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite / Postgres                                            │
//! │  ├── UNIQUE (store_id, sku), UNIQUE (store_id, external_id)            │
//! │  └── CHECK (stock >= 0)                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::{Product, SaleRequest};
use crate::{MAX_ITEM_QUANTITY, MAX_SALE_LINES};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a SKU (Stock Keeping Unit).
///
/// ## Rules
/// - Must not be empty
/// - At most 50 characters
/// - Only alphanumeric characters, hyphens, underscores
///
/// ```rust
/// use tally_core::validation::validate_sku;
///
/// assert!(validate_sku("ABC-1").is_ok());
/// assert!(validate_sku("").is_err());
/// assert!(validate_sku("has space").is_err());
/// ```
pub fn validate_sku(sku: &str) -> ValidationResult<()> {
    let sku = sku.trim();

    if sku.is_empty() {
        return Err(ValidationError::Required {
            field: "sku".to_string(),
        });
    }

    if sku.len() > 50 {
        return Err(ValidationError::TooLong {
            field: "sku".to_string(),
            max: 50,
        });
    }

    if !sku
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: "sku".to_string(),
            reason: "must contain only letters, numbers, hyphens, and underscores".to_string(),
        });
    }

    Ok(())
}

/// Validates a display name or description (1-200 characters).
pub fn validate_name(field: &str, name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if name.chars().count() > 200 {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 200,
        });
    }

    Ok(())
}

/// Validates an external id (idempotency key) supplied by a caller.
pub fn validate_external_id(external_id: &str) -> ValidationResult<()> {
    let id = external_id.trim();

    if id.is_empty() {
        return Err(ValidationError::Required {
            field: "external_id".to_string(),
        });
    }

    if id.len() > 128 {
        return Err(ValidationError::TooLong {
            field: "external_id".to_string(),
            max: 128,
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a line quantity.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_ITEM_QUANTITY (999)
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

/// Validates a price in cents. Zero is allowed (free items).
///
/// ```rust
/// use tally_core::validation::validate_price_cents;
///
/// assert!(validate_price_cents(1099).is_ok());
/// assert!(validate_price_cents(0).is_ok());
/// assert!(validate_price_cents(-100).is_err());
/// ```
pub fn validate_price_cents(cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: "price".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    Ok(())
}

/// Validates an amount that must be strictly positive (expenses).
pub fn validate_amount_cents(field: &str, cents: i64) -> ValidationResult<()> {
    if cents <= 0 {
        return Err(ValidationError::MustBePositive {
            field: field.to_string(),
        });
    }

    Ok(())
}

/// Validates a counted or opening cash amount (zero allowed).
pub fn validate_cash_count(field: &str, cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    Ok(())
}

// =============================================================================
// Aggregate Validators
// =============================================================================

/// Validates a product before it is written to the cache or pushed.
pub fn validate_product(product: &Product) -> ValidationResult<()> {
    validate_sku(&product.sku)?;
    validate_name("name", &product.name)?;
    validate_price_cents(product.sale_price_cents)?;
    validate_price_cents(product.cost_price_cents)?;
    if product.stock < 0 {
        return Err(ValidationError::OutOfRange {
            field: "stock".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }
    Ok(())
}

/// Validates the shape of a sale request before any lookup happens.
pub fn validate_sale_request(request: &SaleRequest) -> ValidationResult<()> {
    if request.lines.is_empty() {
        return Err(ValidationError::Required {
            field: "lines".to_string(),
        });
    }

    if request.lines.len() > MAX_SALE_LINES {
        return Err(ValidationError::OutOfRange {
            field: "lines".to_string(),
            min: 1,
            max: MAX_SALE_LINES as i64,
        });
    }

    for line in &request.lines {
        validate_quantity(line.quantity)?;
        let has_key = line.sku.as_deref().is_some_and(|s| !s.trim().is_empty())
            || line.product_id.as_deref().is_some_and(|s| !s.trim().is_empty());
        if !has_key {
            return Err(ValidationError::Required {
                field: "product_id or sku".to_string(),
            });
        }
    }

    if let Some(id) = &request.external_id {
        validate_external_id(id)?;
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantId;
    use crate::types::{PaymentMethod, SaleRequestLine};

    #[test]
    fn test_validate_sku() {
        assert!(validate_sku("ABC-1").is_ok());
        assert!(validate_sku("product_1").is_ok());

        assert!(validate_sku("").is_err());
        assert!(validate_sku("   ").is_err());
        assert!(validate_sku("has space").is_err());
        assert!(validate_sku(&"A".repeat(100)).is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(999).is_ok());

        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(-1).is_err());
        assert!(validate_quantity(1000).is_err());
    }

    #[test]
    fn test_validate_product_rejects_negative_stock() {
        let tenant = TenantId::new("store-1").unwrap();
        let mut product = Product::new_local(&tenant, "ABC-1", "Shirt", 3, 500, 900);
        assert!(validate_product(&product).is_ok());

        product.stock = -1;
        assert!(validate_product(&product).is_err());
    }

    #[test]
    fn test_validate_sale_request() {
        let ok = SaleRequest::new(vec![SaleRequestLine::by_sku("ABC-1", 2)], PaymentMethod::Cash);
        assert!(validate_sale_request(&ok).is_ok());

        let empty = SaleRequest::new(vec![], PaymentMethod::Cash);
        assert!(validate_sale_request(&empty).is_err());

        let keyless = SaleRequest::new(
            vec![SaleRequestLine {
                product_id: None,
                sku: Some("  ".to_string()),
                quantity: 1,
            }],
            PaymentMethod::Cash,
        );
        assert!(validate_sale_request(&keyless).is_err());

        let blank_external = ok.with_external_id(" ");
        assert!(validate_sale_request(&blank_external).is_err());
    }
}
