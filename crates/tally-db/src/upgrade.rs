//! # Document Upgrades
//!
//! Rewrites cached JSON bodies written by older builds to the current layout.
//! Runs once at open, right after the DDL migrations; nothing else in the
//! crate looks at `doc_version`.
//!
//! ## v1 → v2
//! ```text
//! ┌──────────────┬────────────────────────────────┬──────────────────────────┐
//! │ collection   │ v1                             │ v2                       │
//! ├──────────────┼────────────────────────────────┼──────────────────────────┤
//! │ product      │ cost_price / sale_price (f64)  │ *_cents (i64)            │
//! │              │ color / size / model (flat)    │ attributes { .. }        │
//! │              │ (no provenance)                │ provenance (inferred)    │
//! │              │ (maybe no updated_at / active) │ now / true               │
//! │ expense      │ amount (f64), no provenance    │ amount_cents, provenance │
//! │ sale         │ total, items[].price (f64)     │ total_cents, unit_price_ │
//! │              │ (maybe no status)              │ cents, finalized         │
//! │ others       │ unchanged                      │ version bump             │
//! └──────────────┴────────────────────────────────┴──────────────────────────┘
//! ```
//!
//! ## Provenance Inference
//! v1 rows did not record where they came from. Ids minted by the remote are
//! UUIDs while the old device code used ad-hoc ids, so a UUID-shaped id is
//! taken as `remote` and anything else as `local`. This is the only place
//! that heuristic exists.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tally_core::{Money, Provenance};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{open_session_key, CURRENT_DOC_VERSION};
use crate::error::{DbError, DbResult};

#[derive(sqlx::FromRow)]
struct StaleDocument {
    store_id: String,
    collection: String,
    id: String,
    body: String,
    doc_version: i64,
}

/// Upgrades every document below [`CURRENT_DOC_VERSION`].
///
/// All rewrites happen in one transaction. Returns how many rows changed.
pub async fn upgrade_documents(pool: &SqlitePool) -> DbResult<usize> {
    let mut tx = pool
        .begin_with("BEGIN IMMEDIATE")
        .await
        .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

    let stale = sqlx::query_as::<_, StaleDocument>(
        r#"
        SELECT store_id, collection, id, body, doc_version
        FROM cache_documents
        WHERE doc_version < ?1
        ORDER BY store_id, collection, id
        "#,
    )
    .bind(CURRENT_DOC_VERSION)
    .fetch_all(&mut *tx)
    .await?;

    if stale.is_empty() {
        return Ok(0);
    }

    info!(documents = stale.len(), to_version = CURRENT_DOC_VERSION, "Upgrading cached documents");

    for doc in &stale {
        let mut body: Value = serde_json::from_str(&doc.body)?;
        if doc.doc_version < 2 {
            upgrade_v1_to_v2(&doc.collection, &doc.id, &mut body);
        }
        let natural_key = natural_key_of(&doc.collection, &body);
        let body = serde_json::to_string(&body)?;

        let updated = sqlx::query(
            r#"
            UPDATE cache_documents
            SET body = ?4, natural_key = ?5, doc_version = ?6, updated_at = ?7
            WHERE store_id = ?1 AND collection = ?2 AND id = ?3
            "#,
        )
        .bind(&doc.store_id)
        .bind(&doc.collection)
        .bind(&doc.id)
        .bind(&body)
        .bind(natural_key.as_deref())
        .bind(CURRENT_DOC_VERSION)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        match updated.map_err(DbError::from) {
            Ok(_) => {}
            Err(DbError::UniqueViolation { .. }) => {
                // Two legacy rows claim the same business key. Keep both,
                // unindexed; the next reconciliation collapses them.
                warn!(
                    store_id = %doc.store_id,
                    collection = %doc.collection,
                    id = %doc.id,
                    "Duplicate business key in legacy document; left unindexed"
                );
                sqlx::query(
                    r#"
                    UPDATE cache_documents
                    SET body = ?4, natural_key = NULL, doc_version = ?5, updated_at = ?6
                    WHERE store_id = ?1 AND collection = ?2 AND id = ?3
                    "#,
                )
                .bind(&doc.store_id)
                .bind(&doc.collection)
                .bind(&doc.id)
                .bind(&body)
                .bind(CURRENT_DOC_VERSION)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            }
            Err(e) => return Err(e),
        }
        debug!(collection = %doc.collection, id = %doc.id, "Document upgraded");
    }

    tx.commit()
        .await
        .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

    Ok(stale.len())
}

// =============================================================================
// v1 → v2
// =============================================================================

fn upgrade_v1_to_v2(collection: &str, id: &str, body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    match collection {
        "product" => {
            decimal_to_cents(obj, "cost_price", "cost_price_cents");
            decimal_to_cents(obj, "sale_price", "sale_price_cents");

            let mut attributes = Map::new();
            for key in ["color", "size", "model"] {
                if let Some(v) = obj.remove(key) {
                    attributes.insert(key.to_string(), v);
                }
            }
            obj.entry("attributes")
                .or_insert_with(|| Value::Object(attributes));

            obj.entry("stock").or_insert(Value::from(0));
            obj.entry("active").or_insert(Value::Bool(true));
            obj.entry("updated_at")
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
            infer_provenance(obj, id);
        }
        "expense" => {
            decimal_to_cents(obj, "amount", "amount_cents");
            infer_provenance(obj, id);
        }
        "sale" => {
            decimal_to_cents(obj, "total", "total_cents");
            if let Some(items) = obj.get_mut("items").and_then(Value::as_array_mut) {
                for item in items.iter_mut().filter_map(Value::as_object_mut) {
                    decimal_to_cents(item, "price", "unit_price_cents");
                }
            }
            obj.entry("status")
                .or_insert_with(|| Value::String("finalized".to_string()));
        }
        _ => {}
    }
}

/// Moves a legacy float amount to integer cents, unless the cents field is
/// already present.
fn decimal_to_cents(obj: &mut Map<String, Value>, legacy: &str, cents: &str) {
    let Some(old) = obj.remove(legacy) else {
        return;
    };
    if obj.contains_key(cents) {
        return;
    }
    let value = old.as_f64().unwrap_or_default();
    obj.insert(
        cents.to_string(),
        Value::from(Money::from_legacy_decimal(value).cents()),
    );
}

fn infer_provenance(obj: &mut Map<String, Value>, id: &str) {
    if obj.contains_key("provenance") {
        return;
    }
    let inferred = if Uuid::parse_str(id).is_ok() {
        Provenance::Remote
    } else {
        Provenance::Local
    };
    if let Ok(v) = serde_json::to_value(inferred) {
        obj.insert("provenance".to_string(), v);
    }
}

/// The natural key a document of `collection` carries, read from its body.
fn natural_key_of(collection: &str, body: &Value) -> Option<String> {
    let field = |name: &str| body.get(name).and_then(Value::as_str);
    match collection {
        "product" => field("sku").map(|s| s.trim().to_string()),
        "sale" => field("external_id").map(str::to_string),
        "cash_closure" => field("cash_session_id").map(str::to_string),
        "cash_session" => match field("status") {
            Some("open") => field("device_id").map(open_session_key),
            _ => None,
        },
        _ => None,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
