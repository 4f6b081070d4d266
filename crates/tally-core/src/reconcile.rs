//! # Reconciliation Merge
//!
//! Merges an authoritative remote snapshot with the device's cached copy.
//!
//! ## Merge Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  For every entity in REMOTE          ──► keep (stamped Remote)          │
//! │                                                                         │
//! │  For every entity only in LOCAL:                                        │
//! │    same id as a remote entity        ──► skip (remote fields win)       │
//! │    same natural key (SKU) as remote  ──► skip (collapsed duplicate)     │
//! │    provenance == Remote              ──► DROP (deleted upstream)        │
//! │    provenance == Local               ──► keep (not pushed yet)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The function is pure. Fetching the snapshot and replacing the cached
//! collection atomically is the caller's job.

use std::collections::HashSet;

use crate::types::{Expense, Product, Provenance};

// =============================================================================
// Reconcilable
// =============================================================================

/// An entity that can be merged by [`reconcile`].
pub trait Reconcilable: Clone {
    fn entity_id(&self) -> &str;

    /// Secondary business key used to collapse duplicates with different ids.
    fn natural_key(&self) -> Option<&str> {
        None
    }

    fn provenance(&self) -> Provenance;

    fn set_provenance(&mut self, provenance: Provenance);
}

impl Reconcilable for Product {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> Option<&str> {
        Some(self.sku.trim())
    }

    fn provenance(&self) -> Provenance {
        self.provenance
    }

    fn set_provenance(&mut self, provenance: Provenance) {
        self.provenance = provenance;
    }
}

impl Reconcilable for Expense {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn provenance(&self) -> Provenance {
        self.provenance
    }

    fn set_provenance(&mut self, provenance: Provenance) {
        self.provenance = provenance;
    }
}

// =============================================================================
// Merge
// =============================================================================

/// Result of a merge, with the ids that took each non-trivial path.
#[derive(Debug, Clone)]
pub struct MergeOutcome<T> {
    /// The new collection: remote entities first, then kept local ones.
    pub merged: Vec<T>,
    /// Local entities dropped because they were deleted upstream.
    pub dropped_upstream: Vec<String>,
    /// Local-only entities kept because they were never pushed.
    pub kept_local: Vec<String>,
    /// Local ids replaced by a remote entity with the same natural key.
    pub collapsed_duplicates: Vec<String>,
}

impl<T> MergeOutcome<T> {
    pub fn is_noop_for_local(&self) -> bool {
        self.dropped_upstream.is_empty() && self.collapsed_duplicates.is_empty()
    }
}

/// Merges `remote` (authoritative) with `local` (cached).
///
/// ```rust
/// use tally_core::{reconcile, Product, Provenance, TenantId};
///
/// let store = TenantId::new("store-1").unwrap();
/// let mut remote = Product::new_local(&store, "ABC-1", "Remote shirt", 4, 100, 200);
/// remote.provenance = Provenance::Remote;
/// let local = Product::new_local(&store, "ABC-1", "Local shirt", 9, 100, 200);
///
/// let outcome = reconcile(vec![remote.clone()], vec![local]);
/// assert_eq!(outcome.merged.len(), 1);
/// assert_eq!(outcome.merged[0].name, "Remote shirt");
/// ```
pub fn reconcile<T: Reconcilable>(remote: Vec<T>, local: Vec<T>) -> MergeOutcome<T> {
    let mut merged: Vec<T> = Vec::with_capacity(remote.len() + local.len());
    let mut remote_ids: HashSet<String> = HashSet::new();
    let mut remote_keys: HashSet<String> = HashSet::new();

    for mut entity in remote {
        // The remote schema keeps both keys unique; guard against a bad
        // snapshot anyway so the cache never holds two rows for one SKU.
        if remote_ids.contains(entity.entity_id()) {
            continue;
        }
        if let Some(key) = entity.natural_key() {
            if !remote_keys.insert(key.to_string()) {
                continue;
            }
        }
        remote_ids.insert(entity.entity_id().to_string());
        entity.set_provenance(Provenance::Remote);
        merged.push(entity);
    }

    let mut dropped_upstream = Vec::new();
    let mut kept_local = Vec::new();
    let mut collapsed_duplicates = Vec::new();

    for entity in local {
        if remote_ids.contains(entity.entity_id()) {
            continue;
        }
        if entity
            .natural_key()
            .is_some_and(|key| remote_keys.contains(key))
        {
            collapsed_duplicates.push(entity.entity_id().to_string());
            continue;
        }
        match entity.provenance() {
            Provenance::Remote => dropped_upstream.push(entity.entity_id().to_string()),
            Provenance::Local => {
                kept_local.push(entity.entity_id().to_string());
                merged.push(entity);
            }
        }
    }

    MergeOutcome {
        merged,
        dropped_upstream,
        kept_local,
        collapsed_duplicates,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
