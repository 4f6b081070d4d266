//! End-to-end tests of the consistency core against the in-memory remote:
//! idempotent sales, stock conservation, catalog reconciliation and queue
//! retry behavior.

use std::sync::Arc;
use tally_core::{
    Confirmation, MovementReason, PaymentMethod, Product, Provenance, Role, SaleRequest,
    SaleRequestLine, SyncState, TenantId,
};
use tally_db::{Database, DbConfig};
use tally_sync::{CancelResult, CoreConfig, MemoryRemote, PosCore, SaleResult, SyncError};

const STORE: &str = "store-1";

fn store() -> TenantId {
    TenantId::new(STORE).unwrap()
}

fn config(store_id: &str) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.device.id = "device-1".into();
    config.tenant.store_id = Some(store_id.into());
    config.queue.initial_backoff_ms = 0;
    config.queue.max_attempts = 3;
    config
}

async fn core_with(remote: &MemoryRemote, db: Database, store_id: &str) -> PosCore {
    PosCore::new(config(store_id), db, Arc::new(remote.clone()))
}

async fn core(remote: &MemoryRemote) -> PosCore {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    core_with(remote, db, STORE).await
}

/// Seeds a remote product and pulls it into the cache.
async fn stocked(remote: &MemoryRemote, core: &PosCore, sku: &str, stock: i64) -> Product {
    let product = Product::new_local(&store(), sku, sku, stock, 100, 250);
    remote.seed_product(product.clone());
    core.pull_catalog().await.unwrap();
    product
}

async fn local_stock(core: &PosCore, sku: &str) -> i64 {
    core.find_product_by_sku(sku).await.unwrap().unwrap().stock
}

fn remote_stock(remote: &MemoryRemote, product: &Product) -> i64 {
    remote.product(STORE, &product.id).unwrap().stock
}

fn sell(sku: &str, quantity: i64, external_id: &str) -> SaleRequest {
    SaleRequest::new(vec![SaleRequestLine::by_sku(sku, quantity)], PaymentMethod::Cash)
        .with_external_id(external_id)
}

// =============================================================================
// Sales
// =============================================================================

#[tokio::test]
async fn test_repeated_sale_applies_once() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let product = stocked(&remote, &core, "A", 5).await;

    let first = core.create_sale(sell("A", 2, "e1")).await.unwrap();
    let second = core.create_sale(sell("A", 2, "e1")).await.unwrap();

    let SaleResult::Confirmed { sale: first, replay: false } = first else {
        panic!("expected a fresh confirmation");
    };
    let SaleResult::Confirmed { sale: second, replay: true } = second else {
        panic!("expected a replay");
    };
    assert_eq!(first.id, second.id);
    assert_eq!(local_stock(&core, "A").await, 3);
    assert_eq!(remote_stock(&remote, &product), 3);
    assert_eq!(remote.sales(STORE).len(), 1);
}

#[tokio::test]
async fn test_shortage_leaves_stock_untouched() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let product = stocked(&remote, &core, "A", 1).await;

    let result = core.create_sale(sell("A", 2, "e2")).await.unwrap();

    let SaleResult::InsufficientStock(shortage) = result else {
        panic!("expected a shortage");
    };
    assert_eq!(shortage.product_id, product.id);
    assert_eq!(shortage.available, 1);
    assert_eq!(shortage.required, 2);
    assert_eq!(local_stock(&core, "A").await, 1);
    assert_eq!(remote_stock(&remote, &product), 1);
    assert!(remote.sales(STORE).is_empty());
}

#[tokio::test]
async fn test_lost_response_converges_without_double_count() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let product = stocked(&remote, &core, "A", 5).await;

    // The remote commits the sale but the device only sees a timeout.
    remote.lose_next_responses(1);
    let first = core.create_sale(sell("A", 2, "e3")).await.unwrap();
    assert!(matches!(first, SaleResult::Queued { entry_id: Some(_), .. }));

    let retry = core.create_sale(sell("A", 2, "e3")).await.unwrap();
    assert!(matches!(retry, SaleResult::Queued { entry_id: None, .. }));
    assert_eq!(local_stock(&core, "A").await, 3);

    let report = core.push_pending().await.unwrap();
    assert_eq!(report.synced, 1);

    let replay = core.create_sale(sell("A", 2, "e3")).await.unwrap();
    assert!(matches!(replay, SaleResult::Confirmed { replay: true, .. }));
    assert_eq!(replay.sale().unwrap().id, first.sale().unwrap().id);
    assert_eq!(local_stock(&core, "A").await, 3);
    assert_eq!(remote_stock(&remote, &product), 3);
    assert_eq!(remote.sales(STORE).len(), 1);
}

#[tokio::test]
async fn test_lost_response_with_stale_cache_is_not_a_rejection() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let mut product = stocked(&remote, &core, "A", 1).await;
    // Restocked elsewhere; this device has not pulled yet.
    product.stock = 5;
    remote.seed_product(product.clone());

    remote.lose_next_responses(1);
    let err = core.create_sale(sell("A", 2, "e-stale")).await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(remote.sales(STORE).len(), 1);
    assert_eq!(remote_stock(&remote, &product), 3);
    assert_eq!(core.sync_overview().await.unwrap().pending, 0);

    let retry = core.create_sale(sell("A", 2, "e-stale")).await.unwrap();
    assert!(matches!(retry, SaleResult::Confirmed { replay: true, .. }));
    assert_eq!(remote.sales(STORE).len(), 1);

    core.pull_catalog().await.unwrap();
    assert_eq!(local_stock(&core, "A").await, 3);
    assert_eq!(remote_stock(&remote, &product), 3);
}

#[tokio::test]
async fn test_synchronous_retry_after_lost_response() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let product = stocked(&remote, &core, "A", 5).await;
    let request = sell("A", 1, "e4").with_confirmation(Confirmation::Synchronous);

    remote.lose_next_responses(1);
    let err = core.create_sale(request.clone()).await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
    assert_eq!(local_stock(&core, "A").await, 5);

    let result = core.create_sale(request).await.unwrap();

    assert!(matches!(result, SaleResult::Confirmed { replay: true, .. }));
    assert_eq!(local_stock(&core, "A").await, 4);
    assert_eq!(remote_stock(&remote, &product), 4);
}

#[tokio::test]
async fn test_stock_conservation_across_cancel_and_offline_sale() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let product = stocked(&remote, &core, "A", 10).await;

    let confirmed = core.create_sale(sell("A", 3, "s1")).await.unwrap();
    let sale_id = confirmed.sale().unwrap().id.clone();
    let cancelled = core.cancel_sale(&sale_id, Role::Manager).await.unwrap();
    assert!(matches!(cancelled, CancelResult::Cancelled(_)));
    let again = core.cancel_sale(&sale_id, Role::Manager).await.unwrap();
    assert!(matches!(again, CancelResult::AlreadyCancelled(_)));

    remote.set_offline(true);
    let offline = core.create_sale(sell("A", 2, "s2")).await.unwrap();
    assert!(matches!(offline, SaleResult::Queued { .. }));
    remote.set_offline(false);

    // initial - sold + restored
    assert_eq!(local_stock(&core, "A").await, 10 - 3 - 2 + 3);
    let net: i64 = core
        .database()
        .cache(store().into())
        .movements(&product.id)
        .await
        .unwrap()
        .iter()
        .map(|m| m.delta)
        .sum();
    assert_eq!(net, -2);

    core.push_pending().await.unwrap();
    assert_eq!(remote_stock(&remote, &product), 8);
}

#[tokio::test]
async fn test_concurrent_sales_never_oversell() {
    let remote = MemoryRemote::new();
    let core = Arc::new(core(&remote).await);
    let product = stocked(&remote, &core, "A", 5).await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let core = core.clone();
        tasks.push(tokio::spawn(async move {
            core.create_sale(sell("A", 1, &format!("c{i}"))).await
        }));
    }

    let mut confirmed = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            SaleResult::Confirmed { .. } => confirmed += 1,
            SaleResult::InsufficientStock(_) => rejected += 1,
            other => panic!("unexpected {other:?}"),
        }
    }

    assert_eq!(confirmed, 5);
    assert_eq!(rejected, 5);
    assert_eq!(local_stock(&core, "A").await, 0);
    assert_eq!(remote_stock(&remote, &product), 0);
}

#[tokio::test]
async fn test_restock_reaches_remote_once() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let product = stocked(&remote, &core, "A", 2).await;

    core.record_restock(&product.id, 5).await.unwrap();
    core.adjust_stock(&product.id, -1, MovementReason::Adjustment)
        .await
        .unwrap();
    core.push_pending().await.unwrap();
    core.push_pending().await.unwrap();

    assert_eq!(local_stock(&core, "A").await, 6);
    assert_eq!(remote_stock(&remote, &product), 6);
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn test_pull_honours_upstream_deletes_and_keeps_local() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let p1 = stocked(&remote, &core, "P1", 4).await;
    let p2 = core
        .save_product(Product::new_local(&store(), "P2", "Local only", 1, 10, 20))
        .await
        .unwrap();

    remote.remove_product(STORE, &p1.id);
    let report = core.pull_catalog().await.unwrap();

    assert_eq!(report.dropped_upstream, vec![p1.id.clone()]);
    assert_eq!(report.kept_local, vec![p2.id.clone()]);
    let products = core.list_products().await.unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].id, p2.id);
    assert_eq!(products[0].provenance, Provenance::Local);
}

#[tokio::test]
async fn test_pull_collapses_same_sku() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let local = core
        .save_product(Product::new_local(&store(), "ABC-1", "Local name", 1, 10, 20))
        .await
        .unwrap();
    let upstream = Product::new_local(&store(), "ABC-1", "Remote name", 9, 10, 30);
    remote.seed_product(upstream.clone());

    let report = core.pull_catalog().await.unwrap();

    assert_eq!(report.collapsed, vec![local.id.clone()]);
    let products = core.list_products().await.unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].id, upstream.id);
    assert_eq!(products[0].name, "Remote name");
    assert_eq!(products[0].stock, 9);
}

#[tokio::test]
async fn test_pull_between_offline_sale_and_push_keeps_stock() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let product = stocked(&remote, &core, "A", 5).await;

    remote.set_offline(true);
    let sale = core.create_sale(sell("A", 2, "o1")).await.unwrap();
    assert!(matches!(sale, SaleResult::Queued { .. }));
    remote.set_offline(false);
    assert_eq!(local_stock(&core, "A").await, 3);

    let report = core.pull_catalog().await.unwrap();
    assert_eq!(report.replayed, vec![product.id.clone()]);
    assert_eq!(local_stock(&core, "A").await, 3);

    let pushed = core.push_pending().await.unwrap();
    assert_eq!(pushed.synced, 1);
    assert_eq!(local_stock(&core, "A").await, 3);
    assert_eq!(remote_stock(&remote, &product), 3);

    let report = core.pull_catalog().await.unwrap();
    assert!(report.replayed.is_empty());
    assert_eq!(local_stock(&core, "A").await, 3);
}

#[tokio::test]
async fn test_pull_replays_queued_cancellation() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let product = stocked(&remote, &core, "A", 5).await;
    let sale = core.create_sale(sell("A", 2, "k1")).await.unwrap();
    let sale_id = sale.sale().unwrap().id.clone();

    remote.set_offline(true);
    let cancelled = core.cancel_sale(&sale_id, Role::Manager).await.unwrap();
    assert!(matches!(cancelled, CancelResult::Queued { .. }));
    remote.set_offline(false);
    assert_eq!(local_stock(&core, "A").await, 5);

    core.pull_catalog().await.unwrap();
    assert_eq!(remote_stock(&remote, &product), 3);
    assert_eq!(local_stock(&core, "A").await, 5);

    core.push_pending().await.unwrap();
    assert_eq!(remote_stock(&remote, &product), 5);
    assert_eq!(local_stock(&core, "A").await, 5);
}

#[tokio::test]
async fn test_pushed_product_survives_upstream_pull() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let product = core
        .save_product(Product::new_local(&store(), "NEW-1", "New", 3, 10, 20))
        .await
        .unwrap();

    core.push_pending().await.unwrap();
    core.pull_catalog().await.unwrap();

    let cached = core.find_product_by_sku("NEW-1").await.unwrap().unwrap();
    assert_eq!(cached.id, product.id);
    assert_eq!(cached.provenance, Provenance::Remote);
}

// =============================================================================
// Queue
// =============================================================================

#[tokio::test]
async fn test_entry_turns_terminal_after_max_attempts() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    core.save_product(Product::new_local(&store(), "A", "A", 1, 1, 2))
        .await
        .unwrap();

    remote.set_offline(true);
    let first = core.push_pending().await.unwrap();
    let second = core.push_pending().await.unwrap();
    let third = core.push_pending().await.unwrap();
    assert_eq!((first.retried, second.retried, third.failed), (1, 1, 1));

    let calls = remote.call_count();
    let fourth = core.push_pending().await.unwrap();
    assert_eq!(fourth.synced + fourth.retried + fourth.failed, 0);
    assert_eq!(remote.call_count(), calls);

    let failed = core.queue().entries(Some(SyncState::Failed)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 3);

    // Manual retry gets one more attempt once the remote is back.
    remote.set_offline(false);
    assert!(core.queue().retry_failed(failed[0].id).await.unwrap());
    let report = core.push_pending().await.unwrap();
    assert_eq!(report.synced, 1);
}

#[tokio::test]
async fn test_cancel_of_queued_sale_waits_for_the_sale() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    let product = stocked(&remote, &core, "A", 5).await;

    remote.set_offline(true);
    let sale = core.create_sale(sell("A", 2, "q1")).await.unwrap();
    let sale_id = sale.sale().unwrap().id.clone();
    let cancelled = core.cancel_sale(&sale_id, Role::Manager).await.unwrap();
    assert!(matches!(cancelled, CancelResult::Queued { .. }));
    remote.set_offline(false);
    assert_eq!(local_stock(&core, "A").await, 5);

    // The sale push fails; the cancellation behind it finds no remote sale.
    remote.fail_next(1);
    let first = core.push_pending().await.unwrap();
    assert_eq!((first.synced, first.retried, first.failed), (0, 2, 0));
    assert!(remote.sales(STORE).is_empty());
    assert_eq!(remote_stock(&remote, &product), 5);

    let second = core.push_pending().await.unwrap();
    assert_eq!((second.synced, second.failed), (2, 0));

    let sales = remote.sales(STORE);
    assert_eq!(sales.len(), 1);
    assert!(sales[0].is_cancelled());
    assert_eq!(remote_stock(&remote, &product), 5);
    assert_eq!(local_stock(&core, "A").await, 5);
    assert_eq!(core.sync_overview().await.unwrap().pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drain_and_sale_share_a_file_database() {
    let path = std::env::temp_dir().join(format!("tally-sync-{}.db", uuid::Uuid::new_v4()));
    let remote = MemoryRemote::new();
    let db = Database::new(DbConfig::new(&path)).await.unwrap();
    let core = Arc::new(core_with(&remote, db.clone(), STORE).await);
    let product = stocked(&remote, &core, "A", 5).await;
    core.record_restock(&product.id, 1).await.unwrap();

    let mut writer = db.cache(store().into()).begin_write().await.unwrap();
    let cached: Product = writer.get_by_id(&product.id).await.unwrap().unwrap();
    assert_eq!(cached.stock, 6);

    let drainer = core.clone();
    let drain = tokio::spawn(async move { drainer.push_pending().await });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!drain.is_finished());

    writer
        .apply_stock_delta(&product.id, -1, MovementReason::Adjustment, None)
        .await
        .unwrap();
    writer.commit().await.unwrap();

    let report = drain.await.unwrap().unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(remote_stock(&remote, &product), 6);
    assert_eq!(local_stock(&core, "A").await, 5);

    db.close().await;
    for suffix in ["", "-wal", "-shm"] {
        let mut file = path.clone().into_os_string();
        file.push(suffix);
        let _ = std::fs::remove_file(file);
    }
}

#[tokio::test]
async fn test_tenants_do_not_see_each_other() {
    let remote = MemoryRemote::new();
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let one = core_with(&remote, db.clone(), "store-1").await;
    let two = core_with(&remote, db, "store-2").await;

    one.save_product(Product::new_local(&store(), "A", "A", 1, 1, 2))
        .await
        .unwrap();

    assert!(two.list_products().await.unwrap().is_empty());
    assert!(two.find_product_by_sku("A").await.unwrap().is_none());
    let report = two.push_pending().await.unwrap();
    assert_eq!(report.synced, 0);
    assert_eq!(two.sync_overview().await.unwrap().pending, 0);
    assert_eq!(one.sync_overview().await.unwrap().pending, 1);
}

// =============================================================================
// Cash
// =============================================================================

#[tokio::test]
async fn test_cash_day_closes_and_pushes() {
    let remote = MemoryRemote::new();
    let core = core(&remote).await;
    stocked(&remote, &core, "A", 10).await;

    let session = core.cash().open_session("Ana", 10_000).await.unwrap();
    let sale = core.create_sale(sell("A", 2, "cash-1")).await.unwrap();
    assert_eq!(sale.sale().unwrap().cash_session_id.as_deref(), Some(session.id.as_str()));
    core.cash()
        .record_expense("Cleaning", Some("supplies".into()), 1_500)
        .await
        .unwrap();

    // opening 10_000 + cash sales 500 - expenses 1_500
    let closure = core.cash().close_session("Ana", 9_000).await.unwrap();
    assert_eq!(closure.expected_cents, 9_000);
    assert_eq!(closure.difference_cents, 0);

    let report = core.push_pending().await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(remote.cash_closures(STORE).len(), 1);
    assert_eq!(remote.expenses(STORE).len(), 1);
    let sessions = remote.cash_sessions(STORE);
    assert_eq!(sessions.len(), 1);
    assert!(!sessions[0].is_open());
}
