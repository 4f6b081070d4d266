//! Integration tests for the local cache store: durability, the document
//! upgrade pass and the stock ledger.

use chrono::Utc;
use std::path::PathBuf;
use tally_core::{MovementReason, Product, Provenance, SyncEntity, SyncState, TenantId};
use tally_db::{Database, DbConfig, DbError, CURRENT_DOC_VERSION};

fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("tally-test-{}.db", uuid::Uuid::new_v4()))
}

fn cleanup(path: &PathBuf) {
    for suffix in ["", "-wal", "-shm"] {
        let mut p = path.clone().into_os_string();
        p.push(suffix);
        let _ = std::fs::remove_file(p);
    }
}

#[tokio::test]
async fn test_writes_survive_restart() {
    let path = temp_db_path();
    let product = Product::new_local(&tenant("s1"), "ABC-1", "Shirt", 5, 100, 200);

    {
        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let store = db.cache(tenant("s1").into());
        store.put(&product).await.unwrap();

        let mut writer = store.begin_write().await.unwrap();
        writer
            .apply_stock_delta(&product.id, -2, MovementReason::Sale, Some("sale-1"))
            .await
            .unwrap();
        writer
            .enqueue(SyncEntity::Sale, "sale-1", &serde_json::json!({}))
            .await
            .unwrap();
        writer.commit().await.unwrap();
        db.close().await;
    }

    let db = Database::new(DbConfig::new(&path)).await.unwrap();
    let store = db.cache(tenant("s1").into());
    let reloaded: Product = store.get_by_id(&product.id).await.unwrap().unwrap();
    assert_eq!(reloaded.stock, 3);
    assert_eq!(store.movements(&product.id).await.unwrap().len(), 1);
    assert_eq!(store.pending_sync_count().await.unwrap(), 1);
    db.close().await;

    cleanup(&path);
}

#[tokio::test]
async fn test_legacy_documents_upgraded_on_open() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let legacy = serde_json::json!({
        "id": "legacy-1",
        "store_id": "s1",
        "sku": "OLD-1",
        "name": "Old Shirt",
        "stock": 2,
        "cost_price": 3.25,
        "sale_price": 7.5,
        "color": "blue"
    });
    sqlx::query(
        r#"
        INSERT INTO cache_documents (store_id, collection, id, natural_key, body, updated_at)
        VALUES ('s1', 'product', 'legacy-1', NULL, ?1, ?2)
        "#,
    )
    .bind(legacy.to_string())
    .bind(Utc::now())
    .execute(db.pool())
    .await
    .unwrap();

    db.run_migrations().await.unwrap();

    let store = db.cache(tenant("s1").into());
    let product = store.find_product_by_sku("OLD-1").await.unwrap().unwrap();
    assert_eq!(product.cost_price_cents, 325);
    assert_eq!(product.sale_price_cents, 750);
    assert_eq!(product.attributes.color.as_deref(), Some("blue"));
    assert_eq!(product.provenance, Provenance::Local);
    assert!(product.active);

    let version: i64 =
        sqlx::query_scalar("SELECT doc_version FROM cache_documents WHERE id = 'legacy-1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!(version, CURRENT_DOC_VERSION);

    // a second pass has nothing to do
    assert_eq!(tally_db::upgrade::upgrade_documents(db.pool()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_stock_conservation_over_ledger() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let store = db.cache(tenant("s1").into());
    let product = Product::new_local(&tenant("s1"), "ABC-1", "Shirt", 4, 100, 200);
    store.put(&product).await.unwrap();

    let deltas = [
        (-3, MovementReason::Sale),
        (2, MovementReason::Cancellation),
        (-5, MovementReason::Sale),
        (10, MovementReason::Restock),
    ];
    for (delta, reason) in deltas {
        let mut writer = store.begin_write().await.unwrap();
        writer
            .apply_stock_delta(&product.id, delta, reason, None)
            .await
            .unwrap();
        writer.commit().await.unwrap();
    }

    let current: Product = store.get_by_id(&product.id).await.unwrap().unwrap();
    let movements = store.movements(&product.id).await.unwrap();
    let net: i64 = movements.iter().map(|m| m.delta).sum();

    assert!(current.stock >= 0);
    assert_eq!(current.stock, 10);
    assert_eq!(product.stock + net, current.stock);
    for pair in movements.windows(2) {
        assert_eq!(pair[0].new_stock, pair[1].previous_stock);
    }
}

#[tokio::test]
async fn test_failure_bookkeeping_turns_terminal() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let store = db.cache(tenant("s1").into());

    let mut writer = store.begin_write().await.unwrap();
    let id = writer
        .enqueue(SyncEntity::Expense, "exp-1", &serde_json::json!({}))
        .await
        .unwrap();
    writer.commit().await.unwrap();

    for expected in 1..=3 {
        let entry = db.sync_queue().get(id).await.unwrap().unwrap();
        let mut writer = store.begin_write().await.unwrap();
        let (state, attempts) = writer
            .record_entry_failure(&entry, "offline", 3, false)
            .await
            .unwrap();
        writer.commit().await.unwrap();
        assert_eq!(attempts, expected);
        let want = if expected < 3 { SyncState::Pending } else { SyncState::Failed };
        assert_eq!(state, want);
    }

    let status = store
        .sync_status(SyncEntity::Expense, "exp-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, SyncState::Failed);
    assert!(db.sync_queue().pending("s1", 10).await.unwrap().is_empty());

    let mut writer = store.begin_write().await.unwrap();
    assert!(writer.retry_failed(id).await.unwrap());
    writer.commit().await.unwrap();
    let entry = db.sync_queue().get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, SyncState::Pending);
    assert_eq!(entry.attempts, 3);
}

#[tokio::test]
async fn test_unknown_product_is_not_found() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let store = db.cache(tenant("s1").into());
    let mut writer = store.begin_write().await.unwrap();
    let err = writer
        .apply_stock_delta("missing", -1, MovementReason::Sale, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NotFound { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writer_holds_the_file_lock_from_the_start() {
    let path = temp_db_path();
    // Two handles stand in for two processes: separate writer registries,
    // one SQLite file.
    let first = Database::new(DbConfig::new(&path)).await.unwrap();
    let second = Database::new(DbConfig::new(&path)).await.unwrap();
    let product = Product::new_local(&tenant("s1"), "ABC-1", "Shirt", 5, 100, 200);
    first.cache(tenant("s1").into()).put(&product).await.unwrap();

    let mut writer = first.cache(tenant("s1").into()).begin_write().await.unwrap();
    let read: Product = writer.get_by_id(&product.id).await.unwrap().unwrap();
    assert_eq!(read.stock, 5);

    let other = second.clone();
    let contender = tokio::spawn(async move {
        let store = other.cache(tenant("s1").into());
        let mut w = store.begin_write().await?;
        w.enqueue(SyncEntity::Product, "p-other", &serde_json::json!({}))
            .await?;
        w.commit().await
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!contender.is_finished());

    // Without the lock taken at BEGIN this write would hit SQLITE_BUSY_SNAPSHOT.
    writer
        .apply_stock_delta(&product.id, -1, MovementReason::Adjustment, None)
        .await
        .unwrap();
    writer.commit().await.unwrap();
    contender.await.unwrap().unwrap();

    let reloaded: Product = second
        .cache(tenant("s1").into())
        .get_by_id(&product.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.stock, 4);
    assert_eq!(second.sync_queue().count("s1", SyncState::Pending).await.unwrap(), 1);

    first.close().await;
    second.close().await;
    cleanup(&path);
}
