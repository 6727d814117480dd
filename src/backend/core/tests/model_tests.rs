//! Model lifecycle tests against a counting store.

mod common;

use common::*;
use modelsync_core::db::Database;
use modelsync_core::error::{ErrorCode, SyncError};
use modelsync_core::events::{ChangeEvent, EventBus};
use modelsync_core::messenger::Connection;
use modelsync_core::model::{HookContext, Hooks, Identifier, Model, ModelCache, ModelState, Selector};
use serde_json::json;
use std::sync::Arc;

fn cached_model(
    db: &Arc<CountingDatabase>,
    bus: &Arc<EventBus<ChangeEvent>>,
    cache: &Arc<ModelCache>,
    selector: Selector,
) -> Arc<Model> {
    let database: Arc<dyn Database> = db.clone();
    let model = Arc::new(Model::new("task", database, Hooks::default()));
    model.attach(Arc::clone(bus), Some(cache));
    model.assign_selector(selector.clone()).unwrap();
    let (model, inserted) = cache.get_or_insert(Identifier::new("task", &selector), model);
    assert!(inserted);
    model.ensure_listening();
    model
}

fn fixture() -> (Arc<CountingDatabase>, Arc<EventBus<ChangeEvent>>, Arc<ModelCache>) {
    (
        Arc::new(CountingDatabase::new(task_store())),
        Arc::new(EventBus::new()),
        Arc::new(ModelCache::new()),
    )
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn test_concurrent_reads_share_one_query() {
    let (db, bus, cache) = fixture();
    let selector = Selector::ById(json!(7));
    let model = cached_model(&db, &bus, &cache, selector.clone());

    db.hold_reads();
    let first = {
        let (model, selector) = (Arc::clone(&model), selector.clone());
        tokio::spawn(async move { model.read(&selector).await })
    };
    db.wait_for_reads(1).await;
    let second = {
        let (model, selector) = (Arc::clone(&model), selector.clone());
        tokio::spawn(async move { model.read(&selector).await })
    };
    tokio::time::sleep(QUIET_PERIOD).await;
    db.open_reads();

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert_eq!(a, b);
    assert_eq!(a["title"], "ship release");
    assert_eq!(db.reads(), 1);
    assert_eq!(model.state(), ModelState::Populated);
}

#[tokio::test]
async fn test_read_racing_a_write_returns_written_value() {
    let (db, bus, cache) = fixture();
    let selector = Selector::ById(json!(7));
    let model = cached_model(&db, &bus, &cache, selector.clone());

    db.hold_reads();
    let read = {
        let (model, selector) = (Arc::clone(&model), selector.clone());
        tokio::spawn(async move { model.read(&selector).await })
    };
    db.wait_for_reads(1).await;

    let written = model
        .write(json!({"title": "renamed"}), None)
        .await
        .unwrap();
    assert_eq!(written["title"], "renamed");

    db.open_reads();
    let value = read.await.unwrap().unwrap();
    assert_eq!(value["title"], "renamed");
    assert_eq!(model.value().unwrap()["title"], "renamed");
}

#[tokio::test]
async fn test_failed_query_reaches_every_waiter() {
    let (db, bus, cache) = fixture();
    let database: Arc<dyn Database> = db.clone();
    // No `note` table in the store
    let model = Arc::new(Model::new("note", database, Hooks::default()));
    model.attach(Arc::clone(&bus), Some(&cache));
    let selector = Selector::ById(json!(1));

    db.hold_reads();
    let first = {
        let (model, selector) = (Arc::clone(&model), selector.clone());
        tokio::spawn(async move { model.read(&selector).await })
    };
    db.wait_for_reads(1).await;
    let second = {
        let (model, selector) = (Arc::clone(&model), selector.clone());
        tokio::spawn(async move { model.read(&selector).await })
    };
    tokio::time::sleep(QUIET_PERIOD).await;
    db.open_reads();

    let a = first.await.unwrap().unwrap_err();
    let b = second.await.unwrap().unwrap_err();
    assert_eq!(a.code(), ErrorCode::StoreFailure);
    assert_eq!(b.code(), ErrorCode::StoreFailure);
    assert_eq!(db.reads(), 1);
    assert_eq!(model.state(), ModelState::Unbound);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_last_unbind_destroys_and_evicts() {
    let (db, bus, cache) = fixture();
    let selector = Selector::ById(json!(7));
    let model = cached_model(&db, &bus, &cache, selector.clone());
    let key = Identifier::new("task", &selector);

    let (conn_a, _rx_a) = Connection::channel(8, false);
    let (conn_b, _rx_b) = Connection::channel(8, false);
    model.bind(conn_a.clone(), json!("a")).unwrap();
    model.bind(conn_b.clone(), json!("b")).unwrap();
    assert_eq!(model.subscriber_count(), 2);

    assert!(!model.unbind(conn_a.id()));
    assert!(cache.contains(&key));

    assert!(model.unbind(conn_b.id()));
    assert!(model.is_destroyed());
    assert!(!model.is_listening());
    assert!(!cache.contains(&key));
    assert_eq!(bus.listener_count("task.change"), 0);
}

#[tokio::test]
async fn test_destroyed_model_rejects_everything() {
    let (db, bus, cache) = fixture();
    let selector = Selector::ById(json!(8));
    let model = cached_model(&db, &bus, &cache, selector.clone());
    model.destroy();

    let err = model.read(&selector).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ModelDestroyed);
    let err = model.write(json!({"status": "closed"}), None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ModelDestroyed);
    let err = model.delete(json!(null), None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ModelDestroyed);

    let (conn, _rx) = Connection::channel(8, false);
    assert!(model.bind(conn, json!(1)).is_err());
    assert_eq!(db.reads(), 0);
    assert_eq!(db.writes(), 0);
}

#[tokio::test]
async fn test_hook_rejection_skips_database() {
    let db = Arc::new(CountingDatabase::new(task_store()));
    let database: Arc<dyn Database> = db.clone();
    let hooks = Hooks::new().with_authorize(
        |_: &HookContext| -> modelsync_core::Result<()> { Err(SyncError::unauthorized("no")) },
    );
    let model = Model::new("task", database, hooks);
    model.assign_selector(Selector::ById(json!(7))).unwrap();

    let err = model.write(json!({"status": "closed"}), None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthorizationFailed);
    let err = model.delete(json!(null), None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthorizationFailed);

    assert_eq!(db.writes(), 0);
    assert!(!model.is_destroyed());
}

#[tokio::test]
async fn test_delete_publishes_then_destroys() {
    let (db, bus, cache) = fixture();
    let seven = cached_model(&db, &bus, &cache, Selector::ById(json!(7)));
    let view = cached_model(
        &db,
        &bus,
        &cache,
        Selector::ByFilter {
            filter: json!({"status": "open"}),
            order: json!({"id": "asc"}),
        },
    );

    let result = seven.delete(json!(null), None).await.unwrap();
    assert!(result.is_null());
    assert!(seven.is_destroyed());
    assert_eq!(cache.len(), 1);

    assert!(view.is_stale());
    assert_eq!(view.changes_received(), 1);
}

#[tokio::test]
async fn test_overlapping_refreshes_push_only_the_newest() {
    let (db, bus, cache) = fixture();
    let selector = Selector::ByFilter {
        filter: json!({"status": "open"}),
        order: json!({"id": "asc"}),
    };
    let view = cached_model(&db, &bus, &cache, selector.clone());
    view.read(&selector).await.unwrap();
    let (conn, mut rx) = Connection::channel(8, false);
    view.bind(conn, json!("v-1")).unwrap();

    let database: Arc<dyn Database> = db.clone();
    let writer = Model::new("task", database, Hooks::default());
    writer.attach(Arc::clone(&bus), None);

    // Both refreshes are in flight before either completes.
    db.hold_reads();
    writer.write(json!({"id": 7, "status": "closed"}), None).await.unwrap();
    writer.write(json!({"id": 8, "status": "closed"}), None).await.unwrap();
    db.wait_for_reads(3).await;
    db.open_reads();

    let push = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("no push after refresh")
        .unwrap();
    assert_eq!(push.correlation_id, json!("v-1"));
    assert_eq!(push.data["result"], json!([]));
    assert_eq!(push.data["reason"]["payload"]["id"], 8);
    assert!(tokio::time::timeout(QUIET_PERIOD, rx.recv()).await.is_err());

    assert_eq!(view.value(), Some(json!([])));
    assert!(!view.is_stale());
    assert_eq!(view.changes_received(), 2);
}

// ============================================================================
// Identifiers
// ============================================================================

#[test]
fn test_identifier_ignores_key_order() {
    let a = Identifier::new(
        "task",
        &Selector::ByFilter {
            filter: json!({"status": "open", "owner": {"team": "core", "name": "ana"}}),
            order: json!({}),
        },
    );
    let b = Identifier::new(
        "task",
        &Selector::ByFilter {
            filter: json!({"owner": {"name": "ana", "team": "core"}, "status": "open"}),
            order: json!({}),
        },
    );
    assert_eq!(a, b);
    assert_ne!(a, Identifier::new("task", &Selector::ById(json!(7))));
    let other_entity = Selector::ByFilter {
        filter: json!({"status": "open", "owner": {"team": "core", "name": "ana"}}),
        order: json!({}),
    };
    assert_ne!(a, Identifier::new("note", &other_entity));
}
