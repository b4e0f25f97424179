use std::sync::Arc;

use idb_record::schema::{FieldDef, TableDef};
use idb_record::{Error, MemEngine, Model, Record, connect, destroy, disconnect, schema};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Record, Serialize, Deserialize, Debug, PartialEq, Clone)]
#[record(store = "docs")]
struct Doc {
    #[record(primary_key)]
    id: u32,
    title: String,
    author: String,
}

static LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

#[tokio::test]
async fn toggling_a_field_index_rebuilds_only_that_index() {
    let _guard = LOCK.lock().await;
    let _ = env_logger::builder().is_test(true).try_init();
    disconnect();
    let engine = Arc::new(MemEngine::new());

    connect(engine.clone(), "updb", 1).await.unwrap();
    Doc::create(json!({ "id": 1, "title": "Dune", "author": "Herbert" }), None)
        .await
        .unwrap();
    Doc::create(json!({ "id": 2, "title": "Solaris", "author": "Lem" }), None)
        .await
        .unwrap();
    assert_eq!(
        Doc::query().with_index("title").count().await.unwrap(),
        2
    );
    disconnect();

    // version 2 declares the same table with `title` no longer indexed
    schema::register(
        TableDef::new("Doc")
            .store("docs")
            .field(FieldDef::new("id").primary_key())
            .field(FieldDef::new("title").unindexed())
            .field(FieldDef::new("author")),
    );
    connect(engine.clone(), "updb", 2).await.unwrap();

    let err = Doc::query().with_index("title").count().await.unwrap_err();
    assert!(matches!(err, Error::NoSuchIndex(_)));

    // the other index and the stored rows are untouched
    assert_eq!(
        Doc::query().with_index("author").count().await.unwrap(),
        2
    );
    let docs = Doc::all(None).await.unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].title, "Dune");

    disconnect();
    schema::unregister("Doc");
}

#[tokio::test]
async fn reopening_at_a_lower_version_fails() {
    let _guard = LOCK.lock().await;
    disconnect();
    let engine = Arc::new(MemEngine::new());

    connect(engine.clone(), "verdb", 3).await.unwrap();
    disconnect();

    let err = connect(engine.clone(), "verdb", 2).await.unwrap_err();
    assert!(matches!(err, Error::VersionBelowStored { .. }));
}

#[tokio::test]
async fn reopening_at_the_same_version_skips_the_upgrade() {
    let _guard = LOCK.lock().await;
    disconnect();
    let engine = Arc::new(MemEngine::new());

    connect(engine.clone(), "samedb", 1).await.unwrap();
    Doc::create(json!({ "id": 1, "title": "Dune", "author": "Herbert" }), None)
        .await
        .unwrap();
    disconnect();

    let db = connect(engine.clone(), "samedb", 1).await.unwrap();
    assert_eq!(db.version(), 1);
    assert_eq!(Doc::count(None).await.unwrap(), 1);
    disconnect();
}

#[tokio::test]
async fn connect_is_idempotent_while_open() {
    let _guard = LOCK.lock().await;
    disconnect();
    let engine = Arc::new(MemEngine::new());

    let first = connect(engine.clone(), "one", 1).await.unwrap();
    let second = connect(engine.clone(), "two", 9).await.unwrap();
    assert_eq!(first.name(), second.name());
    assert_eq!(second.version(), 1);
    disconnect();
}

#[tokio::test]
async fn destroy_refuses_the_open_database() {
    let _guard = LOCK.lock().await;
    disconnect();
    let engine = Arc::new(MemEngine::new());

    connect(engine.clone(), "deldb", 1).await.unwrap();
    Doc::create(json!({ "id": 1, "title": "Dune", "author": "Herbert" }), None)
        .await
        .unwrap();

    let err = destroy(engine.clone(), "deldb").await.unwrap_err();
    assert!(matches!(err, Error::DatabaseOpen(_)));

    disconnect();
    destroy(engine.clone(), "deldb").await.unwrap();

    // a destroyed database comes back empty
    connect(engine.clone(), "deldb", 1).await.unwrap();
    assert_eq!(Doc::count(None).await.unwrap(), 0);
    disconnect();
}

#[tokio::test]
async fn operations_after_disconnect_fail_fast() {
    let _guard = LOCK.lock().await;
    disconnect();
    let err = Doc::count(None).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}
