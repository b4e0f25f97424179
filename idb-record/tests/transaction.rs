use std::sync::Arc;
use std::time::Duration;

use idb_record::{Error, MemEngine, Model, Record, TxMode, connect, disconnect, transact};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Record, Serialize, Deserialize, Debug, PartialEq, Clone)]
struct User {
    #[record(primary_key)]
    id: u32,
    name: String,
}

#[derive(Record, Serialize, Deserialize, Debug, PartialEq)]
#[record(template)]
#[record(index(fields(created), name = "recent"))]
struct Content {
    #[record(primary_key)]
    id: u32,
    created: u32,
}

#[derive(Record, Serialize, Deserialize, Debug, PartialEq)]
#[record(extends = "Content", store = "posts")]
struct Post {
    #[record(primary_key)]
    id: u32,
    created: u32,
    title: String,
}

static LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn fresh(name: &str) -> tokio::sync::MutexGuard<'static, ()> {
    let guard = LOCK.lock().await;
    let _ = env_logger::builder().is_test(true).try_init();
    disconnect();
    connect(Arc::new(MemEngine::new()), name, 1).await.unwrap();
    guard
}

#[tokio::test]
async fn scoped_success_commits() {
    let _guard = fresh("tx_commit").await;
    let created = transact(TxMode::ReadWrite, &["User"], |tx| async move {
        let user = User::create(json!({ "id": 1, "name": "Alice" }), Some(&tx)).await?;
        let loaded = User::get(1u32, Some(&tx)).await?;
        assert_eq!(loaded.as_ref(), Some(&user));
        Ok(user)
    })
    .await
    .unwrap();

    assert_eq!(created.name, "Alice");
    assert_eq!(User::all(None).await.unwrap(), vec![created]);
}

#[tokio::test]
async fn scoped_failure_rolls_back() {
    let _guard = fresh("tx_rollback").await;
    let err = transact(TxMode::ReadWrite, &["User"], |tx| async move {
        User::create(json!({ "id": 1, "name": "Alice" }), Some(&tx)).await?;
        Err::<(), _>(Error::Storage("boom".to_string()))
    })
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Storage(_)));
    assert!(User::all(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn callback_outliving_the_transaction_is_a_distinct_error() {
    let _guard = fresh("tx_premature").await;
    let err = transact(TxMode::ReadWrite, &["User"], |tx| async move {
        User::create(json!({ "id": 1, "name": "Alice" }), Some(&tx)).await?;
        // suspending on anything outside the transaction lets the host
        // finish it on its own
        tokio::time::sleep(Duration::from_millis(1)).await;
        User::create(json!({ "id": 2, "name": "Bob" }), Some(&tx)).await
    })
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        Error::TransactionPrematurelyCompleted { .. }
    ));
    // the write issued before the suspension had already committed
    let stored = User::all(None).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, 1);
}

#[tokio::test]
async fn idle_callback_suspension_also_completes_the_transaction() {
    let _guard = fresh("tx_idle").await;
    let err = transact(TxMode::ReadWrite, &["User"], |_tx| async move {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(())
    })
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        Error::TransactionPrematurelyCompleted { .. }
    ));
}

#[tokio::test]
async fn awaited_transaction_operations_keep_the_transaction_alive() {
    let _guard = fresh("tx_alive").await;
    transact(TxMode::ReadWrite, &["User"], |tx| async move {
        for id in 1u32..=20 {
            User::create(json!({ "id": id, "name": format!("U{id}") }), Some(&tx)).await?;
        }
        let count = User::count(Some(&tx)).await?;
        assert_eq!(count, 20);
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(User::count(None).await.unwrap(), 20);
}

#[tokio::test]
async fn stores_outside_the_scope_are_rejected() {
    let _guard = fresh("tx_scope").await;
    let err = transact(TxMode::ReadWrite, &["User"], |tx| async move {
        Post::create(
            json!({ "id": 1, "created": 7, "title": "Out of scope" }),
            Some(&tx),
        )
        .await
    })
    .await
    .unwrap_err();
    assert!(matches!(err, Error::StoreNotInTransaction(_)));
    assert!(Post::all(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn read_only_transactions_reject_writes() {
    let _guard = fresh("tx_readonly").await;
    let err = transact(TxMode::ReadOnly, &["User"], |tx| async move {
        User::create(json!({ "id": 1, "name": "Alice" }), Some(&tx)).await
    })
    .await
    .unwrap_err();
    assert!(matches!(err, Error::ReadOnly));
}

#[tokio::test]
async fn template_types_cannot_be_locked_or_stored() {
    let _guard = fresh("tx_template").await;
    let err = transact(TxMode::ReadWrite, &["Content"], |_tx| async move { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = Content::create(json!({ "id": 1, "created": 7 }), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn derived_types_inherit_template_indexes() {
    let _guard = fresh("tx_extends").await;
    for (id, created) in [(1u32, 30u32), (2, 10), (3, 20)] {
        Post::create(
            json!({ "id": id, "created": created, "title": format!("P{id}") }),
            None,
        )
        .await
        .unwrap();
    }
    let recent: Vec<Post> = Post::query()
        .with_index_range("recent", idb_record::Between::at_least(15))
        .all()
        .await
        .unwrap();
    let ids: Vec<u32> = recent.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![3, 1]);
}

#[tokio::test]
async fn transact_requires_a_connection() {
    let _guard = LOCK.lock().await;
    disconnect();
    let err = transact(TxMode::ReadWrite, &["User"], |_tx| async move { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected));

    let err = User::all(None).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}
