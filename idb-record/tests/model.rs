use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use idb_record::{Error, Key, MemEngine, Model, Record, connect, disconnect};
use serde::{Deserialize, Serialize};
use serde_json::json;

static SERIAL: AtomicU32 = AtomicU32::new(0);

fn next_serial() -> u32 {
    SERIAL.fetch_add(1, Ordering::SeqCst)
}

#[derive(Record, Serialize, Deserialize, Debug, PartialEq, Clone)]
struct User {
    #[record(primary_key)]
    id: u32,
    #[record(unique)]
    email: String,
    name: String,
    #[record(default = 18)]
    age: u32,
    #[record(default = next_serial())]
    serial: u32,
    #[record(default = uuid::Uuid::new_v4().to_string())]
    token: String,
    #[record(index = false)]
    bio: Option<String>,
}

#[derive(Record, Serialize, Deserialize, Debug, PartialEq)]
struct Membership {
    #[record(primary_key)]
    user_id: u32,
    #[record(primary_key)]
    group_id: u32,
    role: String,
}

static LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn fresh(name: &str) -> tokio::sync::MutexGuard<'static, ()> {
    let guard = LOCK.lock().await;
    let _ = env_logger::builder().is_test(true).try_init();
    disconnect();
    connect(Arc::new(MemEngine::new()), name, 1).await.unwrap();
    guard
}

fn alice() -> serde_json::Value {
    json!({ "id": 1, "email": "alice@example.com", "name": "Alice" })
}

#[tokio::test]
async fn create_then_get_returns_equal_record() {
    let _guard = fresh("model_roundtrip").await;
    let created = User::create(alice(), None).await.unwrap();
    let fetched = User::get(1u32, None).await.unwrap().unwrap();
    assert_eq!(created, fetched);
    assert_eq!(fetched.name, "Alice");
    assert_eq!(fetched.bio, None);
}

#[tokio::test]
async fn missing_record_is_none_not_an_error() {
    let _guard = fresh("model_missing").await;
    assert!(User::get(99u32, None).await.unwrap().is_none());
}

#[tokio::test]
async fn static_default_fills_missing_field() {
    let _guard = fresh("model_default").await;
    let user = User::create(alice(), None).await.unwrap();
    assert_eq!(user.age, 18);
    // an explicit value wins over the default
    let user = User::create(
        json!({ "id": 2, "email": "b@example.com", "name": "Bob", "age": 40 }),
        None,
    )
    .await
    .unwrap();
    assert_eq!(user.age, 40);
}

#[tokio::test]
async fn generator_default_runs_exactly_once_per_creation() {
    let _guard = fresh("model_generator").await;
    let before = SERIAL.load(Ordering::SeqCst);
    let user = User::create(alice(), None).await.unwrap();
    assert_eq!(SERIAL.load(Ordering::SeqCst), before + 1);
    assert_eq!(user.serial, before);

    let other = User::create(
        json!({ "id": 2, "email": "b@example.com", "name": "Bob" }),
        None,
    )
    .await
    .unwrap();
    assert_eq!(other.serial, before + 1);
    assert!(!other.token.is_empty());
    assert_ne!(user.token, other.token);
}

#[tokio::test]
async fn missing_non_nullable_field_fails_validation() {
    let _guard = fresh("model_validation").await;
    let err = User::create(json!({ "id": 1, "email": "a@example.com" }), None)
        .await
        .unwrap_err();
    match err {
        Error::Validation(message) => {
            assert!(message.contains("name"), "unexpected message: {message}");
            assert!(message.contains("not nullable"), "unexpected message: {message}");
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    // nothing was written
    assert_eq!(User::count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn explicit_null_in_non_nullable_field_fails_validation() {
    let _guard = fresh("model_null").await;
    let err = User::create(
        json!({ "id": 1, "email": "a@example.com", "name": null }),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn create_is_insert_only() {
    let _guard = fresh("model_insert_only").await;
    User::create(alice(), None).await.unwrap();
    let err = User::create(
        json!({ "id": 1, "email": "other@example.com", "name": "Clone" }),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Constraint(_)));
    assert_eq!(User::count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn unique_index_conflicts_are_constraint_errors() {
    let _guard = fresh("model_unique").await;
    User::create(alice(), None).await.unwrap();
    let err = User::create(
        json!({ "id": 2, "email": "alice@example.com", "name": "Impostor" }),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Constraint(_)));
}

#[tokio::test]
async fn save_overwrites_and_delete_removes() {
    let _guard = fresh("model_save_delete").await;
    let mut user = User::create(alice(), None).await.unwrap();

    user.update(json!({ "name": "Alicia", "age": 30 })).unwrap();
    // update is in-memory only
    assert_eq!(User::get(1u32, None).await.unwrap().unwrap().name, "Alice");

    user.save(None).await.unwrap();
    let stored = User::get(1u32, None).await.unwrap().unwrap();
    assert_eq!(stored.name, "Alicia");
    assert_eq!(stored.age, 30);

    user.delete(None).await.unwrap();
    assert!(User::get(1u32, None).await.unwrap().is_none());
}

#[tokio::test]
async fn keys_and_clear_operate_on_the_whole_store() {
    let _guard = fresh("model_keys_clear").await;
    for id in 1u32..=3 {
        User::create(
            json!({ "id": id, "email": format!("u{id}@example.com"), "name": format!("U{id}") }),
            None,
        )
        .await
        .unwrap();
    }
    let keys = User::keys(None).await.unwrap();
    assert_eq!(keys, vec![Key::from(1), Key::from(2), Key::from(3)]);

    User::clear(None).await.unwrap();
    assert_eq!(User::count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn composite_keys_roundtrip() {
    let _guard = fresh("model_composite").await;
    let membership = Membership::create(
        json!({ "user_id": 1, "group_id": 2, "role": "admin" }),
        None,
    )
    .await
    .unwrap();
    assert_eq!(membership.key().unwrap(), Key::from((1, 2)));

    let fetched = Membership::get((1u32, 2u32), None).await.unwrap().unwrap();
    assert_eq!(fetched, membership);
    assert!(Membership::get((1u32, 3u32), None).await.unwrap().is_none());
}

#[tokio::test]
async fn instance_key_follows_declaration_order() {
    let _guard = fresh("model_key_order").await;
    let user = User::create(alice(), None).await.unwrap();
    assert_eq!(user.key().unwrap(), Key::from(1));
}
