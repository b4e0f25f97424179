//! Typed records over an asynchronous, index-based key-value store.
//!
//! Record types declare their schema with `#[derive(Record)]` and are
//! manipulated through [`Model`] operations and the lazy [`Query`]
//! builder. The storage engine is consumed through the traits in
//! [`engine`]; [`MemEngine`] is the in-process reference
//! implementation. [`transact`] runs a callback inside one transaction
//! spanning an explicit set of record types, detecting callbacks that
//! outlive their transaction.
//!
//! ```no_run
//! use idb_record::{Model, Record};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Record, Serialize, Deserialize)]
//! struct User {
//!     #[record(primary_key)]
//!     id: u32,
//!     #[record(unique)]
//!     email: String,
//!     name: String,
//! }
//!
//! # async fn demo() -> idb_record::Result<()> {
//! idb_record::connect(Arc::new(idb_record::MemEngine::new()), "app", 1).await?;
//! let user = User::create(
//!     serde_json::json!({ "id": 1, "email": "a@example.com", "name": "Alice" }),
//!     None,
//! )
//! .await?;
//! let found = User::filter("name", "Alice").first().await?;
//! # let _ = (user, found);
//! # Ok(())
//! # }
//! ```

mod db;
pub mod engine;
mod error;
mod filter;
mod mem;
mod query;
mod record;
pub mod schema;
mod transaction;
mod value;

pub use db::{Db, connect, current, destroy, disconnect};
pub use engine::{Direction, TxMode, TxOutcome};
pub use error::{Error, Result};
pub use filter::{Between, Filter};
pub use mem::MemEngine;
pub use query::Query;
pub use record::{Model, Record};
pub use transaction::{Tx, transact};
pub use value::{Key, KeyRange, Row, Value};

pub use idb_record_derive::Record;

// the derive expands against these paths
pub use inventory;
pub use serde_json;
