//! The storage-engine boundary. The crate consumes the host storage
//! primitive only through these traits: a named, versioned connection
//! with an upgrade surface for schema surgery, transactions over an
//! explicit store set with a natural-completion signal, and cursors
//! over stores and indexes optionally bounded by key ranges.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::value::{Key, KeyRange, Row};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

/// How a transaction ended, as reported by its natural-completion
/// signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    Aborted,
}

impl fmt::Display for TxOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxOutcome::Committed => f.write_str("committed"),
            TxOutcome::Aborted => f.write_str("aborted"),
        }
    }
}

/// Store layout requested of the engine at upgrade time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorePlan {
    pub name: String,
    pub key: Vec<String>,
    pub indexes: Vec<IndexPlan>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexPlan {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
    pub multi: bool,
}

/// Synchronous schema surface available only while a version upgrade is
/// in progress. Stored rows survive every operation except
/// `delete_store`.
pub trait Upgrade {
    fn store_names(&self) -> Vec<String>;
    fn create_store(&mut self, name: &str, key: &[String]) -> Result<()>;
    fn delete_store(&mut self, name: &str) -> Result<()>;
    fn index_names(&self, store: &str) -> Result<Vec<String>>;
    fn index_plan(&self, store: &str, index: &str) -> Result<IndexPlan>;
    fn create_index(&mut self, store: &str, index: &IndexPlan) -> Result<()>;
    fn delete_index(&mut self, store: &str, index: &str) -> Result<()>;
}

/// Upgrade callback: receives the schema surface plus the stored and
/// requested versions.
pub type UpgradeHook<'a> = &'a (dyn Fn(&mut dyn Upgrade, u32, u32) -> Result<()> + Send + Sync);

#[async_trait]
pub trait Engine: Send + Sync {
    /// Open a named, versioned database. The hook runs only when
    /// `version` exceeds the stored version; requesting a version below
    /// the stored one is an error.
    async fn open(
        &self,
        name: &str,
        version: u32,
        upgrade: UpgradeHook<'_>,
    ) -> Result<Arc<dyn Connection>>;

    async fn delete_database(&self, name: &str) -> Result<()>;
}

pub trait Connection: Send + Sync {
    /// Open a transaction spanning exactly `stores`. Opening is
    /// synchronous; the transaction's lifetime is governed by the
    /// engine's bookkeeping of outstanding requests.
    fn transaction(&self, stores: &[String], mode: TxMode) -> Result<Arc<dyn Transaction>>;

    fn store_names(&self) -> Vec<String>;
    fn version(&self) -> u32;
    fn close(&self);
}

#[async_trait]
pub trait Transaction: Send + Sync {
    /// A store handle, valid only if the store is inside this
    /// transaction's declared scope.
    fn store(&self, name: &str) -> Result<Box<dyn Store>>;

    async fn commit(&self) -> Result<()>;
    async fn abort(&self) -> Result<()>;

    /// Resolves when the engine itself finishes the transaction,
    /// whether or not anyone called `commit` or `abort`.
    async fn completed(&self) -> TxOutcome;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &Key) -> Result<Option<Row>>;
    /// Insert-only write; fails if the key already exists.
    async fn insert(&self, key: &Key, row: Row) -> Result<()>;
    /// Upsert.
    async fn put(&self, key: &Key, row: Row) -> Result<()>;
    async fn delete(&self, key: &Key) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn count(&self) -> Result<u64>;

    fn index(&self, name: &str) -> Result<Box<dyn Index>>;

    async fn open_cursor(
        &self,
        range: Option<KeyRange>,
        direction: Direction,
    ) -> Result<Box<dyn Cursor>>;
}

#[async_trait]
pub trait Index: Send + Sync {
    async fn open_cursor(
        &self,
        range: Option<KeyRange>,
        direction: Direction,
    ) -> Result<Box<dyn Cursor>>;
}

pub struct CursorEntry {
    pub primary: Key,
    pub row: Row,
}

#[async_trait]
pub trait Cursor: Send {
    /// Advance and return the next row, or `None` once exhausted.
    async fn step(&mut self) -> Result<Option<CursorEntry>>;
    /// Rewrite the row at the current position; the primary key must
    /// not change.
    async fn update(&mut self, row: Row) -> Result<()>;
    /// Delete the row at the current position.
    async fn delete(&mut self) -> Result<()>;
}
