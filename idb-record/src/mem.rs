//! In-memory reference engine. Implements the engine traits with the
//! same observable semantics as a browser-resident indexed store:
//! versioned upgrades that preserve data, insert-fails-if-exists,
//! unique-index enforcement, snapshot cursors with in-place
//! update/delete, and transactions that auto-commit once their request
//! queue drains while the caller is suspended elsewhere.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use log::trace;

use crate::engine::{
    Connection, Cursor, CursorEntry, Direction, Engine, Index, IndexPlan, Store, Transaction,
    TxMode, TxOutcome, Upgrade, UpgradeHook,
};
use crate::value::{Key, KeyRange, Row, Value, extract_key};
use crate::{Error, Result};

pub struct MemEngine {
    databases: Mutex<HashMap<String, Arc<MemDatabase>>>,
}

impl MemEngine {
    pub fn new() -> Self {
        MemEngine {
            databases: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemEngine {
    fn default() -> Self {
        MemEngine::new()
    }
}

struct MemDatabase {
    name: String,
    state: Mutex<DbState>,
}

struct DbState {
    version: u32,
    stores: HashMap<String, StoreData>,
}

struct StoreData {
    key_fields: Vec<String>,
    rows: BTreeMap<Key, Row>,
    indexes: HashMap<String, IndexPlan>,
}

#[async_trait]
impl Engine for MemEngine {
    async fn open(
        &self,
        name: &str,
        version: u32,
        upgrade: UpgradeHook<'_>,
    ) -> Result<Arc<dyn Connection>> {
        let db = self
            .databases
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemDatabase {
                    name: name.to_string(),
                    state: Mutex::new(DbState {
                        version: 0,
                        stores: HashMap::new(),
                    }),
                })
            })
            .clone();

        {
            let mut state = db.state.lock().unwrap();
            if version < state.version {
                return Err(Error::VersionBelowStored {
                    requested: version,
                    stored: state.version,
                });
            }
            if version > state.version {
                let stored = state.version;
                trace!("upgrading `{name}` from version {stored} to {version}");
                {
                    let mut surgeon = MemUpgrade { state: &mut state };
                    upgrade(&mut surgeon, stored, version)?;
                }
                state.version = version;
            }
        }

        Ok(Arc::new(MemConnection {
            db,
            closed: AtomicBool::new(false),
        }))
    }

    async fn delete_database(&self, name: &str) -> Result<()> {
        self.databases.lock().unwrap().remove(name);
        Ok(())
    }
}

struct MemUpgrade<'a> {
    state: &'a mut DbState,
}

impl MemUpgrade<'_> {
    fn store(&self, name: &str) -> Result<&StoreData> {
        self.state
            .stores
            .get(name)
            .ok_or_else(|| Error::NoSuchStore(name.to_string()))
    }
}

impl Upgrade for MemUpgrade<'_> {
    fn store_names(&self) -> Vec<String> {
        self.state.stores.keys().cloned().collect()
    }

    fn create_store(&mut self, name: &str, key: &[String]) -> Result<()> {
        if self.state.stores.contains_key(name) {
            return Err(Error::Storage(format!("store `{name}` already exists")));
        }
        self.state.stores.insert(
            name.to_string(),
            StoreData {
                key_fields: key.to_vec(),
                rows: BTreeMap::new(),
                indexes: HashMap::new(),
            },
        );
        Ok(())
    }

    fn delete_store(&mut self, name: &str) -> Result<()> {
        self.state
            .stores
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NoSuchStore(name.to_string()))
    }

    fn index_names(&self, store: &str) -> Result<Vec<String>> {
        Ok(self.store(store)?.indexes.keys().cloned().collect())
    }

    fn index_plan(&self, store: &str, index: &str) -> Result<IndexPlan> {
        self.store(store)?
            .indexes
            .get(index)
            .cloned()
            .ok_or_else(|| Error::NoSuchIndex(index.to_string()))
    }

    fn create_index(&mut self, store: &str, index: &IndexPlan) -> Result<()> {
        let data = self
            .state
            .stores
            .get_mut(store)
            .ok_or_else(|| Error::NoSuchStore(store.to_string()))?;
        if data.indexes.contains_key(&index.name) {
            return Err(Error::Storage(format!(
                "index `{}` already exists on `{store}`",
                index.name
            )));
        }
        data.indexes.insert(index.name.clone(), index.clone());
        Ok(())
    }

    fn delete_index(&mut self, store: &str, index: &str) -> Result<()> {
        self.state
            .stores
            .get_mut(store)
            .ok_or_else(|| Error::NoSuchStore(store.to_string()))?
            .indexes
            .remove(index)
            .map(|_| ())
            .ok_or_else(|| Error::NoSuchIndex(index.to_string()))
    }
}

struct MemConnection {
    db: Arc<MemDatabase>,
    closed: AtomicBool,
}

impl Connection for MemConnection {
    fn transaction(&self, stores: &[String], mode: TxMode) -> Result<Arc<dyn Transaction>> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(Error::NotConnected);
        }
        {
            let state = self.db.state.lock().unwrap();
            for store in stores {
                if !state.stores.contains_key(store) {
                    return Err(Error::NoSuchStore(store.clone()));
                }
            }
        }
        Ok(Arc::new(MemTx {
            inner: Arc::new(TxInner {
                db: self.db.clone(),
                scope: stores.iter().cloned().collect(),
                mode,
                state: Mutex::new(TxState {
                    status: TxStatus::Active,
                    pending: 0,
                    overlay: HashMap::new(),
                    wakers: Vec::new(),
                }),
            }),
        }))
    }

    fn store_names(&self) -> Vec<String> {
        self.db.state.lock().unwrap().stores.keys().cloned().collect()
    }

    fn version(&self) -> u32 {
        self.db.state.lock().unwrap().version
    }

    fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    Committed,
    Aborted,
}

struct TxState {
    status: TxStatus,
    /// Outstanding requests against this transaction. The transaction
    /// stays alive exactly as long as new requests arrive before the
    /// count rests at zero.
    pending: usize,
    /// Writes not yet published to the database; `None` marks a delete.
    overlay: HashMap<String, BTreeMap<Key, Option<Row>>>,
    wakers: Vec<Waker>,
}

struct TxInner {
    db: Arc<MemDatabase>,
    scope: HashSet<String>,
    mode: TxMode,
    state: Mutex<TxState>,
}

struct MemTx {
    inner: Arc<TxInner>,
}

impl TxInner {
    fn begin_op(&self) -> Result<OpGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        if state.status != TxStatus::Active {
            return Err(Error::TransactionInactive);
        }
        state.pending += 1;
        Ok(OpGuard(self))
    }

    fn end_op(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending -= 1;
        if state.pending == 0 {
            for waker in state.wakers.drain(..) {
                waker.wake();
            }
        }
    }

    /// Read one key through the overlay.
    fn read(&self, store: &str, key: &Key) -> Result<Option<Row>> {
        {
            let state = self.state.lock().unwrap();
            if let Some(entry) = state.overlay.get(store).and_then(|ov| ov.get(key)) {
                return Ok(entry.clone());
            }
        }
        let db = self.db.state.lock().unwrap();
        let data = db
            .stores
            .get(store)
            .ok_or_else(|| Error::NoSuchStore(store.to_string()))?;
        Ok(data.rows.get(key).cloned())
    }

    /// The full store contents as this transaction sees them.
    fn visible(&self, store: &str) -> Result<BTreeMap<Key, Row>> {
        let mut rows = {
            let db = self.db.state.lock().unwrap();
            db.stores
                .get(store)
                .ok_or_else(|| Error::NoSuchStore(store.to_string()))?
                .rows
                .clone()
        };
        let state = self.state.lock().unwrap();
        if let Some(overlay) = state.overlay.get(store) {
            for (key, entry) in overlay {
                match entry {
                    Some(row) => {
                        rows.insert(key.clone(), row.clone());
                    }
                    None => {
                        rows.remove(key);
                    }
                }
            }
        }
        Ok(rows)
    }

    fn store_meta(&self, store: &str) -> Result<(Vec<String>, HashMap<String, IndexPlan>)> {
        let db = self.db.state.lock().unwrap();
        let data = db
            .stores
            .get(store)
            .ok_or_else(|| Error::NoSuchStore(store.to_string()))?;
        Ok((data.key_fields.clone(), data.indexes.clone()))
    }

    fn require_writable(&self) -> Result<()> {
        if self.mode == TxMode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn write(&self, store: &str, key: &Key, row: Row, fail_if_exists: bool) -> Result<()> {
        self.require_writable()?;
        let rows = self.visible(store)?;
        if fail_if_exists && rows.contains_key(key) {
            return Err(Error::Constraint(format!(
                "a record with key {key:?} already exists in `{store}`"
            )));
        }
        let (_, indexes) = self.store_meta(store)?;
        for index in indexes.values().filter(|ix| ix.unique) {
            let Some(new_entries) = index_entries(index, &row) else {
                continue;
            };
            for (other_key, other_row) in &rows {
                if other_key == key {
                    continue;
                }
                let Some(entries) = index_entries(index, other_row) else {
                    continue;
                };
                if entries.iter().any(|e| new_entries.contains(e)) {
                    return Err(Error::Constraint(format!(
                        "unique index `{}` on `{store}` violated",
                        index.name
                    )));
                }
            }
        }
        let mut state = self.state.lock().unwrap();
        state
            .overlay
            .entry(store.to_string())
            .or_default()
            .insert(key.clone(), Some(row));
        Ok(())
    }

    fn remove(&self, store: &str, key: &Key) -> Result<()> {
        self.require_writable()?;
        let mut state = self.state.lock().unwrap();
        state
            .overlay
            .entry(store.to_string())
            .or_default()
            .insert(key.clone(), None);
        Ok(())
    }

    /// Move from Active to a terminal status, publishing the overlay on
    /// commit. Returns `None` when the transaction already finished.
    fn finish(&self, commit: bool) -> Option<TxOutcome> {
        let (overlay, wakers) = {
            let mut state = self.state.lock().unwrap();
            if state.status != TxStatus::Active {
                return None;
            }
            state.status = if commit {
                TxStatus::Committed
            } else {
                TxStatus::Aborted
            };
            (
                std::mem::take(&mut state.overlay),
                std::mem::take(&mut state.wakers),
            )
        };
        if commit {
            let mut db = self.db.state.lock().unwrap();
            for (store, entries) in overlay {
                if let Some(data) = db.stores.get_mut(&store) {
                    for (key, entry) in entries {
                        match entry {
                            Some(row) => {
                                data.rows.insert(key, row);
                            }
                            None => {
                                data.rows.remove(&key);
                            }
                        }
                    }
                }
            }
        }
        for waker in wakers {
            waker.wake();
        }
        Some(if commit {
            TxOutcome::Committed
        } else {
            TxOutcome::Aborted
        })
    }
}

/// Balances `begin_op` even when the caller's future is dropped
/// mid-operation.
struct OpGuard<'a>(&'a TxInner);

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.end_op();
    }
}

/// Suspends exactly once, making every storage operation a real
/// scheduling point.
fn yield_once() -> YieldOnce {
    YieldOnce(false)
}

struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Index entries for one row, or `None` when the row does not appear in
/// the index. A multi-valued index yields one entry per array element.
fn index_entries(index: &IndexPlan, row: &Row) -> Option<Vec<Key>> {
    if index.multi {
        let field = index.fields.first()?;
        return match row.get(field) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Array(items)) => {
                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    entries.push(Key(vec![Value::from_json(item).ok()?]));
                }
                Some(entries)
            }
            Some(other) => Some(vec![Key(vec![Value::from_json(other).ok()?])]),
        };
    }
    let mut components = Vec::with_capacity(index.fields.len());
    for field in &index.fields {
        match row.get(field) {
            None | Some(serde_json::Value::Null) => return None,
            Some(value) => components.push(Value::from_json(value).ok()?),
        }
    }
    Some(vec![Key(components)])
}

#[async_trait]
impl Transaction for MemTx {
    fn store(&self, name: &str) -> Result<Box<dyn Store>> {
        if !self.inner.scope.contains(name) {
            return Err(Error::StoreNotInTransaction(name.to_string()));
        }
        Ok(Box::new(MemStore {
            tx: self.inner.clone(),
            store: name.to_string(),
        }))
    }

    async fn commit(&self) -> Result<()> {
        let already = {
            let state = self.inner.state.lock().unwrap();
            state.status
        };
        match already {
            TxStatus::Aborted => Err(Error::TransactionInactive),
            TxStatus::Committed => Ok(()),
            TxStatus::Active => {
                self.inner.finish(true);
                trace!("transaction on `{}` committed", self.inner.db.name);
                Ok(())
            }
        }
    }

    async fn abort(&self) -> Result<()> {
        let already = {
            let state = self.inner.state.lock().unwrap();
            state.status
        };
        match already {
            TxStatus::Committed => Err(Error::TransactionInactive),
            TxStatus::Aborted => Ok(()),
            TxStatus::Active => {
                self.inner.finish(false);
                trace!("transaction on `{}` aborted", self.inner.db.name);
                Ok(())
            }
        }
    }

    async fn completed(&self) -> TxOutcome {
        let inner = self.inner.clone();
        std::future::poll_fn(move |cx| {
            {
                let mut state = inner.state.lock().unwrap();
                match state.status {
                    TxStatus::Committed => return Poll::Ready(TxOutcome::Committed),
                    TxStatus::Aborted => return Poll::Ready(TxOutcome::Aborted),
                    TxStatus::Active => {}
                }
                if state.pending > 0 {
                    state.wakers.push(cx.waker().clone());
                    return Poll::Pending;
                }
            }
            // The request queue rested at zero while the caller was
            // suspended somewhere else; the host commits on its own.
            match inner.finish(true) {
                Some(outcome) => Poll::Ready(outcome),
                None => {
                    let state = inner.state.lock().unwrap();
                    Poll::Ready(match state.status {
                        TxStatus::Aborted => TxOutcome::Aborted,
                        _ => TxOutcome::Committed,
                    })
                }
            }
        })
        .await
    }
}

struct MemStore {
    tx: Arc<TxInner>,
    store: String,
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, key: &Key) -> Result<Option<Row>> {
        let _op = self.tx.begin_op()?;
        yield_once().await;
        self.tx.read(&self.store, key)
    }

    async fn insert(&self, key: &Key, row: Row) -> Result<()> {
        let _op = self.tx.begin_op()?;
        yield_once().await;
        self.tx.write(&self.store, key, row, true)
    }

    async fn put(&self, key: &Key, row: Row) -> Result<()> {
        let _op = self.tx.begin_op()?;
        yield_once().await;
        self.tx.write(&self.store, key, row, false)
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        let _op = self.tx.begin_op()?;
        yield_once().await;
        self.tx.remove(&self.store, key)
    }

    async fn clear(&self) -> Result<()> {
        let _op = self.tx.begin_op()?;
        yield_once().await;
        self.tx.require_writable()?;
        let keys: Vec<Key> = self.tx.visible(&self.store)?.into_keys().collect();
        let mut state = self.tx.state.lock().unwrap();
        let overlay = state.overlay.entry(self.store.clone()).or_default();
        for key in keys {
            overlay.insert(key, None);
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let _op = self.tx.begin_op()?;
        yield_once().await;
        Ok(self.tx.visible(&self.store)?.len() as u64)
    }

    fn index(&self, name: &str) -> Result<Box<dyn Index>> {
        let (_, indexes) = self.tx.store_meta(&self.store)?;
        let plan = indexes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoSuchIndex(name.to_string()))?;
        Ok(Box::new(MemIndex {
            tx: self.tx.clone(),
            store: self.store.clone(),
            plan,
        }))
    }

    async fn open_cursor(
        &self,
        range: Option<KeyRange>,
        direction: Direction,
    ) -> Result<Box<dyn Cursor>> {
        let _op = self.tx.begin_op()?;
        yield_once().await;
        let rows = self.tx.visible(&self.store)?;
        let mut entries: Vec<Key> = match &range {
            Some(range) if range.is_empty() => Vec::new(),
            Some(range) => rows.range(range.clone()).map(|(k, _)| k.clone()).collect(),
            None => rows.keys().cloned().collect(),
        };
        if direction == Direction::Reverse {
            entries.reverse();
        }
        Ok(Box::new(MemCursor {
            tx: self.tx.clone(),
            store: self.store.clone(),
            entries: entries.into_iter().collect(),
            current: None,
        }))
    }
}

struct MemIndex {
    tx: Arc<TxInner>,
    store: String,
    plan: IndexPlan,
}

#[async_trait]
impl Index for MemIndex {
    async fn open_cursor(
        &self,
        range: Option<KeyRange>,
        direction: Direction,
    ) -> Result<Box<dyn Cursor>> {
        let _op = self.tx.begin_op()?;
        yield_once().await;
        let rows = self.tx.visible(&self.store)?;
        let mut entries: Vec<(Key, Key)> = Vec::new();
        for (primary, row) in &rows {
            let Some(index_keys) = index_entries(&self.plan, row) else {
                continue;
            };
            for entry in index_keys {
                if range.as_ref().is_some_and(|r| !r.contains(&entry)) {
                    continue;
                }
                entries.push((entry, primary.clone()));
            }
        }
        entries.sort();
        if direction == Direction::Reverse {
            entries.reverse();
        }
        Ok(Box::new(MemCursor {
            tx: self.tx.clone(),
            store: self.store.clone(),
            entries: entries.into_iter().map(|(_, primary)| primary).collect(),
            current: None,
        }))
    }
}

struct MemCursor {
    tx: Arc<TxInner>,
    store: String,
    /// Primary keys snapshotted at open, in iteration order. Rows are
    /// re-read at step time, so later deletes and updates are observed.
    entries: std::collections::VecDeque<Key>,
    current: Option<Key>,
}

#[async_trait]
impl Cursor for MemCursor {
    async fn step(&mut self) -> Result<Option<CursorEntry>> {
        let _op = self.tx.begin_op()?;
        yield_once().await;
        while let Some(primary) = self.entries.pop_front() {
            if let Some(row) = self.tx.read(&self.store, &primary)? {
                self.current = Some(primary.clone());
                return Ok(Some(CursorEntry { primary, row }));
            }
        }
        self.current = None;
        Ok(None)
    }

    async fn update(&mut self, row: Row) -> Result<()> {
        let primary = self
            .current
            .clone()
            .ok_or_else(|| Error::Storage("cursor is not positioned on a row".to_string()))?;
        let _op = self.tx.begin_op()?;
        yield_once().await;
        let (key_fields, _) = self.tx.store_meta(&self.store)?;
        let new_key = extract_key(&key_fields, &row)?;
        if new_key != primary {
            return Err(Error::Constraint(
                "a cursor update must not change the primary key".to_string(),
            ));
        }
        self.tx.write(&self.store, &primary, row, false)
    }

    async fn delete(&mut self) -> Result<()> {
        let primary = self
            .current
            .clone()
            .ok_or_else(|| Error::Storage("cursor is not positioned on a row".to_string()))?;
        let _op = self.tx.begin_op()?;
        yield_once().await;
        self.tx.remove(&self.store, &primary)
    }
}
