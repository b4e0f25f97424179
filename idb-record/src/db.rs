//! Connection lifecycle. One process-wide connection, lazily opened and
//! idempotently reused; `connect`, `disconnect` and `destroy` are the
//! only entry points that touch it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, RwLock};

use log::{debug, warn};

use crate::engine::{Connection, Engine, StorePlan, Transaction, TxMode, Upgrade};
use crate::{Error, Result, schema};

/// An established connection to a named, versioned database.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

struct DbInner {
    name: String,
    version: u32,
    conn: Arc<dyn Connection>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .finish()
    }
}

impl Db {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn store_names(&self) -> Vec<String> {
        self.inner.conn.store_names()
    }

    pub(crate) fn transaction(
        &self,
        stores: &[String],
        mode: TxMode,
    ) -> Result<Arc<dyn Transaction>> {
        self.inner.conn.transaction(stores, mode)
    }
}

static ACTIVE: LazyLock<RwLock<Option<Db>>> = LazyLock::new(|| RwLock::new(None));

/// The current connection; fails fast when none is established.
pub fn current() -> Result<Db> {
    ACTIVE.read().unwrap().clone().ok_or(Error::NotConnected)
}

/// Open the process-wide connection, creating stores and reconciling
/// indexes from the registered schema when `version` exceeds the stored
/// version. Idempotent: while a connection exists, every caller gets it
/// back unmodified.
pub async fn connect(engine: Arc<dyn Engine>, name: &str, version: u32) -> Result<Db> {
    if let Some(db) = ACTIVE.read().unwrap().clone() {
        return Ok(db);
    }
    let plan = schema::plan()?;
    let conn = engine
        .open(name, version, &|up, stored, requested| {
            apply_plan(up, &plan, stored, requested)
        })
        .await?;
    let db = Db {
        inner: Arc::new(DbInner {
            name: name.to_string(),
            version,
            conn,
        }),
    };
    let mut slot = ACTIVE.write().unwrap();
    if let Some(existing) = slot.clone() {
        // lost the open race; the first connection wins
        db.inner.conn.close();
        return Ok(existing);
    }
    debug!("connected to `{name}` at version {version}");
    *slot = Some(db.clone());
    Ok(db)
}

/// Close and forget the process-wide connection, if any.
pub fn disconnect() {
    if let Some(db) = ACTIVE.write().unwrap().take() {
        db.inner.conn.close();
        debug!("disconnected from `{}`", db.inner.name);
    }
}

/// Delete a database that is not currently open.
pub async fn destroy(engine: Arc<dyn Engine>, name: &str) -> Result<()> {
    if let Some(db) = ACTIVE.read().unwrap().clone() {
        if db.inner.name == name {
            return Err(Error::DatabaseOpen(name.to_string()));
        }
    }
    engine.delete_database(name).await
}

/// Reconcile the engine's layout with the declared schema: create
/// missing stores, create missing indexes, recreate changed ones and
/// drop those no longer declared. Stored rows are never touched.
fn apply_plan(up: &mut dyn Upgrade, plan: &[StorePlan], stored: u32, requested: u32) -> Result<()> {
    debug!("upgrading schema from version {stored} to {requested}");
    let existing: HashSet<String> = up.store_names().into_iter().collect();
    for store in plan {
        if !existing.contains(&store.name) {
            up.create_store(&store.name, &store.key)?;
        }
        let have: HashSet<String> = up.index_names(&store.name)?.into_iter().collect();
        let want: HashMap<&str, &crate::engine::IndexPlan> = store
            .indexes
            .iter()
            .map(|ix| (ix.name.as_str(), ix))
            .collect();
        for index in &store.indexes {
            if have.contains(&index.name) {
                if up.index_plan(&store.name, &index.name)? != *index {
                    warn!(
                        "index `{}` on `{}` changed shape, rebuilding",
                        index.name, store.name
                    );
                    up.delete_index(&store.name, &index.name)?;
                    up.create_index(&store.name, index)?;
                }
            } else {
                up.create_index(&store.name, index)?;
            }
        }
        for name in &have {
            if !want.contains_key(name.as_str()) {
                debug!("dropping undeclared index `{name}` on `{}`", store.name);
                up.delete_index(&store.name, name)?;
            }
        }
    }
    Ok(())
}
