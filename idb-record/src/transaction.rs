//! Transaction coordination. A scoped transaction races its callback
//! against the engine's natural-completion signal: the callback is
//! always polled first, so as long as it only awaits operations on the
//! transaction the signal can never win. If it does win, the callback
//! suspended on something outside the transaction, and every further
//! operation it would issue has nothing left to run against; that is
//! surfaced as a distinct error instead of a hang or a silent loss.

use std::future::Future;
use std::sync::Arc;

use futures::future::{Either, select};
use log::warn;

use crate::engine::{Store, Transaction, TxMode, TxOutcome};
use crate::{Error, Result, db, schema};

/// Opaque transaction capability handed to callbacks and record
/// operations. Cloning shares the underlying transaction.
#[derive(Clone)]
pub struct Tx {
    raw: Arc<dyn Transaction>,
}

impl Tx {
    pub(crate) fn new(raw: Arc<dyn Transaction>) -> Self {
        Tx { raw }
    }

    pub(crate) fn store(&self, name: &str) -> Result<Box<dyn Store>> {
        self.raw.store(name)
    }

    pub(crate) async fn commit(&self) -> Result<()> {
        self.raw.commit().await
    }

    pub(crate) async fn abort(&self) -> Result<()> {
        self.raw.abort().await
    }
}

/// Resolve a store handle for one operation. With a caller-supplied
/// transaction the handle must already span the store; without one, a
/// fresh transaction over exactly that store is opened and returned as
/// owned, for the caller to settle after the operation.
pub(crate) fn resolve(
    store_name: &str,
    mode: TxMode,
    existing: Option<&Tx>,
) -> Result<(Box<dyn Store>, Tx, bool)> {
    match existing {
        Some(tx) => Ok((tx.store(store_name)?, tx.clone(), false)),
        None => {
            let db = db::current()?;
            let tx = Tx::new(db.transaction(&[store_name.to_string()], mode)?);
            Ok((tx.store(store_name)?, tx.clone(), true))
        }
    }
}

/// Commit an owned transaction on success, abort it on failure, and
/// pass the outcome through.
pub(crate) async fn settle<T>(outcome: Result<T>, tx: &Tx, owned: bool) -> Result<T> {
    if !owned {
        return outcome;
    }
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(abort_err) = tx.abort().await {
                warn!("abort after a failed operation also failed: {abort_err}");
            }
            Err(err)
        }
    }
}

enum RaceOutcome<T> {
    Callback(Result<T>),
    Natural(TxOutcome),
}

/// Run `f` inside one transaction spanning the stores of `types`.
///
/// The callback's success commits, its error aborts before being
/// re-raised, and a natural completion while the callback is still
/// pending fails with [`Error::TransactionPrematurelyCompleted`].
pub async fn transact<T, F, Fut>(mode: TxMode, types: &[&str], f: F) -> Result<T>
where
    F: FnOnce(Tx) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let db = db::current()?;
    let mut stores: Vec<String> = Vec::new();
    for ty in types {
        let table = schema::resolve(ty)?;
        if table.template {
            return Err(Error::Validation(format!(
                "`{ty}` is a template type and has no store"
            )));
        }
        if !stores.contains(&table.store_name) {
            stores.push(table.store_name.clone());
        }
    }

    let raw = db.transaction(&stores, mode)?;
    let tx = Tx::new(raw.clone());

    let outcome = {
        let callback = Box::pin(f(tx));
        let completed = Box::pin(raw.completed());
        match select(callback, completed).await {
            Either::Left((result, _)) => RaceOutcome::Callback(result),
            Either::Right((natural, _)) => RaceOutcome::Natural(natural),
        }
    };

    match outcome {
        RaceOutcome::Callback(Ok(value)) => {
            raw.commit().await?;
            Ok(value)
        }
        RaceOutcome::Callback(Err(err)) => {
            if let Err(abort_err) = raw.abort().await {
                warn!("abort after callback failure also failed: {abort_err}");
            }
            Err(err)
        }
        RaceOutcome::Natural(natural) => {
            warn!(
                "transaction over {stores:?} reached natural completion ({natural}) before its callback settled"
            );
            Err(Error::TransactionPrematurelyCompleted { outcome: natural })
        }
    }
}
