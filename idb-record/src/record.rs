//! Typed record behavior. `Record` is the derive target; `Model` adds
//! the persistence operations, blanket-implemented for every record
//! type. Every operation takes an optional transaction; without one it
//! opens an implicit single-store transaction and settles it after the
//! operation.

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::engine::TxMode;
use crate::filter::Filter;
use crate::query::Query;
use crate::schema::{self, ResolvedTable};
use crate::transaction::{self, Tx};
use crate::value::{Key, extract_key, to_object};
use crate::{Error, Result};

/// A declared record type, mapped to one store through the registry.
/// Implemented with `#[derive(Record)]`.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + Sized + 'static {
    /// Registry key for this type.
    fn table() -> &'static str;
}

fn storable<T: Record>() -> Result<ResolvedTable> {
    let table = schema::resolve(T::table())?;
    if table.template {
        return Err(Error::Validation(format!(
            "`{}` is a template type and has no store",
            T::table()
        )));
    }
    Ok(table)
}

/// Persistence operations over a [`Record`].
pub trait Model: Record {
    fn query() -> Query<Self> {
        Query::new()
    }

    fn filter(field: impl Into<String>, filter: impl Into<Filter>) -> Query<Self> {
        Query::new().filter(field, filter)
    }

    fn order_by(field: &str) -> Query<Self> {
        Query::new().order_by(field)
    }

    /// Create and persist a record from a partial value object.
    /// Declared fields without an entry receive their default; a
    /// non-nullable field left without a value fails validation. The
    /// write is insert-only, so an existing key is a constraint error.
    fn create(
        values: impl Serialize + Send,
        tx: Option<&Tx>,
    ) -> impl Future<Output = Result<Self>> + Send {
        async move {
            let table = storable::<Self>()?;
            let mut row = to_object(serde_json::to_value(values)?)?;
            for field in &table.fields {
                if !row.contains_key(&field.name) {
                    if let Some(default) = field.default {
                        row.insert(field.name.clone(), default());
                    }
                }
                let missing = matches!(
                    row.get(&field.name),
                    None | Some(serde_json::Value::Null)
                );
                if missing && !field.nullable {
                    return Err(Error::Validation(format!(
                        "field `{}` is not nullable",
                        field.name
                    )));
                }
            }
            let key = extract_key(&table.key_fields, &row)?;
            let record: Self = serde_json::from_value(serde_json::Value::Object(row.clone()))?;
            let (store, tx, owned) = transaction::resolve(&table.store_name, TxMode::ReadWrite, tx)?;
            let outcome = store.insert(&key, row).await;
            transaction::settle(outcome, &tx, owned).await?;
            Ok(record)
        }
    }

    /// Fetch by primary key; absence is `None`, never an error.
    fn get(
        key: impl Into<Key> + Send,
        tx: Option<&Tx>,
    ) -> impl Future<Output = Result<Option<Self>>> + Send {
        async move {
            let table = storable::<Self>()?;
            let key = key.into();
            let (store, tx, owned) = transaction::resolve(&table.store_name, TxMode::ReadOnly, tx)?;
            let outcome = store.get(&key).await;
            let row = transaction::settle(outcome, &tx, owned).await?;
            row.map(|row| Ok(serde_json::from_value(serde_json::Value::Object(row))?))
                .transpose()
        }
    }

    fn all(tx: Option<&Tx>) -> impl Future<Output = Result<Vec<Self>>> + Send {
        let mut query = Self::query();
        if let Some(tx) = tx {
            query = query.within(tx);
        }
        query.all()
    }

    fn count(tx: Option<&Tx>) -> impl Future<Output = Result<u64>> + Send {
        let mut query = Self::query();
        if let Some(tx) = tx {
            query = query.within(tx);
        }
        query.count()
    }

    /// Every stored primary key, without materializing records.
    fn keys(tx: Option<&Tx>) -> impl Future<Output = Result<Vec<Key>>> + Send {
        let mut query = Self::query();
        if let Some(tx) = tx {
            query = query.within(tx);
        }
        query.keys()
    }

    /// Unconditionally empty the backing store.
    fn clear(tx: Option<&Tx>) -> impl Future<Output = Result<()>> + Send {
        async move {
            let table = storable::<Self>()?;
            let (store, tx, owned) = transaction::resolve(&table.store_name, TxMode::ReadWrite, tx)?;
            let outcome = store.clear().await;
            transaction::settle(outcome, &tx, owned).await
        }
    }

    /// The ordered primary-key component values of this record.
    fn key(&self) -> Result<Key> {
        let table = storable::<Self>()?;
        let row = to_object(serde_json::to_value(self)?)?;
        extract_key(&table.key_fields, &row)
    }

    /// Full overwrite under this record's key.
    fn save(&self, tx: Option<&Tx>) -> impl Future<Output = Result<()>> + Send {
        async move {
            let table = storable::<Self>()?;
            let row = to_object(serde_json::to_value(self)?)?;
            let key = extract_key(&table.key_fields, &row)?;
            let (store, tx, owned) = transaction::resolve(&table.store_name, TxMode::ReadWrite, tx)?;
            let outcome = store.put(&key, row).await;
            transaction::settle(outcome, &tx, owned).await
        }
    }

    /// Delete this record's row by key.
    fn delete(&self, tx: Option<&Tx>) -> impl Future<Output = Result<()>> + Send {
        async move {
            let table = storable::<Self>()?;
            let row = to_object(serde_json::to_value(self)?)?;
            let key = extract_key(&table.key_fields, &row)?;
            let (store, tx, owned) = transaction::resolve(&table.store_name, TxMode::ReadWrite, tx)?;
            let outcome = store.delete(&key).await;
            transaction::settle(outcome, &tx, owned).await
        }
    }

    /// In-memory merge only; call `save` to persist the result.
    fn update(&mut self, values: impl Serialize) -> Result<()> {
        let patch = to_object(serde_json::to_value(values)?)?;
        let mut row = to_object(serde_json::to_value(&*self)?)?;
        for (field, value) in patch {
            row.insert(field, value);
        }
        *self = serde_json::from_value(serde_json::Value::Object(row))?;
        Ok(())
    }
}

impl<T: Record> Model for T {}
