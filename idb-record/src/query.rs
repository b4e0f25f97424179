//! The lazy query builder. Builder calls only accumulate state;
//! storage is touched when a terminal operation runs. Execution picks
//! the cheapest cursor the builder state allows, then applies every
//! filter entry and the skip/limit window uniformly per row.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::ControlFlow;

use async_stream::try_stream;
use futures::Stream;
use log::trace;

use crate::engine::{Cursor, Direction, TxMode};
use crate::filter::{Between, Filter};
use crate::record::Record;
use crate::schema::{self, ResolvedTable};
use crate::transaction::{self, Tx};
use crate::value::{Key, KeyRange, Row};
use crate::{Error, Result};

pub struct Query<T: Record> {
    filters: HashMap<String, Filter>,
    order: Option<String>,
    reverse: bool,
    index: Option<(String, Option<Between>)>,
    limit: Option<usize>,
    offset: usize,
    tx: Option<Tx>,
    conflict: bool,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Clone for Query<T> {
    fn clone(&self) -> Self {
        Query {
            filters: self.filters.clone(),
            order: self.order.clone(),
            reverse: self.reverse,
            index: self.index.clone(),
            limit: self.limit,
            offset: self.offset,
            tx: self.tx.clone(),
            conflict: self.conflict,
            _record: PhantomData,
        }
    }
}

impl<T: Record> Default for Query<T> {
    fn default() -> Self {
        Query::new()
    }
}

impl<T: Record> Query<T> {
    pub fn new() -> Self {
        Query {
            filters: HashMap::new(),
            order: None,
            reverse: false,
            index: None,
            limit: None,
            offset: 0,
            tx: None,
            conflict: false,
            _record: PhantomData,
        }
    }

    /// Keep rows whose `field` matches `filter`. Entries on distinct
    /// fields are conjunctive; a second entry on the same field
    /// replaces the first.
    pub fn filter(mut self, field: impl Into<String>, filter: impl Into<Filter>) -> Self {
        self.filters.insert(field.into(), filter.into());
        self
    }

    /// Order by an indexed field; a `-` prefix means descending.
    /// Mutually exclusive with `with_index`.
    pub fn order_by(mut self, field: &str) -> Self {
        if self.index.is_some() {
            self.conflict = true;
        }
        match field.strip_prefix('-') {
            Some(name) => {
                self.order = Some(name.to_string());
                self.reverse = true;
            }
            None => {
                self.order = Some(field.to_string());
                self.reverse = false;
            }
        }
        self
    }

    /// Flip the iteration direction.
    pub fn reverse(mut self) -> Self {
        self.reverse = !self.reverse;
        self
    }

    /// Drive the scan from a named index. Mutually exclusive with
    /// `order_by`.
    pub fn with_index(mut self, name: &str) -> Self {
        if self.order.is_some() {
            self.conflict = true;
        }
        self.index = Some((name.to_string(), None));
        self
    }

    /// Drive the scan from a named index, bounded to `range`.
    pub fn with_index_range(mut self, name: &str, range: Between) -> Self {
        if self.order.is_some() {
            self.conflict = true;
        }
        self.index = Some((name.to_string(), Some(range)));
        self
    }

    /// Cap the number of yielded rows.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Skip the first `n` matching rows.
    pub fn offset(mut self, n: usize) -> Self {
        self.offset = n;
        self
    }

    /// Run inside an existing scoped transaction instead of opening an
    /// implicit one.
    pub fn within(mut self, tx: &Tx) -> Self {
        self.tx = Some(tx.clone());
        self
    }

    fn storable(&self) -> Result<ResolvedTable> {
        let table = schema::resolve(T::table())?;
        if table.template {
            return Err(Error::Validation(format!(
                "`{}` is a template type and has no store",
                T::table()
            )));
        }
        Ok(table)
    }

    /// Cursor selection, in priority order: explicit index, ordering
    /// field, a lone literal/range filter over an indexed field, full
    /// store scan.
    fn choose_plan(&self, table: &ResolvedTable) -> Result<CursorPlan> {
        if self.conflict {
            return Err(Error::InvalidQuery(
                "`with_index` and `order_by` cannot be combined",
            ));
        }
        if let Some((name, range)) = &self.index {
            return Ok(CursorPlan::Index {
                name: name.clone(),
                range: range.as_ref().map(Between::key_range),
            });
        }
        if let Some(field) = &self.order {
            return Ok(CursorPlan::Index {
                name: field.clone(),
                range: None,
            });
        }
        let indexable = table.indexable();
        let mut candidate = None;
        for (field, filter) in &self.filters {
            let usable = matches!(filter, Filter::Value(_) | Filter::Range(_))
                && indexable.contains(&field.as_str());
            if usable {
                if candidate.is_some() {
                    candidate = None;
                    break;
                }
                candidate = Some((field, filter));
            }
        }
        if let Some((field, filter)) = candidate {
            let range = match filter {
                Filter::Value(value) => KeyRange::only(Key::from(value.clone())),
                Filter::Range(between) => between.key_range(),
                Filter::Test(_) => unreachable!(),
            };
            return Ok(CursorPlan::Index {
                name: field.clone(),
                range: Some(range),
            });
        }
        Ok(CursorPlan::Store)
    }

    fn matches(&self, row: &Row) -> bool {
        const NULL: serde_json::Value = serde_json::Value::Null;
        self.filters
            .iter()
            .all(|(field, filter)| filter.matches(row.get(field).unwrap_or(&NULL)))
    }

    async fn open(&self, mode: TxMode) -> Result<Scan> {
        let table = self.storable()?;
        let plan = self.choose_plan(&table)?;
        let (store, tx, owned) = transaction::resolve(&table.store_name, mode, self.tx.as_ref())?;
        let direction = if self.reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        trace!("query over `{}` uses {plan:?}", table.store_name);
        let cursor = match plan {
            CursorPlan::Index { name, range } => {
                store.index(&name)?.open_cursor(range, direction).await?
            }
            CursorPlan::Store => store.open_cursor(None, direction).await?,
        };
        Ok(Scan { cursor, tx, owned })
    }

    fn window(&self) -> Window {
        Window {
            offset: self.offset,
            limit: self.limit,
            matched: 0,
            yielded: 0,
        }
    }

    /// Yield at most one record.
    pub async fn first(self) -> Result<Option<T>> {
        let mut scan = self.open(TxMode::ReadOnly).await?;
        let outcome = async {
            let mut window = self.window();
            while !window.full() {
                let Some(entry) = scan.cursor.step().await? else {
                    break;
                };
                if !self.matches(&entry.row) {
                    continue;
                }
                match window.admit() {
                    Admit::Skip => continue,
                    Admit::Yield => return Ok(Some(materialize::<T>(entry.row)?)),
                    Admit::Done => break,
                }
            }
            Ok(None)
        }
        .await;
        transaction::settle(outcome, &scan.tx, scan.owned).await
    }

    /// Materialize every yielded row.
    pub async fn all(self) -> Result<Vec<T>> {
        let mut scan = self.open(TxMode::ReadOnly).await?;
        let outcome = async {
            let mut window = self.window();
            let mut records = Vec::new();
            while !window.full() {
                let Some(entry) = scan.cursor.step().await? else {
                    break;
                };
                if !self.matches(&entry.row) {
                    continue;
                }
                match window.admit() {
                    Admit::Skip => continue,
                    Admit::Yield => records.push(materialize::<T>(entry.row)?),
                    Admit::Done => break,
                }
            }
            Ok(records)
        }
        .await;
        transaction::settle(outcome, &scan.tx, scan.owned).await
    }

    /// Count yielded rows without materializing them. An unfiltered,
    /// unwindowed query counts at the store level instead of scanning.
    pub async fn count(self) -> Result<u64> {
        if self.filters.is_empty()
            && self.index.is_none()
            && self.order.is_none()
            && self.offset == 0
            && self.limit.is_none()
            && !self.conflict
        {
            let table = self.storable()?;
            let (store, tx, owned) =
                transaction::resolve(&table.store_name, TxMode::ReadOnly, self.tx.as_ref())?;
            let outcome = store.count().await;
            return transaction::settle(outcome, &tx, owned).await;
        }
        let mut scan = self.open(TxMode::ReadOnly).await?;
        let outcome = async {
            let mut window = self.window();
            let mut count = 0u64;
            while !window.full() {
                let Some(entry) = scan.cursor.step().await? else {
                    break;
                };
                if !self.matches(&entry.row) {
                    continue;
                }
                match window.admit() {
                    Admit::Skip => continue,
                    Admit::Yield => count += 1,
                    Admit::Done => break,
                }
            }
            Ok(count)
        }
        .await;
        transaction::settle(outcome, &scan.tx, scan.owned).await
    }

    /// Every yielded row's primary key, without materializing records.
    pub async fn keys(self) -> Result<Vec<Key>> {
        let mut scan = self.open(TxMode::ReadOnly).await?;
        let outcome = async {
            let mut window = self.window();
            let mut keys = Vec::new();
            while !window.full() {
                let Some(entry) = scan.cursor.step().await? else {
                    break;
                };
                if !self.matches(&entry.row) {
                    continue;
                }
                match window.admit() {
                    Admit::Skip => continue,
                    Admit::Yield => keys.push(entry.primary),
                    Admit::Done => break,
                }
            }
            Ok(keys)
        }
        .await;
        transaction::settle(outcome, &scan.tx, scan.owned).await
    }

    /// Delete every yielded row in place; returns the count.
    pub async fn delete(self) -> Result<u64> {
        let mut scan = self.open(TxMode::ReadWrite).await?;
        let outcome = async {
            let mut window = self.window();
            let mut deleted = 0u64;
            while !window.full() {
                let Some(entry) = scan.cursor.step().await? else {
                    break;
                };
                if !self.matches(&entry.row) {
                    continue;
                }
                match window.admit() {
                    Admit::Skip => continue,
                    Admit::Yield => {
                        scan.cursor.delete().await?;
                        deleted += 1;
                    }
                    Admit::Done => break,
                }
            }
            Ok(deleted)
        }
        .await;
        transaction::settle(outcome, &scan.tx, scan.owned).await
    }

    /// Merge `patch` into every yielded row and write it back in place;
    /// returns the count. The primary key must not change.
    pub async fn update(self, patch: impl serde::Serialize) -> Result<u64> {
        let patch = crate::value::to_object(serde_json::to_value(patch)?)?;
        let mut scan = self.open(TxMode::ReadWrite).await?;
        let outcome = async {
            let mut window = self.window();
            let mut updated = 0u64;
            while !window.full() {
                let Some(entry) = scan.cursor.step().await? else {
                    break;
                };
                if !self.matches(&entry.row) {
                    continue;
                }
                match window.admit() {
                    Admit::Skip => continue,
                    Admit::Yield => {
                        let mut row = entry.row;
                        for (field, value) in &patch {
                            row.insert(field.clone(), value.clone());
                        }
                        scan.cursor.update(row).await?;
                        updated += 1;
                    }
                    Admit::Done => break,
                }
            }
            Ok(updated)
        }
        .await;
        transaction::settle(outcome, &scan.tx, scan.owned).await
    }

    /// Invoke `f` with every yielded record and the active transaction,
    /// in `mode`. Returning `ControlFlow::Break` stops the iteration.
    /// This is the escape hatch for interleaving reads and writes
    /// against the same transaction across consecutive rows.
    pub async fn for_each<F, Fut>(self, mode: TxMode, mut f: F) -> Result<()>
    where
        F: FnMut(T, Tx) -> Fut,
        Fut: Future<Output = Result<ControlFlow<()>>>,
    {
        let mut scan = self.open(mode).await?;
        let tx = scan.tx.clone();
        let outcome = async {
            let mut window = self.window();
            while !window.full() {
                let Some(entry) = scan.cursor.step().await? else {
                    break;
                };
                if !self.matches(&entry.row) {
                    continue;
                }
                match window.admit() {
                    Admit::Skip => continue,
                    Admit::Yield => {
                        let record = materialize::<T>(entry.row)?;
                        if f(record, tx.clone()).await?.is_break() {
                            break;
                        }
                    }
                    Admit::Done => break,
                }
            }
            Ok(())
        }
        .await;
        transaction::settle(outcome, &scan.tx, scan.owned).await
    }

    /// Lazily stream yielded records over an implicit read-only
    /// transaction.
    pub fn stream(self) -> impl Stream<Item = Result<T>> + Send {
        try_stream! {
            let mut scan = self.open(TxMode::ReadOnly).await?;
            let mut window = self.window();
            while !window.full() {
                let Some(entry) = scan.cursor.step().await? else {
                    break;
                };
                if !self.matches(&entry.row) {
                    continue;
                }
                match window.admit() {
                    Admit::Skip => continue,
                    Admit::Yield => yield materialize::<T>(entry.row)?,
                    Admit::Done => break,
                }
            }
            if scan.owned {
                scan.tx.commit().await?;
            }
        }
    }
}

#[derive(Debug)]
enum CursorPlan {
    Index {
        name: String,
        range: Option<KeyRange>,
    },
    Store,
}

struct Scan {
    cursor: Box<dyn Cursor>,
    tx: Tx,
    owned: bool,
}

/// Skip/limit bookkeeping shared by every terminal operation. Rows
/// failing a filter never reach it.
struct Window {
    offset: usize,
    limit: Option<usize>,
    matched: usize,
    yielded: usize,
}

enum Admit {
    Skip,
    Yield,
    Done,
}

impl Window {
    fn full(&self) -> bool {
        self.limit.is_some_and(|limit| self.yielded >= limit)
    }

    fn admit(&mut self) -> Admit {
        if self.full() {
            return Admit::Done;
        }
        self.matched += 1;
        if self.matched <= self.offset {
            return Admit::Skip;
        }
        self.yielded += 1;
        Admit::Yield
    }
}

fn materialize<T: Record>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::Object(row))?)
}
