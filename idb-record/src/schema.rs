//! Schema metadata registry. Record types declared with
//! `#[derive(Record)]` register a [`TableMeta`] through `inventory` at
//! startup; tests and migration tooling can re-declare a table at
//! runtime with [`register`]. Descriptors are resolved on demand,
//! composing `extends` chains field by field.

use std::collections::{HashMap, HashSet};
use std::sync::{LazyLock, RwLock};

use log::warn;

use crate::engine::{IndexPlan, StorePlan};
use crate::{Error, Result};

/// Default generator for a field, producing the stored JSON value.
/// A static default is just the constant case.
pub type DefaultFn = fn() -> serde_json::Value;

#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub primary_key: bool,
    pub unique: bool,
    pub nullable: bool,
    pub indexed: bool,
    pub default: Option<DefaultFn>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>) -> Self {
        FieldDef {
            name: name.into(),
            primary_key: false,
            unique: false,
            nullable: false,
            indexed: true,
            default: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unindexed(mut self) -> Self {
        self.indexed = false;
        self
    }

    pub fn default(mut self, default: DefaultFn) -> Self {
        self.default = Some(default);
        self
    }
}

/// An extra named index over one or more declared fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
    pub multi: bool,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        IndexDef {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
            multi: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }
}

/// Static registration payload emitted by `#[derive(Record)]`.
pub struct TableMeta {
    pub type_name: &'static str,
    pub store: Option<&'static str>,
    pub template: bool,
    pub extends: Option<&'static str>,
    pub fields: fn() -> Vec<FieldDef>,
    pub indexes: fn() -> Vec<IndexDef>,
}

inventory::collect!(TableMeta);

/// Runtime-registered table declaration.
#[derive(Clone, Debug, Default)]
pub struct TableDef {
    pub type_name: String,
    pub store: Option<String>,
    pub template: bool,
    pub extends: Option<String>,
    pub fields: Vec<FieldDef>,
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn new(type_name: impl Into<String>) -> Self {
        TableDef {
            type_name: type_name.into(),
            ..TableDef::default()
        }
    }

    pub fn store(mut self, store: impl Into<String>) -> Self {
        self.store = Some(store.into());
        self
    }

    pub fn template(mut self) -> Self {
        self.template = true;
        self
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }
}

static RUNTIME: LazyLock<RwLock<HashMap<String, TableDef>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Declare (or re-declare) a table at runtime. A runtime declaration
/// shadows a derive-emitted one with the same type name.
pub fn register(def: TableDef) {
    RUNTIME.write().unwrap().insert(def.type_name.clone(), def);
}

pub fn unregister(type_name: &str) {
    RUNTIME.write().unwrap().remove(type_name);
}

fn raw(type_name: &str) -> Option<TableDef> {
    if let Some(def) = RUNTIME.read().unwrap().get(type_name) {
        return Some(def.clone());
    }
    inventory::iter::<TableMeta>
        .into_iter()
        .find(|meta| meta.type_name == type_name)
        .map(|meta| TableDef {
            type_name: meta.type_name.to_string(),
            store: meta.store.map(str::to_string),
            template: meta.template,
            extends: meta.extends.map(str::to_string),
            fields: (meta.fields)(),
            indexes: (meta.indexes)(),
        })
}

/// Every registered type name.
pub fn tables() -> Vec<String> {
    let mut names: HashSet<String> = inventory::iter::<TableMeta>
        .into_iter()
        .map(|meta| meta.type_name.to_string())
        .collect();
    names.extend(RUNTIME.read().unwrap().keys().cloned());
    let mut names: Vec<String> = names.into_iter().collect();
    names.sort();
    names
}

/// Effective descriptor for one record type, with the `extends` chain
/// folded in.
#[derive(Clone, Debug)]
pub struct ResolvedTable {
    pub type_name: String,
    pub store_name: String,
    pub template: bool,
    pub fields: Vec<FieldDef>,
    pub indexes: Vec<IndexDef>,
    pub key_fields: Vec<String>,
    pub has_concrete_subtype: bool,
}

impl ResolvedTable {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields carrying their own single-field index: indexed or unique,
    /// and not part of the primary key (the key path is not an index).
    pub fn indexable(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| (f.indexed || f.unique) && !f.primary_key)
            .map(|f| f.name.as_str())
            .collect()
    }
}

fn chain_of(type_name: &str) -> Result<Vec<TableDef>> {
    let def = raw(type_name).ok_or_else(|| Error::NoSuchTable(type_name.to_string()))?;
    let mut seen: HashSet<String> = HashSet::from([def.type_name.clone()]);
    let mut chain = vec![def];
    while let Some(parent_name) = chain.last().and_then(|d| d.extends.clone()) {
        if !seen.insert(parent_name.clone()) {
            return Err(Error::Validation(format!(
                "inheritance cycle through `{parent_name}`"
            )));
        }
        let parent =
            raw(&parent_name).ok_or_else(|| Error::NoSuchTable(parent_name.to_string()))?;
        chain.push(parent);
    }
    Ok(chain)
}

/// Resolve one type's effective descriptor. Declaration errors surface
/// here, before any storage is touched.
pub fn resolve(type_name: &str) -> Result<ResolvedTable> {
    let chain = chain_of(type_name)?;

    // parent chain first, own entries shadowing by name
    let mut fields: Vec<FieldDef> = Vec::new();
    let mut indexes: Vec<IndexDef> = Vec::new();
    for def in chain.iter().rev() {
        for field in &def.fields {
            match fields.iter_mut().find(|f| f.name == field.name) {
                Some(slot) => *slot = field.clone(),
                None => fields.push(field.clone()),
            }
        }
        for index in &def.indexes {
            match indexes.iter_mut().find(|ix| ix.name == index.name) {
                Some(slot) => *slot = index.clone(),
                None => indexes.push(index.clone()),
            }
        }
    }

    for field in &fields {
        if field.primary_key && field.nullable {
            return Err(Error::Validation(format!(
                "primary-key field `{}` cannot be nullable",
                field.name
            )));
        }
    }
    for index in &indexes {
        if index.fields.is_empty() {
            return Err(Error::Validation(format!(
                "index `{}` covers no fields",
                index.name
            )));
        }
        if index.multi && index.fields.len() != 1 {
            return Err(Error::Validation(format!(
                "multi-valued index `{}` must cover exactly one field",
                index.name
            )));
        }
        if index.multi && index.unique {
            return Err(Error::Validation(format!(
                "index `{}` cannot be both unique and multi-valued",
                index.name
            )));
        }
        for field in &index.fields {
            if !fields.iter().any(|f| &f.name == field) {
                return Err(Error::Validation(format!(
                    "index `{}` references unknown field `{field}`",
                    index.name
                )));
            }
        }
    }

    let leaf = &chain[0];
    let key_fields: Vec<String> = fields
        .iter()
        .filter(|f| f.primary_key)
        .map(|f| f.name.clone())
        .collect();
    if key_fields.is_empty() && !leaf.template {
        return Err(Error::Validation(format!(
            "`{type_name}` declares no primary-key field"
        )));
    }

    let has_concrete_subtype = tables().iter().any(|other| {
        other != type_name
            && chain_of(other).is_ok_and(|chain| {
                !chain[0].template && chain.iter().skip(1).any(|d| d.type_name == type_name)
            })
    });

    Ok(ResolvedTable {
        store_name: leaf.store.clone().unwrap_or_else(|| leaf.type_name.clone()),
        type_name: leaf.type_name.clone(),
        template: leaf.template,
        fields,
        indexes,
        key_fields,
        has_concrete_subtype,
    })
}

/// The engine-facing layout of every materialized table: one store per
/// non-template type, one index per indexable field (named after it),
/// plus the extra named indexes.
pub fn plan() -> Result<Vec<StorePlan>> {
    let mut stores = Vec::new();
    for name in tables() {
        let table = resolve(&name)?;
        if table.template {
            if !table.has_concrete_subtype {
                warn!("template type `{name}` has no concrete subtype and is never materialized");
            }
            continue;
        }
        let mut indexes: Vec<IndexPlan> = table
            .indexable()
            .iter()
            .map(|field| IndexPlan {
                name: field.to_string(),
                fields: vec![field.to_string()],
                unique: table.field(field).is_some_and(|f| f.unique),
                multi: false,
            })
            .collect();
        for index in &table.indexes {
            indexes.push(IndexPlan {
                name: index.name.clone(),
                fields: index.fields.clone(),
                unique: index.unique,
                multi: index.multi,
            });
        }
        stores.push(StorePlan {
            name: table.store_name.clone(),
            key: table.key_fields.clone(),
            indexes,
        });
    }
    Ok(stores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    // the registry is process-global; these tests mutate it
    static LOCK: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[test]
    fn resolve_composes_extends_chain() {
        let _guard = serial();
        register(
            TableDef::new("schema_test_base")
                .template()
                .field(FieldDef::new("id").primary_key())
                .field(FieldDef::new("created")),
        );
        register(
            TableDef::new("schema_test_child")
                .extends("schema_test_base")
                .field(FieldDef::new("name").unique()),
        );

        let child = resolve("schema_test_child").unwrap();
        assert_eq!(child.key_fields, vec!["id"]);
        assert!(child.field("created").is_some());
        assert!(!child.template);

        let base = resolve("schema_test_base").unwrap();
        assert!(base.template);
        assert!(base.has_concrete_subtype);

        unregister("schema_test_child");
        unregister("schema_test_base");
    }

    #[test]
    fn nullable_primary_key_is_rejected() {
        let _guard = serial();
        register(
            TableDef::new("schema_test_bad_pk")
                .field(FieldDef::new("id").primary_key().nullable()),
        );
        let err = resolve("schema_test_bad_pk").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        unregister("schema_test_bad_pk");
    }

    #[test]
    fn multi_index_rules_are_enforced() {
        let _guard = serial();
        register(
            TableDef::new("schema_test_bad_multi")
                .field(FieldDef::new("id").primary_key())
                .field(FieldDef::new("a"))
                .field(FieldDef::new("b"))
                .index(IndexDef::new("ab", ["a", "b"]).multi()),
        );
        assert!(matches!(
            resolve("schema_test_bad_multi").unwrap_err(),
            Error::Validation(_)
        ));
        unregister("schema_test_bad_multi");

        register(
            TableDef::new("schema_test_unique_multi")
                .field(FieldDef::new("id").primary_key())
                .field(FieldDef::new("tags"))
                .index(IndexDef::new("tags", ["tags"]).multi().unique()),
        );
        assert!(matches!(
            resolve("schema_test_unique_multi").unwrap_err(),
            Error::Validation(_)
        ));
        unregister("schema_test_unique_multi");
    }

    #[test]
    fn plan_excludes_primary_key_from_auto_indexes() {
        let _guard = serial();
        register(
            TableDef::new("schema_test_plan")
                .store("plan_rows")
                .field(FieldDef::new("id").primary_key())
                .field(FieldDef::new("name"))
                .field(FieldDef::new("secret").unindexed()),
        );
        let plan = plan().unwrap();
        let store = plan.iter().find(|s| s.name == "plan_rows").unwrap();
        assert_eq!(store.key, vec!["id"]);
        assert!(store.indexes.iter().any(|ix| ix.name == "name"));
        assert!(!store.indexes.iter().any(|ix| ix.name == "id"));
        assert!(!store.indexes.iter().any(|ix| ix.name == "secret"));
        unregister("schema_test_plan");
    }
}
