//! Versioned table layouts
//!
//! Each resource type has an ordered list of named versions. Preparing
//! storage applies, in order, every version not yet recorded in the
//! type's versions table. Moving from one version to the next only touches
//! tables whose layout differs:
//!
//! 1. Changed tables are renamed out of the way ("parked").
//! 2. Changed and added tables are created with the new layout.
//! 3. Columns both layouts share are copied back from the parked tables.
//! 4. The version's migration function runs, seeing the parked tables.
//! 5. Parked tables and tables the new version no longer has are dropped.
//!
//! Nothing here commits; a failure part way leaves the surrounding
//! transaction to roll everything back.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::schema::{schema_for_shape, ObjectShape, Schema, TableScope};
use crate::sql::{ColumnType, SqlValue, Transaction};

/// Called after a version's tables are in place
///
/// The map goes from table name to the parked copy of its old contents.
/// It is empty for the first version.
pub type MigrationFn = Box<
    dyn Fn(&Transaction<'_>, &BTreeMap<String, String>) -> StorageResult<()> + Send + Sync,
>;

const VERSIONS_TABLE: &str = "versions";
const VERSION_COLUMN: &str = "version";

/// One named layout of a resource type
pub struct Version {
    name: String,
    prototypes: Vec<(Value, TableScope)>,
    migration: Option<MigrationFn>,
    schema: Schema,
}

impl Version {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prototypes(&self) -> &[(Value, TableScope)] {
        &self.prototypes
    }

    /// Merged tables of every prototype in this version
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn migrate(&self, t: &Transaction<'_>, parked: &BTreeMap<String, String>) -> StorageResult<()> {
        match &self.migration {
            Some(func) => func(t, parked),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Version")
            .field("name", &self.name)
            .field("prototypes", &self.prototypes)
            .field("migration", &self.migration.is_some())
            .finish()
    }
}

/// Builder for [`VersionedStorage`]
pub struct VersionedStorageBuilder {
    resource_type: String,
    versions: Vec<(String, Option<MigrationFn>, Vec<(Value, TableScope)>)>,
    error: Option<StorageError>,
}

impl VersionedStorageBuilder {
    /// Begin a version without a migration function
    pub fn start_version(mut self, name: impl Into<String>) -> Self {
        self.versions.push((name.into(), None, Vec::new()));
        self
    }

    /// Begin a version whose data is fixed up by `func`
    pub fn start_version_with<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Transaction<'_>, &BTreeMap<String, String>) -> StorageResult<()>
            + Send
            + Sync
            + 'static,
    {
        let migration: MigrationFn = Box::new(func);
        self.versions.push((name.into(), Some(migration), Vec::new()));
        self
    }

    /// Add a prototype to the most recently started version
    pub fn add_prototype(mut self, prototype: Value, scope: TableScope) -> Self {
        match self.versions.last_mut() {
            Some((_, _, prototypes)) => prototypes.push((prototype, scope)),
            None => {
                self.error.get_or_insert(StorageError::InvalidVersion(
                    "add_prototype called before start_version".to_string(),
                ));
            }
        }
        self
    }

    pub fn build(self) -> StorageResult<VersionedStorage> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let mut versions: Vec<Version> = Vec::new();
        for (name, migration, prototypes) in self.versions {
            if versions.iter().any(|v| v.name == name) {
                return Err(StorageError::InvalidVersion(format!(
                    "version '{name}' registered twice"
                )));
            }

            // Prototypes sharing a scope describe one object
            let mut shapes: Vec<(&TableScope, ObjectShape)> = Vec::new();
            for (prototype, scope) in &prototypes {
                let shape = ObjectShape::from_prototype(prototype)?;
                match shapes.iter_mut().find(|(s, _)| *s == scope) {
                    Some((_, existing)) => existing.merge(shape)?,
                    None => shapes.push((scope, shape)),
                }
            }
            let mut schema = Schema::default();
            for (scope, shape) in &shapes {
                let root = scope.root_table(&self.resource_type)?;
                schema.merge(schema_for_shape(shape, &root)?)?;
            }
            versions.push(Version {
                name,
                prototypes,
                migration,
                schema,
            });
        }

        Ok(VersionedStorage {
            resource_type: self.resource_type,
            versions,
        })
    }
}

/// Ordered versions of one resource type's tables
#[derive(Debug)]
pub struct VersionedStorage {
    resource_type: String,
    versions: Vec<Version>,
}

impl VersionedStorage {
    pub fn builder(resource_type: impl Into<String>) -> VersionedStorageBuilder {
        VersionedStorageBuilder {
            resource_type: resource_type.into(),
            versions: Vec::new(),
            error: None,
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    /// Name of the table recording applied versions
    pub fn versions_table(&self) -> StorageResult<String> {
        TableScope::Aux(VERSIONS_TABLE.to_string()).root_table(&self.resource_type)
    }

    /// Bring the stored tables up to the latest version
    ///
    /// Versions already recorded are skipped, so running this again is a
    /// no-op.
    pub fn prepare_storage(&self, t: &Transaction<'_>) -> StorageResult<()> {
        let versions_table = self.versions_table()?;
        if !t.table_exists(&versions_table)? {
            t.create_table(&versions_table, &[(VERSION_COLUMN, ColumnType::Text)])?;
        }

        let applied: BTreeSet<String> = t
            .select(&versions_table, &[VERSION_COLUMN], None)?
            .into_iter()
            .filter_map(|row| row.get(VERSION_COLUMN)?.as_str().map(str::to_string))
            .collect();
        info!(
            "Previously prepared versions of {}: {:?}",
            self.resource_type, applied
        );

        let Some(first) = self.versions.first() else {
            return Ok(());
        };
        if !applied.contains(&first.name) {
            self.prepare_first_version(t, first)?;
            self.remember_version(t, &versions_table, first)?;
        }

        for pair in self.versions.windows(2) {
            let (old, new) = (&pair[0], &pair[1]);
            if !applied.contains(&new.name) {
                self.prepare_next_version(t, old, new)?;
                self.remember_version(t, &versions_table, new)?;
            }
        }
        Ok(())
    }

    fn remember_version(
        &self,
        t: &Transaction<'_>,
        versions_table: &str,
        version: &Version,
    ) -> StorageResult<()> {
        t.insert(
            versions_table,
            &[(VERSION_COLUMN, SqlValue::from(version.name.as_str()))],
        )
    }

    fn prepare_first_version(&self, t: &Transaction<'_>, version: &Version) -> StorageResult<()> {
        info!(
            "Preparing first version {} of {}",
            version.name, self.resource_type
        );
        for table in version.schema.tables() {
            t.create_table(&table.name, &table.column_defs())?;
        }
        version.migrate(t, &BTreeMap::new())
    }

    fn prepare_next_version(
        &self,
        t: &Transaction<'_>,
        old: &Version,
        new: &Version,
    ) -> StorageResult<()> {
        info!(
            "Upgrading {} from version {} to {}",
            self.resource_type, old.name, new.name
        );

        let old_tables = old.schema.table_columns();
        let new_tables = new.schema.table_columns();

        let changed: Vec<&str> = new_tables
            .iter()
            .filter(|(name, columns)| {
                old_tables
                    .get(*name)
                    .is_some_and(|old| old != *columns)
            })
            .map(|(name, _)| *name)
            .collect();
        let removed: Vec<&str> = old_tables
            .keys()
            .filter(|name| !new_tables.contains_key(*name))
            .copied()
            .collect();

        let mut parked = BTreeMap::new();
        for table in &changed {
            let parked_name = park_table(t, table)?;
            parked.insert(table.to_string(), parked_name);
        }
        if !parked.is_empty() {
            info!("Parked tables: {:?}", parked);
        }

        // Changed and added tables, in declaration order
        for table in new.schema.tables() {
            if !old_tables.contains_key(table.name.as_str()) || parked.contains_key(&table.name) {
                t.create_table(&table.name, &table.column_defs())?;
            }
        }

        for table in &changed {
            let new_columns: BTreeSet<&str> = new_tables[table].iter().map(|(c, _)| *c).collect();
            let shared: Vec<&str> = old_tables[table]
                .iter()
                .map(|(c, _)| *c)
                .filter(|c| new_columns.contains(c))
                .collect();
            if !shared.is_empty() {
                copy_shared_columns(t, &parked[*table], table, &shared)?;
            }
        }

        new.migrate(t, &parked)?;

        for parked_name in parked.values() {
            t.drop_table(parked_name)?;
        }
        for table in removed {
            t.drop_table(table)?;
        }
        Ok(())
    }
}

/// Rename `table` to a fresh `<table>_<random>` name and return that name
fn park_table(t: &Transaction<'_>, table: &str) -> StorageResult<String> {
    loop {
        let candidate = format!("{table}_{}", Uuid::new_v4().simple());
        if t.table_exists(&candidate)? {
            warn!("Parking name {} is taken, trying another", candidate);
            continue;
        }
        t.rename_table(table, &candidate)?;
        return Ok(candidate);
    }
}

/// Copy `columns` row by row, leaving out nulls and all-null rows
fn copy_shared_columns(
    t: &Transaction<'_>,
    from: &str,
    to: &str,
    columns: &[&str],
) -> StorageResult<()> {
    for row in t.select(from, columns, None)? {
        let values: Vec<(&str, SqlValue)> = columns
            .iter()
            .filter_map(|c| match row.get(*c) {
                Some(value) if !value.is_null() => Some((*c, value.clone())),
                _ => None,
            })
            .collect();
        if !values.is_empty() {
            t.insert(to, &values)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Condition, Database};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn user_tables(t: &Transaction<'_>) -> Vec<String> {
        let tables = Condition::eq("sqlite_master", "type", "table");
        let rows = t.select("sqlite_master", &["name"], Some(&tables)).unwrap();
        let mut names: Vec<String> = rows
            .iter()
            .filter_map(|r| r["name"].as_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    fn v1() -> VersionedStorage {
        VersionedStorage::builder("person")
            .start_version("v1")
            .add_prototype(json!({"id": "", "name": "", "age": 0}), TableScope::Main)
            .build()
            .unwrap()
    }

    fn v2() -> VersionedStorageBuilder {
        VersionedStorage::builder("person")
            .start_version("v1")
            .add_prototype(json!({"id": "", "name": "", "age": 0}), TableScope::Main)
            .start_version("v2")
            .add_prototype(
                json!({"id": "", "name": "", "nick": "", "aliases": [""]}),
                TableScope::Main,
            )
    }

    fn insert_person(t: &Transaction<'_>, id: &str, name: &str, age: i64) {
        t.insert(
            "person",
            &[
                ("id", SqlValue::from(id)),
                ("name", SqlValue::from(name)),
                ("age", SqlValue::from(age)),
            ],
        )
        .unwrap();
    }

    #[test]
    fn test_first_version_creates_tables() {
        let mut db = Database::open_in_memory().unwrap();
        let t = db.begin().unwrap();
        v1().prepare_storage(&t).unwrap();

        assert_eq!(user_tables(&t), vec!["person", "person__aux_versions"]);
        let versions = t.select("person__aux_versions", &["version"], None).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0]["version"], SqlValue::from("v1"));
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let mut db = Database::open_in_memory().unwrap();
        let vs = v2().build().unwrap();
        let t = db.begin().unwrap();
        vs.prepare_storage(&t).unwrap();
        t.insert(
            "person",
            &[("id", SqlValue::from("p1")), ("name", SqlValue::from("Bond"))],
        )
        .unwrap();
        let tables = user_tables(&t);

        vs.prepare_storage(&t).unwrap();

        assert_eq!(user_tables(&t), tables);
        let rows = t.select("person", &["id", "name"], None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], SqlValue::from("Bond"));
        assert_eq!(t.select("person__aux_versions", &["version"], None).unwrap().len(), 2);
    }

    #[test]
    fn test_migration_preserves_shared_columns() {
        let mut db = Database::open_in_memory().unwrap();
        {
            let t = db.begin().unwrap();
            v1().prepare_storage(&t).unwrap();
            insert_person(&t, "p1", "Bond", 40);
            insert_person(&t, "p2", "Moneypenny", 30);
            t.commit().unwrap();
        }

        let t = db.begin().unwrap();
        v2().build().unwrap().prepare_storage(&t).unwrap();

        let rows = t.select("person", &["id", "name", "nick"], None).unwrap();
        let names: Vec<_> = rows.iter().map(|r| (r["id"].clone(), r["name"].clone())).collect();
        assert_eq!(
            names,
            vec![
                (SqlValue::from("p1"), SqlValue::from("Bond")),
                (SqlValue::from("p2"), SqlValue::from("Moneypenny")),
            ]
        );
        assert!(rows.iter().all(|r| r["nick"].is_null()));
        // The dropped column is gone and nothing is left parked
        assert!(t.select("person", &["age"], None).is_err());
        assert_eq!(
            user_tables(&t),
            vec!["person", "person__aux_versions", "person_aliases"]
        );
    }

    #[test]
    fn test_added_table_leaves_others_alone() {
        let mut db = Database::open_in_memory().unwrap();
        let t = db.begin().unwrap();
        VersionedStorage::builder("thing")
            .start_version("1")
            .add_prototype(json!({"id": "", "a": ""}), TableScope::Main)
            .build()
            .unwrap()
            .prepare_storage(&t)
            .unwrap();
        t.insert("thing", &[("id", SqlValue::from("x")), ("a", SqlValue::from("keep"))])
            .unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        VersionedStorage::builder("thing")
            .start_version("1")
            .add_prototype(json!({"id": "", "a": ""}), TableScope::Main)
            .start_version_with("2", move |_, parked| {
                seen.lock().unwrap().push(parked.clone());
                Ok(())
            })
            .add_prototype(json!({"id": "", "a": "", "tags": [""]}), TableScope::Main)
            .build()
            .unwrap()
            .prepare_storage(&t)
            .unwrap();

        // Only the new list table was created; the root table was not parked
        assert_eq!(*log.lock().unwrap(), vec![BTreeMap::new()]);
        let rows = t.select("thing", &["id", "a"], None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["a"], SqlValue::from("keep"));
        assert!(t.table_exists("thing_tags").unwrap());
    }

    #[test]
    fn test_changed_list_table_keeps_order() {
        use crate::storage::read_only::ReadOnlyStorage;
        use crate::storage::resource::ResourceDefinition;
        use crate::storage::write_only::WriteOnlyStorage;

        let old = json!({"id": "", "dicts": [{"a": "", "tags": [""]}]});
        let new = json!({"id": "", "dicts": [{"a": "", "b": 0, "tags": [""]}]});

        let mut db = Database::open_in_memory().unwrap();
        let t = db.begin().unwrap();
        VersionedStorage::builder("thing")
            .start_version("1")
            .add_prototype(old.clone(), TableScope::Main)
            .build()
            .unwrap()
            .prepare_storage(&t)
            .unwrap();
        let added = WriteOnlyStorage::new(ResourceDefinition::new("thing", old.clone()).unwrap())
            .add_item(
                &t,
                &json!({"dicts": [
                    {"a": "first", "tags": ["t1", "t2", "t3"]},
                    {"a": "second", "tags": []},
                    {"a": "third", "tags": ["t4"]},
                ]}),
            )
            .unwrap();
        let id = added["id"].as_str().unwrap();

        VersionedStorage::builder("thing")
            .start_version("1")
            .add_prototype(old, TableScope::Main)
            .start_version("2")
            .add_prototype(new.clone(), TableScope::Main)
            .build()
            .unwrap()
            .prepare_storage(&t)
            .unwrap();

        let ro = ReadOnlyStorage::new(ResourceDefinition::new("thing", new).unwrap());
        assert_eq!(
            ro.get_item(&t, id).unwrap(),
            json!({
                "id": id,
                "dicts": [
                    {"a": "first", "b": null, "tags": ["t1", "t2", "t3"]},
                    {"a": "second", "b": null, "tags": []},
                    {"a": "third", "b": null, "tags": ["t4"]},
                ],
            })
        );
        assert_eq!(
            user_tables(&t),
            vec!["thing", "thing__aux_versions", "thing_dicts", "thing_dicts_tags"]
        );
    }

    #[test]
    fn test_migration_function_sees_parked_tables() {
        let mut db = Database::open_in_memory().unwrap();
        let t = db.begin().unwrap();
        v1().prepare_storage(&t).unwrap();
        insert_person(&t, "p1", "Bond", 40);

        // Backfill the new column from the parked copy of the old table
        let vs = VersionedStorage::builder("person")
            .start_version("v1")
            .add_prototype(json!({"id": "", "name": "", "age": 0}), TableScope::Main)
            .start_version_with("v2", |t, parked| {
                let old = &parked["person"];
                assert!(old.starts_with("person_"));
                for row in t.select(old, &["id", "age"], None)? {
                    let years = match row["age"].as_i64() {
                        Some(age) => format!("{age} years"),
                        None => String::new(),
                    };
                    t.update(
                        "person",
                        Some(&Condition::eq("person", "id", row["id"].clone())),
                        &[("age_text", SqlValue::from(years))],
                    )?;
                }
                Ok(())
            })
            .add_prototype(json!({"id": "", "name": "", "age_text": ""}), TableScope::Main)
            .build()
            .unwrap();
        vs.prepare_storage(&t).unwrap();

        let rows = t.select("person", &["name", "age_text"], None).unwrap();
        assert_eq!(rows[0]["name"], SqlValue::from("Bond"));
        assert_eq!(rows[0]["age_text"], SqlValue::from("40 years"));
        assert_eq!(user_tables(&t), vec!["person", "person__aux_versions"]);
    }

    #[test]
    fn test_first_version_function_gets_empty_map() {
        let mut db = Database::open_in_memory().unwrap();
        let t = db.begin().unwrap();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        VersionedStorage::builder("thing")
            .start_version_with("1", move |_, parked| {
                assert!(parked.is_empty());
                *counter.lock().unwrap() += 1;
                Ok(())
            })
            .add_prototype(json!({"a": ""}), TableScope::Main)
            .build()
            .unwrap()
            .prepare_storage(&t)
            .unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_removed_tables_are_dropped() {
        let mut db = Database::open_in_memory().unwrap();
        let t = db.begin().unwrap();
        VersionedStorage::builder("thing")
            .start_version("1")
            .add_prototype(json!({"a": "", "tags": [""]}), TableScope::Main)
            .start_version("2")
            .add_prototype(json!({"a": ""}), TableScope::Main)
            .build()
            .unwrap()
            .prepare_storage(&t)
            .unwrap();
        assert!(!t.table_exists("thing_tags").unwrap());
        assert!(t.table_exists("thing").unwrap());
    }

    #[test]
    fn test_all_null_rows_are_not_copied() {
        let mut db = Database::open_in_memory().unwrap();
        let t = db.begin().unwrap();
        v1().prepare_storage(&t).unwrap();
        t.insert("person", &[("age", SqlValue::from(3))]).unwrap();
        insert_person(&t, "p1", "Bond", 40);

        v2().build().unwrap().prepare_storage(&t).unwrap();

        let rows = t.select("person", &["id"], None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], SqlValue::from("p1"));
    }

    #[test]
    fn test_subitem_and_aux_scopes() {
        let mut db = Database::open_in_memory().unwrap();
        let t = db.begin().unwrap();
        VersionedStorage::builder("person")
            .start_version("1")
            .add_prototype(json!({"name": ""}), TableScope::Main)
            .add_prototype(json!({"secret": ""}), TableScope::Subpath("sub".into()))
            .add_prototype(json!({"listener": ""}), TableScope::Aux("listeners".into()))
            .build()
            .unwrap()
            .prepare_storage(&t)
            .unwrap();
        assert_eq!(
            user_tables(&t),
            vec![
                "person",
                "person__aux_listeners",
                "person__aux_versions",
                "person__path_sub",
            ]
        );
    }

    #[test]
    fn test_builder_validation() {
        let result = VersionedStorage::builder("thing")
            .add_prototype(json!({"a": ""}), TableScope::Main)
            .start_version("1")
            .build();
        assert!(matches!(result, Err(StorageError::InvalidVersion(_))));

        let result = VersionedStorage::builder("thing")
            .start_version("1")
            .start_version("1")
            .build();
        assert!(matches!(result, Err(StorageError::InvalidVersion(_))));

        let result = VersionedStorage::builder("thing")
            .start_version("1")
            .add_prototype(json!({"a": ""}), TableScope::Main)
            .add_prototype(json!({"a": 0}), TableScope::Main)
            .build();
        assert!(matches!(result, Err(StorageError::SchemaConflict { .. })));

        // A field may not be a scalar in one prototype and a list in another
        let result = VersionedStorage::builder("thing")
            .start_version("1")
            .add_prototype(json!({"a": ""}), TableScope::Main)
            .add_prototype(json!({"a": [""]}), TableScope::Main)
            .build();
        assert!(matches!(result, Err(StorageError::SchemaConflict { .. })));

        // Scopes are merged separately, so the same name may differ across them
        let vs = VersionedStorage::builder("thing")
            .start_version("1")
            .add_prototype(json!({"a": ""}), TableScope::Main)
            .add_prototype(json!({"b": 0}), TableScope::Main)
            .add_prototype(json!({"a": [""]}), TableScope::Subpath("sub".into()))
            .build()
            .unwrap();
        let tables: Vec<_> = vs.versions()[0]
            .schema()
            .tables()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(tables, vec!["thing", "thing__path_sub", "thing__path_sub_a"]);
        let root = vs.versions()[0].schema().table("thing").unwrap();
        let columns: Vec<_> = root.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(columns, vec!["a", "b", "id"]);
    }

    #[test]
    fn test_no_versions_only_prepares_bookkeeping() {
        let mut db = Database::open_in_memory().unwrap();
        let t = db.begin().unwrap();
        let vs = VersionedStorage::builder("thing").build().unwrap();
        vs.prepare_storage(&t).unwrap();
        assert_eq!(user_tables(&t), vec!["thing__aux_versions"]);
    }
}
