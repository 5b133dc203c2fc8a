//! Resource type specifications
//!
//! One row per resource type, holding the operator-supplied specification
//! document as JSON in the `yaml` column. Independent of the versioned item
//! tables.

use serde_json::Value;

use super::error::{StorageError, StorageResult};
use crate::sql::{ColumnType, Condition, SqlValue, Transaction};

const TABLE: &str = "resource_types";
const TYPE_COLUMN: &str = "type";
/// Holds JSON, which YAML readers also accept
const SPEC_COLUMN: &str = "yaml";

/// Stores the specification document of each resource type
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceTypeStorage;

impl ResourceTypeStorage {
    pub fn new() -> Self {
        Self
    }

    /// Create the table if it does not exist yet
    pub fn prepare_tables(&self, t: &Transaction<'_>) -> StorageResult<()> {
        if !t.table_exists(TABLE)? {
            t.create_table(
                TABLE,
                &[(TYPE_COLUMN, ColumnType::Text), (SPEC_COLUMN, ColumnType::Text)],
            )?;
        }
        Ok(())
    }

    pub fn get_types(&self, t: &Transaction<'_>) -> StorageResult<Vec<String>> {
        let rows = t.select(TABLE, &[TYPE_COLUMN], None)?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get(TYPE_COLUMN)?.as_str().map(str::to_string))
            .collect())
    }

    /// The stored specification, if the type is known
    pub fn get_spec(&self, t: &Transaction<'_>, type_name: &str) -> StorageResult<Option<Value>> {
        let rows = t.select(TABLE, &[SPEC_COLUMN], Some(&by_type(type_name)))?;
        match rows.first().and_then(|row| row.get(SPEC_COLUMN)?.as_str()) {
            Some(spec) => Ok(Some(serde_json::from_str(spec)?)),
            None => Ok(None),
        }
    }

    /// Insert the specification, replacing any stored for the same type
    pub fn add_or_update_spec(&self, t: &Transaction<'_>, spec: &Value) -> StorageResult<()> {
        let type_name = spec
            .get(TYPE_COLUMN)
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::InvalidSpec("missing string field 'type'".to_string()))?;
        let values = [
            (TYPE_COLUMN, SqlValue::from(type_name)),
            (SPEC_COLUMN, SqlValue::from(serde_json::to_string(spec)?)),
        ];

        if self.get_types(t)?.iter().any(|known| known == type_name) {
            t.update(TABLE, Some(&by_type(type_name)), &values)?;
        } else {
            t.insert(TABLE, &values)?;
        }
        Ok(())
    }

    pub fn delete_spec(&self, t: &Transaction<'_>, type_name: &str) -> StorageResult<()> {
        t.delete(TABLE, Some(&by_type(type_name)))?;
        Ok(())
    }
}

fn by_type(type_name: &str) -> Condition {
    Condition::eq(TABLE, TYPE_COLUMN, type_name)
}
