//! Creating items
//!
//! An item is checked against the prototype, completed with defaults and
//! then flattened: one root row for its scalars and one row per list
//! element, each carrying the item id and its list positions.

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::resource::{encode_value, zero_value, ResourceDefinition};
use super::schema::{child_table, json_kind, position_columns, ObjectShape};
use crate::sql::{SqlValue, Transaction, LINK_COLUMN};

const REVISION_FIELD: &str = "revision";
const TYPE_FIELD: &str = "type";

/// Inserts new items of one resource type
#[derive(Debug, Clone)]
pub struct WriteOnlyStorage {
    definition: ResourceDefinition,
}

impl WriteOnlyStorage {
    pub fn new(definition: ResourceDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &ResourceDefinition {
        &self.definition
    }

    /// Store a new item and return it with its assigned id and revision
    ///
    /// Missing fields are filled in: `type` with the resource type, scalars
    /// with `null` and lists with `[]`. Every registered subitem is created
    /// with zero values.
    pub fn add_item(&self, t: &Transaction<'_>, item: &Value) -> StorageResult<Value> {
        let Value::Object(fields) = item else {
            return Err(StorageError::InvalidFieldValue {
                field: self.definition.resource_type().to_string(),
                expected: "object".to_string(),
            });
        };
        if fields.contains_key(LINK_COLUMN) {
            return Err(StorageError::CannotAddWithId);
        }
        if fields.contains_key(REVISION_FIELD) {
            return Err(StorageError::CannotAddWithRevision);
        }

        let shape = self.definition.shape();
        let mut fields = fields.clone();
        if shape.has_field(TYPE_FIELD) && !fields.contains_key(TYPE_FIELD) {
            fields.insert(
                TYPE_FIELD.to_string(),
                Value::String(self.definition.resource_type().to_string()),
            );
        }
        fill_defaults(&mut fields, shape);
        check_object(&fields, shape, "")?;

        let id = Uuid::new_v4().to_string();
        fields.insert(LINK_COLUMN.to_string(), Value::String(id.clone()));
        fields.insert(
            REVISION_FIELD.to_string(),
            Value::String(Uuid::new_v4().to_string()),
        );

        let root = self.definition.root_table();
        insert_row(t, root, &id, &[], shape, &fields)?;
        insert_lists(t, root, &id, &[], shape, &fields)?;

        for subitem in self.definition.subitems() {
            let zeroes = zero_object(subitem.shape());
            insert_row(t, subitem.root_table(), &id, &[], subitem.shape(), &zeroes)?;
        }

        debug!("Added {} item {}", self.definition.resource_type(), id);
        Ok(Value::Object(fields))
    }
}

fn fill_defaults(fields: &mut Map<String, Value>, shape: &ObjectShape) {
    for (name, _) in &shape.scalars {
        fields.entry(name.clone()).or_insert(Value::Null);
    }
    for name in shape
        .scalar_lists
        .iter()
        .map(|(n, _)| n)
        .chain(shape.object_lists.iter().map(|(n, _)| n))
    {
        // Null lists are stored as no rows
        let value = fields.entry(name.clone()).or_insert(Value::Null);
        if value.is_null() {
            *value = Value::Array(Vec::new());
        }
    }
    for (name, element) in &shape.object_lists {
        if let Some(Value::Array(items)) = fields.get_mut(name) {
            for item in items {
                if let Value::Object(obj) = item {
                    fill_defaults(obj, element);
                }
            }
        }
    }
}

fn check_object(fields: &Map<String, Value>, shape: &ObjectShape, path: &str) -> StorageResult<()> {
    let qualified = |name: &str| {
        if path.is_empty() {
            name.to_string()
        } else {
            format!("{path}.{name}")
        }
    };

    if let Some(unknown) = fields.keys().find(|k| !shape.has_field(k)) {
        return Err(StorageError::field_not_in_resource(qualified(unknown)));
    }
    for (name, column_type) in &shape.scalars {
        if let Some(value) = fields.get(name) {
            encode_value(&qualified(name), value, *column_type)?;
        }
    }
    for (name, column_type) in &shape.scalar_lists {
        for value in list_of(fields, name, &qualified(name))? {
            encode_value(&qualified(name), value, *column_type)?;
        }
    }
    for (name, element) in &shape.object_lists {
        let field = qualified(name);
        for value in list_of(fields, name, &field)? {
            match value {
                Value::Object(obj) => check_object(obj, element, &field)?,
                other => {
                    return Err(StorageError::InvalidFieldValue {
                        field,
                        expected: format!("object, got {}", json_kind(other)),
                    })
                }
            }
        }
    }
    Ok(())
}

fn list_of<'a>(
    fields: &'a Map<String, Value>,
    name: &str,
    field: &str,
) -> StorageResult<&'a [Value]> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(StorageError::InvalidFieldValue {
            field: field.to_string(),
            expected: "list".to_string(),
        }),
    }
}

/// Link and position columns for a row at `positions`
fn row_key(id: &str, positions: &[usize]) -> Vec<(&'static str, SqlValue)> {
    let mut values = vec![(LINK_COLUMN, SqlValue::from(id))];
    for (column, pos) in position_columns(positions.len()).iter().zip(positions) {
        values.push((*column, SqlValue::from(*pos)));
    }
    values
}

fn insert_row(
    t: &Transaction<'_>,
    table: &str,
    id: &str,
    positions: &[usize],
    shape: &ObjectShape,
    fields: &Map<String, Value>,
) -> StorageResult<()> {
    let mut values: Vec<(&str, SqlValue)> = row_key(id, positions);
    for (name, column_type) in &shape.scalars {
        if name == LINK_COLUMN {
            continue;
        }
        let value = fields.get(name).unwrap_or(&Value::Null);
        values.push((name.as_str(), encode_value(name, value, *column_type)?));
    }
    t.insert(table, &values)
}

fn insert_lists(
    t: &Transaction<'_>,
    table: &str,
    id: &str,
    positions: &[usize],
    shape: &ObjectShape,
    fields: &Map<String, Value>,
) -> StorageResult<()> {
    for (name, column_type) in &shape.scalar_lists {
        let list_table = child_table(table, name)?;
        for (pos, value) in list_of(fields, name, name)?.iter().enumerate() {
            let mut values: Vec<(&str, SqlValue)> = row_key(id, &[positions, &[pos][..]].concat());
            values.push((name.as_str(), encode_value(name, value, *column_type)?));
            t.insert(&list_table, &values)?;
        }
    }

    for (name, element) in &shape.object_lists {
        let list_table = child_table(table, name)?;
        for (pos, value) in list_of(fields, name, name)?.iter().enumerate() {
            let Value::Object(obj) = value else {
                continue;
            };
            let element_positions = [positions, &[pos][..]].concat();
            insert_row(t, &list_table, id, &element_positions, element, obj)?;
            insert_lists(t, &list_table, id, &element_positions, element, obj)?;
        }
    }
    Ok(())
}

/// Object with every field of `shape` at its zero value
fn zero_object(shape: &ObjectShape) -> Map<String, Value> {
    let mut fields = Map::new();
    for (name, column_type) in &shape.scalars {
        fields.insert(name.clone(), zero_value(*column_type));
    }
    for name in shape
        .scalar_lists
        .iter()
        .map(|(n, _)| n)
        .chain(shape.object_lists.iter().map(|(n, _)| n))
    {
        fields.insert(name.clone(), Value::Array(Vec::new()));
    }
    fields
}
