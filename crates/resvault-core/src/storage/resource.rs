//! Registered resource types
//!
//! A [`ResourceDefinition`] holds the latest prototype of one resource type
//! and its subitems, with shapes and table layouts derived once up front.
//! Read and write storage work from it instead of re-deriving per call.

use serde_json::{Number, Value};

use super::error::{StorageError, StorageResult};
use super::schema::{schema_for_shape, ObjectShape, Schema, TableScope};
use crate::sql::{ColumnType, SqlValue};

/// A subitem: a side document stored in its own tables
#[derive(Debug, Clone)]
pub struct Subitem {
    name: String,
    prototype: Value,
    shape: ObjectShape,
    root_table: String,
}

impl Subitem {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prototype(&self) -> &Value {
        &self.prototype
    }

    pub fn shape(&self) -> &ObjectShape {
        &self.shape
    }

    pub fn root_table(&self) -> &str {
        &self.root_table
    }
}

/// Latest prototype of a resource type plus its subitems
#[derive(Debug, Clone)]
pub struct ResourceDefinition {
    resource_type: String,
    prototype: Value,
    shape: ObjectShape,
    root_table: String,
    subitems: Vec<Subitem>,
    /// Main tables followed by every subitem's tables
    schema: Schema,
}

impl ResourceDefinition {
    pub fn new(resource_type: impl Into<String>, prototype: Value) -> StorageResult<Self> {
        let resource_type = resource_type.into();
        let shape = ObjectShape::from_prototype(&prototype)?.with_id();
        let root_table = TableScope::Main.root_table(&resource_type)?;
        let schema = schema_for_shape(&shape, &root_table)?;

        Ok(Self {
            resource_type,
            prototype,
            shape,
            root_table,
            subitems: Vec::new(),
            schema,
        })
    }

    /// Register a subitem prototype under `name`
    pub fn with_subitem(
        mut self,
        name: impl Into<String>,
        prototype: Value,
    ) -> StorageResult<Self> {
        let name = name.into();
        if self.subitems.iter().any(|s| s.name == name) {
            return Err(StorageError::schema_conflict(format!(
                "subitem '{name}' registered twice"
            )));
        }

        let shape = ObjectShape::from_prototype(&prototype)?;
        let root_table = TableScope::Subpath(name.clone()).root_table(&self.resource_type)?;
        let schema = schema_for_shape(&shape, &root_table)?;
        for table in schema.tables() {
            if self.schema.table(&table.name).is_some() {
                return Err(StorageError::schema_conflict(format!(
                    "subitem '{name}' reuses table '{}'",
                    table.name
                )));
            }
        }
        self.schema.merge(schema)?;

        self.subitems.push(Subitem {
            name,
            prototype,
            shape,
            root_table,
        });
        Ok(self)
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn prototype(&self) -> &Value {
        &self.prototype
    }

    pub fn shape(&self) -> &ObjectShape {
        &self.shape
    }

    pub fn root_table(&self) -> &str {
        &self.root_table
    }

    /// Tables of the item and all its subitems, in declaration order
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn subitems(&self) -> &[Subitem] {
        &self.subitems
    }

    pub fn subitem(&self, name: &str) -> StorageResult<&Subitem> {
        self.subitems
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| StorageError::UnknownSubitem {
                resource_type: self.resource_type.clone(),
                subitem: name.to_string(),
            })
    }
}

/// Convert a JSON field value into a value for a column of `column_type`
pub(crate) fn encode_value(
    field: &str,
    value: &Value,
    column_type: ColumnType,
) -> StorageResult<SqlValue> {
    let encoded = match (column_type, value) {
        (_, Value::Null) => Some(SqlValue::Null),
        (ColumnType::Text, Value::String(s)) => Some(SqlValue::Text(s.clone())),
        (ColumnType::Boolean, Value::Bool(b)) => Some(SqlValue::Boolean(*b)),
        (ColumnType::Integer, Value::Number(n)) => n.as_i64().map(SqlValue::Integer),
        (ColumnType::Real, Value::Number(n)) => n.as_f64().map(SqlValue::Real),
        _ => None,
    };
    encoded.ok_or_else(|| StorageError::InvalidFieldValue {
        field: field.to_string(),
        expected: column_type.to_string(),
    })
}

/// Convert a stored value back to JSON using the column's declared type
pub(crate) fn decode_value(value: &SqlValue, column_type: ColumnType) -> Value {
    match (column_type, value) {
        (_, SqlValue::Null) => Value::Null,
        (ColumnType::Boolean, v) => match v.as_i64() {
            Some(i) => Value::Bool(i != 0),
            None => Value::Null,
        },
        (_, SqlValue::Boolean(b)) => Value::Bool(*b),
        (_, SqlValue::Text(s)) => Value::String(s.clone()),
        (_, SqlValue::Integer(i)) => Value::Number((*i).into()),
        (_, SqlValue::Real(f)) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
    }
}

/// Placeholder a freshly created subitem starts with
pub(crate) fn zero_value(column_type: ColumnType) -> Value {
    match column_type {
        ColumnType::Text => Value::String(String::new()),
        ColumnType::Boolean => Value::Bool(false),
        ColumnType::Integer => Value::Number(0.into()),
        ColumnType::Real => Number::from_f64(0.0).map(Value::Number).unwrap_or(Value::Null),
    }
}
