//! Prototype to relational schema derivation
//!
//! A prototype is a JSON object used only for its shape. Scalars become
//! columns of the table that owns them; every list becomes a table of its
//! own whose rows carry the root item id plus one position column per list
//! level, so nested order can be rebuilt from flat rows.
//!
//! ## Layout
//!
//! ```text
//! <root>                 id, <scalars>
//! <root>_<L>             id, list_pos, <L>
//! <root>_<F>             id, list_pos, <scalars of F>
//! <root>_<F>_<L>         id, dict_list_pos, list_pos, <L>
//! <root>_<F>_<G>         id, dict_list_pos, list_pos, <scalars of G>
//! <root>_<F>_<G>_<M>     id, dict_list_pos, list_pos, str_list_pos, <M>
//! ```
//!
//! `<root>` is `<type>` for the item itself, `<type>__path_<name>` for a
//! subitem and `<type>__aux_<name>` for an auxiliary table.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::sql::{normalize_name, ColumnType, LINK_COLUMN};
use crate::storage::error::{StorageError, StorageResult};

/// Position columns of a list table, by nesting level (1-based)
const POSITION_COLUMNS: [&[&str]; 3] = [
    &["list_pos"],
    &["dict_list_pos", "list_pos"],
    &["dict_list_pos", "list_pos", "str_list_pos"],
];

/// Deepest list level the layout can store
pub const MAX_LIST_LEVEL: usize = POSITION_COLUMNS.len();

/// Position columns for a list table `level` lists below the root
pub fn position_columns(level: usize) -> &'static [&'static str] {
    match level {
        0 => &[],
        n => POSITION_COLUMNS[(n - 1).min(MAX_LIST_LEVEL - 1)],
    }
}

fn is_reserved(name: &str) -> bool {
    name == LINK_COLUMN || POSITION_COLUMNS[MAX_LIST_LEVEL - 1].contains(&name)
}

/// Which family of tables a prototype describes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableScope {
    /// The item itself
    Main,
    /// A named subitem stored next to the item
    Subpath(String),
    /// Bookkeeping that is not part of the item
    Aux(String),
}

impl TableScope {
    /// Name of the root table for this scope
    pub fn root_table(&self, resource_type: &str) -> StorageResult<String> {
        let base = normalize_name(resource_type)?;
        Ok(match self {
            TableScope::Main => base,
            TableScope::Subpath(path) => format!("{base}__path_{}", normalize_name(path)?),
            TableScope::Aux(name) => format!("{base}__aux_{}", normalize_name(name)?),
        })
    }
}

/// Name of the table holding list `field` of rows stored in `parent`
pub fn child_table(parent: &str, field: &str) -> StorageResult<String> {
    Ok(format!("{parent}_{}", normalize_name(field)?))
}

/// The shape of one object level of a prototype
///
/// Each group is kept in key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectShape {
    pub scalars: Vec<(String, ColumnType)>,
    /// Lists of scalars, with the element type
    pub scalar_lists: Vec<(String, ColumnType)>,
    pub object_lists: Vec<(String, ObjectShape)>,
}

impl ObjectShape {
    /// Derive the shape of a prototype object
    pub fn from_prototype(prototype: &Value) -> StorageResult<Self> {
        match prototype {
            Value::Object(map) => Self::from_map(map, 0),
            other => Err(StorageError::schema_conflict(format!(
                "prototype must be an object, got {}",
                json_kind(other)
            ))),
        }
    }

    fn from_map(map: &Map<String, Value>, level: usize) -> StorageResult<Self> {
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();

        let mut shape = ObjectShape::default();
        for key in keys {
            let value = &map[key];
            match value {
                Value::Array(elements) => match elements.first() {
                    None => {
                        return Err(StorageError::schema_conflict(format!(
                            "list '{key}' has no element to describe its shape"
                        )))
                    }
                    Some(Value::Object(_)) => {
                        if level + 1 >= MAX_LIST_LEVEL {
                            return Err(StorageError::TooDeeplyNested { field: key.clone() });
                        }
                        let mut element = ObjectShape::default();
                        for item in elements {
                            let Value::Object(obj) = item else {
                                return Err(mixed_list(key));
                            };
                            element.merge(Self::from_map(obj, level + 1)?)?;
                        }
                        shape.object_lists.push((key.clone(), element));
                    }
                    Some(first) => {
                        let column_type = scalar_type(key, first)?;
                        for item in elements {
                            if scalar_type(key, item).ok() != Some(column_type) {
                                return Err(mixed_list(key));
                            }
                        }
                        shape.scalar_lists.push((key.clone(), column_type));
                    }
                },
                other => shape.scalars.push((key.clone(), scalar_type(key, other)?)),
            }
        }
        Ok(shape)
    }

    /// Fold another shape of the same object into this one
    pub fn merge(&mut self, other: ObjectShape) -> StorageResult<()> {
        for (name, column_type) in other.scalars {
            merge_typed(&mut self.scalars, name, column_type)?;
        }
        for (name, column_type) in other.scalar_lists {
            merge_typed(&mut self.scalar_lists, name, column_type)?;
        }
        for (name, shape) in other.object_lists {
            match self.object_lists.iter_mut().find(|(n, _)| *n == name) {
                Some((_, existing)) => existing.merge(shape)?,
                None => self.object_lists.push((name, shape)),
            }
        }
        self.scalars.sort_by(|a, b| a.0.cmp(&b.0));
        self.scalar_lists.sort_by(|a, b| a.0.cmp(&b.0));
        self.object_lists.sort_by(|a, b| a.0.cmp(&b.0));

        for name in self.field_names() {
            if self.field_names().filter(|n| *n == name).count() > 1 {
                return Err(StorageError::schema_conflict(format!(
                    "field '{name}' has more than one shape"
                )));
            }
        }
        Ok(())
    }

    /// Make sure the shape has a text `id` scalar
    pub fn with_id(mut self) -> Self {
        if !self.scalars.iter().any(|(n, _)| n == LINK_COLUMN) {
            self.scalars.push((LINK_COLUMN.to_string(), ColumnType::Text));
            self.scalars.sort_by(|a, b| a.0.cmp(&b.0));
        }
        self
    }

    /// All field names in canonical order
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.scalars
            .iter()
            .map(|(n, _)| n.as_str())
            .chain(self.scalar_lists.iter().map(|(n, _)| n.as_str()))
            .chain(self.object_lists.iter().map(|(n, _)| n.as_str()))
    }

    pub fn scalar_type(&self, name: &str) -> Option<ColumnType> {
        self.scalars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| *t)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_names().any(|n| n == name)
    }
}

fn merge_typed(
    fields: &mut Vec<(String, ColumnType)>,
    name: String,
    column_type: ColumnType,
) -> StorageResult<()> {
    match fields.iter().find(|(n, _)| *n == name) {
        Some((_, existing)) if *existing != column_type => Err(StorageError::schema_conflict(
            format!("field '{name}' is both {existing} and {column_type}"),
        )),
        Some(_) => Ok(()),
        None => {
            fields.push((name, column_type));
            Ok(())
        }
    }
}

fn scalar_type(field: &str, value: &Value) -> StorageResult<ColumnType> {
    match value {
        Value::String(_) => Ok(ColumnType::Text),
        Value::Bool(_) => Ok(ColumnType::Boolean),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(ColumnType::Integer),
        Value::Number(_) => Ok(ColumnType::Real),
        other => Err(StorageError::schema_conflict(format!(
            "field '{field}' has no scalar placeholder ({})",
            json_kind(other)
        ))),
    }
}

fn mixed_list(field: &str) -> StorageError {
    StorageError::schema_conflict(format!("list '{field}' mixes element shapes"))
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// What a column holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    /// Link to the root item
    Id,
    /// Position within a list
    Position,
    /// Item data
    Field,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub role: ColumnRole,
}

impl Column {
    fn new(name: &str, column_type: ColumnType, role: ColumnRole) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            role,
        }
    }
}

/// One derived table
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Column definitions in declaration order, for `create_table`
    pub fn column_defs(&self) -> Vec<(&str, ColumnType)> {
        self.columns
            .iter()
            .map(|c| (c.name.as_str(), c.column_type))
            .collect()
    }

    pub fn position_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.role == ColumnRole::Position)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Ordered set of tables derived from one or more prototypes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    tables: Vec<TableSchema>,
}

impl Schema {
    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// `(table, column, type)` triples in declaration order
    pub fn triples(&self) -> impl Iterator<Item = (&str, &str, ColumnType)> {
        self.tables.iter().flat_map(|t| {
            t.columns
                .iter()
                .map(move |c| (t.name.as_str(), c.name.as_str(), c.column_type))
        })
    }

    /// Table name to ordered `(column, type)` list
    pub fn table_columns(&self) -> BTreeMap<&str, Vec<(&str, ColumnType)>> {
        self.tables
            .iter()
            .map(|t| (t.name.as_str(), t.column_defs()))
            .collect()
    }

    /// Every column holding item field `field`, in declaration order
    pub fn field_locations<'a>(
        &'a self,
        field: &'a str,
    ) -> impl Iterator<Item = (&'a TableSchema, &'a Column)> + 'a {
        self.tables.iter().flat_map(move |t| {
            t.columns
                .iter()
                .filter(move |c| c.role == ColumnRole::Field && c.name == field)
                .map(move |c| (t, c))
        })
    }

    /// Add the tables of `other`, merging columns of tables both define
    pub fn merge(&mut self, other: Schema) -> StorageResult<()> {
        for table in other.tables {
            let Some(existing) = self.tables.iter_mut().find(|t| t.name == table.name) else {
                self.tables.push(table);
                continue;
            };
            for column in table.columns {
                match existing.columns.iter().find(|c| c.name == column.name) {
                    Some(c) if c.column_type != column.column_type => {
                        return Err(StorageError::schema_conflict(format!(
                            "column '{}.{}' is both {} and {}",
                            table.name, column.name, c.column_type, column.column_type
                        )));
                    }
                    Some(_) => {}
                    None => existing.columns.push(column),
                }
            }
        }
        Ok(())
    }

    fn push(&mut self, table: TableSchema) -> StorageResult<()> {
        if self.table(&table.name).is_some() {
            return Err(StorageError::schema_conflict(format!(
                "two fields map to table '{}'",
                table.name
            )));
        }
        self.tables.push(table);
        Ok(())
    }
}

/// Derive the tables for `prototype` within `scope`
pub fn derive_schema(
    prototype: &Value,
    resource_type: &str,
    scope: &TableScope,
) -> StorageResult<Schema> {
    let shape = ObjectShape::from_prototype(prototype)?;
    schema_for_shape(&shape, &scope.root_table(resource_type)?)
}

/// Lay out tables for an already derived shape rooted at table `root`
pub fn schema_for_shape(shape: &ObjectShape, root: &str) -> StorageResult<Schema> {
    let mut schema = Schema::default();

    let mut root_table = TableSchema {
        name: normalize_name(root)?,
        columns: Vec::new(),
    };
    for (name, column_type) in &shape.scalars {
        root_table
            .columns
            .push(Column::new(name, *column_type, ColumnRole::Field));
    }
    if shape.scalar_type(LINK_COLUMN).is_none() {
        let at = root_table
            .columns
            .iter()
            .position(|c| c.name.as_str() > LINK_COLUMN)
            .unwrap_or(root_table.columns.len());
        root_table
            .columns
            .insert(at, Column::new(LINK_COLUMN, ColumnType::Text, ColumnRole::Id));
    }
    let root = root_table.name.clone();
    schema.push(root_table)?;

    for (name, column_type) in &shape.scalar_lists {
        schema.push(scalar_list_table(&root, name, *column_type, 1)?)?;
    }

    for (name, element) in &shape.object_lists {
        let table = child_table(&root, name)?;
        schema.push(object_list_table(&table, element, 1)?)?;

        for (inner_name, inner) in &element.object_lists {
            schema.push(object_list_table(&child_table(&table, inner_name)?, inner, 2)?)?;
        }
        for (list_name, column_type) in &element.scalar_lists {
            schema.push(scalar_list_table(&table, list_name, *column_type, 2)?)?;
        }
        for (inner_name, inner) in &element.object_lists {
            let inner_table = child_table(&table, inner_name)?;
            for (list_name, column_type) in &inner.scalar_lists {
                schema.push(scalar_list_table(&inner_table, list_name, *column_type, 3)?)?;
            }
        }
    }

    Ok(schema)
}

fn list_columns(level: usize) -> Vec<Column> {
    let mut columns = vec![Column::new(LINK_COLUMN, ColumnType::Text, ColumnRole::Id)];
    for position in position_columns(level) {
        columns.push(Column::new(position, ColumnType::Integer, ColumnRole::Position));
    }
    columns
}

fn scalar_list_table(
    parent: &str,
    field: &str,
    column_type: ColumnType,
    level: usize,
) -> StorageResult<TableSchema> {
    if is_reserved(field) {
        return Err(reserved(field));
    }
    let mut columns = list_columns(level);
    columns.push(Column::new(field, column_type, ColumnRole::Field));
    Ok(TableSchema {
        name: child_table(parent, field)?,
        columns,
    })
}

fn object_list_table(
    name: &str,
    element: &ObjectShape,
    level: usize,
) -> StorageResult<TableSchema> {
    let mut columns = list_columns(level);
    for (field, column_type) in &element.scalars {
        if is_reserved(field) {
            return Err(reserved(field));
        }
        columns.push(Column::new(field, *column_type, ColumnRole::Field));
    }
    Ok(TableSchema {
        name: name.to_string(),
        columns,
    })
}

fn reserved(field: &str) -> StorageError {
    StorageError::schema_conflict(format!("'{field}' is reserved inside lists"))
}
