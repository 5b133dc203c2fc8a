//! Dialect-neutral SQL building blocks
//!
//! Storage code talks to the backing store only through a [`Transaction`],
//! describing rows with [`SqlValue`]s and filters with [`Condition`] trees.
//! A [`SqlDialect`] turns those into statements for one concrete store.
//!
//! ## Linking
//!
//! Every table derived for a resource type carries the root item id in
//! its `id` column ([`LINK_COLUMN`]). A condition leaf or sort key that
//! names a table other than the one being selected from is resolved
//! through that column: the leaf holds when *some* row of the other table
//! with the same id satisfies it.

use std::collections::BTreeMap;
use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, Value};

pub mod dialect;
pub mod transaction;

pub use dialect::{SqlDialect, SqliteDialect, Statement};
pub use transaction::{Database, Transaction};

use crate::storage::error::{StorageError, StorageResult};

/// Column shared by every table of a resource type, holding the item id
pub const LINK_COLUMN: &str = "id";

/// A row returned by a select, keyed by the requested column names
pub type Row = BTreeMap<String, SqlValue>;

/// Column types supported by the storage layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Text => "string",
            ColumnType::Integer => "integer",
            ColumnType::Real => "number",
            ColumnType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// A single value bound to or read from a statement
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; booleans read back from SQLite arrive as 0/1
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl From<usize> for SqlValue {
    fn from(value: usize) -> Self {
        SqlValue::Integer(value as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Boolean(value)
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Integer(i) => SqlValue::Integer(i),
            Value::Real(f) => SqlValue::Real(f),
            Value::Text(s) => SqlValue::Text(s),
            Value::Blob(b) => SqlValue::Text(String::from_utf8_lossy(&b).into_owned()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            SqlValue::Null => Value::Null,
            SqlValue::Text(s) => return Ok(ToSqlOutput::from(s.as_str())),
            SqlValue::Integer(i) => Value::Integer(*i),
            SqlValue::Real(f) => Value::Real(*f),
            SqlValue::Boolean(b) => Value::Integer(i64::from(*b)),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

/// Comparison applied by a condition leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    StartsWith,
    Contains,
}

/// Boolean expression over column comparisons
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        op: CompareOp,
        table: String,
        column: String,
        value: SqlValue,
        /// Compare lower-cased text on both sides
        fold_case: bool,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn compare(
        op: CompareOp,
        table: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<SqlValue>,
    ) -> Self {
        Condition::Compare {
            op,
            table: table.into(),
            column: column.into(),
            value: value.into(),
            fold_case: false,
        }
    }

    pub fn eq(
        table: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<SqlValue>,
    ) -> Self {
        Self::compare(CompareOp::Eq, table, column, value)
    }

    /// Conjunction; an empty list matches every row
    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::And(conditions)
    }

    /// Disjunction; an empty list matches no row
    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Or(conditions)
    }

    /// Make every leaf of this tree compare case-insensitively
    pub fn case_insensitive(self) -> Self {
        match self {
            Condition::Compare {
                op,
                table,
                column,
                value,
                ..
            } => Condition::Compare {
                op,
                table,
                column,
                value,
                fold_case: true,
            },
            Condition::And(children) => {
                Condition::And(children.into_iter().map(Self::case_insensitive).collect())
            }
            Condition::Or(children) => {
                Condition::Or(children.into_iter().map(Self::case_insensitive).collect())
            }
        }
    }

    /// Tables referenced anywhere in the tree, in first-seen order
    pub fn tables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_tables(&mut out);
        out
    }

    fn collect_tables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Compare { table, .. } => {
                if !out.contains(&table.as_str()) {
                    out.push(table);
                }
            }
            Condition::And(children) | Condition::Or(children) => {
                for child in children {
                    child.collect_tables(out);
                }
            }
        }
    }
}

/// Ordering key for a select
///
/// When `table` differs from the selected table, the key is the value of
/// the linked row whose `first_row` position columns are all 0, i.e. the
/// first element of the list that table stores.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub table: String,
    pub column: String,
    pub ascending: bool,
    pub first_row: Vec<String>,
}

impl SortKey {
    pub fn new(table: impl Into<String>, column: impl Into<String>, ascending: bool) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            ascending,
            first_row: Vec::new(),
        }
    }

    pub fn at_first_position(mut self, position_columns: &[&str]) -> Self {
        self.first_row = position_columns.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// A full select: projection, filter, ordering and pagination
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    pub columns: Vec<String>,
    pub condition: Option<Condition>,
    pub order_by: Vec<SortKey>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Select {
    pub fn new(table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            condition: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn order_by(mut self, key: SortKey) -> Self {
        self.order_by.push(key);
        self
    }

    pub fn limit(mut self, limit: Option<i64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: Option<i64>) -> Self {
        self.offset = offset;
        self
    }
}

/// Validate a table or column name and map dashes to underscores
///
/// Only ASCII letters, digits, `-` and `_` are accepted.
pub fn normalize_name(name: &str) -> StorageResult<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(StorageError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(name.replace('-', "_"))
}
