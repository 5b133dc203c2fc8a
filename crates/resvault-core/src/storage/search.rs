//! Search parameters and their translation into conditions
//!
//! A search key names a logical field. It may live in several tables (the
//! root table, list tables, subitem tables); a parameter holds for an item
//! when any of those rows satisfies it.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

use super::error::{StorageError, StorageResult};
use super::schema::Schema;
use crate::sql::{ColumnType, CompareOp, Condition, SortKey, SqlValue};

/// How a search value is compared to a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Exact,
    Gt,
    Ge,
    Lt,
    Le,
    Ne,
    StartsWith,
    Contains,
}

impl MatchRule {
    fn op(self) -> CompareOp {
        match self {
            MatchRule::Exact => CompareOp::Eq,
            MatchRule::Gt => CompareOp::Gt,
            MatchRule::Ge => CompareOp::Ge,
            MatchRule::Lt => CompareOp::Lt,
            MatchRule::Le => CompareOp::Le,
            MatchRule::Ne => CompareOp::Ne,
            MatchRule::StartsWith => CompareOp::StartsWith,
            MatchRule::Contains => CompareOp::Contains,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchRule::Exact => "exact",
            MatchRule::Gt => "gt",
            MatchRule::Ge => "ge",
            MatchRule::Lt => "lt",
            MatchRule::Le => "le",
            MatchRule::Ne => "ne",
            MatchRule::StartsWith => "startswith",
            MatchRule::Contains => "contains",
        }
    }
}

impl FromStr for MatchRule {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(MatchRule::Exact),
            "gt" => Ok(MatchRule::Gt),
            "ge" => Ok(MatchRule::Ge),
            "lt" => Ok(MatchRule::Lt),
            "le" => Ok(MatchRule::Le),
            "ne" => Ok(MatchRule::Ne),
            "startswith" => Ok(MatchRule::StartsWith),
            "contains" => Ok(MatchRule::Contains),
            other => Err(StorageError::UnknownMatchRule(other.to_string())),
        }
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One search condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParam {
    pub rule: MatchRule,
    pub key: String,
    /// Alternatives; the param holds if any of them matches
    pub values: Vec<String>,
}

impl SearchParam {
    pub fn new(rule: MatchRule, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            rule,
            key: key.into(),
            values: vec![value.into()],
        }
    }

    /// Match when any of `values` matches
    pub fn any<I, S>(rule: MatchRule, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rule,
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exact(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(MatchRule::Exact, key, value)
    }

    /// Condition over every table holding the key
    ///
    /// A value that cannot be compared with some location's column type
    /// is skipped there; if it fits nowhere the search is rejected.
    pub(crate) fn to_condition(&self, schema: &Schema) -> StorageResult<Condition> {
        let mut leaves = Vec::new();
        let mut found = false;
        for (table, column) in schema.field_locations(&self.key) {
            found = true;
            for value in &self.values {
                let Some(cast) = cast_value(value, column.column_type) else {
                    continue;
                };
                let leaf = Condition::compare(self.rule.op(), &table.name, &column.name, cast);
                leaves.push(if column.column_type == ColumnType::Text {
                    leaf.case_insensitive()
                } else {
                    leaf
                });
            }
        }

        if !found {
            return Err(StorageError::field_not_in_resource(&self.key));
        }
        if leaves.is_empty() && !self.values.is_empty() {
            return Err(StorageError::InvalidSearchValue {
                field: self.key.clone(),
                value: self.values.join(","),
            });
        }
        Ok(Condition::or(leaves))
    }
}

fn cast_value(value: &str, column_type: ColumnType) -> Option<SqlValue> {
    match column_type {
        ColumnType::Text => Some(SqlValue::from(value)),
        ColumnType::Boolean => match value.to_lowercase().as_str() {
            "true" => Some(SqlValue::Boolean(true)),
            "false" => Some(SqlValue::Boolean(false)),
            _ => None,
        },
        ColumnType::Integer => value
            .parse::<i64>()
            .map(SqlValue::Integer)
            .or_else(|_| value.parse::<f64>().map(SqlValue::Real))
            .ok(),
        ColumnType::Real => value.parse::<f64>().map(SqlValue::Real).ok(),
    }
}

/// One sort key: a field name and its direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortParam {
    pub key: String,
    pub ascending: bool,
}

impl SortParam {
    pub fn asc(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn desc(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }

    /// Sort on the first location of the key, first list element only
    pub(crate) fn to_sort_key(&self, schema: &Schema) -> StorageResult<SortKey> {
        let (table, column) = schema
            .field_locations(&self.key)
            .next()
            .ok_or_else(|| StorageError::field_not_in_resource(&self.key))?;
        Ok(SortKey::new(&table.name, &column.name, self.ascending)
            .at_first_position(&table.position_columns()))
    }
}

/// What a search returns for each match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Projection {
    #[default]
    IdsOnly,
    /// Full items
    All,
    /// Only these top-level fields, plus `id`
    Fields(Vec<String>),
}

/// Result of a search
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResult {
    pub resources: Vec<Value>,
}

impl SearchResult {
    /// Ids of the returned resources, in result order
    pub fn ids(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_str))
            .collect()
    }
}
