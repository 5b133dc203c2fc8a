//! SQL dialects
//!
//! A dialect formats each transaction operation into a statement text plus
//! its positional parameters. The transaction never builds SQL itself.

use super::{
    normalize_name, ColumnType, CompareOp, Condition, Select, SortKey, SqlValue, LINK_COLUMN,
};
use crate::storage::error::StorageResult;

/// A formatted statement and the values for its placeholders
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    fn new(sql: String) -> Self {
        Self {
            sql,
            params: Vec::new(),
        }
    }
}

/// Formats storage operations for one backing store
pub trait SqlDialect: Send + Sync {
    /// Short name used in log output
    fn name(&self) -> &'static str;

    /// Column type as spelled in DDL
    fn type_name(&self, column_type: ColumnType) -> &'static str;

    /// Quote a table or column name
    fn quote(&self, name: &str) -> StorageResult<String> {
        Ok(format!("\"{}\"", normalize_name(name)?))
    }

    fn format_table_exists(&self, table: &str) -> StorageResult<Statement>;

    fn format_create_table(
        &self,
        table: &str,
        columns: &[(&str, ColumnType)],
    ) -> StorageResult<Statement>;

    fn format_add_column(
        &self,
        table: &str,
        column: &str,
        column_type: ColumnType,
    ) -> StorageResult<Statement>;

    fn format_rename_table(&self, old_name: &str, new_name: &str) -> StorageResult<Statement>;

    fn format_drop_table(&self, table: &str) -> StorageResult<Statement>;

    fn format_select(&self, select: &Select) -> StorageResult<Statement>;

    fn format_insert(&self, table: &str, values: &[(&str, SqlValue)]) -> StorageResult<Statement>;

    fn format_update(
        &self,
        table: &str,
        condition: Option<&Condition>,
        values: &[(&str, SqlValue)],
    ) -> StorageResult<Statement>;

    fn format_delete(&self, table: &str, condition: Option<&Condition>)
        -> StorageResult<Statement>;
}

/// Dialect for SQLite (via rusqlite)
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqliteDialect {
    fn column(&self, table: &str, column: &str) -> StorageResult<String> {
        Ok(format!("{}.{}", self.quote(table)?, self.quote(column)?))
    }

    /// `EXISTS` clause joining `other` to `base` on the link column
    fn linked(&self, base: &str, other: &str, predicate: &str) -> StorageResult<String> {
        let other_q = self.quote(other)?;
        Ok(format!(
            "EXISTS (SELECT 1 FROM {other_q} WHERE {} = {} AND {predicate})",
            self.column(other, LINK_COLUMN)?,
            self.column(base, LINK_COLUMN)?,
        ))
    }

    fn format_condition(
        &self,
        base: &str,
        condition: &Condition,
        params: &mut Vec<SqlValue>,
    ) -> StorageResult<String> {
        match condition {
            Condition::Compare {
                op,
                table,
                column,
                value,
                fold_case,
            } => {
                let predicate =
                    self.format_comparison(table, column, *op, value, *fold_case, params)?;
                if normalize_name(table)? == normalize_name(base)? {
                    Ok(predicate)
                } else {
                    self.linked(base, table, &predicate)
                }
            }
            Condition::And(children) => {
                self.format_junction(base, "AND", "1 = 1", children, params)
            }
            Condition::Or(children) => {
                self.format_junction(base, "OR", "1 = 0", children, params)
            }
        }
    }

    fn format_junction(
        &self,
        base: &str,
        op: &str,
        empty: &str,
        children: &[Condition],
        params: &mut Vec<SqlValue>,
    ) -> StorageResult<String> {
        if children.is_empty() {
            return Ok(empty.to_string());
        }
        let parts = children
            .iter()
            .map(|c| Ok(format!("({})", self.format_condition(base, c, params)?)))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(parts.join(&format!(" {op} ")))
    }

    fn format_comparison(
        &self,
        table: &str,
        column: &str,
        op: CompareOp,
        value: &SqlValue,
        fold_case: bool,
        params: &mut Vec<SqlValue>,
    ) -> StorageResult<String> {
        let mut lhs = self.column(table, column)?;

        if value.is_null() {
            return match op {
                CompareOp::Eq => Ok(format!("{lhs} IS NULL")),
                CompareOp::Ne => Ok(format!("{lhs} IS NOT NULL")),
                // Ordering against NULL never holds
                _ => Ok("1 = 0".to_string()),
            };
        }

        let mut rhs = "?".to_string();
        if fold_case {
            lhs = format!("LOWER({lhs})");
            rhs = "LOWER(?)".to_string();
        }
        params.push(value.clone());

        let sql = match op {
            CompareOp::Eq => format!("{lhs} = {rhs}"),
            CompareOp::Ne => format!("{lhs} != {rhs}"),
            CompareOp::Gt => format!("{lhs} > {rhs}"),
            CompareOp::Ge => format!("{lhs} >= {rhs}"),
            CompareOp::Lt => format!("{lhs} < {rhs}"),
            CompareOp::Le => format!("{lhs} <= {rhs}"),
            CompareOp::StartsWith => format!("instr({lhs}, {rhs}) = 1"),
            CompareOp::Contains => format!("instr({lhs}, {rhs}) > 0"),
        };
        Ok(sql)
    }

    fn format_sort_key(&self, base: &str, key: &SortKey) -> StorageResult<String> {
        let expr = if normalize_name(&key.table)? == normalize_name(base)? {
            self.column(&key.table, &key.column)?
        } else {
            let mut clauses = vec![format!(
                "{} = {}",
                self.column(&key.table, LINK_COLUMN)?,
                self.column(base, LINK_COLUMN)?
            )];
            for position in &key.first_row {
                clauses.push(format!("{} = 0", self.column(&key.table, position)?));
            }
            format!(
                "(SELECT {} FROM {} WHERE {} LIMIT 1)",
                self.column(&key.table, &key.column)?,
                self.quote(&key.table)?,
                clauses.join(" AND ")
            )
        };
        Ok(if key.ascending {
            format!("{expr} ASC")
        } else {
            format!("{expr} DESC")
        })
    }

    fn format_limit(limit: Option<i64>, offset: Option<i64>) -> Option<String> {
        match (limit, offset) {
            (None, None) => None,
            (Some(limit), None) => Some(format!("LIMIT {limit}")),
            (None, Some(offset)) => Some(format!("LIMIT -1 OFFSET {offset}")),
            (Some(limit), Some(offset)) => Some(format!("LIMIT {limit} OFFSET {offset}")),
        }
    }
}

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn type_name(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Boolean => "BOOLEAN",
        }
    }

    fn format_table_exists(&self, table: &str) -> StorageResult<Statement> {
        Ok(Statement {
            sql: "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?".to_string(),
            params: vec![SqlValue::Text(normalize_name(table)?)],
        })
    }

    fn format_create_table(
        &self,
        table: &str,
        columns: &[(&str, ColumnType)],
    ) -> StorageResult<Statement> {
        let specs = columns
            .iter()
            .map(|(name, column_type)| {
                Ok(format!("{} {}", self.quote(name)?, self.type_name(*column_type)))
            })
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Statement::new(format!(
            "CREATE TABLE {} ({})",
            self.quote(table)?,
            specs.join(", ")
        )))
    }

    fn format_add_column(
        &self,
        table: &str,
        column: &str,
        column_type: ColumnType,
    ) -> StorageResult<Statement> {
        Ok(Statement::new(format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.quote(table)?,
            self.quote(column)?,
            self.type_name(column_type)
        )))
    }

    fn format_rename_table(&self, old_name: &str, new_name: &str) -> StorageResult<Statement> {
        Ok(Statement::new(format!(
            "ALTER TABLE {} RENAME TO {}",
            self.quote(old_name)?,
            self.quote(new_name)?
        )))
    }

    fn format_drop_table(&self, table: &str) -> StorageResult<Statement> {
        Ok(Statement::new(format!("DROP TABLE {}", self.quote(table)?)))
    }

    fn format_select(&self, select: &Select) -> StorageResult<Statement> {
        let base = &select.table;
        let columns = select
            .columns
            .iter()
            .map(|c| self.column(base, c))
            .collect::<StorageResult<Vec<_>>>()?;

        let mut stmt = Statement::new(format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            self.quote(base)?
        ));

        if let Some(condition) = &select.condition {
            let clause = self.format_condition(base, condition, &mut stmt.params)?;
            stmt.sql.push_str(&format!(" WHERE {clause}"));
        }

        let mut keys = select
            .order_by
            .iter()
            .map(|key| self.format_sort_key(base, key))
            .collect::<StorageResult<Vec<_>>>()?;
        // Ties, and unsorted selects, keep insertion order
        keys.push(format!("{}.rowid ASC", self.quote(base)?));
        stmt.sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));

        if let Some(limit) = Self::format_limit(select.limit, select.offset) {
            stmt.sql.push(' ');
            stmt.sql.push_str(&limit);
        }

        Ok(stmt)
    }

    fn format_insert(&self, table: &str, values: &[(&str, SqlValue)]) -> StorageResult<Statement> {
        if values.is_empty() {
            return Ok(Statement::new(format!(
                "INSERT INTO {} DEFAULT VALUES",
                self.quote(table)?
            )));
        }
        let names = values
            .iter()
            .map(|(name, _)| self.quote(name))
            .collect::<StorageResult<Vec<_>>>()?;
        let placeholders = vec!["?"; values.len()];
        Ok(Statement {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.quote(table)?,
                names.join(", "),
                placeholders.join(", ")
            ),
            params: values.iter().map(|(_, v)| v.clone()).collect(),
        })
    }

    fn format_update(
        &self,
        table: &str,
        condition: Option<&Condition>,
        values: &[(&str, SqlValue)],
    ) -> StorageResult<Statement> {
        let assignments = values
            .iter()
            .map(|(name, _)| Ok(format!("{} = ?", self.quote(name)?)))
            .collect::<StorageResult<Vec<_>>>()?;
        let mut stmt = Statement {
            sql: format!(
                "UPDATE {} SET {}",
                self.quote(table)?,
                assignments.join(", ")
            ),
            params: values.iter().map(|(_, v)| v.clone()).collect(),
        };
        if let Some(condition) = condition {
            let clause = self.format_condition(table, condition, &mut stmt.params)?;
            stmt.sql.push_str(&format!(" WHERE {clause}"));
        }
        Ok(stmt)
    }

    fn format_delete(
        &self,
        table: &str,
        condition: Option<&Condition>,
    ) -> StorageResult<Statement> {
        let mut stmt = Statement::new(format!("DELETE FROM {}", self.quote(table)?));
        if let Some(condition) = condition {
            let clause = self.format_condition(table, condition, &mut stmt.params)?;
            stmt.sql.push_str(&format!(" WHERE {clause}"));
        }
        Ok(stmt)
    }
}
