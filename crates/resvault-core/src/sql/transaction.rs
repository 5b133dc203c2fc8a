//! Database handle and transactions
//!
//! A [`Database`] owns the SQLite connection and the dialect chosen for it.
//! All storage work happens inside a [`Transaction`], which borrows the
//! connection exclusively until it is committed or dropped. Dropping an
//! uncommitted transaction rolls it back, so every exit path releases the
//! connection.

use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use super::{ColumnType, Condition, Row, Select, SqlDialect, SqlValue, SqliteDialect, Statement};
use crate::config::Config;
use crate::storage::error::{StorageError, StorageResult};

/// Connection to a backing store plus the dialect used to talk to it
pub struct Database {
    conn: Connection,
    dialect: Box<dyn SqlDialect>,
}

impl Database {
    /// Open or create the SQLite database named by the configuration
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.database_path;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .context("Failed to set busy timeout")?;

        Ok(Self::with_dialect(conn, Box::new(SqliteDialect)))
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::with_dialect(conn, Box::new(SqliteDialect)))
    }

    /// Wrap an existing connection with a specific dialect
    pub fn with_dialect(conn: Connection, dialect: Box<dyn SqlDialect>) -> Self {
        Self { conn, dialect }
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Start a transaction
    ///
    /// Call [`Transaction::commit`] to keep its changes.
    pub fn begin(&mut self) -> StorageResult<Transaction<'_>> {
        let dialect = self.dialect.as_ref();
        let tx = self.conn.transaction()?;
        debug!("BEGIN ({})", dialect.name());
        Ok(Transaction { tx, dialect })
    }

    /// Run `f` in a transaction, committing on success and rolling back on error
    pub fn with_transaction<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
        E: From<StorageError>,
    {
        let tx = self.begin()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    debug!("Rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }
}

/// A unit of work against the backing store
pub struct Transaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
    dialect: &'conn dyn SqlDialect,
}

impl Transaction<'_> {
    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect
    }

    pub fn table_exists(&self, table: &str) -> StorageResult<bool> {
        let stmt = self.dialect.format_table_exists(table)?;
        let mut prepared = self.tx.prepare(&stmt.sql)?;
        Ok(prepared.exists(params_from_iter(stmt.params.iter()))?)
    }

    /// Create a table; fails if it already exists
    pub fn create_table(&self, table: &str, columns: &[(&str, ColumnType)]) -> StorageResult<()> {
        if self.table_exists(table)? {
            return Err(StorageError::TableExists {
                table: table.to_string(),
            });
        }
        self.execute(&self.dialect.format_create_table(table, columns)?)?;
        Ok(())
    }

    /// Add a column to an existing table
    pub fn add_column(
        &self,
        table: &str,
        column: &str,
        column_type: ColumnType,
    ) -> StorageResult<()> {
        self.require_table(table)?;
        self.execute(&self.dialect.format_add_column(table, column, column_type)?)?;
        Ok(())
    }

    pub fn rename_table(&self, old_name: &str, new_name: &str) -> StorageResult<()> {
        self.require_table(old_name)?;
        if self.table_exists(new_name)? {
            return Err(StorageError::TableExists {
                table: new_name.to_string(),
            });
        }
        self.execute(&self.dialect.format_rename_table(old_name, new_name)?)?;
        Ok(())
    }

    pub fn drop_table(&self, table: &str) -> StorageResult<()> {
        self.require_table(table)?;
        self.execute(&self.dialect.format_drop_table(table)?)?;
        Ok(())
    }

    /// Select `columns` from rows of `table` matching `condition`
    ///
    /// No condition selects every row.
    pub fn select(
        &self,
        table: &str,
        columns: &[&str],
        condition: Option<&Condition>,
    ) -> StorageResult<Vec<Row>> {
        let mut select = Select::new(table, columns);
        select.condition = condition.cloned();
        self.query(&select)
    }

    /// Run a select with ordering and pagination
    pub fn query(&self, select: &Select) -> StorageResult<Vec<Row>> {
        let stmt = self.dialect.format_select(select)?;
        debug!("{}", stmt.sql);

        let mut prepared = self.tx.prepare(&stmt.sql)?;
        let rows = prepared
            .query_map(params_from_iter(stmt.params.iter()), |row| {
                let mut out = Row::new();
                for (i, name) in select.columns.iter().enumerate() {
                    let value: rusqlite::types::Value = row.get(i)?;
                    out.insert(name.clone(), SqlValue::from(value));
                }
                Ok(out)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert(&self, table: &str, values: &[(&str, SqlValue)]) -> StorageResult<()> {
        self.execute(&self.dialect.format_insert(table, values)?)?;
        Ok(())
    }

    /// Update matching rows, returning how many changed
    pub fn update(
        &self,
        table: &str,
        condition: Option<&Condition>,
        values: &[(&str, SqlValue)],
    ) -> StorageResult<usize> {
        self.execute(&self.dialect.format_update(table, condition, values)?)
    }

    /// Delete matching rows, returning how many were removed
    pub fn delete(&self, table: &str, condition: Option<&Condition>) -> StorageResult<usize> {
        self.execute(&self.dialect.format_delete(table, condition)?)
    }

    pub fn commit(self) -> StorageResult<()> {
        self.tx.commit()?;
        debug!("COMMIT");
        Ok(())
    }

    pub fn rollback(self) -> StorageResult<()> {
        self.tx.rollback()?;
        debug!("ROLLBACK");
        Ok(())
    }

    fn require_table(&self, table: &str) -> StorageResult<()> {
        if self.table_exists(table)? {
            Ok(())
        } else {
            Err(StorageError::NoSuchTable {
                table: table.to_string(),
            })
        }
    }

    fn execute(&self, stmt: &Statement) -> StorageResult<usize> {
        debug!("{}", stmt.sql);
        Ok(self.tx.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?)
    }
}
