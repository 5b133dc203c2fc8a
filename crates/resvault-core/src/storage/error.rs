//! Storage error handling
//!
//! Provides typed errors for schema derivation, transactions, migrations and
//! item storage, with classification helpers for the layer above.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Requested item id is not in the root table
    #[error("Item does not exist: '{item_id}'")]
    ItemDoesNotExist { item_id: String },

    /// Search or sort field does not resolve in the registered schema
    #[error("Resource does not contain field '{field}'")]
    FieldNotInResource { field: String },

    /// Prototype shape is ambiguous or disagrees with another registration
    #[error("Schema conflict: {details}")]
    SchemaConflict { details: String },

    /// Prototype nests lists deeper than the table layout supports
    #[error("Prototype is too deeply nested at field '{field}'")]
    TooDeeplyNested { field: String },

    /// Table or column name contains characters that cannot be used in SQL
    #[error("Invalid table or column name: '{name}'")]
    InvalidName { name: String },

    /// Attempt to create a table that already exists
    #[error("Table '{table}' already exists")]
    TableExists { table: String },

    /// Attempt to alter, rename or drop a table that does not exist
    #[error("Table '{table}' does not exist")]
    NoSuchTable { table: String },

    /// Subitem name was never registered for the resource type
    #[error("Resource type '{resource_type}' has no subitem '{subitem}'")]
    UnknownSubitem {
        resource_type: String,
        subitem: String,
    },

    /// New items get their id from storage
    #[error("Cannot add an item that already has an id")]
    CannotAddWithId,

    /// New items get their revision from storage
    #[error("Cannot add an item that already has a revision")]
    CannotAddWithRevision,

    /// Item value does not fit the column derived from the prototype
    #[error("Invalid value for field '{field}': expected {expected}")]
    InvalidFieldValue { field: String, expected: String },

    /// Search value cannot be compared against the field's column type
    #[error("Invalid search value '{value}' for field '{field}'")]
    InvalidSearchValue { field: String, value: String },

    /// Search rule name is not one of the supported rules
    #[error("Unknown search rule: '{0}'")]
    UnknownMatchRule(String),

    /// Version registration is inconsistent
    #[error("Invalid version registration: {0}")]
    InvalidVersion(String),

    /// Resource type specification lacks a usable type name
    #[error("Invalid resource type specification: {0}")]
    InvalidSpec(String),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Check if this error was caused by the caller's input
    ///
    /// These are the errors an API layer reports back to the client instead
    /// of treating them as server failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StorageError::ItemDoesNotExist { .. }
                | StorageError::FieldNotInResource { .. }
                | StorageError::UnknownSubitem { .. }
                | StorageError::CannotAddWithId
                | StorageError::CannotAddWithRevision
                | StorageError::InvalidFieldValue { .. }
                | StorageError::InvalidSearchValue { .. }
                | StorageError::UnknownMatchRule(_)
                | StorageError::InvalidSpec(_)
        )
    }

    /// Check if retrying the whole transaction may succeed
    ///
    /// Only lock contention in the backing store qualifies.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            _ if self.is_transient() => {
                Some("Another connection holds the database lock. Retry the transaction.")
            }
            StorageError::SchemaConflict { .. } | StorageError::TooDeeplyNested { .. } => {
                Some("Fix the resource prototype so every field has exactly one shape.")
            }
            StorageError::TableExists { .. } | StorageError::NoSuchTable { .. } => {
                Some("The stored tables do not match the registered versions.")
            }
            StorageError::InvalidVersion(_) => {
                Some("Register each version once, and call start_version before add_prototype.")
            }
            _ => None,
        }
    }

    pub(crate) fn field_not_in_resource(field: impl Into<String>) -> Self {
        StorageError::FieldNotInResource {
            field: field.into(),
        }
    }

    pub(crate) fn schema_conflict(details: impl Into<String>) -> Self {
        StorageError::SchemaConflict {
            details: details.into(),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
