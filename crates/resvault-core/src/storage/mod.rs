//! Storage layer
//!
//! Maps nested JSON resources onto relational tables.
//!
//! ## Architecture
//!
//! - **Schema**: derived from a prototype resource; one table per list level
//! - **VersionedStorage**: ordered schema versions, migrated on startup
//! - **WriteOnlyStorage / ReadOnlyStorage**: item writes, reads and searches
//!   against the schema of the latest version
//! - **ResourceTypeStorage**: specification documents per resource type
//!
//! Every operation runs inside a caller-owned [`crate::sql::Transaction`].

pub mod error;
pub mod read_only;
pub mod resource;
pub mod restype;
pub mod schema;
pub mod search;
pub mod versioned;
pub mod write_only;

pub use error::{StorageError, StorageResult};
pub use read_only::ReadOnlyStorage;
pub use resource::{ResourceDefinition, Subitem};
pub use restype::ResourceTypeStorage;
pub use schema::{derive_schema, Column, ColumnRole, Schema, TableSchema, TableScope};
pub use search::{MatchRule, Projection, SearchParam, SearchResult, SortParam};
pub use versioned::{MigrationFn, Version, VersionedStorage, VersionedStorageBuilder};
pub use write_only::WriteOnlyStorage;
