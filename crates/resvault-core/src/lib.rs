//! resvault Core Library
//!
//! Stores structured JSON resources (nested objects, lists of scalars,
//! lists of objects) in a relational database and serves them back by id
//! or through searches.
//!
//! # Architecture
//!
//! - **Prototypes**: each resource type is described by an example
//!   resource; its table layout is derived from it
//! - **Versions**: a resource type carries an ordered list of prototypes;
//!   preparing storage migrates the tables to the latest one
//! - **SQL layer**: a small dialect-neutral query model with a SQLite
//!   backend
//!
//! # Quick Start
//!
//! ```text
//! let mut db = Database::open(&Config::load()?)?;
//!
//! let prototype = json!({"type": "", "id": "", "name": ""});
//! let versions = VersionedStorage::builder("person")
//!     .start_version("v1")
//!     .add_prototype(prototype.clone(), TableScope::Main)
//!     .build()?;
//! db.with_transaction(|t| versions.prepare_storage(t))?;
//!
//! let definition = ResourceDefinition::new("person", prototype)?;
//! let added = db.with_transaction(|t| {
//!     WriteOnlyStorage::new(definition.clone()).add_item(t, &json!({"name": "Ada"}))
//! })?;
//! ```
//!
//! # Modules
//!
//! - `storage`: schemas, versioning, item reads/writes and search
//! - `sql`: query model, SQLite dialect, connection and transactions
//! - `config`: database location and connection settings

pub mod config;
pub mod sql;
pub mod storage;

pub use config::Config;
pub use sql::{Database, Transaction};
pub use storage::{
    MatchRule, Projection, ReadOnlyStorage, ResourceDefinition, ResourceTypeStorage,
    SearchParam, SearchResult, SortParam, StorageError, StorageResult, TableScope,
    VersionedStorage, WriteOnlyStorage,
};
