//! Trust registry for trustforge.
//!
//! Durable storage for trust bundles, attested nodes and their selectors,
//! registration entries and join tokens, over a relational schema whose
//! column bounds follow the configured SQL dialect.
//!
//! # Core Concepts
//!
//! - **Bundle**: trust material for one trust domain
//! - **Attested node**: an agent that completed node attestation
//! - **Registration entry**: selectors and a parent identity mapped to a workload identity
//! - **Dialect**: `sqlite3`, `postgres` or `mysql` column types and value bounds

pub mod dialect;
pub mod error;
pub mod models;
pub mod store;

pub use dialect::{
    column_specs, model_for_dialect, remap_for_dialect, schema_ddl, table_name, DatabaseType,
    DialectRow, EntityKind,
};
pub use error::{RegistryError, Result};
pub use models::{
    AttestedNode, Bundle, DeleteMode, JoinToken, ListEntriesRequest, Model, RegisteredEntry, Row,
    Selector,
};
pub use store::{SqlStore, CURRENT_SCHEMA_VERSION};
