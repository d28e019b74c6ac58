//! Registry error types.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur in registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{entity} already exists: {key}")]
    Conflict { entity: &'static str, key: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} {key} is federated with {references} registration entries")]
    InUse {
        entity: &'static str,
        key: String,
        references: usize,
    },

    #[error("unsupported schema version {found:?}, expected {expected}")]
    SchemaVersion { found: Option<i32>, expected: i32 },

    #[error("{table}.{column} is {len} long, exceeding the limit of {max_len}")]
    FieldTooLong {
        table: &'static str,
        column: &'static str,
        len: usize,
        max_len: usize,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported database type {0:?}")]
    UnsupportedDatabase(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }

    /// The store cannot be used at all; retrying will not help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RegistryError::SchemaVersion { .. } | RegistryError::UnsupportedDatabase(_)
        )
    }

    pub(crate) fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        RegistryError::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Map a write failure, turning unique-constraint violations into
    /// [`RegistryError::Conflict`].
    pub(crate) fn from_write(err: rusqlite::Error, entity: &'static str, key: &str) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == ErrorCode::ConstraintViolation
                    && (e.extended_code == SQLITE_CONSTRAINT_UNIQUE
                        || e.extended_code == SQLITE_CONSTRAINT_PRIMARYKEY) =>
            {
                RegistryError::Conflict {
                    entity,
                    key: key.to_string(),
                }
            }
            _ => RegistryError::Database(err),
        }
    }
}

const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

pub type Result<T> = std::result::Result<T, RegistryError>;
