//! SQL dialect adaptation.
//!
//! The registry keeps one canonical entity model and maps it onto the
//! column types and value bounds of the configured database. Mapping is an
//! explicit function per [`EntityKind`]: table names are identical across
//! dialects, column types and maximum lengths are not.
//!
//! # Bounds
//!
//! | column | sqlite3 | postgres | mysql |
//! |---|---|---|---|
//! | indexed text | `TEXT` | `VARCHAR(255)` | `VARCHAR(191)` |
//! | other text | `TEXT` | `VARCHAR(255)` | `VARCHAR(255)` |
//! | bundle data | `BLOB` | `BYTEA` | `LONGBLOB` |
//!
//! MySQL caps index keys at 767 bytes, and a 4-byte charset leaves 191
//! characters per indexed column. Bundle data is unbounded everywhere.
//! Values that do not fit are rejected with [`RegistryError::FieldTooLong`];
//! they are never truncated, since two distinct keys sharing a prefix would
//! collide on the unique index.

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use std::fmt;
use std::str::FromStr;

use crate::error::{RegistryError, Result};
use crate::models::Row;

/// Longest indexed text column MySQL accepts under utf8mb4.
pub const MYSQL_INDEX_KEY_LIMIT: usize = 191;
/// Default width of unsized text columns on servers that enforce one.
pub const DEFAULT_TEXT_LIMIT: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    Sqlite3,
    Postgres,
    Mysql,
}

impl DatabaseType {
    pub const ALL: [DatabaseType; 3] = [
        DatabaseType::Sqlite3,
        DatabaseType::Postgres,
        DatabaseType::Mysql,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite3 => "sqlite3",
            DatabaseType::Postgres => "postgres",
            DatabaseType::Mysql => "mysql",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sqlite3" => Ok(DatabaseType::Sqlite3),
            "postgres" => Ok(DatabaseType::Postgres),
            "mysql" => Ok(DatabaseType::Mysql),
            other => Err(RegistryError::UnsupportedDatabase(other.to_string())),
        }
    }
}

/// Every persisted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Bundle,
    AttestedNode,
    NodeSelector,
    RegisteredEntry,
    Selector,
    FederationLink,
    JoinToken,
    Migration,
}

impl EntityKind {
    /// In table creation order; referenced tables come first.
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Bundle,
        EntityKind::AttestedNode,
        EntityKind::NodeSelector,
        EntityKind::RegisteredEntry,
        EntityKind::Selector,
        EntityKind::FederationLink,
        EntityKind::JoinToken,
        EntityKind::Migration,
    ];

    /// Human-readable name used in errors and logs.
    pub const fn display_name(&self) -> &'static str {
        match self {
            EntityKind::Bundle => "bundle",
            EntityKind::AttestedNode => "attested node",
            EntityKind::NodeSelector => "node selector",
            EntityKind::RegisteredEntry => "registration entry",
            EntityKind::Selector => "selector",
            EntityKind::FederationLink => "federation link",
            EntityKind::JoinToken => "join token",
            EntityKind::Migration => "migration",
        }
    }

    /// Whether rows carry the `id`/`created_at`/`updated_at` base columns.
    /// Federation links are a pure join table.
    pub fn has_base_columns(&self) -> bool {
        !matches!(self, EntityKind::FederationLink)
    }
}

impl Row<'_> {
    pub fn kind(&self) -> EntityKind {
        match self {
            Row::Bundle(_) => EntityKind::Bundle,
            Row::AttestedNode(_) => EntityKind::AttestedNode,
            Row::NodeSelector(_) => EntityKind::NodeSelector,
            Row::RegisteredEntry(_) => EntityKind::RegisteredEntry,
            Row::Selector(_) => EntityKind::Selector,
            Row::FederationLink(_) => EntityKind::FederationLink,
            Row::JoinToken(_) => EntityKind::JoinToken,
            Row::Migration(_) => EntityKind::Migration,
        }
    }
}

pub fn table_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Bundle => "bundles",
        EntityKind::AttestedNode => "attested_node_entries",
        EntityKind::NodeSelector => "node_resolver_map_entries",
        EntityKind::RegisteredEntry => "registered_entries",
        EntityKind::Selector => "selectors",
        EntityKind::FederationLink => "federated_registration_entries",
        EntityKind::JoinToken => "join_tokens",
        EntityKind::Migration => "migrations",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    BigInt,
    Boolean,
    Text,
    Blob,
}

struct ColumnDef {
    name: &'static str,
    column_type: ColumnType,
    references: Option<&'static str>,
}

const fn col(name: &'static str, column_type: ColumnType) -> ColumnDef {
    ColumnDef {
        name,
        column_type,
        references: None,
    }
}

const fn fk(name: &'static str, table: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        column_type: ColumnType::Integer,
        references: Some(table),
    }
}

const BUNDLE_COLUMNS: &[ColumnDef] = &[
    col("trust_domain", ColumnType::Text),
    col("data", ColumnType::Blob),
];
const ATTESTED_NODE_COLUMNS: &[ColumnDef] = &[
    col("spiffe_id", ColumnType::Text),
    col("data_type", ColumnType::Text),
    col("serial_number", ColumnType::Text),
    col("expires_at", ColumnType::BigInt),
];
const NODE_SELECTOR_COLUMNS: &[ColumnDef] = &[
    col("spiffe_id", ColumnType::Text),
    col("type", ColumnType::Text),
    col("value", ColumnType::Text),
];
const REGISTERED_ENTRY_COLUMNS: &[ColumnDef] = &[
    col("entry_id", ColumnType::Text),
    col("spiffe_id", ColumnType::Text),
    col("parent_id", ColumnType::Text),
    col("ttl", ColumnType::Integer),
    col("admin", ColumnType::Boolean),
    col("downstream", ColumnType::Boolean),
];
const SELECTOR_COLUMNS: &[ColumnDef] = &[
    fk("registered_entry_id", "registered_entries"),
    col("type", ColumnType::Text),
    col("value", ColumnType::Text),
];
const FEDERATION_LINK_COLUMNS: &[ColumnDef] = &[
    fk("bundle_id", "bundles"),
    fk("registered_entry_id", "registered_entries"),
];
const JOIN_TOKEN_COLUMNS: &[ColumnDef] = &[
    col("token", ColumnType::Text),
    col("expiry", ColumnType::BigInt),
];
const MIGRATION_COLUMNS: &[ColumnDef] = &[col("version", ColumnType::Integer)];

fn column_defs(kind: EntityKind) -> &'static [ColumnDef] {
    match kind {
        EntityKind::Bundle => BUNDLE_COLUMNS,
        EntityKind::AttestedNode => ATTESTED_NODE_COLUMNS,
        EntityKind::NodeSelector => NODE_SELECTOR_COLUMNS,
        EntityKind::RegisteredEntry => REGISTERED_ENTRY_COLUMNS,
        EntityKind::Selector => SELECTOR_COLUMNS,
        EntityKind::FederationLink => FEDERATION_LINK_COLUMNS,
        EntityKind::JoinToken => JOIN_TOKEN_COLUMNS,
        EntityKind::Migration => MIGRATION_COLUMNS,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub unique: bool,
}

const fn unique(name: &'static str, columns: &'static [&'static str]) -> IndexSpec {
    IndexSpec {
        name,
        columns,
        unique: true,
    }
}

const fn plain(name: &'static str, columns: &'static [&'static str]) -> IndexSpec {
    IndexSpec {
        name,
        columns,
        unique: false,
    }
}

const BUNDLE_INDEXES: &[IndexSpec] = &[unique("uix_bundles_trust_domain", &["trust_domain"])];
const ATTESTED_NODE_INDEXES: &[IndexSpec] =
    &[unique("uix_attested_node_entries_spiffe_id", &["spiffe_id"])];
const NODE_SELECTOR_INDEXES: &[IndexSpec] =
    &[unique("idx_node_resolver_map", &["spiffe_id", "type", "value"])];
const REGISTERED_ENTRY_INDEXES: &[IndexSpec] = &[
    unique("uix_registered_entries_entry_id", &["entry_id"]),
    plain("idx_registered_entries_spiffe_id", &["spiffe_id"]),
    plain("idx_registered_entries_parent_id", &["parent_id"]),
];
const SELECTOR_INDEXES: &[IndexSpec] = &[unique(
    "idx_selector_entry",
    &["registered_entry_id", "type", "value"],
)];
const FEDERATION_LINK_INDEXES: &[IndexSpec] = &[unique(
    "uix_federated_registration_entries",
    &["bundle_id", "registered_entry_id"],
)];
const JOIN_TOKEN_INDEXES: &[IndexSpec] = &[unique("uix_join_tokens_token", &["token"])];

pub fn indexes(kind: EntityKind) -> &'static [IndexSpec] {
    match kind {
        EntityKind::Bundle => BUNDLE_INDEXES,
        EntityKind::AttestedNode => ATTESTED_NODE_INDEXES,
        EntityKind::NodeSelector => NODE_SELECTOR_INDEXES,
        EntityKind::RegisteredEntry => REGISTERED_ENTRY_INDEXES,
        EntityKind::Selector => SELECTOR_INDEXES,
        EntityKind::FederationLink => FEDERATION_LINK_INDEXES,
        EntityKind::JoinToken => JOIN_TOKEN_INDEXES,
        EntityKind::Migration => &[],
    }
}

fn is_indexed(kind: EntityKind, column: &str) -> bool {
    indexes(kind)
        .iter()
        .any(|index| index.columns.contains(&column))
}

/// Column as laid out for one dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub column_type: ColumnType,
    /// Characters for text, bytes for blobs
    pub max_len: Option<usize>,
    pub indexed: bool,
    pub references: Option<&'static str>,
}

impl ColumnSpec {
    pub fn sql_type(&self, db: DatabaseType) -> String {
        match (self.column_type, db) {
            (ColumnType::Integer, _) => "INTEGER".to_string(),
            (ColumnType::BigInt, DatabaseType::Sqlite3) => "INTEGER".to_string(),
            (ColumnType::BigInt, _) => "BIGINT".to_string(),
            (ColumnType::Boolean, _) => "BOOLEAN".to_string(),
            (ColumnType::Text, _) => match self.max_len {
                Some(len) => format!("VARCHAR({len})"),
                None => "TEXT".to_string(),
            },
            (ColumnType::Blob, DatabaseType::Postgres) => "BYTEA".to_string(),
            (ColumnType::Blob, DatabaseType::Mysql) => "LONGBLOB".to_string(),
            (ColumnType::Blob, _) => "BLOB".to_string(),
        }
    }
}

fn max_len(kind: EntityKind, def: &ColumnDef, db: DatabaseType) -> Option<usize> {
    match def.column_type {
        ColumnType::Text => match db {
            DatabaseType::Sqlite3 => None,
            DatabaseType::Postgres => Some(DEFAULT_TEXT_LIMIT),
            DatabaseType::Mysql if is_indexed(kind, def.name) => Some(MYSQL_INDEX_KEY_LIMIT),
            DatabaseType::Mysql => Some(DEFAULT_TEXT_LIMIT),
        },
        _ => None,
    }
}

/// Entity columns for `db`, excluding the base columns.
pub fn column_specs(kind: EntityKind, db: DatabaseType) -> Vec<ColumnSpec> {
    column_defs(kind)
        .iter()
        .map(|def| ColumnSpec {
            name: def.name,
            column_type: def.column_type,
            max_len: max_len(kind, def, db),
            indexed: is_indexed(kind, def.name),
            references: def.references,
        })
        .collect()
}

/// A dialect-neutral column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Integer(i64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
}

impl ColumnValue {
    /// Length checked against a column bound, if the value has one.
    pub fn bounded_len(&self) -> Option<usize> {
        match self {
            ColumnValue::Text(s) => Some(s.chars().count()),
            ColumnValue::Blob(b) => Some(b.len()),
            ColumnValue::Integer(_) | ColumnValue::Bool(_) => None,
        }
    }
}

impl ToSql for ColumnValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ColumnValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            ColumnValue::Bool(v) => ToSqlOutput::Owned(Value::Integer(i64::from(*v))),
            ColumnValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            ColumnValue::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

/// A column value paired with the bound it was checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bounded {
    pub column: &'static str,
    pub value: ColumnValue,
    pub max_len: Option<usize>,
}

/// An entity mapped onto one dialect, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectRow {
    pub kind: EntityKind,
    pub db: DatabaseType,
    pub table: &'static str,
    pub columns: Vec<Bounded>,
}

impl DialectRow {
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|c| c.column == column)
            .map(|c| &c.value)
    }
}

fn row_values(row: &Row<'_>) -> Vec<ColumnValue> {
    use ColumnValue::{Blob, Bool, Integer, Text};

    match row {
        Row::Bundle(b) => vec![Text(b.trust_domain.clone()), Blob(b.data.clone())],
        Row::AttestedNode(n) => vec![
            Text(n.spiffe_id.clone()),
            Text(n.data_type.clone()),
            Text(n.serial_number.clone()),
            Integer(n.expires_at),
        ],
        Row::NodeSelector(s) => vec![
            Text(s.spiffe_id.clone()),
            Text(s.selector_type.clone()),
            Text(s.value.clone()),
        ],
        Row::RegisteredEntry(e) => vec![
            Text(e.entry_id.clone()),
            Text(e.spiffe_id.clone()),
            Text(e.parent_id.clone()),
            Integer(i64::from(e.ttl)),
            Bool(e.admin),
            Bool(e.downstream),
        ],
        Row::Selector(s) => vec![
            Integer(s.registered_entry_id),
            Text(s.selector_type.clone()),
            Text(s.value.clone()),
        ],
        Row::FederationLink(l) => vec![Integer(l.bundle_id), Integer(l.registered_entry_id)],
        Row::JoinToken(t) => vec![Text(t.token.clone()), Integer(t.expiry)],
        Row::Migration(m) => vec![Integer(i64::from(m.version))],
    }
}

fn bind(
    kind: EntityKind,
    values: impl IntoIterator<Item = ColumnValue>,
    db: DatabaseType,
) -> Result<DialectRow> {
    let table = table_name(kind);
    let columns = column_specs(kind, db)
        .into_iter()
        .zip(values)
        .map(|(spec, value)| {
            if let (Some(max_len), Some(len)) = (spec.max_len, value.bounded_len()) {
                if len > max_len {
                    return Err(RegistryError::FieldTooLong {
                        table,
                        column: spec.name,
                        len,
                        max_len,
                    });
                }
            }
            Ok(Bounded {
                column: spec.name,
                value,
                max_len: spec.max_len,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(DialectRow {
        kind,
        db,
        table,
        columns,
    })
}

/// Map a canonical entity onto `db`.
///
/// Pure and deterministic. Fails with [`RegistryError::FieldTooLong`] when a
/// value exceeds its column bound for this dialect.
pub fn model_for_dialect(row: &Row<'_>, db: DatabaseType) -> Result<DialectRow> {
    bind(row.kind(), row_values(row), db)
}

/// Re-apply the bounds of `db` to an already mapped row.
///
/// Remapping onto the row's own dialect returns it unchanged; remapping onto
/// a stricter dialect reports the first value that no longer fits.
pub fn remap_for_dialect(row: &DialectRow, db: DatabaseType) -> Result<DialectRow> {
    bind(row.kind, row.columns.iter().map(|c| c.value.clone()), db)
}

fn primary_key(db: DatabaseType) -> &'static str {
    match db {
        DatabaseType::Sqlite3 => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        DatabaseType::Postgres => "id SERIAL PRIMARY KEY",
        DatabaseType::Mysql => "id INTEGER PRIMARY KEY AUTO_INCREMENT",
    }
}

/// `CREATE TABLE` and `CREATE INDEX` statements for the full schema.
pub fn schema_ddl(db: DatabaseType) -> Vec<String> {
    let timestamp = ColumnSpec {
        name: "created_at",
        column_type: ColumnType::BigInt,
        max_len: None,
        indexed: false,
        references: None,
    }
    .sql_type(db);

    let mut statements = Vec::new();
    for kind in EntityKind::ALL {
        let table = table_name(kind);

        let mut columns = Vec::new();
        if kind.has_base_columns() {
            columns.push(primary_key(db).to_string());
            columns.push(format!("created_at {timestamp} NOT NULL"));
            columns.push(format!("updated_at {timestamp} NOT NULL"));
        }
        for spec in column_specs(kind, db) {
            let mut column = format!("{} {} NOT NULL", spec.name, spec.sql_type(db));
            if let Some(parent) = spec.references {
                column.push_str(&format!(" REFERENCES {parent}(id) ON DELETE CASCADE"));
            }
            columns.push(column);
        }
        statements.push(format!(
            "CREATE TABLE {table} (\n    {}\n)",
            columns.join(",\n    ")
        ));

        for index in indexes(kind) {
            statements.push(format!(
                "CREATE {}INDEX {} ON {table} ({})",
                if index.unique { "UNIQUE " } else { "" },
                index.name,
                index.columns.join(", ")
            ));
        }
    }
    statements
}
