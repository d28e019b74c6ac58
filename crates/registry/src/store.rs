//! SQL trust registry.
//!
//! The store persists bundles, attested nodes, node selectors, registration
//! entries and join tokens. The execution engine is SQLite; the configured
//! [`DatabaseType`] selects the value bounds every write is checked against
//! (see [`crate::dialect`]), so a registry that would overflow a MySQL index
//! is rejected here rather than after migrating.
//!
//! # Guarantees
//!
//! - Every write goes through [`model_for_dialect`] first
//! - Multi-row writes (entry + selectors + federation links, selector
//!   replacement, cascading bundle deletes) are single transactions
//! - One connection behind a mutex: writes are serialized, so two selector
//!   replacements for the same node never interleave
//! - The schema version is checked on open; a mismatch is fatal and there is
//!   no automatic migration

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row as SqlRow};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use trustforge_core::{clock, DataStoreConfig};

use crate::dialect::{
    model_for_dialect, schema_ddl, ColumnValue, DatabaseType, DialectRow, EntityKind,
};
use crate::error::{RegistryError, Result};
use crate::models::{
    AttestedNode, Bundle, DeleteMode, EntrySelector, FederationLink, JoinToken,
    ListEntriesRequest, Migration, Model, NodeSelector, RegisteredEntry, Row, Selector,
};

/// Schema version written to fresh databases and required of existing ones.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

const IN_MEMORY: &str = ":memory:";
const REDACTED: &str = "[redacted]";

const BUNDLE: &str = EntityKind::Bundle.display_name();
const ATTESTED_NODE: &str = EntityKind::AttestedNode.display_name();
const NODE_SELECTOR: &str = EntityKind::NodeSelector.display_name();
const REGISTERED_ENTRY: &str = EntityKind::RegisteredEntry.display_name();
const SELECTOR: &str = EntityKind::Selector.display_name();
const FEDERATION_LINK: &str = EntityKind::FederationLink.display_name();
const JOIN_TOKEN: &str = EntityKind::JoinToken.display_name();

const BUNDLE_COLUMNS: &str = "id, created_at, updated_at, trust_domain, data";
const ATTESTED_NODE_COLUMNS: &str =
    "id, created_at, updated_at, spiffe_id, data_type, serial_number, expires_at";
const ENTRY_COLUMNS: &str =
    "id, created_at, updated_at, entry_id, spiffe_id, parent_id, ttl, admin, downstream";
const JOIN_TOKEN_COLUMNS: &str = "id, created_at, updated_at, token, expiry";

/// SQLite-backed registry
pub struct SqlStore {
    conn: Mutex<Connection>,
    db: DatabaseType,
}

impl SqlStore {
    /// Open the datastore described by `config`.
    ///
    /// Only `sqlite3` connections can be opened; the other dialects are
    /// available through [`SqlStore::open_with_dialect`] for bound checking.
    pub fn open(config: &DataStoreConfig) -> Result<Self> {
        let db: DatabaseType = config.database_type.parse()?;
        if db != DatabaseType::Sqlite3 {
            return Err(RegistryError::UnsupportedDatabase(db.to_string()));
        }

        if config.connection_string == IN_MEMORY {
            Self::open_in_memory(db)
        } else {
            Self::open_with_dialect(&config.connection_string, db)
        }
    }

    /// Open (or create) a database file, checking values against `db`.
    pub fn open_with_dialect(path: impl AsRef<Path>, db: DatabaseType) -> Result<Self> {
        let path = path.as_ref();

        info!(
            path = %path.display(),
            dialect = %db,
            "Opening registry datastore"
        );

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::init(conn, db)
    }

    /// Fresh in-memory database, checking values against `db`.
    pub fn open_in_memory(db: DatabaseType) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, db)
    }

    fn init(mut conn: Connection, db: DatabaseType) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let found = read_schema_version(&conn)?;
        if found.is_none() && user_table_count(&conn)? == 0 {
            apply_schema(&mut conn, db)?;
            info!(version = CURRENT_SCHEMA_VERSION, "Registry schema created");
        } else if found != Some(CURRENT_SCHEMA_VERSION) {
            warn!(
                found = ?found,
                expected = CURRENT_SCHEMA_VERSION,
                "Refusing to open registry with unsupported schema version"
            );
            return Err(RegistryError::SchemaVersion {
                found,
                expected: CURRENT_SCHEMA_VERSION,
            });
        } else {
            debug!(version = CURRENT_SCHEMA_VERSION, "Registry schema version ok");
        }

        Ok(Self {
            conn: Mutex::new(conn),
            db,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dialect whose bounds this store enforces.
    pub fn dialect(&self) -> DatabaseType {
        self.db
    }

    fn map(&self, row: Row<'_>) -> Result<DialectRow> {
        model_for_dialect(&row, self.db)
    }

    pub fn schema_version(&self) -> Result<i32> {
        read_schema_version(&self.conn())?.ok_or(RegistryError::SchemaVersion {
            found: None,
            expected: CURRENT_SCHEMA_VERSION,
        })
    }

    // Bundles

    pub fn create_bundle(&self, bundle: &Bundle) -> Result<Bundle> {
        require("trust domain", &bundle.trust_domain)?;
        let row = self.map(Row::Bundle(bundle))?;
        let now = clock::now_unix();

        let id = insert_row(&self.conn(), &row, now)
            .map_err(|e| RegistryError::from_write(e, BUNDLE, &bundle.trust_domain))?;

        debug!(trust_domain = %bundle.trust_domain, id, "Bundle created");

        Ok(Bundle {
            model: Model::created(id, now),
            ..bundle.clone()
        })
    }

    pub fn fetch_bundle(&self, trust_domain: &str) -> Result<Bundle> {
        bundle_by_trust_domain(&self.conn(), trust_domain)
    }

    pub fn list_bundles(&self) -> Result<Vec<Bundle>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {BUNDLE_COLUMNS} FROM bundles ORDER BY id"))?;
        let bundles = stmt
            .query_map([], bundle_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bundles)
    }

    /// Replace the data of an existing bundle.
    pub fn update_bundle(&self, bundle: &Bundle) -> Result<Bundle> {
        let row = self.map(Row::Bundle(bundle))?;
        let now = clock::now_unix();
        let conn = self.conn();

        if update_row(&conn, &row, &["trust_domain"], now)? == 0 {
            return Err(RegistryError::not_found(BUNDLE, &bundle.trust_domain));
        }

        debug!(trust_domain = %bundle.trust_domain, "Bundle updated");
        bundle_by_trust_domain(&conn, &bundle.trust_domain)
    }

    /// Delete a bundle; `mode` decides what happens to federated entries.
    pub fn delete_bundle(&self, trust_domain: &str, mode: DeleteMode) -> Result<Bundle> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let bundle = bundle_by_trust_domain(&tx, trust_domain)?;
        let entry_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT registered_entry_id FROM federated_registration_entries WHERE bundle_id = ?1",
            )?;
            let ids = stmt
                .query_map([bundle.model.id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        match mode {
            DeleteMode::Restrict if !entry_ids.is_empty() => {
                return Err(RegistryError::InUse {
                    entity: BUNDLE,
                    key: trust_domain.to_string(),
                    references: entry_ids.len(),
                });
            }
            DeleteMode::Restrict => {}
            DeleteMode::Dissociate => {
                tx.execute(
                    "DELETE FROM federated_registration_entries WHERE bundle_id = ?1",
                    [bundle.model.id],
                )?;
            }
            DeleteMode::Delete => {
                for id in &entry_ids {
                    tx.execute("DELETE FROM registered_entries WHERE id = ?1", [id])?;
                }
            }
        }

        tx.execute("DELETE FROM bundles WHERE id = ?1", [bundle.model.id])?;
        tx.commit()?;

        info!(
            trust_domain = %trust_domain,
            mode = ?mode,
            federated_entries = entry_ids.len(),
            "Bundle deleted"
        );

        Ok(bundle)
    }

    // Attested nodes

    pub fn create_attested_node(&self, node: &AttestedNode) -> Result<AttestedNode> {
        require("SPIFFE ID", &node.spiffe_id)?;
        let row = self.map(Row::AttestedNode(node))?;
        let now = clock::now_unix();

        let id = insert_row(&self.conn(), &row, now)
            .map_err(|e| RegistryError::from_write(e, ATTESTED_NODE, &node.spiffe_id))?;

        info!(
            spiffe_id = %node.spiffe_id,
            data_type = %node.data_type,
            expires_at = node.expires_at,
            "Attested node created"
        );

        Ok(AttestedNode {
            model: Model::created(id, now),
            ..node.clone()
        })
    }

    pub fn fetch_attested_node(&self, spiffe_id: &str) -> Result<AttestedNode> {
        attested_node_by_spiffe_id(&self.conn(), spiffe_id)
    }

    /// All attested nodes, or only those whose credential expires strictly
    /// before `expires_before`.
    pub fn list_attested_nodes(&self, expires_before: Option<i64>) -> Result<Vec<AttestedNode>> {
        let conn = self.conn();
        let nodes = match expires_before {
            Some(before) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ATTESTED_NODE_COLUMNS} FROM attested_node_entries \
                     WHERE expires_at < ?1 ORDER BY id"
                ))?;
                let nodes = stmt
                    .query_map([before], attested_node_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                nodes
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ATTESTED_NODE_COLUMNS} FROM attested_node_entries ORDER BY id"
                ))?;
                let nodes = stmt
                    .query_map([], attested_node_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                nodes
            }
        };
        Ok(nodes)
    }

    /// Record a rotated credential for an attested node. Last writer wins.
    pub fn update_attested_node(
        &self,
        spiffe_id: &str,
        serial_number: &str,
        expires_at: i64,
    ) -> Result<AttestedNode> {
        let now = clock::now_unix();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing = attested_node_by_spiffe_id(&tx, spiffe_id)?;
        let mut updated = AttestedNode {
            serial_number: serial_number.to_string(),
            expires_at,
            ..existing
        };
        let row = self.map(Row::AttestedNode(&updated))?;
        update_row(&tx, &row, &["spiffe_id"], now)?;
        tx.commit()?;

        updated.model.updated_at = now;
        debug!(spiffe_id = %spiffe_id, expires_at, "Attested node updated");
        Ok(updated)
    }

    pub fn delete_attested_node(&self, spiffe_id: &str) -> Result<AttestedNode> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let node = attested_node_by_spiffe_id(&tx, spiffe_id)?;
        tx.execute(
            "DELETE FROM attested_node_entries WHERE id = ?1",
            [node.model.id],
        )?;
        tx.commit()?;

        info!(spiffe_id = %spiffe_id, "Attested node deleted");
        Ok(node)
    }

    // Node selectors

    /// Replace the full selector set of a node.
    pub fn set_node_selectors(&self, spiffe_id: &str, selectors: &[Selector]) -> Result<()> {
        require("SPIFFE ID", spiffe_id)?;
        let rows = selectors
            .iter()
            .map(|s| NodeSelector {
                model: Model::default(),
                spiffe_id: spiffe_id.to_string(),
                selector_type: s.selector_type.clone(),
                value: s.value.clone(),
            })
            .collect::<Vec<_>>();
        let mapped = rows
            .iter()
            .map(|s| self.map(Row::NodeSelector(s)))
            .collect::<Result<Vec<_>>>()?;

        let now = clock::now_unix();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM node_resolver_map_entries WHERE spiffe_id = ?1",
            [spiffe_id],
        )?;
        for (selector, row) in selectors.iter().zip(&mapped) {
            insert_row(&tx, row, now).map_err(|e| {
                RegistryError::from_write(e, NODE_SELECTOR, &selector_key(selector))
            })?;
        }
        tx.commit()?;

        debug!(spiffe_id = %spiffe_id, count = selectors.len(), "Node selectors set");
        Ok(())
    }

    pub fn get_node_selectors(&self, spiffe_id: &str) -> Result<Vec<Selector>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT type, value FROM node_resolver_map_entries WHERE spiffe_id = ?1 ORDER BY id",
        )?;
        let selectors = stmt
            .query_map([spiffe_id], selector_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(selectors)
    }

    // Registration entries

    /// Create an entry with its selectors and federation links.
    ///
    /// An empty `entry_id` is replaced with a random UUID. Naming a trust
    /// domain without a bundle fails with `NotFound` and nothing is written.
    pub fn create_registration_entry(&self, entry: &RegisteredEntry) -> Result<RegisteredEntry> {
        require("SPIFFE ID", &entry.spiffe_id)?;
        require("parent ID", &entry.parent_id)?;

        let mut entry = entry.clone();
        if entry.entry_id.is_empty() {
            entry.entry_id = uuid::Uuid::new_v4().to_string();
        }
        let row = self.map(Row::RegisteredEntry(&entry))?;

        let now = clock::now_unix();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let id = insert_row(&tx, &row, now)
            .map_err(|e| RegistryError::from_write(e, REGISTERED_ENTRY, &entry.entry_id))?;
        self.write_entry_relations(&tx, id, &entry, now)?;
        tx.commit()?;

        entry.model = Model::created(id, now);

        info!(
            entry_id = %entry.entry_id,
            spiffe_id = %entry.spiffe_id,
            parent_id = %entry.parent_id,
            selectors = entry.selectors.len(),
            federates_with = entry.federates_with.len(),
            "Registration entry created"
        );

        Ok(entry)
    }

    pub fn fetch_registration_entry(&self, entry_id: &str) -> Result<RegisteredEntry> {
        entry_by_entry_id(&self.conn(), entry_id)
    }

    pub fn list_registration_entries(
        &self,
        request: &ListEntriesRequest,
    ) -> Result<Vec<RegisteredEntry>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(parent_id) = &request.by_parent_id {
            values.push(parent_id.as_str());
            clauses.push(format!("parent_id = ?{}", values.len()));
        }
        if let Some(spiffe_id) = &request.by_spiffe_id {
            values.push(spiffe_id.as_str());
            clauses.push(format!("spiffe_id = ?{}", values.len()));
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM registered_entries{filter} ORDER BY id"
        ))?;
        let mut entries = stmt
            .query_map(rusqlite::params_from_iter(values), entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for entry in &mut entries {
            load_entry_relations(&conn, entry)?;
        }
        Ok(entries)
    }

    /// Replace an entry's fields, selectors and federation links.
    pub fn update_registration_entry(&self, entry: &RegisteredEntry) -> Result<RegisteredEntry> {
        require("entry ID", &entry.entry_id)?;
        let row = self.map(Row::RegisteredEntry(entry))?;

        let now = clock::now_unix();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing = entry_by_entry_id(&tx, &entry.entry_id)?;
        let id = existing.model.id;
        update_row(&tx, &row, &["entry_id"], now)?;
        tx.execute("DELETE FROM selectors WHERE registered_entry_id = ?1", [id])?;
        tx.execute(
            "DELETE FROM federated_registration_entries WHERE registered_entry_id = ?1",
            [id],
        )?;
        self.write_entry_relations(&tx, id, entry, now)?;
        tx.commit()?;

        debug!(entry_id = %entry.entry_id, "Registration entry updated");

        Ok(RegisteredEntry {
            model: Model {
                id,
                created_at: existing.model.created_at,
                updated_at: now,
            },
            ..entry.clone()
        })
    }

    /// Delete an entry, returning it as it was.
    pub fn delete_registration_entry(&self, entry_id: &str) -> Result<RegisteredEntry> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let entry = entry_by_entry_id(&tx, entry_id)?;
        // Selectors and federation links cascade.
        tx.execute(
            "DELETE FROM registered_entries WHERE id = ?1",
            [entry.model.id],
        )?;
        tx.commit()?;

        info!(entry_id = %entry_id, spiffe_id = %entry.spiffe_id, "Registration entry deleted");
        Ok(entry)
    }

    fn write_entry_relations(
        &self,
        conn: &Connection,
        id: i64,
        entry: &RegisteredEntry,
        now: i64,
    ) -> Result<()> {
        for selector in &entry.selectors {
            let row = EntrySelector {
                model: Model::default(),
                registered_entry_id: id,
                selector_type: selector.selector_type.clone(),
                value: selector.value.clone(),
            };
            let row = self.map(Row::Selector(&row))?;
            insert_row(conn, &row, now)
                .map_err(|e| RegistryError::from_write(e, SELECTOR, &selector_key(selector)))?;
        }

        for trust_domain in &entry.federates_with {
            let bundle_id: i64 = conn
                .query_row(
                    "SELECT id FROM bundles WHERE trust_domain = ?1",
                    [trust_domain],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| RegistryError::not_found(BUNDLE, trust_domain))?;
            let link = FederationLink {
                bundle_id,
                registered_entry_id: id,
            };
            let row = self.map(Row::FederationLink(&link))?;
            insert_row(conn, &row, now)
                .map_err(|e| RegistryError::from_write(e, FEDERATION_LINK, trust_domain))?;
        }

        Ok(())
    }

    // Join tokens

    pub fn create_join_token(&self, token: &JoinToken) -> Result<JoinToken> {
        require("token", &token.token)?;
        let row = self.map(Row::JoinToken(token))?;
        let now = clock::now_unix();

        let id = insert_row(&self.conn(), &row, now)
            .map_err(|e| RegistryError::from_write(e, JOIN_TOKEN, REDACTED))?;

        debug!(id, expiry = token.expiry, "Join token created");

        Ok(JoinToken {
            model: Model::created(id, now),
            ..token.clone()
        })
    }

    pub fn fetch_join_token(&self, token: &str) -> Result<JoinToken> {
        join_token_by_value(&self.conn(), token)
    }

    /// Consume a join token.
    pub fn delete_join_token(&self, token: &str) -> Result<JoinToken> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let join_token = join_token_by_value(&tx, token)?;
        tx.execute("DELETE FROM join_tokens WHERE id = ?1", [join_token.model.id])?;
        tx.commit()?;

        debug!(id = join_token.model.id, "Join token deleted");
        Ok(join_token)
    }

    /// Delete tokens expiring strictly before `expires_before`; returns the count.
    pub fn prune_join_tokens(&self, expires_before: i64) -> Result<usize> {
        let pruned = self.conn().execute(
            "DELETE FROM join_tokens WHERE expiry < ?1",
            [expires_before],
        )?;

        info!(pruned, expires_before, "Join tokens pruned");
        Ok(pruned)
    }
}

impl Model {
    fn created(id: i64, now: i64) -> Self {
        Self {
            id,
            created_at: now,
            updated_at: now,
        }
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(RegistryError::InvalidArgument(format!("{field} is required")));
    }
    Ok(())
}

fn selector_key(selector: &Selector) -> String {
    format!("{}:{}", selector.selector_type, selector.value)
}

fn apply_schema(conn: &mut Connection, db: DatabaseType) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(&schema_ddl(DatabaseType::Sqlite3).join(";\n"))?;

    let migration = Migration {
        model: Model::default(),
        version: CURRENT_SCHEMA_VERSION,
    };
    let row = model_for_dialect(&Row::Migration(&migration), db)?;
    insert_row(&tx, &row, clock::now_unix())?;

    tx.commit()?;
    Ok(())
}

fn user_table_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?)
}

fn read_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let has_table: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'migrations'",
        [],
        |row| row.get(0),
    )?;
    if !has_table {
        return Ok(None);
    }

    Ok(conn
        .query_row(
            "SELECT version FROM migrations ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

/// Insert a mapped row, stamping the base columns when the table has them.
fn insert_row(conn: &Connection, row: &DialectRow, now: i64) -> rusqlite::Result<i64> {
    let mut columns = Vec::with_capacity(row.columns.len() + 2);
    let mut values = Vec::with_capacity(row.columns.len() + 2);
    if row.kind.has_base_columns() {
        columns.extend(["created_at", "updated_at"]);
        values.extend([
            ColumnValue::Integer(now),
            ColumnValue::Integer(now),
        ]);
    }
    for bounded in &row.columns {
        columns.push(bounded.column);
        values.push(bounded.value.clone());
    }

    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            row.table,
            columns.join(", ")
        ),
        rusqlite::params_from_iter(values.iter()),
    )?;
    Ok(conn.last_insert_rowid())
}

/// Update every non-key column of a mapped row; returns the affected count.
fn update_row(
    conn: &Connection,
    row: &DialectRow,
    key: &[&str],
    now: i64,
) -> rusqlite::Result<usize> {
    let mut assignments = vec!["updated_at = ?1".to_string()];
    let mut values = vec![ColumnValue::Integer(now)];
    for bounded in row.columns.iter().filter(|c| !key.contains(&c.column)) {
        values.push(bounded.value.clone());
        assignments.push(format!("{} = ?{}", bounded.column, values.len()));
    }

    let mut conditions = Vec::with_capacity(key.len());
    for bounded in row.columns.iter().filter(|c| key.contains(&c.column)) {
        values.push(bounded.value.clone());
        conditions.push(format!("{} = ?{}", bounded.column, values.len()));
    }

    conn.execute(
        &format!(
            "UPDATE {} SET {} WHERE {}",
            row.table,
            assignments.join(", "),
            conditions.join(" AND ")
        ),
        rusqlite::params_from_iter(values.iter()),
    )
}

fn model_from_row(row: &SqlRow<'_>) -> rusqlite::Result<Model> {
    Ok(Model {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn bundle_from_row(row: &SqlRow<'_>) -> rusqlite::Result<Bundle> {
    Ok(Bundle {
        model: model_from_row(row)?,
        trust_domain: row.get("trust_domain")?,
        data: row.get("data")?,
    })
}

fn attested_node_from_row(row: &SqlRow<'_>) -> rusqlite::Result<AttestedNode> {
    Ok(AttestedNode {
        model: model_from_row(row)?,
        spiffe_id: row.get("spiffe_id")?,
        data_type: row.get("data_type")?,
        serial_number: row.get("serial_number")?,
        expires_at: row.get("expires_at")?,
    })
}

fn entry_from_row(row: &SqlRow<'_>) -> rusqlite::Result<RegisteredEntry> {
    Ok(RegisteredEntry {
        model: model_from_row(row)?,
        entry_id: row.get("entry_id")?,
        spiffe_id: row.get("spiffe_id")?,
        parent_id: row.get("parent_id")?,
        ttl: row.get("ttl")?,
        selectors: Vec::new(),
        federates_with: Vec::new(),
        admin: row.get("admin")?,
        downstream: row.get("downstream")?,
    })
}

fn join_token_from_row(row: &SqlRow<'_>) -> rusqlite::Result<JoinToken> {
    Ok(JoinToken {
        model: model_from_row(row)?,
        token: row.get("token")?,
        expiry: row.get("expiry")?,
    })
}

fn selector_from_row(row: &SqlRow<'_>) -> rusqlite::Result<Selector> {
    Ok(Selector {
        selector_type: row.get(0)?,
        value: row.get(1)?,
    })
}

fn bundle_by_trust_domain(conn: &Connection, trust_domain: &str) -> Result<Bundle> {
    conn.query_row(
        &format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE trust_domain = ?1"),
        [trust_domain],
        bundle_from_row,
    )
    .optional()?
    .ok_or_else(|| RegistryError::not_found(BUNDLE, trust_domain))
}

fn attested_node_by_spiffe_id(conn: &Connection, spiffe_id: &str) -> Result<AttestedNode> {
    conn.query_row(
        &format!("SELECT {ATTESTED_NODE_COLUMNS} FROM attested_node_entries WHERE spiffe_id = ?1"),
        [spiffe_id],
        attested_node_from_row,
    )
    .optional()?
    .ok_or_else(|| RegistryError::not_found(ATTESTED_NODE, spiffe_id))
}

fn join_token_by_value(conn: &Connection, token: &str) -> Result<JoinToken> {
    conn.query_row(
        &format!("SELECT {JOIN_TOKEN_COLUMNS} FROM join_tokens WHERE token = ?1"),
        [token],
        join_token_from_row,
    )
    .optional()?
    .ok_or_else(|| RegistryError::not_found(JOIN_TOKEN, REDACTED))
}

fn entry_by_entry_id(conn: &Connection, entry_id: &str) -> Result<RegisteredEntry> {
    let mut entry = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM registered_entries WHERE entry_id = ?1"),
            [entry_id],
            entry_from_row,
        )
        .optional()?
        .ok_or_else(|| RegistryError::not_found(REGISTERED_ENTRY, entry_id))?;
    load_entry_relations(conn, &mut entry)?;
    Ok(entry)
}

fn load_entry_relations(conn: &Connection, entry: &mut RegisteredEntry) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT type, value FROM selectors WHERE registered_entry_id = ?1 ORDER BY id",
    )?;
    entry.selectors = stmt
        .query_map(params![entry.model.id], selector_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        r#"
        SELECT b.trust_domain
        FROM federated_registration_entries f
        JOIN bundles b ON b.id = f.bundle_id
        WHERE f.registered_entry_id = ?1
        ORDER BY b.trust_domain
        "#,
    )?;
    entry.federates_with = stmt
        .query_map(params![entry.model.id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT: &str = "spiffe://example.org/spire/agent/k8s_psat/production/POD-UID";

    fn store() -> SqlStore {
        SqlStore::open_in_memory(DatabaseType::Sqlite3).unwrap()
    }

    fn node(spiffe_id: &str, expires_at: i64) -> AttestedNode {
        AttestedNode {
            spiffe_id: spiffe_id.to_string(),
            data_type: "k8s_psat".to_string(),
            serial_number: "1".to_string(),
            expires_at,
            ..Default::default()
        }
    }

    fn entry(spiffe_id: &str, federates_with: &[&str]) -> RegisteredEntry {
        RegisteredEntry {
            spiffe_id: spiffe_id.to_string(),
            parent_id: AGENT.to_string(),
            ttl: 3600,
            selectors: vec![
                Selector::new("k8s", "ns:default"),
                Selector::new("k8s", "sa:web"),
            ],
            federates_with: federates_with.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_store_records_schema_version() {
        let store = store();
        assert_eq!(store.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
        assert_eq!(store.dialect(), DatabaseType::Sqlite3);
    }

    #[test]
    fn test_open_rejects_unlinked_dialects() {
        for database_type in ["postgres", "mysql", "oracle"] {
            let config = DataStoreConfig {
                database_type: database_type.to_string(),
                connection_string: IN_MEMORY.to_string(),
            };
            let err = SqlStore::open(&config).err().unwrap();
            assert!(matches!(err, RegistryError::UnsupportedDatabase(_)));
        }

        let config = DataStoreConfig {
            database_type: "sqlite3".to_string(),
            connection_string: IN_MEMORY.to_string(),
        };
        assert!(SqlStore::open(&config).is_ok());
    }

    #[test]
    fn test_bundle_crud() {
        let store = store();
        let created = store
            .create_bundle(&Bundle::new("example.org", b"v1".to_vec()))
            .unwrap();
        assert!(created.model.id > 0);
        assert_eq!(created.model.created_at, created.model.updated_at);

        let fetched = store.fetch_bundle("example.org").unwrap();
        assert_eq!(fetched, created);

        let updated = store
            .update_bundle(&Bundle::new("example.org", b"v2".to_vec()))
            .unwrap();
        assert_eq!(updated.data, b"v2");
        assert_eq!(updated.model.id, created.model.id);

        store
            .create_bundle(&Bundle::new("other.org", b"x".to_vec()))
            .unwrap();
        let domains: Vec<_> = store
            .list_bundles()
            .unwrap()
            .into_iter()
            .map(|b| b.trust_domain)
            .collect();
        assert_eq!(domains, ["example.org", "other.org"]);

        let deleted = store
            .delete_bundle("example.org", DeleteMode::Restrict)
            .unwrap();
        assert_eq!(deleted.data, b"v2");
        assert!(store.fetch_bundle("example.org").unwrap_err().is_not_found());
    }

    #[test]
    fn test_duplicate_bundle_conflicts() {
        let store = store();
        store
            .create_bundle(&Bundle::new("example.org", b"a".to_vec()))
            .unwrap();
        let err = store
            .create_bundle(&Bundle::new("example.org", b"b".to_vec()))
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "bundle already exists: example.org");
    }

    #[test]
    fn test_update_missing_bundle_not_found() {
        let err = store()
            .update_bundle(&Bundle::new("missing.org", b"a".to_vec()))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_attested_node_lifecycle() {
        let store = store();
        store.create_attested_node(&node(AGENT, 100)).unwrap();

        let err = store.create_attested_node(&node(AGENT, 200)).unwrap_err();
        assert!(err.is_conflict());

        let rotated = store.update_attested_node(AGENT, "2", 300).unwrap();
        assert_eq!(rotated.serial_number, "2");
        assert_eq!(rotated.expires_at, 300);
        assert_eq!(rotated.data_type, "k8s_psat");

        let fetched = store.fetch_attested_node(AGENT).unwrap();
        assert_eq!(fetched.serial_number, "2");

        assert!(store
            .update_attested_node("spiffe://example.org/spire/agent/missing", "1", 1)
            .unwrap_err()
            .is_not_found());

        store.delete_attested_node(AGENT).unwrap();
        assert!(store.fetch_attested_node(AGENT).unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_attested_nodes_by_expiry() {
        let store = store();
        store
            .create_attested_node(&node("spiffe://example.org/spire/agent/a", 100))
            .unwrap();
        store
            .create_attested_node(&node("spiffe://example.org/spire/agent/b", 200))
            .unwrap();

        assert_eq!(store.list_attested_nodes(None).unwrap().len(), 2);
        let expiring = store.list_attested_nodes(Some(150)).unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].spiffe_id, "spiffe://example.org/spire/agent/a");
    }

    #[test]
    fn test_set_node_selectors_replaces_wholesale() {
        let store = store();
        store
            .set_node_selectors(
                AGENT,
                &[
                    Selector::new("k8s_psat", "cluster:production"),
                    Selector::new("k8s_psat", "agent_ns:spire"),
                ],
            )
            .unwrap();
        store
            .set_node_selectors(AGENT, &[Selector::new("k8s_psat", "agent_sa:spire-agent")])
            .unwrap();

        assert_eq!(
            store.get_node_selectors(AGENT).unwrap(),
            vec![Selector::new("k8s_psat", "agent_sa:spire-agent")]
        );

        store.set_node_selectors(AGENT, &[]).unwrap();
        assert!(store.get_node_selectors(AGENT).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_node_selectors_roll_back() {
        let store = store();
        let original = vec![Selector::new("k8s_psat", "cluster:production")];
        store.set_node_selectors(AGENT, &original).unwrap();

        let dup = Selector::new("k8s_psat", "agent_ns:spire");
        let err = store
            .set_node_selectors(AGENT, &[dup.clone(), dup])
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get_node_selectors(AGENT).unwrap(), original);
    }

    #[test]
    fn test_registration_entry_create_and_fetch() {
        let store = store();
        store
            .create_bundle(&Bundle::new("spiffe://other.org", b"b".to_vec()))
            .unwrap();

        let created = store
            .create_registration_entry(&entry(
                "spiffe://example.org/web",
                &["spiffe://other.org"],
            ))
            .unwrap();
        assert!(uuid::Uuid::parse_str(&created.entry_id).is_ok());

        let fetched = store.fetch_registration_entry(&created.entry_id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.selectors.len(), 2);
        assert_eq!(fetched.federates_with, ["spiffe://other.org"]);
    }

    #[test]
    fn test_entry_with_unknown_federated_bundle_rolls_back() {
        let store = store();
        let err = store
            .create_registration_entry(&entry(
                "spiffe://example.org/web",
                &["spiffe://unknown.org"],
            ))
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "bundle not found: spiffe://unknown.org");

        assert!(store
            .list_registration_entries(&ListEntriesRequest::default())
            .unwrap()
            .is_empty());
        let selectors: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM selectors", [], |row| row.get(0))
            .unwrap();
        assert_eq!(selectors, 0);
    }

    #[test]
    fn test_list_entries_by_parent() {
        let store = store();
        store
            .create_registration_entry(&entry("spiffe://example.org/a", &[]))
            .unwrap();
        let mut other = entry("spiffe://example.org/b", &[]);
        other.parent_id = "spiffe://example.org/spire/agent/other".to_string();
        store.create_registration_entry(&other).unwrap();

        let by_parent = store
            .list_registration_entries(&ListEntriesRequest {
                by_parent_id: Some(AGENT.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_parent.len(), 1);
        assert_eq!(by_parent[0].spiffe_id, "spiffe://example.org/a");
        assert_eq!(by_parent[0].selectors.len(), 2);

        let both = store
            .list_registration_entries(&ListEntriesRequest {
                by_parent_id: Some(AGENT.to_string()),
                by_spiffe_id: Some("spiffe://example.org/b".to_string()),
            })
            .unwrap();
        assert!(both.is_empty());
    }

    #[test]
    fn test_update_and_delete_registration_entry() {
        let store = store();
        store
            .create_bundle(&Bundle::new("spiffe://other.org", b"b".to_vec()))
            .unwrap();
        let created = store
            .create_registration_entry(&entry("spiffe://example.org/web", &[]))
            .unwrap();

        let mut changed = created.clone();
        changed.ttl = 60;
        changed.selectors = vec![Selector::new("unix", "uid:1000")];
        changed.federates_with = vec!["spiffe://other.org".to_string()];
        let updated = store.update_registration_entry(&changed).unwrap();
        assert_eq!(updated.model.id, created.model.id);

        let fetched = store.fetch_registration_entry(&created.entry_id).unwrap();
        assert_eq!(fetched.ttl, 60);
        assert_eq!(fetched.selectors, vec![Selector::new("unix", "uid:1000")]);
        assert_eq!(fetched.federates_with, ["spiffe://other.org"]);

        let deleted = store.delete_registration_entry(&created.entry_id).unwrap();
        assert_eq!(deleted.ttl, 60);
        assert!(store
            .fetch_registration_entry(&created.entry_id)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_delete_bundle_modes() {
        let store = store();
        for td in ["spiffe://a.org", "spiffe://b.org", "spiffe://c.org"] {
            store
                .create_bundle(&Bundle::new(td, b"bundle".to_vec()))
                .unwrap();
        }
        store
            .create_registration_entry(&entry("spiffe://example.org/a", &["spiffe://a.org"]))
            .unwrap();
        let on_b = store
            .create_registration_entry(&entry("spiffe://example.org/b", &["spiffe://b.org"]))
            .unwrap();
        let on_c = store
            .create_registration_entry(&entry("spiffe://example.org/c", &["spiffe://c.org"]))
            .unwrap();

        let err = store
            .delete_bundle("spiffe://a.org", DeleteMode::Restrict)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InUse { references: 1, .. }));
        assert!(store.fetch_bundle("spiffe://a.org").is_ok());

        store
            .delete_bundle("spiffe://b.org", DeleteMode::Dissociate)
            .unwrap();
        let kept = store.fetch_registration_entry(&on_b.entry_id).unwrap();
        assert!(kept.federates_with.is_empty());

        store
            .delete_bundle("spiffe://c.org", DeleteMode::Delete)
            .unwrap();
        assert!(store
            .fetch_registration_entry(&on_c.entry_id)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_join_tokens() {
        let store = store();
        store.create_join_token(&JoinToken::new("old", 100)).unwrap();
        store.create_join_token(&JoinToken::new("new", 300)).unwrap();

        let err = store.create_join_token(&JoinToken::new("old", 1)).unwrap_err();
        assert!(err.is_conflict());
        assert!(!err.to_string().contains("old"));

        assert_eq!(store.prune_join_tokens(200).unwrap(), 1);
        assert!(store.fetch_join_token("old").unwrap_err().is_not_found());

        let consumed = store.delete_join_token("new").unwrap();
        assert_eq!(consumed.expiry, 300);
        assert!(store.delete_join_token("new").unwrap_err().is_not_found());
    }

    #[test]
    fn test_mysql_dialect_rejects_overlong_key() {
        let mysql = SqlStore::open_in_memory(DatabaseType::Mysql).unwrap();
        let long_id = format!("spiffe://example.org/spire/agent/{}", "x".repeat(200));

        let err = mysql.create_attested_node(&node(&long_id, 1)).unwrap_err();
        assert!(matches!(err, RegistryError::FieldTooLong { column: "spiffe_id", .. }));
        assert!(mysql.list_attested_nodes(None).unwrap().is_empty());

        // SQLite itself has no such bound.
        let sqlite = store();
        sqlite.create_attested_node(&node(&long_id, 1)).unwrap();
        assert_eq!(sqlite.fetch_attested_node(&long_id).unwrap().spiffe_id, long_id);
    }

    #[test]
    fn test_large_bundle_accepted_on_every_dialect() {
        let data = vec![7u8; 70_000];
        for db in DatabaseType::ALL {
            let store = SqlStore::open_in_memory(db).unwrap();
            store
                .create_bundle(&Bundle::new("spiffe://big.org", data.clone()))
                .unwrap();
            assert_eq!(store.fetch_bundle("spiffe://big.org").unwrap().data, data);

            let grown = vec![8u8; 140_000];
            let updated = store
                .update_bundle(&Bundle::new("spiffe://big.org", grown.clone()))
                .unwrap();
            assert_eq!(updated.data, grown);
        }
    }

    #[test]
    fn test_empty_keys_rejected() {
        let store = store();
        assert!(matches!(
            store.create_attested_node(&node("", 1)),
            Err(RegistryError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.create_bundle(&Bundle::new("", b"".to_vec())),
            Err(RegistryError::InvalidArgument(_))
        ));
    }
}
