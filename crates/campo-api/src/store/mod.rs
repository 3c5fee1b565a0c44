//! Tenant-scoped relational store behind the sync endpoint.
//!
//! Every operational row carries a non-null `tenant_id` resolved from the
//! authenticated caller, never from payloads.

mod snapshot;
mod upload;

use std::collections::BTreeMap;
use std::path::Path;

use campo_core::protocol::{Snapshot, UploadBatch};
use campo_core::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::config::SnapshotWindows;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

pub struct ServerStore {
    conn: Connection,
}

impl ServerStore {
    /// Open the store at the given path, creating it and running migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&mut conn)?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    // -- provisioning ------------------------------------------------------

    pub fn create_tenant(&self, name: &str) -> Result<i64> {
        self.conn
            .execute("INSERT INTO tenants (name) VALUES (?)", params![name])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn create_api_token(&self, token: &str, tenant_id: Option<i64>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO api_tokens (token, tenant_id) VALUES (?, ?)",
            params![token, tenant_id],
        )?;
        Ok(())
    }

    /// Look up the tenant bound to a bearer token. `Ok(None)` means the
    /// token is unknown; `Ok(Some(None))` means it is known but carries no
    /// tenant binding.
    pub fn tenant_for_token(&self, token: &str) -> Result<Option<Option<i64>>> {
        let result = self.conn.query_row(
            "SELECT tenant_id FROM api_tokens WHERE token = ?",
            params![token],
            |row| row.get::<_, Option<i64>>(0),
        );
        match result {
            Ok(tenant_id) => Ok(Some(tenant_id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    // -- sync operations ---------------------------------------------------

    /// Apply an upload batch atomically. See [`upload`] for the per-entity
    /// merge policies. Any failure rolls the whole batch back.
    pub fn apply_upload(
        &mut self,
        tenant_id: i64,
        batch: &UploadBatch,
    ) -> Result<BTreeMap<String, usize>> {
        upload::apply(&mut self.conn, tenant_id, batch)
    }

    /// Project the tenant's read-only snapshot as of `now`.
    pub fn snapshot(
        &self,
        tenant_id: i64,
        now: DateTime<Utc>,
        windows: &SnapshotWindows,
    ) -> Result<Snapshot> {
        snapshot::project(&self.conn, tenant_id, now, windows)
    }
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let version = schema_version(conn)?;
    if version < 1 {
        migrate_v1(conn)?;
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|flag| flag != 0),
    )?;
    if !exists {
        return Ok(0);
    }
    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS tenants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS api_tokens (
            token TEXT PRIMARY KEY,
            tenant_id INTEGER REFERENCES tenants(id)
        );

        CREATE TABLE IF NOT EXISTS contractors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            display_name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS workers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            rut TEXT NOT NULL,
            name TEXT NOT NULL,
            contractor_id INTEGER,
            UNIQUE(tenant_id, rut)
        );
        CREATE TABLE IF NOT EXISTS fields (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            area_hectares REAL
        );
        CREATE TABLE IF NOT EXISTS species (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS varieties (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            species_id INTEGER NOT NULL,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS harvest_containers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            capacity_kg REAL
        );
        CREATE TABLE IF NOT EXISTS cards (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            code TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS task_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS labor_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS unit_of_measures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attendances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            worker_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            check_in TEXT,
            check_out TEXT,
            field_id INTEGER,
            task_type_id INTEGER,
            UNIQUE(tenant_id, worker_id, date)
        );
        CREATE TABLE IF NOT EXISTS harvest_collections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            worker_id INTEGER NOT NULL,
            card_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            container_id INTEGER NOT NULL,
            quantity REAL NOT NULL CHECK (quantity >= 0),
            field_id INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_harvest_collections_tenant_date
            ON harvest_collections(tenant_id, date);
        CREATE TABLE IF NOT EXISTS card_assignments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            card_id INTEGER NOT NULL,
            worker_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            UNIQUE(tenant_id, date, card_id)
        );
        CREATE INDEX IF NOT EXISTS idx_card_assignments_tenant_date
            ON card_assignments(tenant_id, date);

        CREATE TABLE IF NOT EXISTS crops (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            field_id INTEGER NOT NULL,
            UNIQUE(tenant_id, name, field_id)
        );
        CREATE TABLE IF NOT EXISTS plantings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            crop_id INTEGER NOT NULL,
            field_id INTEGER NOT NULL,
            planted_date TEXT NOT NULL,
            UNIQUE(tenant_id, crop_id, field_id, planted_date)
        );
        CREATE TABLE IF NOT EXISTS supplies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            unit_of_measure_id INTEGER
        );
        CREATE TABLE IF NOT EXISTS direct_costs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            amount REAL NOT NULL,
            category TEXT NOT NULL DEFAULT 'direct',
            field_id INTEGER
        );
        CREATE TABLE IF NOT EXISTS labor_plans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            labor_type_id INTEGER NOT NULL,
            planned_hours REAL NOT NULL,
            UNIQUE(tenant_id, year, month, labor_type_id)
        );
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            due_date TEXT,
            task_type_id INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_tenant_due ON tasks(tenant_id, due_date DESC);
        CREATE TABLE IF NOT EXISTS task_assignments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            task_id INTEGER NOT NULL,
            worker_id INTEGER NOT NULL,
            UNIQUE(task_id, worker_id)
        );

        INSERT INTO schema_version (version) VALUES (1);",
    )?;

    tx.commit()?;
    tracing::info!("Migrated server database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let mut store = ServerStore::open_in_memory().unwrap();
        migrate(&mut store.conn).unwrap();
        assert_eq!(schema_version(&store.conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn token_lookup_distinguishes_unknown_from_unbound() {
        let store = ServerStore::open_in_memory().unwrap();
        let tenant = store.create_tenant("Fundo Norte").unwrap();
        store.create_api_token("bound", Some(tenant)).unwrap();
        store.create_api_token("unbound", None).unwrap();

        assert_eq!(store.tenant_for_token("bound").unwrap(), Some(Some(tenant)));
        assert_eq!(store.tenant_for_token("unbound").unwrap(), Some(None));
        assert_eq!(store.tenant_for_token("missing").unwrap(), None);
    }
}
