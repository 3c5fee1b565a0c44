//! Local database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
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

/// Migration to version 1: queue tables plus server mirror
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Write-ahead queue: rows with synced = 0 are pending upload.
        CREATE TABLE IF NOT EXISTS attendance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            check_in TEXT,
            check_out TEXT,
            field_id INTEGER,
            task_type_id INTEGER,
            synced INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_attendance_synced ON attendance(synced);

        CREATE TABLE IF NOT EXISTS harvest_collections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_id INTEGER NOT NULL,
            card_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            container_id INTEGER NOT NULL,
            quantity REAL NOT NULL,
            field_id INTEGER,
            synced INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_harvest_collections_synced ON harvest_collections(synced);

        -- deleted_at set locally queues a tombstone for upload.
        CREATE TABLE IF NOT EXISTS card_assignments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            card_id INTEGER NOT NULL,
            worker_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            deleted_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_card_assignments_synced ON card_assignments(synced);

        -- Server mirror: fully replaced on every download, no sync column.
        CREATE TABLE IF NOT EXISTS workers (
            id INTEGER PRIMARY KEY,
            rut TEXT NOT NULL,
            name TEXT NOT NULL,
            contractor_id INTEGER
        );
        CREATE TABLE IF NOT EXISTS contractors (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS fields (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            area_hectares REAL
        );
        CREATE TABLE IF NOT EXISTS species (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS varieties (
            id INTEGER PRIMARY KEY,
            species_id INTEGER NOT NULL,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS harvest_containers (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            capacity_kg REAL
        );
        CREATE TABLE IF NOT EXISTS cards (
            id INTEGER PRIMARY KEY,
            code TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS crops (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            field_id INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS plantings (
            id INTEGER PRIMARY KEY,
            crop_id INTEGER NOT NULL,
            field_id INTEGER NOT NULL,
            planted_date TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS supplies (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            unit_of_measure_id INTEGER
        );
        CREATE TABLE IF NOT EXISTS direct_costs (
            id INTEGER PRIMARY KEY,
            date TEXT NOT NULL,
            amount REAL NOT NULL,
            category TEXT NOT NULL,
            field_id INTEGER
        );
        CREATE TABLE IF NOT EXISTS labor_plans (
            id INTEGER PRIMARY KEY,
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            labor_type_id INTEGER NOT NULL,
            planned_hours REAL NOT NULL
        );
        CREATE TABLE IF NOT EXISTS task_types (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS labor_types (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS unit_of_measures (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            due_date TEXT,
            task_type_id INTEGER
        );

        INSERT INTO schema_version (version) VALUES (1);",
    )?;

    tx.commit()?;

    tracing::info!("Migrated local database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_queue_tables_have_synced_column() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        for table in ["attendance", "harvest_collections", "card_assignments"] {
            let count: i32 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = 'synced'"),
                    [],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "table {table} is missing the synced column");
        }
    }

    #[test]
    fn test_mirror_tables_have_no_synced_column() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        for table in ["workers", "cards", "fields", "tasks"] {
            let count: i32 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = 'synced'"),
                    [],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 0, "mirror table {table} should not track sync state");
        }
    }
}
