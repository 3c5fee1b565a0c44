//! Local store: mirror tables plus the write-ahead queue.

use std::path::Path;

use rusqlite::{params, params_from_iter, Connection};

use crate::error::Result;
use crate::protocol::{
    AttendanceRecord, CardAssignmentRecord, CollectionRecord, Snapshot, UploadBatch,
};

use super::migrations;

/// Queue tables carrying the `synced` latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTable {
    Attendance,
    HarvestCollections,
    CardAssignments,
}

impl QueueTable {
    const fn table_name(self) -> &'static str {
        match self {
            Self::Attendance => "attendance",
            Self::HarvestCollections => "harvest_collections",
            Self::CardAssignments => "card_assignments",
        }
    }
}

/// Pending rows per queue table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub attendances: usize,
    pub collections: usize,
    pub card_assignments: usize,
}

impl PendingCounts {
    pub const fn total(&self) -> usize {
        self.attendances + self.collections + self.card_assignments
    }
}

/// The exact set of unsynced rows captured for one upload attempt.
///
/// Row ids are remembered alongside the wire batch so that, after the server
/// acknowledges, only these rows flip to `synced = 1`. Rows queued while the
/// request was in flight keep their pending state.
#[derive(Debug, Clone, Default)]
pub struct PendingBatch {
    pub attendance_ids: Vec<i64>,
    pub collection_ids: Vec<i64>,
    pub card_assignment_ids: Vec<i64>,
    pub batch: UploadBatch,
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.attendance_ids.is_empty()
            && self.collection_ids.is_empty()
            && self.card_assignment_ids.is_empty()
    }
}

/// Embedded datastore for the field device.
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    /// Open a database at the given path, creating it (and parent
    /// directories) if needed. Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&mut conn)?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    // -- queue writes ------------------------------------------------------

    /// Stage an attendance record for upload. Returns the local row id.
    pub fn queue_attendance(&self, record: &AttendanceRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO attendance (worker_id, date, check_in, check_out, field_id, task_type_id, synced)
             VALUES (?, ?, ?, ?, ?, ?, 0)",
            params![
                record.worker_id,
                record.date,
                record.check_in,
                record.check_out,
                record.field_id,
                record.task_type_id
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Stage a harvest collection for upload. Returns the local row id.
    pub fn queue_collection(&self, record: &CollectionRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO harvest_collections (worker_id, card_id, date, container_id, quantity, field_id, synced)
             VALUES (?, ?, ?, ?, ?, ?, 0)",
            params![
                record.worker_id,
                record.card_id,
                record.date,
                record.container_id,
                record.quantity,
                record.field_id
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Stage a card assignment (or, with `deleted_at` set, a tombstone)
    /// for upload. Returns the local row id.
    pub fn queue_card_assignment(&self, record: &CardAssignmentRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO card_assignments (card_id, worker_id, date, deleted_at, synced)
             VALUES (?, ?, ?, ?, 0)",
            params![
                record.card_id,
                record.worker_id,
                record.date,
                record.deleted_at
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // -- queue reads -------------------------------------------------------

    /// Count pending rows per queue table.
    pub fn pending_counts(&self) -> Result<PendingCounts> {
        let count = |table: QueueTable| -> Result<usize> {
            let n: i64 = self.conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE synced = 0",
                    table.table_name()
                ),
                [],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(n).unwrap_or(0))
        };
        Ok(PendingCounts {
            attendances: count(QueueTable::Attendance)?,
            collections: count(QueueTable::HarvestCollections)?,
            card_assignments: count(QueueTable::CardAssignments)?,
        })
    }

    /// Collect every unsynced row into an upload batch, remembering row ids.
    pub fn pending_batch(&self) -> Result<PendingBatch> {
        let mut pending = PendingBatch::default();

        let mut stmt = self.conn.prepare(
            "SELECT id, worker_id, date, check_in, check_out, field_id, task_type_id
             FROM attendance WHERE synced = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                AttendanceRecord {
                    worker_id: row.get(1)?,
                    date: row.get(2)?,
                    check_in: row.get(3)?,
                    check_out: row.get(4)?,
                    field_id: row.get(5)?,
                    task_type_id: row.get(6)?,
                },
            ))
        })?;
        for row in rows {
            let (id, record) = row?;
            pending.attendance_ids.push(id);
            pending.batch.attendances.push(record);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, worker_id, card_id, date, container_id, quantity, field_id
             FROM harvest_collections WHERE synced = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                CollectionRecord {
                    worker_id: row.get(1)?,
                    card_id: row.get(2)?,
                    date: row.get(3)?,
                    container_id: row.get(4)?,
                    quantity: row.get(5)?,
                    field_id: row.get(6)?,
                },
            ))
        })?;
        for row in rows {
            let (id, record) = row?;
            pending.collection_ids.push(id);
            pending.batch.collections.push(record);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, card_id, worker_id, date, deleted_at
             FROM card_assignments WHERE synced = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                CardAssignmentRecord {
                    card_id: row.get(1)?,
                    worker_id: row.get(2)?,
                    date: row.get(3)?,
                    deleted_at: row.get(4)?,
                },
            ))
        })?;
        for row in rows {
            let (id, record) = row?;
            pending.card_assignment_ids.push(id);
            pending.batch.card_assignments.push(record);
        }

        Ok(pending)
    }

    // -- acknowledgement ---------------------------------------------------

    /// Flip `synced = 1` for exactly the given row ids.
    pub fn mark_synced(&self, table: QueueTable, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let updated = self.conn.execute(
            &format!(
                "UPDATE {} SET synced = 1 WHERE id IN ({placeholders})",
                table.table_name()
            ),
            params_from_iter(ids.iter()),
        )?;
        Ok(updated)
    }

    /// Acknowledge every row captured in a pending batch.
    pub fn mark_batch_synced(&self, pending: &PendingBatch) -> Result<()> {
        self.mark_synced(QueueTable::Attendance, &pending.attendance_ids)?;
        self.mark_synced(QueueTable::HarvestCollections, &pending.collection_ids)?;
        self.mark_synced(QueueTable::CardAssignments, &pending.card_assignment_ids)?;
        Ok(())
    }

    // -- download merge ----------------------------------------------------

    /// Merge a server snapshot into the local database in one transaction.
    ///
    /// Mirror tables are fully replaced. Card assignments are
    /// replace-and-preserve: only `synced = 1` rows are dropped before the
    /// server's windowed set is inserted (as synced), so work queued while
    /// offline survives the merge untouched.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute("DELETE FROM workers", [])?;
        for row in &snapshot.workers {
            tx.execute(
                "INSERT INTO workers (id, rut, name, contractor_id) VALUES (?, ?, ?, ?)",
                params![row.id, row.rut, row.name, row.contractor_id],
            )?;
        }

        tx.execute("DELETE FROM contractors", [])?;
        for row in &snapshot.contractors {
            tx.execute(
                "INSERT INTO contractors (id, name) VALUES (?, ?)",
                params![row.id, row.name],
            )?;
        }

        tx.execute("DELETE FROM fields", [])?;
        for row in &snapshot.fields {
            tx.execute(
                "INSERT INTO fields (id, name, area_hectares) VALUES (?, ?, ?)",
                params![row.id, row.name, row.area_hectares],
            )?;
        }

        tx.execute("DELETE FROM species", [])?;
        for row in &snapshot.species {
            tx.execute(
                "INSERT INTO species (id, name) VALUES (?, ?)",
                params![row.id, row.name],
            )?;
        }

        tx.execute("DELETE FROM varieties", [])?;
        for row in &snapshot.varieties {
            tx.execute(
                "INSERT INTO varieties (id, species_id, name) VALUES (?, ?, ?)",
                params![row.id, row.species_id, row.name],
            )?;
        }

        tx.execute("DELETE FROM harvest_containers", [])?;
        for row in &snapshot.harvest_containers {
            tx.execute(
                "INSERT INTO harvest_containers (id, name, capacity_kg) VALUES (?, ?, ?)",
                params![row.id, row.name, row.capacity_kg],
            )?;
        }

        tx.execute("DELETE FROM cards", [])?;
        for row in &snapshot.cards {
            tx.execute(
                "INSERT INTO cards (id, code) VALUES (?, ?)",
                params![row.id, row.code],
            )?;
        }

        tx.execute("DELETE FROM crops", [])?;
        for row in &snapshot.crops {
            tx.execute(
                "INSERT INTO crops (id, name, field_id) VALUES (?, ?, ?)",
                params![row.id, row.name, row.field_id],
            )?;
        }

        tx.execute("DELETE FROM plantings", [])?;
        for row in &snapshot.plantings {
            tx.execute(
                "INSERT INTO plantings (id, crop_id, field_id, planted_date) VALUES (?, ?, ?, ?)",
                params![row.id, row.crop_id, row.field_id, row.planted_date],
            )?;
        }

        tx.execute("DELETE FROM supplies", [])?;
        for row in &snapshot.supplies {
            tx.execute(
                "INSERT INTO supplies (id, name, unit_of_measure_id) VALUES (?, ?, ?)",
                params![row.id, row.name, row.unit_of_measure_id],
            )?;
        }

        tx.execute("DELETE FROM direct_costs", [])?;
        for row in &snapshot.direct_costs {
            tx.execute(
                "INSERT INTO direct_costs (id, date, amount, category, field_id) VALUES (?, ?, ?, ?, ?)",
                params![row.id, row.date, row.amount, row.category, row.field_id],
            )?;
        }

        tx.execute("DELETE FROM labor_plans", [])?;
        for row in &snapshot.labor_plans {
            tx.execute(
                "INSERT INTO labor_plans (id, year, month, labor_type_id, planned_hours)
                 VALUES (?, ?, ?, ?, ?)",
                params![row.id, row.year, row.month, row.labor_type_id, row.planned_hours],
            )?;
        }

        tx.execute("DELETE FROM task_types", [])?;
        for row in &snapshot.task_types {
            tx.execute(
                "INSERT INTO task_types (id, name) VALUES (?, ?)",
                params![row.id, row.name],
            )?;
        }

        tx.execute("DELETE FROM labor_types", [])?;
        for row in &snapshot.labor_types {
            tx.execute(
                "INSERT INTO labor_types (id, name) VALUES (?, ?)",
                params![row.id, row.name],
            )?;
        }

        tx.execute("DELETE FROM unit_of_measures", [])?;
        for row in &snapshot.unit_of_measures {
            tx.execute(
                "INSERT INTO unit_of_measures (id, name) VALUES (?, ?)",
                params![row.id, row.name],
            )?;
        }

        tx.execute("DELETE FROM tasks", [])?;
        for row in &snapshot.tasks {
            tx.execute(
                "INSERT INTO tasks (id, title, due_date, task_type_id) VALUES (?, ?, ?, ?)",
                params![row.id, row.title, row.due_date, row.task_type_id],
            )?;
        }

        // Unsynced assignments survive; only acknowledged rows are replaced.
        tx.execute("DELETE FROM card_assignments WHERE synced = 1", [])?;
        for row in &snapshot.card_assignments {
            tx.execute(
                "INSERT INTO card_assignments (card_id, worker_id, date, deleted_at, synced)
                 VALUES (?, ?, ?, NULL, 1)",
                params![row.card_id, row.worker_id, row.date],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::protocol::{CardAssignmentRow, CardRow, WorkerRow};

    use super::*;

    fn setup() -> LocalStore {
        LocalStore::open_in_memory().unwrap()
    }

    fn attendance(worker_id: i64, date: &str) -> AttendanceRecord {
        AttendanceRecord {
            worker_id,
            date: date.to_string(),
            check_in: Some("08:00:00".to_string()),
            check_out: None,
            field_id: None,
            task_type_id: None,
        }
    }

    fn assignment(card_id: i64, worker_id: i64, date: &str) -> CardAssignmentRecord {
        CardAssignmentRecord {
            card_id,
            worker_id,
            date: date.to_string(),
            deleted_at: None,
        }
    }

    #[test]
    fn queued_rows_are_pending() {
        let store = setup();
        store.queue_attendance(&attendance(1, "2024-06-01")).unwrap();
        store
            .queue_collection(&CollectionRecord {
                worker_id: 1,
                card_id: 2,
                date: "2024-06-01".to_string(),
                container_id: 3,
                quantity: 12.5,
                field_id: Some(4),
            })
            .unwrap();

        let counts = store.pending_counts().unwrap();
        assert_eq!(counts.attendances, 1);
        assert_eq!(counts.collections, 1);
        assert_eq!(counts.card_assignments, 0);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn pending_batch_captures_rows_and_ids() {
        let store = setup();
        let id_a = store.queue_attendance(&attendance(1, "2024-06-01")).unwrap();
        let id_b = store.queue_attendance(&attendance(2, "2024-06-01")).unwrap();
        store.queue_card_assignment(&assignment(5, 1, "2024-06-01")).unwrap();

        let pending = store.pending_batch().unwrap();
        assert_eq!(pending.attendance_ids, vec![id_a, id_b]);
        assert_eq!(pending.batch.attendances.len(), 2);
        assert_eq!(pending.card_assignment_ids.len(), 1);
        assert!(!pending.is_empty());
    }

    #[test]
    fn mark_synced_only_touches_given_ids() {
        let store = setup();
        let id_a = store.queue_attendance(&attendance(1, "2024-06-01")).unwrap();
        let pending = store.pending_batch().unwrap();

        // A row queued after the batch was captured must stay pending.
        let id_b = store.queue_attendance(&attendance(2, "2024-06-01")).unwrap();
        store.mark_batch_synced(&pending).unwrap();

        let synced: Vec<i64> = {
            let mut stmt = store
                .connection()
                .prepare("SELECT id FROM attendance WHERE synced = 1 ORDER BY id")
                .unwrap();
            let ids = stmt
                .query_map([], |row| row.get(0))
                .unwrap()
                .collect::<rusqlite::Result<Vec<i64>>>()
                .unwrap();
            ids
        };
        assert_eq!(synced, vec![id_a]);

        let counts = store.pending_counts().unwrap();
        assert_eq!(counts.attendances, 1);
        let still_pending = store.pending_batch().unwrap();
        assert_eq!(still_pending.attendance_ids, vec![id_b]);
    }

    #[test]
    fn tombstones_queue_like_ordinary_rows() {
        let store = setup();
        store
            .queue_card_assignment(&CardAssignmentRecord {
                card_id: 7,
                worker_id: 3,
                date: "2024-06-01".to_string(),
                deleted_at: Some("2024-06-01T17:30:00Z".to_string()),
            })
            .unwrap();

        let pending = store.pending_batch().unwrap();
        assert_eq!(pending.batch.card_assignments.len(), 1);
        assert!(pending.batch.card_assignments[0].deleted_at.is_some());
    }

    #[test]
    fn snapshot_fully_replaces_mirror_tables() {
        let mut store = setup();

        let mut snapshot = Snapshot {
            workers: vec![WorkerRow {
                id: 1,
                rut: "11.111.111-1".to_string(),
                name: "Ana".to_string(),
                contractor_id: None,
            }],
            cards: vec![CardRow {
                id: 10,
                code: "C-10".to_string(),
            }],
            ..Snapshot::default()
        };
        store.apply_snapshot(&snapshot).unwrap();

        snapshot.workers = vec![WorkerRow {
            id: 2,
            rut: "22.222.222-2".to_string(),
            name: "Beto".to_string(),
            contractor_id: Some(4),
        }];
        snapshot.cards.clear();
        store.apply_snapshot(&snapshot).unwrap();

        let worker_ids: Vec<i64> = {
            let mut stmt = store
                .connection()
                .prepare("SELECT id FROM workers ORDER BY id")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .collect::<rusqlite::Result<Vec<i64>>>()
                .unwrap()
        };
        assert_eq!(worker_ids, vec![2]);

        let card_count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM cards", [], |row| row.get(0))
            .unwrap();
        assert_eq!(card_count, 0);
    }

    #[test]
    fn snapshot_merge_preserves_unsynced_assignments() {
        let mut store = setup();

        // Synced assignment from an earlier cycle plus fresh offline work.
        let acked_id = store.queue_card_assignment(&assignment(1, 1, "2024-06-01")).unwrap();
        store
            .mark_synced(QueueTable::CardAssignments, &[acked_id])
            .unwrap();
        let offline_id = store.queue_card_assignment(&assignment(2, 2, "2024-06-02")).unwrap();

        let snapshot = Snapshot {
            card_assignments: vec![CardAssignmentRow {
                card_id: 3,
                worker_id: 3,
                date: "2024-06-02".to_string(),
            }],
            ..Snapshot::default()
        };
        store.apply_snapshot(&snapshot).unwrap();

        let rows: Vec<(i64, i64, i64)> = {
            let mut stmt = store
                .connection()
                .prepare("SELECT id, card_id, synced FROM card_assignments ORDER BY card_id")
                .unwrap();
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .unwrap()
                .collect::<rusqlite::Result<Vec<_>>>()
                .unwrap()
        };

        // The acked row for card 1 is gone, the offline row for card 2
        // survives unchanged, and the server row for card 3 arrives synced.
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], (offline_id, 2, 0));
        assert_eq!(rows[1].1, 3);
        assert_eq!(rows[1].2, 1);
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("campo.db");
        let store = LocalStore::open(&path).unwrap();
        drop(store);
        assert!(path.exists());
    }
}
