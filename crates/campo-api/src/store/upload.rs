//! Upload merge: reconcile a device batch into the tenant's rows.
//!
//! Everything runs inside one transaction. A batch is one offline work
//! session; attendance must not land while the matching card-assignment
//! deletes roll back, so any per-record failure aborts the whole batch.

use std::collections::BTreeMap;

use campo_core::protocol::{
    AttendanceRecord, CardAssignmentRecord, CollectionRecord, CropRecord, DirectCostRecord,
    LaborPlanRecord, PlantingRecord, SupplyRecord, TaskAssignmentRecord, TaskRecord, UploadBatch,
    WorkerRecord,
};
use campo_core::timefmt::normalize_time;
use campo_core::{Error, Result};
use rusqlite::{params, Connection, Transaction};

/// Default cost category when the device omits one.
const DEFAULT_COST_CATEGORY: &str = "direct";

/// Apply every record of every entity type atomically. Returns per-entity
/// processed counts on success.
pub fn apply(
    conn: &mut Connection,
    tenant_id: i64,
    batch: &UploadBatch,
) -> Result<BTreeMap<String, usize>> {
    let tx = conn.transaction()?;

    // Workers first so freshly registered workers are visible to the
    // records referencing them; tasks before their assignments. The
    // remaining types are order-insensitive.
    for record in &batch.workers {
        merge_worker(&tx, tenant_id, record)?;
    }
    for record in &batch.crops {
        find_or_create_crop(&tx, tenant_id, record)?;
    }
    for record in &batch.plantings {
        find_or_create_planting(&tx, tenant_id, record)?;
    }
    for record in &batch.supplies {
        insert_supply(&tx, tenant_id, record)?;
    }
    for record in &batch.direct_costs {
        insert_direct_cost(&tx, tenant_id, record)?;
    }
    for record in &batch.labor_plans {
        upsert_labor_plan(&tx, tenant_id, record)?;
    }
    for record in &batch.attendances {
        upsert_attendance(&tx, tenant_id, record)?;
    }
    for record in &batch.collections {
        insert_collection(&tx, tenant_id, record)?;
    }
    for record in &batch.card_assignments {
        merge_card_assignment(&tx, tenant_id, record)?;
    }
    for record in &batch.tasks {
        merge_task(&tx, tenant_id, record)?;
    }
    for record in &batch.task_assignments {
        upsert_task_assignment(&tx, tenant_id, record.task_id, record.worker_id)?;
    }

    tx.commit()?;

    let mut processed = BTreeMap::new();
    processed.insert("attendances".to_string(), batch.attendances.len());
    processed.insert("collections".to_string(), batch.collections.len());
    processed.insert("card_assignments".to_string(), batch.card_assignments.len());
    processed.insert("workers".to_string(), batch.workers.len());
    processed.insert("crops".to_string(), batch.crops.len());
    processed.insert("plantings".to_string(), batch.plantings.len());
    processed.insert("supplies".to_string(), batch.supplies.len());
    processed.insert("direct_costs".to_string(), batch.direct_costs.len());
    processed.insert("labor_plans".to_string(), batch.labor_plans.len());
    processed.insert("tasks".to_string(), batch.tasks.len());
    processed.insert("task_assignments".to_string(), batch.task_assignments.len());
    Ok(processed)
}

/// Idempotent upsert on (tenant, worker, date); a re-submitted day
/// overwrites times instead of duplicating the row. Times are normalized
/// to HH:MM:SS before persistence.
fn upsert_attendance(tx: &Transaction<'_>, tenant_id: i64, record: &AttendanceRecord) -> Result<()> {
    let check_in = normalize_time(record.check_in.as_deref())?;
    let check_out = normalize_time(record.check_out.as_deref())?;

    tx.execute(
        "INSERT INTO attendances (tenant_id, worker_id, date, check_in, check_out, field_id, task_type_id)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(tenant_id, worker_id, date) DO UPDATE SET
             check_in = excluded.check_in,
             check_out = excluded.check_out,
             field_id = excluded.field_id,
             task_type_id = excluded.task_type_id",
        params![
            tenant_id,
            record.worker_id,
            record.date,
            check_in,
            check_out,
            record.field_id,
            record.task_type_id
        ],
    )?;
    Ok(())
}

/// Append-only: every submission is a new row.
fn insert_collection(tx: &Transaction<'_>, tenant_id: i64, record: &CollectionRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO harvest_collections (tenant_id, worker_id, card_id, date, container_id, quantity, field_id)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            tenant_id,
            record.worker_id,
            record.card_id,
            record.date,
            record.container_id,
            record.quantity,
            record.field_id
        ],
    )?;
    Ok(())
}

/// Upsert on (tenant, date, card) with mutable worker. A record carrying
/// `deleted_at` is a tombstone-by-value: its only effect is deleting the
/// matching row (a no-op when absent), and the marker is never stored.
fn merge_card_assignment(
    tx: &Transaction<'_>,
    tenant_id: i64,
    record: &CardAssignmentRecord,
) -> Result<()> {
    if record.deleted_at.is_some() {
        tx.execute(
            "DELETE FROM card_assignments WHERE tenant_id = ? AND date = ? AND card_id = ?",
            params![tenant_id, record.date, record.card_id],
        )?;
        return Ok(());
    }

    tx.execute(
        "INSERT INTO card_assignments (tenant_id, card_id, worker_id, date)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(tenant_id, date, card_id) DO UPDATE SET
             worker_id = excluded.worker_id",
        params![tenant_id, record.card_id, record.worker_id, record.date],
    )?;
    Ok(())
}

/// Two explicit paths instead of one ambiguous id-or-rut match: update by
/// id when it is present and owned by the tenant; otherwise upsert on the
/// natural key (tenant, rut). A stale or foreign id falls through to the
/// natural key rather than silently matching the wrong row.
fn merge_worker(tx: &Transaction<'_>, tenant_id: i64, record: &WorkerRecord) -> Result<()> {
    if let Some(id) = record.id {
        let updated = tx.execute(
            "UPDATE workers SET rut = ?, name = ?, contractor_id = ?
             WHERE id = ? AND tenant_id = ?",
            params![record.rut, record.name, record.contractor_id, id, tenant_id],
        )?;
        if updated > 0 {
            return Ok(());
        }
    }

    tx.execute(
        "INSERT INTO workers (tenant_id, rut, name, contractor_id)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(tenant_id, rut) DO UPDATE SET
             name = excluded.name,
             contractor_id = excluded.contractor_id",
        params![tenant_id, record.rut, record.name, record.contractor_id],
    )?;
    Ok(())
}

/// Find-or-create on (tenant, name, field); duplicates are no-ops.
fn find_or_create_crop(tx: &Transaction<'_>, tenant_id: i64, record: &CropRecord) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO crops (tenant_id, name, field_id) VALUES (?, ?, ?)",
        params![tenant_id, record.name, record.field_id],
    )?;
    Ok(())
}

/// Find-or-create on (tenant, crop, field, planted_date).
fn find_or_create_planting(
    tx: &Transaction<'_>,
    tenant_id: i64,
    record: &PlantingRecord,
) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO plantings (tenant_id, crop_id, field_id, planted_date)
         VALUES (?, ?, ?, ?)",
        params![tenant_id, record.crop_id, record.field_id, record.planted_date],
    )?;
    Ok(())
}

fn insert_supply(tx: &Transaction<'_>, tenant_id: i64, record: &SupplyRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO supplies (tenant_id, name, unit_of_measure_id) VALUES (?, ?, ?)",
        params![tenant_id, record.name, record.unit_of_measure_id],
    )?;
    Ok(())
}

fn insert_direct_cost(tx: &Transaction<'_>, tenant_id: i64, record: &DirectCostRecord) -> Result<()> {
    let category = record
        .category
        .as_deref()
        .filter(|category| !category.trim().is_empty())
        .unwrap_or(DEFAULT_COST_CATEGORY);
    tx.execute(
        "INSERT INTO direct_costs (tenant_id, date, amount, category, field_id)
         VALUES (?, ?, ?, ?, ?)",
        params![tenant_id, record.date, record.amount, category, record.field_id],
    )?;
    Ok(())
}

fn upsert_labor_plan(tx: &Transaction<'_>, tenant_id: i64, record: &LaborPlanRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO labor_plans (tenant_id, year, month, labor_type_id, planned_hours)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(tenant_id, year, month, labor_type_id) DO UPDATE SET
             planned_hours = excluded.planned_hours",
        params![
            tenant_id,
            record.year,
            record.month,
            record.labor_type_id,
            record.planned_hours
        ],
    )?;
    Ok(())
}

/// Update by owned id, insert otherwise, then cascade into the nested
/// (task, worker) assignment upserts.
fn merge_task(tx: &Transaction<'_>, tenant_id: i64, record: &TaskRecord) -> Result<()> {
    let task_id = match record.id {
        Some(id) => {
            let updated = tx.execute(
                "UPDATE tasks SET title = ?, due_date = ?, task_type_id = ?
                 WHERE id = ? AND tenant_id = ?",
                params![record.title, record.due_date, record.task_type_id, id, tenant_id],
            )?;
            if updated > 0 {
                id
            } else {
                insert_task(tx, tenant_id, record)?
            }
        }
        None => insert_task(tx, tenant_id, record)?,
    };

    for assignment in &record.assignments {
        upsert_task_assignment(tx, tenant_id, task_id, assignment.worker_id)?;
    }
    Ok(())
}

fn insert_task(tx: &Transaction<'_>, tenant_id: i64, record: &TaskRecord) -> Result<i64> {
    tx.execute(
        "INSERT INTO tasks (tenant_id, title, due_date, task_type_id) VALUES (?, ?, ?, ?)",
        params![tenant_id, record.title, record.due_date, record.task_type_id],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Upsert on (task, worker). The task must exist and belong to the tenant;
/// an unknown reference aborts the batch.
fn upsert_task_assignment(
    tx: &Transaction<'_>,
    tenant_id: i64,
    task_id: i64,
    worker_id: i64,
) -> Result<()> {
    let owned: i64 = tx.query_row(
        "SELECT COUNT(*) FROM tasks WHERE id = ? AND tenant_id = ?",
        params![task_id, tenant_id],
        |row| row.get(0),
    )?;
    if owned == 0 {
        return Err(Error::InvalidInput(format!(
            "task {task_id} does not exist for this tenant"
        )));
    }

    tx.execute(
        "INSERT INTO task_assignments (tenant_id, task_id, worker_id)
         VALUES (?, ?, ?)
         ON CONFLICT(task_id, worker_id) DO NOTHING",
        params![tenant_id, task_id, worker_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use campo_core::protocol::TaskWorkerRecord;
    use pretty_assertions::assert_eq;

    use crate::store::ServerStore;

    use super::*;

    fn setup() -> (ServerStore, i64) {
        let store = ServerStore::open_in_memory().unwrap();
        let tenant = store.create_tenant("Fundo Sur").unwrap();
        (store, tenant)
    }

    fn attendance(worker_id: i64, date: &str, check_in: &str) -> AttendanceRecord {
        AttendanceRecord {
            worker_id,
            date: date.to_string(),
            check_in: Some(check_in.to_string()),
            check_out: None,
            field_id: None,
            task_type_id: None,
        }
    }

    fn apply_one(store: &mut ServerStore, tenant: i64, batch: UploadBatch) {
        store.apply_upload(tenant, &batch).unwrap();
    }

    #[test]
    fn attendance_upsert_is_idempotent() {
        let (mut store, tenant) = setup();

        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                attendances: vec![attendance(1, "2024-06-01", "08:00")],
                ..UploadBatch::default()
            },
        );
        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                attendances: vec![attendance(1, "2024-06-01", "08:15")],
                ..UploadBatch::default()
            },
        );

        let (count, check_in): (i64, String) = store
            .connection()
            .query_row(
                "SELECT COUNT(*), MAX(check_in) FROM attendances WHERE tenant_id = ?",
                params![tenant],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(check_in, "08:15:00");
    }

    #[test]
    fn attendance_times_are_normalized() {
        let (mut store, tenant) = setup();

        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                attendances: vec![AttendanceRecord {
                    worker_id: 1,
                    date: "2024-06-01".to_string(),
                    check_in: Some("9:30 a. m.".to_string()),
                    check_out: Some("6:05\u{202f}p.m.".to_string()),
                    field_id: None,
                    task_type_id: None,
                }],
                ..UploadBatch::default()
            },
        );

        let (check_in, check_out): (String, String) = store
            .connection()
            .query_row(
                "SELECT check_in, check_out FROM attendances WHERE tenant_id = ?",
                params![tenant],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(check_in, "09:30:00");
        assert_eq!(check_out, "18:05:00");
    }

    #[test]
    fn collections_are_append_only() {
        let (mut store, tenant) = setup();
        let record = CollectionRecord {
            worker_id: 1,
            card_id: 2,
            date: "2024-06-01".to_string(),
            container_id: 3,
            quantity: 10.0,
            field_id: None,
        };

        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                collections: vec![record.clone(), record],
                ..UploadBatch::default()
            },
        );

        let count: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM harvest_collections WHERE tenant_id = ?",
                params![tenant],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn card_assignment_tombstone_deletes_and_tolerates_absent_rows() {
        let (mut store, tenant) = setup();

        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                card_assignments: vec![CardAssignmentRecord {
                    card_id: 5,
                    worker_id: 1,
                    date: "2024-06-01".to_string(),
                    deleted_at: None,
                }],
                ..UploadBatch::default()
            },
        );

        let tombstone = CardAssignmentRecord {
            card_id: 5,
            worker_id: 1,
            date: "2024-06-01".to_string(),
            deleted_at: Some("2024-06-01T19:00:00Z".to_string()),
        };
        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                card_assignments: vec![tombstone.clone()],
                ..UploadBatch::default()
            },
        );

        let count: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM card_assignments WHERE tenant_id = ?",
                params![tenant],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);

        // Deleting again is a no-op, not an error.
        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                card_assignments: vec![tombstone],
                ..UploadBatch::default()
            },
        );
    }

    #[test]
    fn card_assignment_upsert_moves_worker() {
        let (mut store, tenant) = setup();

        for worker_id in [1, 2] {
            apply_one(
                &mut store,
                tenant,
                UploadBatch {
                    card_assignments: vec![CardAssignmentRecord {
                        card_id: 9,
                        worker_id,
                        date: "2024-06-01".to_string(),
                        deleted_at: None,
                    }],
                    ..UploadBatch::default()
                },
            );
        }

        let (count, worker): (i64, i64) = store
            .connection()
            .query_row(
                "SELECT COUNT(*), MAX(worker_id) FROM card_assignments WHERE tenant_id = ?",
                params![tenant],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(worker, 2);
    }

    #[test]
    fn worker_merge_updates_by_owned_id_and_falls_back_to_rut() {
        let (mut store, tenant) = setup();

        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                workers: vec![WorkerRecord {
                    id: None,
                    rut: "11.111.111-1".to_string(),
                    name: "Ana".to_string(),
                    contractor_id: None,
                }],
                ..UploadBatch::default()
            },
        );
        let worker_id: i64 = store
            .connection()
            .query_row(
                "SELECT id FROM workers WHERE tenant_id = ?",
                params![tenant],
                |row| row.get(0),
            )
            .unwrap();

        // Owned id: update in place.
        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                workers: vec![WorkerRecord {
                    id: Some(worker_id),
                    rut: "11.111.111-1".to_string(),
                    name: "Ana Maria".to_string(),
                    contractor_id: None,
                }],
                ..UploadBatch::default()
            },
        );

        // Stale id from another device: falls back to the natural key
        // instead of touching a foreign row.
        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                workers: vec![WorkerRecord {
                    id: Some(worker_id + 999),
                    rut: "11.111.111-1".to_string(),
                    name: "Ana M. Rojas".to_string(),
                    contractor_id: Some(3),
                }],
                ..UploadBatch::default()
            },
        );

        let (count, name): (i64, String) = store
            .connection()
            .query_row(
                "SELECT COUNT(*), MAX(name) FROM workers WHERE tenant_id = ?",
                params![tenant],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(name, "Ana M. Rojas");
    }

    #[test]
    fn crop_and_planting_find_or_create_are_no_ops_on_duplicates() {
        let (mut store, tenant) = setup();
        let batch = UploadBatch {
            crops: vec![
                CropRecord {
                    name: "Cerezo".to_string(),
                    field_id: 1,
                },
                CropRecord {
                    name: "Cerezo".to_string(),
                    field_id: 1,
                },
            ],
            plantings: vec![
                PlantingRecord {
                    crop_id: 1,
                    field_id: 1,
                    planted_date: "2023-08-15".to_string(),
                },
                PlantingRecord {
                    crop_id: 1,
                    field_id: 1,
                    planted_date: "2023-08-15".to_string(),
                },
            ],
            ..UploadBatch::default()
        };
        apply_one(&mut store, tenant, batch);

        let crops: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM crops", [], |row| row.get(0))
            .unwrap();
        let plantings: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM plantings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(crops, 1);
        assert_eq!(plantings, 1);
    }

    #[test]
    fn missing_cost_category_defaults_to_direct() {
        let (mut store, tenant) = setup();
        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                direct_costs: vec![DirectCostRecord {
                    date: "2024-06-01".to_string(),
                    amount: 120_000.0,
                    category: None,
                    field_id: None,
                }],
                ..UploadBatch::default()
            },
        );

        let category: String = store
            .connection()
            .query_row("SELECT category FROM direct_costs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(category, "direct");
    }

    #[test]
    fn task_cascades_into_assignments() {
        let (mut store, tenant) = setup();
        apply_one(
            &mut store,
            tenant,
            UploadBatch {
                tasks: vec![TaskRecord {
                    id: None,
                    title: "Podar cuartel 3".to_string(),
                    due_date: Some("2024-06-10".to_string()),
                    task_type_id: None,
                    assignments: vec![
                        TaskWorkerRecord { worker_id: 1 },
                        TaskWorkerRecord { worker_id: 2 },
                        TaskWorkerRecord { worker_id: 1 },
                    ],
                }],
                ..UploadBatch::default()
            },
        );

        let assignments: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM task_assignments", [], |row| row.get(0))
            .unwrap();
        assert_eq!(assignments, 2);
    }

    #[test]
    fn standalone_assignment_for_unknown_task_aborts() {
        let (mut store, tenant) = setup();
        let result = store.apply_upload(
            tenant,
            &UploadBatch {
                task_assignments: vec![TaskAssignmentRecord {
                    task_id: 42,
                    worker_id: 1,
                }],
                ..UploadBatch::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn failing_record_rolls_back_the_whole_batch() {
        let (mut store, tenant) = setup();

        // Attendance would succeed alone; the negative quantity violates
        // the CHECK constraint and must drag the attendance down with it.
        let result = store.apply_upload(
            tenant,
            &UploadBatch {
                attendances: vec![attendance(1, "2024-06-01", "08:00")],
                collections: vec![CollectionRecord {
                    worker_id: 1,
                    card_id: 2,
                    date: "2024-06-01".to_string(),
                    container_id: 3,
                    quantity: -4.0,
                    field_id: None,
                }],
                ..UploadBatch::default()
            },
        );
        assert!(result.is_err());

        let attendances: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM attendances", [], |row| row.get(0))
            .unwrap();
        assert_eq!(attendances, 0);
    }

    #[test]
    fn invalid_time_string_aborts_the_batch() {
        let (mut store, tenant) = setup();
        let result = store.apply_upload(
            tenant,
            &UploadBatch {
                attendances: vec![attendance(1, "2024-06-01", "not a time")],
                ..UploadBatch::default()
            },
        );
        assert!(result.is_err());

        let attendances: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM attendances", [], |row| row.get(0))
            .unwrap();
        assert_eq!(attendances, 0);
    }

    #[test]
    fn tenants_with_the_same_natural_key_do_not_collide() {
        let mut store = ServerStore::open_in_memory().unwrap();
        let tenant_a = store.create_tenant("Fundo A").unwrap();
        let tenant_b = store.create_tenant("Fundo B").unwrap();

        for tenant in [tenant_a, tenant_b] {
            store
                .apply_upload(
                    tenant,
                    &UploadBatch {
                        workers: vec![WorkerRecord {
                            id: None,
                            rut: "22.222.222-2".to_string(),
                            name: format!("Worker of {tenant}"),
                            contractor_id: None,
                        }],
                        attendances: vec![attendance(1, "2024-06-01", "08:00")],
                        ..UploadBatch::default()
                    },
                )
                .unwrap();
        }

        let workers: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM workers", [], |row| row.get(0))
            .unwrap();
        let attendances: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM attendances", [], |row| row.get(0))
            .unwrap();
        assert_eq!(workers, 2);
        assert_eq!(attendances, 2);

        let names: Vec<String> = {
            let conn = store.connection();
            let mut stmt = conn
                .prepare("SELECT name FROM workers WHERE tenant_id = ? ORDER BY id")
                .unwrap();
            stmt.query_map(params![tenant_a], |row| row.get(0))
                .unwrap()
                .collect::<rusqlite::Result<Vec<_>>>()
                .unwrap()
        };
        assert_eq!(names, vec![format!("Worker of {tenant_a}")]);
    }

    #[test]
    fn processed_counts_cover_every_entity_type() {
        let (mut store, tenant) = setup();
        let processed = store
            .apply_upload(
                tenant,
                &UploadBatch {
                    attendances: vec![attendance(1, "2024-06-01", "08:00")],
                    ..UploadBatch::default()
                },
            )
            .unwrap();

        assert_eq!(processed.get("attendances"), Some(&1));
        assert_eq!(processed.get("collections"), Some(&0));
        assert_eq!(processed.len(), 11);
    }
}
