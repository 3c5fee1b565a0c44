//! Snapshot projection: the read-only state pushed to devices on download.
//!
//! Reference tables are projected whole; card assignments, tasks, and labor
//! plans are windowed so years of history never travel to a handset.

use campo_core::protocol::{
    CardAssignmentRow, CardRow, CatalogRow, ContainerRow, ContractorRow, CropRow, DirectCostRow,
    FieldRow, LaborPlanRow, PlantingRow, Snapshot, SupplyRow, TaskRow, VarietyRow, WorkerRow,
};
use campo_core::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};

use crate::config::SnapshotWindows;

pub fn project(
    conn: &Connection,
    tenant_id: i64,
    now: DateTime<Utc>,
    windows: &SnapshotWindows,
) -> Result<Snapshot> {
    // Today counts as day one of the window.
    let assignment_floor = (now.date_naive()
        - Duration::days(i64::from(windows.assignment_days) - 1))
    .format("%Y-%m-%d")
    .to_string();

    Ok(Snapshot {
        workers: collect(
            conn,
            "SELECT id, rut, name, contractor_id FROM workers WHERE tenant_id = ? ORDER BY id",
            params![tenant_id],
            |row| {
                Ok(WorkerRow {
                    id: row.get(0)?,
                    rut: row.get(1)?,
                    name: row.get(2)?,
                    contractor_id: row.get(3)?,
                })
            },
        )?,
        contractors: collect(
            conn,
            "SELECT id, display_name FROM contractors WHERE tenant_id = ? ORDER BY id",
            params![tenant_id],
            |row| {
                Ok(ContractorRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )?,
        fields: collect(
            conn,
            "SELECT id, name, area_hectares FROM fields WHERE tenant_id = ? ORDER BY id",
            params![tenant_id],
            |row| {
                Ok(FieldRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    area_hectares: row.get(2)?,
                })
            },
        )?,
        species: catalog(conn, "species", tenant_id)?,
        varieties: collect(
            conn,
            "SELECT id, species_id, name FROM varieties WHERE tenant_id = ? ORDER BY id",
            params![tenant_id],
            |row| {
                Ok(VarietyRow {
                    id: row.get(0)?,
                    species_id: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )?,
        harvest_containers: collect(
            conn,
            "SELECT id, name, capacity_kg FROM harvest_containers WHERE tenant_id = ? ORDER BY id",
            params![tenant_id],
            |row| {
                Ok(ContainerRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    capacity_kg: row.get(2)?,
                })
            },
        )?,
        cards: collect(
            conn,
            "SELECT id, code FROM cards WHERE tenant_id = ? ORDER BY id",
            params![tenant_id],
            |row| {
                Ok(CardRow {
                    id: row.get(0)?,
                    code: row.get(1)?,
                })
            },
        )?,
        card_assignments: collect(
            conn,
            "SELECT card_id, worker_id, date FROM card_assignments
             WHERE tenant_id = ? AND date >= ? ORDER BY date, card_id",
            params![tenant_id, assignment_floor],
            |row| {
                Ok(CardAssignmentRow {
                    card_id: row.get(0)?,
                    worker_id: row.get(1)?,
                    date: row.get(2)?,
                })
            },
        )?,
        crops: collect(
            conn,
            "SELECT id, name, field_id FROM crops WHERE tenant_id = ? ORDER BY id",
            params![tenant_id],
            |row| {
                Ok(CropRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    field_id: row.get(2)?,
                })
            },
        )?,
        plantings: collect(
            conn,
            "SELECT id, crop_id, field_id, planted_date FROM plantings
             WHERE tenant_id = ? ORDER BY id",
            params![tenant_id],
            |row| {
                Ok(PlantingRow {
                    id: row.get(0)?,
                    crop_id: row.get(1)?,
                    field_id: row.get(2)?,
                    planted_date: row.get(3)?,
                })
            },
        )?,
        supplies: collect(
            conn,
            "SELECT id, name, unit_of_measure_id FROM supplies WHERE tenant_id = ? ORDER BY id",
            params![tenant_id],
            |row| {
                Ok(SupplyRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    unit_of_measure_id: row.get(2)?,
                })
            },
        )?,
        direct_costs: collect(
            conn,
            "SELECT id, date, amount, category, field_id FROM direct_costs
             WHERE tenant_id = ? ORDER BY id",
            params![tenant_id],
            |row| {
                Ok(DirectCostRow {
                    id: row.get(0)?,
                    date: row.get(1)?,
                    amount: row.get(2)?,
                    category: row.get(3)?,
                    field_id: row.get(4)?,
                })
            },
        )?,
        labor_plans: collect(
            conn,
            "SELECT id, year, month, labor_type_id, planned_hours FROM labor_plans
             WHERE tenant_id = ? ORDER BY year DESC, month DESC LIMIT ?",
            params![tenant_id, windows.labor_plan_limit],
            |row| {
                Ok(LaborPlanRow {
                    id: row.get(0)?,
                    year: row.get(1)?,
                    month: row.get(2)?,
                    labor_type_id: row.get(3)?,
                    planned_hours: row.get(4)?,
                })
            },
        )?,
        task_types: catalog(conn, "task_types", tenant_id)?,
        labor_types: catalog(conn, "labor_types", tenant_id)?,
        unit_of_measures: catalog(conn, "unit_of_measures", tenant_id)?,
        tasks: collect(
            conn,
            "SELECT id, title, due_date, task_type_id FROM tasks
             WHERE tenant_id = ? ORDER BY due_date DESC, id DESC LIMIT ?",
            params![tenant_id, windows.task_limit],
            |row| {
                Ok(TaskRow {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    due_date: row.get(2)?,
                    task_type_id: row.get(3)?,
                })
            },
        )?,
        // The reverse direction for assignments is not wired yet; devices
        // must tolerate the empty list.
        task_assignments: Vec::new(),
        server_time: now.to_rfc3339(),
    })
}

fn collect<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn catalog(conn: &Connection, table: &str, tenant_id: i64) -> Result<Vec<CatalogRow>> {
    collect(
        conn,
        &format!("SELECT id, name FROM {table} WHERE tenant_id = ? ORDER BY id"),
        params![tenant_id],
        |row| {
            Ok(CatalogRow {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        },
    )
}
