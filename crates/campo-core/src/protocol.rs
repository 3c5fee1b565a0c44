//! Wire types shared by the sync client and the sync endpoint.
//!
//! Every shape here is the external projection of an entity, deliberately
//! decoupled from storage column names on either side. All dates are
//! `YYYY-MM-DD` strings and all times-of-day are canonical `HH:MM:SS`
//! (see [`crate::timefmt`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Upload records (device -> server)
// ---------------------------------------------------------------------------

/// One day of attendance for one worker. Upserted on (tenant, worker, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub worker_id: i64,
    pub date: String,
    #[serde(default)]
    pub check_in: Option<String>,
    #[serde(default)]
    pub check_out: Option<String>,
    #[serde(default)]
    pub field_id: Option<i64>,
    #[serde(default)]
    pub task_type_id: Option<i64>,
}

/// One harvest submission. Append-only: never deduplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub worker_id: i64,
    pub card_id: i64,
    pub date: String,
    pub container_id: i64,
    pub quantity: f64,
    #[serde(default)]
    pub field_id: Option<i64>,
}

/// Card-to-worker assignment for a date. Upserted on (tenant, date, card);
/// a set `deleted_at` turns the record into a tombstone that hard-deletes
/// the matching row (the marker itself is never stored).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardAssignmentRecord {
    pub card_id: i64,
    pub worker_id: i64,
    pub date: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

/// Worker registration or update. When `id` is present and owned by the
/// tenant the row is updated in place; otherwise the record upserts on the
/// natural key (tenant, rut).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    #[serde(default)]
    pub id: Option<i64>,
    pub rut: String,
    pub name: String,
    #[serde(default)]
    pub contractor_id: Option<i64>,
}

/// Find-or-create on (tenant, name, field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropRecord {
    pub name: String,
    pub field_id: i64,
}

/// Find-or-create on (tenant, crop, field, planted_date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantingRecord {
    pub crop_id: i64,
    pub field_id: i64,
    pub planted_date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplyRecord {
    pub name: String,
    #[serde(default)]
    pub unit_of_measure_id: Option<i64>,
}

/// Missing `category` defaults to `"direct"` at merge time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectCostRecord {
    pub date: String,
    pub amount: f64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub field_id: Option<i64>,
}

/// Upserted on (tenant, year, month, labor_type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaborPlanRecord {
    pub year: i32,
    pub month: u32,
    pub labor_type_id: i64,
    pub planned_hours: f64,
}

/// Task with nested assignments. The task is merged before its assignments
/// so the (task, worker) upserts always have a task row to reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(default)]
    pub id: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub task_type_id: Option<i64>,
    #[serde(default)]
    pub assignments: Vec<TaskWorkerRecord>,
}

/// Assignment nested inside a [`TaskRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWorkerRecord {
    pub worker_id: i64,
}

/// Standalone assignment referencing an existing task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignmentRecord {
    pub task_id: i64,
    pub worker_id: i64,
}

/// Batch payload for `POST /v1/sync/upload`. Absent or empty arrays are
/// valid; all present records commit in a single server transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadBatch {
    #[serde(default)]
    pub attendances: Vec<AttendanceRecord>,
    #[serde(default)]
    pub collections: Vec<CollectionRecord>,
    #[serde(default)]
    pub card_assignments: Vec<CardAssignmentRecord>,
    #[serde(default)]
    pub workers: Vec<WorkerRecord>,
    #[serde(default)]
    pub crops: Vec<CropRecord>,
    #[serde(default)]
    pub plantings: Vec<PlantingRecord>,
    #[serde(default)]
    pub supplies: Vec<SupplyRecord>,
    #[serde(default)]
    pub direct_costs: Vec<DirectCostRecord>,
    #[serde(default)]
    pub labor_plans: Vec<LaborPlanRecord>,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub task_assignments: Vec<TaskAssignmentRecord>,
}

impl UploadBatch {
    /// True when no record of any entity type is present.
    pub fn is_empty(&self) -> bool {
        self.attendances.is_empty()
            && self.collections.is_empty()
            && self.card_assignments.is_empty()
            && self.workers.is_empty()
            && self.crops.is_empty()
            && self.plantings.is_empty()
            && self.supplies.is_empty()
            && self.direct_costs.is_empty()
            && self.labor_plans.is_empty()
            && self.tasks.is_empty()
            && self.task_assignments.is_empty()
    }
}

/// Response body for `POST /v1/sync/upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub status: String,
    #[serde(default)]
    pub processed: BTreeMap<String, usize>,
    #[serde(default)]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Snapshot rows (server -> device)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRow {
    pub id: i64,
    pub rut: String,
    pub name: String,
    pub contractor_id: Option<i64>,
}

/// Contractors expose their display name under the generic `name` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractorRow {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRow {
    pub id: i64,
    pub name: String,
    pub area_hectares: Option<f64>,
}

/// Generic (id, name) reference row: species, task types, labor types,
/// units of measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarietyRow {
    pub id: i64,
    pub species_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRow {
    pub id: i64,
    pub name: String,
    pub capacity_kg: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRow {
    pub id: i64,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardAssignmentRow {
    pub card_id: i64,
    pub worker_id: i64,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropRow {
    pub id: i64,
    pub name: String,
    pub field_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantingRow {
    pub id: i64,
    pub crop_id: i64,
    pub field_id: i64,
    pub planted_date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplyRow {
    pub id: i64,
    pub name: String,
    pub unit_of_measure_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectCostRow {
    pub id: i64,
    pub date: String,
    pub amount: f64,
    pub category: String,
    pub field_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaborPlanRow {
    pub id: i64,
    pub year: i32,
    pub month: u32,
    pub labor_type_id: i64,
    pub planned_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: i64,
    pub title: String,
    pub due_date: Option<String>,
    pub task_type_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignmentRow {
    pub task_id: i64,
    pub worker_id: i64,
}

/// Point-in-time projection of the tenant's reference and recent operational
/// data, returned by `GET /v1/sync/download`. Card assignments, tasks, and
/// labor plans are windowed; everything else is the full table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub workers: Vec<WorkerRow>,
    pub contractors: Vec<ContractorRow>,
    pub fields: Vec<FieldRow>,
    pub species: Vec<CatalogRow>,
    pub varieties: Vec<VarietyRow>,
    pub harvest_containers: Vec<ContainerRow>,
    pub cards: Vec<CardRow>,
    pub card_assignments: Vec<CardAssignmentRow>,
    pub crops: Vec<CropRow>,
    pub plantings: Vec<PlantingRow>,
    pub supplies: Vec<SupplyRow>,
    pub direct_costs: Vec<DirectCostRow>,
    pub labor_plans: Vec<LaborPlanRow>,
    pub task_types: Vec<CatalogRow>,
    pub labor_types: Vec<CatalogRow>,
    pub unit_of_measures: Vec<CatalogRow>,
    pub tasks: Vec<TaskRow>,
    /// Currently always empty; the reverse direction is not wired yet.
    pub task_assignments: Vec<TaskAssignmentRow>,
    pub server_time: String,
}
