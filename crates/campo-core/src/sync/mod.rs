//! Sync client and cycle orchestration.
//!
//! A sync cycle is two sequential phases: upload the write-ahead queue,
//! then download a fresh snapshot and merge it into the local store. The
//! download phase only runs after the upload phase succeeded (or had
//! nothing to send), so a failed upload never gets its unacknowledged rows
//! clobbered by a merge.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::StatusCode;
use serde::Deserialize;

use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::protocol::{Snapshot, UploadBatch, UploadResponse};

/// HTTP client for the sync endpoint.
#[derive(Clone)]
pub struct SyncClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl SyncClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let base_url = normalize_endpoint(base_url.into())?;
        let token = token.into();
        if token.trim().is_empty() {
            return Err(Error::InvalidInput(
                "API token must not be empty".to_string(),
            ));
        }
        Ok(Self {
            base_url,
            token,
            client: reqwest::Client::builder().build()?,
        })
    }

    /// Fetch the tenant snapshot.
    pub async fn download(&self) -> Result<Snapshot> {
        let response = self
            .client
            .get(format!("{}/v1/sync/download", self.base_url))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(server_error(status, &body));
        }

        Ok(response.json::<Snapshot>().await?)
    }

    /// Post a batch of pending records.
    pub async fn upload(&self, batch: &UploadBatch) -> Result<UploadResponse> {
        let response = self
            .client
            .post(format!("{}/v1/sync/upload", self.base_url))
            .bearer_auth(&self.token)
            .json(batch)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(server_error(status, &body));
        }

        Ok(response.json::<UploadResponse>().await?)
    }
}

#[derive(Debug, Deserialize)]
struct ServerErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn server_error(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ServerErrorBody>(body)
        .ok()
        .and_then(|payload| payload.message.or(payload.error))
        .map_or_else(
            || {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("HTTP {}", status.as_u16())
                } else {
                    trimmed.to_string()
                }
            },
            |message| message.trim().to_string(),
        );

    Error::Server {
        status: status.as_u16(),
        message,
    }
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(Error::InvalidInput(
            "endpoint must not be empty".to_string(),
        ));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Per-entity counts acknowledged by the server. Empty when the queue
    /// was empty and the upload was skipped.
    pub uploaded: BTreeMap<String, usize>,
    pub downloaded: bool,
}

/// Orchestrates upload-then-download cycles against one server.
///
/// Cycles are user-triggered and must not interleave: a second `run` while
/// one is in flight fails fast with [`Error::SyncInProgress`] instead of
/// racing the first over the same queue rows.
pub struct SyncEngine {
    client: SyncClient,
    in_flight: AtomicBool,
}

impl SyncEngine {
    pub const fn new(client: SyncClient) -> Self {
        Self {
            client,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Run one full sync cycle against the given local store.
    pub async fn run(&self, store: &mut LocalStore) -> Result<SyncReport> {
        let _guard = self.begin_cycle()?;
        let mut report = SyncReport::default();

        // Phase 1: upload. Skip the network call entirely when nothing is
        // pending. Rows are only marked synced after the server confirms.
        let pending = store.pending_batch()?;
        if pending.is_empty() {
            tracing::debug!("Upload queue empty, skipping upload phase");
        } else {
            let response = self.client.upload(&pending.batch).await?;
            store.mark_batch_synced(&pending)?;
            tracing::info!(
                attendances = pending.attendance_ids.len(),
                collections = pending.collection_ids.len(),
                card_assignments = pending.card_assignment_ids.len(),
                "Upload phase acknowledged"
            );
            report.uploaded = response.processed;
        }

        // Phase 2: download. Only reached when phase 1 succeeded.
        let snapshot = self.client.download().await?;
        store.apply_snapshot(&snapshot)?;
        report.downloaded = true;
        tracing::info!(server_time = %snapshot.server_time, "Snapshot merged");

        Ok(report)
    }

    fn begin_cycle(&self) -> Result<CycleGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::SyncInProgress);
        }
        Ok(CycleGuard {
            in_flight: &self.in_flight,
        })
    }
}

/// Clears the in-flight latch when a cycle ends, even on error paths.
struct CycleGuard<'a> {
    in_flight: &'a AtomicBool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}
