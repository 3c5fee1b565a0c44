use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use campo_core::protocol::{Snapshot, UploadBatch, UploadResponse};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, resolve_tenant, TenantContext};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::store::ServerStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    store: Arc<Mutex<ServerStore>>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, store: ServerStore) -> Self {
        Self {
            config,
            store: Arc::new(Mutex::new(store)),
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/download", get(sync_download))
        .route("/sync/upload", post(sync_upload))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?.to_string();
    let context = {
        let store = state.store.lock().await;
        resolve_tenant(&store, &state.config, &token)?
    };
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

/// Full snapshot for the caller's tenant as of now. Failures surface as a
/// generic 500; details stay in the server log.
async fn sync_download(
    State(state): State<AppState>,
    Extension(context): Extension<TenantContext>,
) -> Result<Json<Snapshot>, AppError> {
    let store = state.store.lock().await;
    match store.snapshot(context.tenant_id, Utc::now(), &state.config.windows) {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(error) => {
            tracing::error!(tenant = context.tenant_id, %error, "Snapshot projection failed");
            Err(AppError::internal("sync download failed"))
        }
    }
}

/// Apply the batch atomically; any failure rolls the whole batch back and
/// the device keeps its queue for the next cycle.
async fn sync_upload(
    State(state): State<AppState>,
    Extension(context): Extension<TenantContext>,
    Json(batch): Json<UploadBatch>,
) -> Response {
    let mut store = state.store.lock().await;
    match store.apply_upload(context.tenant_id, &batch) {
        Ok(processed) => Json(UploadResponse {
            status: "success".to_string(),
            processed,
            message: None,
        })
        .into_response(),
        Err(campo_core::Error::InvalidInput(message)) => {
            tracing::warn!(tenant = context.tenant_id, %message, "Rejected upload batch");
            upload_error(StatusCode::BAD_REQUEST, message)
        }
        Err(error) => {
            tracing::error!(tenant = context.tenant_id, %error, "Upload merge failed");
            upload_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "sync upload failed".to_string(),
            )
        }
    }
}

fn upload_error(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(UploadResponse {
            status: "error".to_string(),
            processed: Default::default(),
            message: Some(message),
        }),
    )
        .into_response()
}
