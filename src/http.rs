//! Administrative HTTP surface.
//!
//! Exposes consistency hashes, manual refreshes and raw change-log windows
//! so operators and peers can compare and repair caches.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{CacheRegistry, RefreshReport};
use crate::changelog::{ChangeLogReader, ChangeLogRecord};
use crate::error::{CacheError, RegistryError, StoreError};

const SOURCE: &str = "cachesync::http";

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<CacheRegistry>,
    pub changes: ChangeLogReader,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/info/hash", get(all_datasets_hash))
        .route("/info/hash/{dataset}", get(dataset_hash))
        .route("/info/hash/{dataset}/{item}", get(item_hash))
        .route("/info/refresh", post(refresh_all))
        .route("/info/refresh/{dataset}", post(refresh_dataset))
        .route("/changed-keys/{start}/{end}", get(changed_keys))
        .with_state(state)
}

#[derive(Debug)]
pub struct AdminError {
    status: StatusCode,
    public_message: &'static str,
    detail: String,
}

impl AdminError {
    fn new(status: StatusCode, public_message: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            public_message,
            detail: detail.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    detail: &'a str,
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(
                source_module = SOURCE,
                status = self.status.as_u16(),
                detail = %self.detail,
                "Admin request failed"
            );
        }
        let body = ErrorBody {
            error: self.public_message,
            detail: &self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RegistryError> for AdminError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::UnknownDataset(_) | RegistryError::NotRegistered(_) => {
                AdminError::new(StatusCode::NOT_FOUND, "Unknown dataset", error.to_string())
            }
            RegistryError::Cache(err) => err.into(),
            other => AdminError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Registry error",
                other.to_string(),
            ),
        }
    }
}

impl From<CacheError> for AdminError {
    fn from(error: CacheError) -> Self {
        let status = match &error {
            CacheError::KeyCodec { .. } => StatusCode::BAD_REQUEST,
            CacheError::Store { .. } => StatusCode::BAD_GATEWAY,
            CacheError::ValueCodec { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AdminError::new(status, "Cache error", error.to_string())
    }
}

impl From<StoreError> for AdminError {
    fn from(error: StoreError) -> Self {
        AdminError::new(
            StatusCode::BAD_GATEWAY,
            "Change log unavailable",
            error.to_string(),
        )
    }
}

/// GET /info/hash
async fn all_datasets_hash(State(state): State<AdminState>) -> Result<String, AdminError> {
    Ok(state.registry.calculate_hash()?.to_string())
}

/// GET /info/hash/{dataset}
async fn dataset_hash(
    State(state): State<AdminState>,
    Path(dataset): Path<String>,
) -> Result<String, AdminError> {
    Ok(state.registry.calculate_dataset_hash(&dataset)?.to_string())
}

/// GET /info/hash/{dataset}/{item}
async fn item_hash(
    State(state): State<AdminState>,
    Path((dataset, item)): Path<(String, String)>,
) -> Result<String, AdminError> {
    Ok(state
        .registry
        .calculate_item_hash(&dataset, &item)?
        .to_string())
}

#[derive(Debug, Serialize)]
struct RefreshAllResponse {
    not_refreshed: Vec<String>,
}

/// POST /info/refresh
async fn refresh_all(State(state): State<AdminState>) -> Json<RefreshAllResponse> {
    let not_refreshed = state.registry.refresh_all().await;
    info!(
        source_module = SOURCE,
        not_refreshed = not_refreshed.len(),
        "Manual refresh of every dataset finished"
    );
    Json(RefreshAllResponse { not_refreshed })
}

/// POST /info/refresh/{dataset}
async fn refresh_dataset(
    State(state): State<AdminState>,
    Path(dataset): Path<String>,
) -> Result<Json<RefreshReport>, AdminError> {
    let report = state.registry.refresh_dataset(&dataset).await?;
    Ok(Json(report))
}

/// GET /changed-keys/{start}/{end}
async fn changed_keys(
    State(state): State<AdminState>,
    Path((start, end)): Path<(i64, i64)>,
) -> Result<Json<Vec<ChangeLogRecord>>, AdminError> {
    if end < start {
        return Err(AdminError::new(
            StatusCode::BAD_REQUEST,
            "Invalid window",
            format!("window end {end} is before start {start}"),
        ));
    }
    Ok(Json(state.changes.changes(start, end).await?))
}
