use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{error, warn};

use crate::cluster::Replicator;
use crate::store::{Item, Store, StoreError};

const EXTERN_ID_MAX: usize = 80;
const PAYLOAD_MAX: usize = 500;

#[derive(Debug, Deserialize)]
pub struct CreateItemRequest {
    pub extern_id: String,
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    pub payload: Option<String>,
    pub done: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    #[serde(flatten)]
    pub cluster: crate::cluster::ClusterInfo,
    pub cpu_usage: f32,
    pub mem_used_mb: u64,
    pub mem_total_mb: u64,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Maps a store failure to an HTTP response, retrying transient errors
/// (write contention, I/O hiccups) once before giving up.
fn run_store_op<T>(op: impl Fn() -> Result<T, StoreError>) -> Result<T, StoreError> {
    match op() {
        Err(e) if e.is_transient() => {
            warn!("transient store error, retrying once: {}", e);
            op()
        }
        result => result,
    }
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::Duplicate => error_response(StatusCode::CONFLICT, "extern_id already exists"),
        StoreError::NotFound => error_response(StatusCode::NOT_FOUND, "item not found"),
        StoreError::NotOwned => error_response(StatusCode::CONFLICT, "item not owned"),
        StoreError::Sqlite(e) => {
            error!("store error: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

/// Data routes return 503 until the join-time sync has finished.
fn require_ready(replicator: &Replicator) -> Option<Response> {
    let (ready, message) = replicator.readiness();
    if ready {
        None
    } else {
        Some(error_response(StatusCode::SERVICE_UNAVAILABLE, message))
    }
}

// ------------------------------------------------------------------
// Health
// ------------------------------------------------------------------

pub async fn handle_ready(Extension(replicator): Extension<Arc<Replicator>>) -> Response {
    let (ready, message) = replicator.readiness();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready,
            message: message.to_string(),
        }),
    )
        .into_response()
}

pub async fn handle_info(Extension(replicator): Extension<Arc<Replicator>>) -> Response {
    let cluster = match replicator.info() {
        Ok(info) => info,
        Err(e) => return store_error_response(e),
    };

    let mut sys = System::new_all();
    sys.refresh_cpu();
    sys.refresh_memory();
    let cpu_usage = sys.global_cpu_info().cpu_usage();
    // sysinfo reports memory in bytes.
    let mem_total_mb = sys.total_memory() / (1024 * 1024);
    let mem_used_mb = sys.used_memory() / (1024 * 1024);

    Json(InfoResponse {
        cluster,
        cpu_usage,
        mem_used_mb,
        mem_total_mb,
    })
    .into_response()
}

// ------------------------------------------------------------------
// Items
// ------------------------------------------------------------------

pub async fn handle_list(
    Extension(store): Extension<Arc<Store>>,
    Extension(replicator): Extension<Arc<Replicator>>,
) -> Response {
    if let Some(resp) = require_ready(&replicator) {
        return resp;
    }
    match run_store_op(|| store.list()) {
        Ok(items) => Json(items).into_response(),
        Err(e) => store_error_response(e),
    }
}

pub async fn handle_get(
    Extension(store): Extension<Arc<Store>>,
    Extension(replicator): Extension<Arc<Replicator>>,
    Path(id): Path<i64>,
) -> Response {
    if let Some(resp) = require_ready(&replicator) {
        return resp;
    }
    match run_store_op(|| store.get_by_local_id(id)) {
        Ok(Some(item)) => Json(item).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "item not found"),
        Err(e) => store_error_response(e),
    }
}

pub async fn handle_create(
    Extension(store): Extension<Arc<Store>>,
    Extension(replicator): Extension<Arc<Replicator>>,
    Json(req): Json<CreateItemRequest>,
) -> Response {
    if let Some(resp) = require_ready(&replicator) {
        return resp;
    }
    if let Err(message) = validate_extern_id(&req.extern_id) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }
    if let Err(message) = validate_payload(&req.payload) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }

    let item = match run_store_op(|| store.create(&req.extern_id, &req.payload)) {
        Ok(item) => item,
        Err(e) => return store_error_response(e),
    };
    replicator.broadcast_created(&item).await;

    (StatusCode::CREATED, Json(item)).into_response()
}

pub async fn handle_update(
    Extension(store): Extension<Arc<Store>>,
    Extension(replicator): Extension<Arc<Replicator>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateItemRequest>,
) -> Response {
    if let Some(resp) = require_ready(&replicator) {
        return resp;
    }
    if let Some(payload) = &req.payload {
        if let Err(message) = validate_payload(payload) {
            return error_response(StatusCode::BAD_REQUEST, message);
        }
    }

    let item = match run_store_op(|| store.update_payload(id, req.payload.as_deref(), req.done)) {
        Ok(item) => item,
        Err(e) => return store_error_response(e),
    };
    replicator.broadcast_updated(&item).await;

    Json(item).into_response()
}

pub async fn handle_delete(
    Extension(store): Extension<Arc<Store>>,
    Extension(replicator): Extension<Arc<Replicator>>,
    Path(id): Path<i64>,
) -> Response {
    if let Some(resp) = require_ready(&replicator) {
        return resp;
    }

    // Fetch first: the broadcast needs the extern_id of the deleted row.
    let item: Item = match run_store_op(|| store.get_by_local_id(id)) {
        Ok(Some(item)) => item,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "item not found"),
        Err(e) => return store_error_response(e),
    };
    if let Err(e) = run_store_op(|| store.delete(id)) {
        return store_error_response(e);
    }
    replicator.broadcast_deleted(&item.extern_id).await;

    StatusCode::NO_CONTENT.into_response()
}

pub fn validate_extern_id(extern_id: &str) -> Result<(), String> {
    if extern_id.is_empty() || extern_id.len() > EXTERN_ID_MAX {
        return Err(format!(
            "extern_id must be between 1 and {EXTERN_ID_MAX} bytes"
        ));
    }
    Ok(())
}

pub fn validate_payload(payload: &str) -> Result<(), String> {
    if payload.is_empty() || payload.len() > PAYLOAD_MAX {
        return Err(format!("payload must be between 1 and {PAYLOAD_MAX} bytes"));
    }
    Ok(())
}
