use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::api::ApiState;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct StatusResponse {
    pub(crate) folder_id: String,
    pub(crate) running: bool,
    pub(crate) missing_chunks: usize,
    pub(crate) requests_outstanding: usize,
    pub(crate) remotes: usize,
    pub(crate) completed_total: u64,
    pub(crate) failed_total: u64,
    pub(crate) store_failures_total: u64,
    pub(crate) timed_out_requests_total: u64,
    pub(crate) ignored_replies_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct DownloadEntry {
    pub(crate) ct_hash: String,
    pub(crate) size: u64,
    pub(crate) filled: u64,
    pub(crate) progress_pct: u8,
    pub(crate) requests: usize,
    pub(crate) remotes_count: u32,
    pub(crate) clustered: bool,
    pub(crate) immediate: bool,
    pub(crate) weight: f32,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct DownloadListResponse {
    pub(crate) folder_id: String,
    pub(crate) queue_len: usize,
    pub(crate) downloads: Vec<DownloadEntry>,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

pub(crate) async fn status(
    State(state): State<ApiState>,
) -> Result<Json<StatusResponse>, StatusCode> {
    let (status, _) = state
        .download_handle
        .snapshot()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(StatusResponse {
        folder_id: state.folder_id.clone(),
        running: status.running,
        missing_chunks: status.missing_chunks,
        requests_outstanding: status.requests_outstanding,
        remotes: status.remotes,
        completed_total: status.completed_total,
        failed_total: status.failed_total,
        store_failures_total: status.store_failures_total,
        timed_out_requests_total: status.timed_out_requests_total,
        ignored_replies_total: status.ignored_replies_total,
    }))
}

pub(crate) async fn downloads(
    State(state): State<ApiState>,
) -> Result<Json<DownloadListResponse>, StatusCode> {
    let (_, items) = state
        .download_handle
        .snapshot()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    let downloads = items
        .iter()
        .map(|d| DownloadEntry {
            ct_hash: d.ct_hash_hex.clone(),
            size: d.size,
            filled: d.filled,
            progress_pct: if d.size == 0 {
                0
            } else {
                ((d.filled.saturating_mul(100) / d.size).min(100)) as u8
            },
            requests: d.requests,
            remotes_count: d.remotes_count,
            clustered: d.clustered,
            immediate: d.immediate,
            weight: d.weight_value,
        })
        .collect::<Vec<_>>();

    Ok(Json(DownloadListResponse {
        folder_id: state.folder_id.clone(),
        queue_len: downloads.len(),
        downloads,
    }))
}
