use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::session::{SessionDescriptor, SessionState};
use crate::source::{redact_credentials, Device};
use crate::stats::StatsSnapshot;
use crate::supervisor::{StartOutcome, StartRequest};

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    active_streams: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_streams: state.supervisor.registry().len(),
    })
}

fn default_channel() -> u32 {
    1
}

/// Body of `POST /streams/start` and one item of `POST /streams/bulk/start`.
///
/// Exactly one of `source_uri` or `device` must be given.
#[derive(Debug, Deserialize)]
pub(super) struct StartStreamRequest {
    #[serde(default)]
    source_uri: Option<String>,
    #[serde(default)]
    device: Option<Device>,
    #[serde(default = "default_channel")]
    channel: u32,
    #[serde(default)]
    sub_stream: u32,
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default)]
    stream_id: Option<String>,
}

/// Public view of a session. The source URI has its password masked.
#[derive(Debug, Serialize)]
pub(super) struct StreamView {
    stream_id: String,
    source_uri: String,
    playlist_url: String,
    state: SessionState,
    pid: Option<u32>,
    started_at: chrono::DateTime<chrono::Utc>,
    duration: u64,
}

impl From<SessionDescriptor> for StreamView {
    fn from(d: SessionDescriptor) -> Self {
        StreamView {
            source_uri: redact_credentials(&d.source_uri),
            stream_id: d.id,
            playlist_url: d.playlist_url,
            state: d.state,
            pid: d.pid,
            started_at: d.started_at,
            duration: d.max_duration_secs,
        }
    }
}

#[derive(Serialize)]
pub(super) struct StartStreamResponse {
    created: bool,
    #[serde(flatten)]
    stream: StreamView,
}

async fn start_one(state: &AppState, req: StartStreamRequest) -> Result<StartOutcome, ApiError> {
    let config = state.supervisor.config();
    let duration = req.duration.unwrap_or(config.default_duration_secs);
    if !(config.min_duration_secs..=config.max_duration_secs).contains(&duration) {
        return Err(ApiError::InvalidRequest(format!(
            "duration must be between {} and {} seconds",
            config.min_duration_secs, config.max_duration_secs
        )));
    }

    let source_uri = match (req.source_uri, req.device) {
        (Some(uri), None) if !uri.trim().is_empty() => uri,
        (Some(_), None) => return Err(ApiError::InvalidRequest("source_uri is empty".into())),
        (None, Some(device)) => {
            state
                .resolver
                .resolve_source_uri(&device, req.channel, req.sub_stream)?
        }
        (Some(_), Some(_)) => {
            return Err(ApiError::InvalidRequest(
                "give either source_uri or device, not both".into(),
            ))
        }
        (None, None) => {
            return Err(ApiError::InvalidRequest(
                "source_uri or device is required".into(),
            ))
        }
    };

    let outcome = state
        .supervisor
        .start(StartRequest {
            source_uri,
            max_duration_secs: duration,
            id: req.stream_id,
        })
        .await?;
    Ok(outcome)
}

pub(super) async fn stream_start(
    State(state): State<AppState>,
    Json(req): Json<StartStreamRequest>,
) -> Result<(StatusCode, Json<StartStreamResponse>), ApiError> {
    let outcome = start_one(&state, req).await?;
    let created = outcome.is_created();
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(StartStreamResponse {
            created,
            stream: outcome.into_descriptor().into(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub(super) struct StopStreamRequest {
    stream_id: String,
}

#[derive(Serialize)]
pub(super) struct StopStreamResponse {
    stream_id: String,
    status: &'static str,
}

pub(super) async fn stream_stop(
    State(state): State<AppState>,
    Json(req): Json<StopStreamRequest>,
) -> Result<Json<StopStreamResponse>, ApiError> {
    if !state.supervisor.stop(&req.stream_id).await.is_found() {
        return Err(ApiError::StreamNotFound(req.stream_id));
    }
    Ok(Json(StopStreamResponse {
        stream_id: req.stream_id,
        status: "stopped",
    }))
}

#[derive(Serialize)]
pub(super) struct ActiveStreamsResponse {
    total_streams: usize,
    streams: Vec<StreamView>,
}

pub(super) async fn streams_active(State(state): State<AppState>) -> Json<ActiveStreamsResponse> {
    let streams: Vec<StreamView> = state
        .supervisor
        .list()
        .into_iter()
        .map(StreamView::from)
        .collect();
    Json(ActiveStreamsResponse {
        total_streams: streams.len(),
        streams,
    })
}

pub(super) async fn stream_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StreamView>, ApiError> {
    state
        .supervisor
        .get(&id)
        .map(|d| Json(d.into()))
        .ok_or(ApiError::StreamNotFound(id))
}

#[derive(Serialize)]
pub(super) struct StatsResponse {
    active_streams: usize,
    total_segment_files: usize,
    hls_root: std::path::PathBuf,
    streams: Vec<StreamView>,
}

impl From<StatsSnapshot> for StatsResponse {
    fn from(s: StatsSnapshot) -> Self {
        StatsResponse {
            active_streams: s.active_count,
            total_segment_files: s.total_segment_files,
            hls_root: s.hls_root,
            streams: s.streams.into_iter().map(StreamView::from).collect(),
        }
    }
}

pub(super) async fn stats_overview(
    State(state): State<AppState>,
) -> Result<Json<StatsResponse>, ApiError> {
    let snapshot = state.supervisor.stats().await?;
    Ok(Json(snapshot.into()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum ItemStatus {
    Success,
    Error,
}

#[derive(Serialize)]
pub(super) struct BulkItem {
    status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    playlist_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Serialize)]
pub(super) struct BulkResponse {
    total_requests: usize,
    successful: usize,
    failed: usize,
    results: Vec<BulkItem>,
}

impl BulkResponse {
    fn from_items(results: Vec<BulkItem>) -> Self {
        let successful = results
            .iter()
            .filter(|r| matches!(r.status, ItemStatus::Success))
            .count();
        BulkResponse {
            total_requests: results.len(),
            successful,
            failed: results.len() - successful,
            results,
        }
    }
}

pub(super) async fn bulk_start(
    State(state): State<AppState>,
    Json(requests): Json<Vec<StartStreamRequest>>,
) -> Json<BulkResponse> {
    let results = futures::future::join_all(requests.into_iter().map(|req| {
        let state = &state;
        async move {
            let requested_id = req.stream_id.clone();
            match start_one(state, req).await {
                Ok(outcome) => {
                    let d = outcome.into_descriptor();
                    BulkItem {
                        status: ItemStatus::Success,
                        stream_id: Some(d.id),
                        playlist_url: Some(d.playlist_url),
                        message: None,
                    }
                }
                Err(e) => BulkItem {
                    status: ItemStatus::Error,
                    stream_id: requested_id,
                    playlist_url: None,
                    message: Some(e.message()),
                },
            }
        }
    }))
    .await;
    Json(BulkResponse::from_items(results))
}

pub(super) async fn bulk_stop(
    State(state): State<AppState>,
    Json(stream_ids): Json<Vec<String>>,
) -> Json<BulkResponse> {
    let results = futures::future::join_all(stream_ids.into_iter().map(|id| {
        let state = &state;
        async move {
            let found = state.supervisor.stop(&id).await.is_found();
            BulkItem {
                status: if found {
                    ItemStatus::Success
                } else {
                    ItemStatus::Error
                },
                message: (!found).then(|| ApiError::StreamNotFound(id.clone()).message()),
                stream_id: Some(id),
                playlist_url: None,
            }
        }
    }))
    .await;
    Json(BulkResponse::from_items(results))
}
