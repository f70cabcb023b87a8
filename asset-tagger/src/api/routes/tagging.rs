//! Tagging admin routes, mounted at `/api/admin/tagging`.

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    AutoProcessingBody, ConcurrencyRequest, FileIdsRequest, LogsQuery, PauseStateResponse,
    ResetStuckRequest, RetryFailedRequest, TaggingLogPageResponse, TriggerRequest,
};
use crate::api::server::AppState;
use crate::tagging::admin::{
    ConcurrencyResult, IgnoreResult, ResetStuckResult, RetryFailedResult, RetryResult,
    TriggerScanResult, UnignoreResult,
};
use crate::tagging::{ADMIN_TOPIC, BroadcastEnvelope, BroadcastMessage, QueueStats, TaggingAdmin};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/trigger", post(trigger))
        .route("/retry-failed", post(retry_failed))
        .route("/retry", post(retry))
        .route("/ignore", post(ignore))
        .route("/unignore", post(unignore))
        .route("/reset-stuck", post(reset_stuck))
        .route("/concurrency", post(set_concurrency))
        .route("/auto-processing", post(set_auto_processing))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stats", get(stats))
        .route("/logs", get(logs))
        .route("/ws", get(feed_ws))
}

fn admin(state: &AppState) -> ApiResult<&TaggingAdmin> {
    state
        .admin
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Tagging service is not available"))
}

async fn trigger(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> ApiResult<Json<TriggerScanResult>> {
    req.validate()?;
    Ok(Json(admin(&state)?.trigger_scan(req.max_files, None).await?))
}

async fn retry_failed(
    State(state): State<AppState>,
    body: Option<Json<RetryFailedRequest>>,
) -> ApiResult<Json<RetryFailedResult>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    req.validate()?;
    Ok(Json(admin(&state)?.retry_failed_all(req.limit, None).await?))
}

async fn retry(
    State(state): State<AppState>,
    Json(req): Json<FileIdsRequest>,
) -> ApiResult<Json<RetryResult>> {
    req.validate()?;
    Ok(Json(
        admin(&state)?.retry(&req.file_ids, req.reason, None).await?,
    ))
}

async fn ignore(
    State(state): State<AppState>,
    Json(req): Json<FileIdsRequest>,
) -> ApiResult<Json<IgnoreResult>> {
    req.validate()?;
    Ok(Json(
        admin(&state)?.ignore(&req.file_ids, req.reason, None).await?,
    ))
}

async fn unignore(
    State(state): State<AppState>,
    Json(req): Json<FileIdsRequest>,
) -> ApiResult<Json<UnignoreResult>> {
    req.validate()?;
    Ok(Json(admin(&state)?.unignore(&req.file_ids, None).await?))
}

async fn reset_stuck(
    State(state): State<AppState>,
    Json(req): Json<ResetStuckRequest>,
) -> ApiResult<Json<ResetStuckResult>> {
    req.validate()?;
    Ok(Json(
        admin(&state)?
            .reset_stuck(req.time_threshold_minutes, None)
            .await?,
    ))
}

async fn set_concurrency(
    State(state): State<AppState>,
    Json(req): Json<ConcurrencyRequest>,
) -> ApiResult<Json<ConcurrencyResult>> {
    req.validate()?;
    Ok(Json(admin(&state)?.set_concurrency(req.concurrency).await?))
}

async fn set_auto_processing(
    State(state): State<AppState>,
    Json(req): Json<AutoProcessingBody>,
) -> ApiResult<Json<AutoProcessingBody>> {
    let enabled = admin(&state)?.set_auto_processing(req.enabled).await?;
    Ok(Json(AutoProcessingBody { enabled }))
}

async fn pause(State(state): State<AppState>) -> ApiResult<Json<PauseStateResponse>> {
    let service = admin(&state)?.service();
    service.pause();
    Ok(Json(PauseStateResponse {
        paused: service.is_paused(),
    }))
}

async fn resume(State(state): State<AppState>) -> ApiResult<Json<PauseStateResponse>> {
    let service = admin(&state)?.service();
    service.resume();
    Ok(Json(PauseStateResponse {
        paused: service.is_paused(),
    }))
}

async fn stats(State(state): State<AppState>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(admin(&state)?.service().queue_stats().await?))
}

async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<TaggingLogPageResponse>> {
    query.validate()?;
    let page = admin(&state)?
        .list_logs(query.file_id.as_deref(), query.limit, query.offset)
        .await?;
    Ok(Json(page.into()))
}

/// Websocket feed of broadcaster messages as JSON text frames.
async fn feed_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let broadcaster = state
        .broadcaster
        .clone()
        .ok_or_else(|| ApiError::service_unavailable("Broadcaster is not available"))?;
    let initial = match &state.admin {
        Some(admin) => admin.service().queue_stats().await.ok(),
        None => None,
    };
    let rx = broadcaster.subscribe();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, rx, initial)))
}

async fn handle_socket(
    socket: WebSocket,
    mut rx: broadcast::Receiver<BroadcastEnvelope>,
    initial: Option<QueueStats>,
) {
    let (mut sender, mut receiver) = socket.split();

    if let Some(stats) = initial {
        let snapshot = BroadcastEnvelope {
            topic: ADMIN_TOPIC.to_string(),
            message: BroadcastMessage::QueueStats(stats),
        };
        if let Ok(text) = serde_json::to_string(&snapshot)
            && sender.send(Message::Text(text.into())).await.is_err()
        {
            debug!("Failed to send initial snapshot, client disconnected");
            return;
        }
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            event = rx.recv() => {
                match event {
                    Ok(envelope) => {
                        let text = match serde_json::to_string(&envelope) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode broadcast message: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Broadcast receiver lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat.tick() => {
                if awaiting_pong {
                    debug!("Client failed to respond to Ping, closing connection");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }
}
