//! `/notifications/*` — the queue-backed delivery surface. Every route here
//! goes through the dispatcher; `/notifications/realtime` is the one
//! exception (see [`send_realtime`]).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Json, Router};
use axum::routing::{delete, get, post};
use serde::{Deserialize, Serialize};

use notifyhub::dispatcher::NotificationFilters;
use notifyhub::prelude::*;

use crate::error::NotifyError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/notifications/send", post(send))
        .route("/notifications/batch", post(send_batch))
        .route("/notifications/realtime", post(send_realtime))
        .route("/notifications/stats/{kind}", get(stats))
        .route("/notifications/{id}/status", get(status))
        .route("/notifications/{id}", delete(cancel))
        .route("/notifications", get(list))
}

const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Serialize)]
struct EnqueuedResponse {
    notification_id: String,
}

async fn send(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NotificationRequest>,
) -> Result<(StatusCode, Json<EnqueuedResponse>), NotifyError> {
    let id = state.dispatcher.enqueue(request).await?;
    Ok((StatusCode::CREATED, Json(EnqueuedResponse { notification_id: id })))
}

#[derive(Debug, Serialize)]
#[serde(tag = "result")]
enum BatchItemResult {
    #[serde(rename = "ok")]
    Ok { notification_id: String },
    #[serde(rename = "error")]
    Error { error: String },
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    results: Vec<BatchItemResult>,
}

async fn send_batch(
    State(state): State<Arc<AppState>>,
    Json(requests): Json<Vec<NotificationRequest>>,
) -> Result<Json<BatchResponse>, NotifyError> {
    if requests.len() > MAX_BATCH_SIZE {
        return Err(NotifyError::Validation(format!(
            "batch of {} exceeds the {MAX_BATCH_SIZE} notification limit",
            requests.len()
        )));
    }
    let mut results = Vec::with_capacity(requests.len());
    for request in requests {
        match state.dispatcher.enqueue(request).await {
            Ok(id) => results.push(BatchItemResult::Ok { notification_id: id }),
            Err(e) => results.push(BatchItemResult::Error { error: e.to_string() }),
        }
    }
    Ok(Json(BatchResponse { results }))
}

#[derive(Debug, Serialize)]
struct NotificationStatusResponse {
    #[serde(flatten)]
    notification: Notification,
    confirmations: Vec<DeliveryConfirmation>,
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<NotificationStatusResponse>, NotifyError> {
    let notification =
        state.dispatcher.get(&id).ok_or_else(|| NotifyError::NotFound(format!("unknown notification: {id}")))?;
    let confirmations = state.confirmations.get_for_notification(&id);
    Ok(Json(NotificationStatusResponse { notification, confirmations }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(rename = "organizationId")]
    organization_id: Option<String>,
    status: Option<NotificationStatus>,
    channel: Option<Channel>,
    from: Option<u64>,
    to: Option<u64>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    50
}

async fn list(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> Json<Vec<Notification>> {
    let filters = NotificationFilters {
        tenant_id: query.organization_id,
        status: query.status,
        channel: query.channel,
        from_ms: query.from,
        to_ms: query.to,
    };
    Json(state.dispatcher.list(&filters, query.limit, query.offset))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, NotifyError> {
    if state.dispatcher.get(&id).is_none() {
        return Err(NotifyError::NotFound(format!("unknown notification: {id}")));
    }
    let cancelled = state.dispatcher.cancel(&id).await;
    Ok(Json(CancelResponse { cancelled }))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(rename = "organizationId")]
    organization_id: Option<String>,
    from: Option<u64>,
    to: Option<u64>,
}

async fn stats(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, NotifyError> {
    match kind.as_str() {
        "queue" => Ok(Json(serde_json::to_value(state.dispatcher.stats()).unwrap_or_default())),
        "delivery" => {
            let organization_id = query
                .organization_id
                .ok_or_else(|| NotifyError::Validation("organizationId is required for delivery stats".to_string()))?;
            let now = notifyhub::model::now_ms();
            let from = query.from.unwrap_or_else(|| now.saturating_sub(24 * 60 * 60 * 1000));
            let to = query.to.unwrap_or(now);
            let analytics = state.confirmations.analytics(&organization_id, from, to);
            Ok(Json(serde_json::to_value(analytics).unwrap_or_default()))
        }
        other => Err(NotifyError::Validation(format!("unknown stats kind: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
struct RealtimeSendRequest {
    #[serde(rename = "organizationId")]
    organization_id: String,
    #[serde(rename = "siteId", default)]
    site_id: Option<String>,
    #[serde(rename = "userIds", default)]
    user_ids: Vec<String>,
    message: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct RealtimeSendResponse {
    sent_count: usize,
}

/// Bypasses the dispatcher entirely: builds an ad-hoc frame and hands it
/// straight to the Real-Time Fabric. No retry, no confirmation record — the
/// caller owns delivery semantics for this path.
async fn send_realtime(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RealtimeSendRequest>,
) -> Result<Json<RealtimeSendResponse>, NotifyError> {
    let frame = serde_json::json!({
        "type": "notification",
        "data": request.message,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let payload: Arc<str> = Arc::from(frame.to_string());
    let (_matched, sent) =
        state.realtime.send_targeted(&request.organization_id, request.site_id.as_deref(), &request.user_ids, payload);
    Ok(Json(RealtimeSendResponse { sent_count: sent }))
}
