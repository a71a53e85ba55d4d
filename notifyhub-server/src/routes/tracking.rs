//! `/track/*` — pixel and click tracking endpoints served from the URLs
//! [`ConfirmationStore::tracking_pixel_url`]/[`click_tracking_url`] hand out.
//! Both routes record a confirmation, then respond the way the embedding
//! medium expects: a pixel with image bytes, a click with a redirect.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use notifyhub::model::Channel;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/track/pixel/{notification_id}/{channel}", get(pixel))
        .route("/track/click/{notification_id}/{channel}", get(click))
}

fn parse_channel(s: &str) -> Option<Channel> {
    match s {
        "web" => Some(Channel::Web),
        "email" => Some(Channel::Email),
        "push" => Some(Channel::Push),
        _ => None,
    }
}

/// 1x1 transparent GIF, served regardless of whether the record call
/// succeeds — a tracking pixel must never break the rendering client.
const TRANSPARENT_PIXEL: &[u8] =
    &[0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B];

async fn pixel(
    State(state): State<Arc<AppState>>,
    Path((notification_id, channel)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(channel) = parse_channel(&channel) else {
        return (StatusCode::BAD_REQUEST, "unknown channel").into_response();
    };
    if let Some(notification) = state.dispatcher.get(&notification_id) {
        let user_agent =
            headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()).map(str::to_string);
        let _ = state.confirmations.record_read(&notification_id, &notification.tenant_id, channel, user_agent);
    }
    ([(header::CONTENT_TYPE, "image/gif")], TRANSPARENT_PIXEL).into_response()
}

#[derive(Debug, Deserialize)]
struct ClickQuery {
    to: String,
}

async fn click(
    State(state): State<Arc<AppState>>,
    Path((notification_id, channel)): Path<(String, String)>,
    Query(query): Query<ClickQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(channel) = parse_channel(&channel) else {
        return (StatusCode::BAD_REQUEST, "unknown channel").into_response();
    };
    if let Some(notification) = state.dispatcher.get(&notification_id) {
        let user_agent =
            headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()).map(str::to_string);
        let _ = state.confirmations.record_clicked(
            &notification_id,
            &notification.tenant_id,
            channel,
            user_agent,
            Some(query.to.clone()),
        );
    }
    Redirect::temporary(&query.to).into_response()
}
