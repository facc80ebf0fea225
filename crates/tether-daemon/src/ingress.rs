//! Webhook ingress: turns HTTP posts into bus messages

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tether_core::{BusMessage, MessageBus};

/// Body of `POST /api/v1/webhook`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookRequest {
    pub iot_thing_name: String,
    pub mqtt_topic_name: String,
    #[serde(default)]
    pub mqtt_event_payload: serde_json::Value,
}

#[derive(Clone)]
struct IngressState {
    bus: Arc<dyn MessageBus>,
}

pub fn router(bus: Arc<dyn MessageBus>) -> Router {
    Router::new()
        .route("/api/v1/webhook", post(webhook_handler))
        .route("/healthz", get(health_handler))
        .with_state(IngressState { bus })
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn webhook_handler(State(state): State<IngressState>, Json(request): Json<WebhookRequest>) -> Response {
    if request.mqtt_topic_name.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing field: mqtt_topic_name").into_response();
    }
    if request.iot_thing_name.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing field: iot_thing_name").into_response();
    }

    let data = match serde_json::to_vec(&request.mqtt_event_payload) {
        Ok(data) => data,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let message = BusMessage::new(request.mqtt_topic_name.clone(), data)
        .with_thing_name(request.iot_thing_name);

    if let Err(e) = state.bus.publish(message) {
        tracing::warn!("Failed to publish webhook to {}: {}", request.mqtt_topic_name, e);
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to publish: {}", e)).into_response();
    }

    tracing::debug!("Webhook published to {}", request.mqtt_topic_name);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "queued", "topic": request.mqtt_topic_name })),
    )
        .into_response()
}

/// Bind `addr` and serve until `shutdown` is cancelled
pub async fn serve(addr: SocketAddr, bus: Arc<dyn MessageBus>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind ingress on {}", addr))?;
    tracing::info!("Webhook ingress listening on {}", listener.local_addr()?);

    axum::serve(listener, router(bus))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Ingress server failed")?;
    Ok(())
}
