//! WebSocket gateway.
//!
//! One route, `/ws`, upgrades each client into a studio session:
//!
//! - binary frames are microphone PCM (`audio.chunk`),
//! - text frames are JSON [`ClientMessage`]s,
//! - outbound [`ServerMessage`]s flow through a bounded per-session channel
//!   drained by a writer task, which preserves the orchestrator's emission
//!   order on the wire.
//!
//! `/healthz` reports liveness and the live session count.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::session::events::{ClientMessage, ServerMessage};
use crate::session::orchestrator::Orchestrator;

/// Outbound messages buffered per session before backpressure.
const OUTBOUND_CAPACITY: usize = 256;

/// Build the gateway router.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_headers(Any);
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(cors)
        .with_state(orchestrator)
}

/// Bind and serve until the shutdown signal resolves.
pub async fn serve(
    orchestrator: Arc<Orchestrator>,
    bind: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "gateway listening");
    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server error")
}

async fn healthz(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": orchestrator.session_count().await,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(orchestrator): State<Arc<Orchestrator>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_loop(socket, orchestrator))
}

/// Drive one connection: register, pump frames both ways, tear down.
async fn client_loop(socket: WebSocket, orchestrator: Arc<Orchestrator>) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    if let Err(error) = orchestrator.register(&session_id, outbound_tx).await {
        tracing::error!(session_id, %error, "registration failed");
        let ack = serde_json::to_string(&ServerMessage::Ack {
            message: format!("error: {error}"),
        })
        .unwrap_or_default();
        let _ = sink.send(Message::Text(ack)).await;
        let _ = sink.close().await;
        return;
    }

    // Writer task: serialize outbound messages in emission order.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(error) => tracing::error!(%error, "outbound serialization failed"),
            }
        }
        let _ = sink.close().await;
    });

    // Reader loop: binary = audio, text = control JSON.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(pcm)) => {
                orchestrator.handle_audio(&session_id, &pcm).await;
            }
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => orchestrator.handle_message(&session_id, message).await,
                Err(error) => {
                    tracing::warn!(session_id, %error, "unparseable client message dropped");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong handled by axum
            Err(error) => {
                tracing::debug!(session_id, %error, "websocket read error");
                break;
            }
        }
    }

    orchestrator.disconnect(&session_id).await;
    writer.abort();
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::orchestrator::Adapters;
    use tower::ServiceExt;

    fn test_orchestrator() -> Arc<Orchestrator> {
        let mut config = Config::default();
        config.recording.enabled = false;
        Orchestrator::new(Arc::new(config), Adapters::default())
    }

    #[tokio::test]
    async fn healthz_reports_session_count() {
        let app = router(test_orchestrator());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["sessions"], 0);
    }

    #[tokio::test]
    async fn ws_route_rejects_plain_get() {
        let app = router(test_orchestrator());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ws")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        // Missing upgrade headers
        assert_ne!(response.status(), axum::http::StatusCode::OK);
    }
}
