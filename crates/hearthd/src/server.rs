//! Local HTTP/WebSocket server.
//!
//! The surface local device and UI clients talk to:
//! - `GET|POST|PUT|DELETE /api/{tail}` proxied to the resource layer
//!   (remote API when online, cache otherwise),
//! - `GET /status/` health check with a fixed JSON body,
//! - `GET /ws/controllers` and `GET /ws/clients` WebSocket endpoints --
//!   every received frame is routed through the controller and broadcast
//!   to all connected local clients, sender included.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use hearth_core::{Controller, CoreError};

/// Build the local router. The admin UI is served from another origin,
/// so CORS is wide open.
pub fn router(controller: Controller) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route(
            "/api/{*tail}",
            get(api_handler)
                .post(api_handler)
                .put(api_handler)
                .delete(api_handler),
        )
        .route("/status/", get(status_handler))
        .route("/ws/controllers", get(ws_handler))
        .route("/ws/clients", get(ws_handler))
        .layer(cors)
        .with_state(controller)
}

// ── HTTP handlers ────────────────────────────────────────────────────

async fn status_handler() -> impl IntoResponse {
    Json(json!({"status": "ok", "message": "Controller is up and running"}))
}

async fn api_handler(
    State(controller): State<Controller>,
    method: Method,
    Path(tail): Path<String>,
    body: Bytes,
) -> Response {
    let data: Option<Value> = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {e}"));
            }
        }
    };

    let path = format!("/api/{tail}");
    match controller
        .resources()
        .handle_request(method.as_str(), &path, data)
        .await
    {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            let status = match &e {
                CoreError::UnsupportedMethod { .. } => StatusCode::METHOD_NOT_ALLOWED,
                CoreError::InvalidPath { .. }
                | CoreError::MissingBody { .. }
                | CoreError::MissingResourceId { .. } => StatusCode::BAD_REQUEST,
                CoreError::DeviceNotFound { .. } => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, &e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

// ── WebSocket handlers ───────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(controller): State<Controller>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, controller))
}

/// One connected local client: forward controller broadcasts out, feed
/// received frames into the controller's routing (which broadcasts them
/// back to every local client, this one included).
async fn handle_socket(socket: WebSocket, controller: Controller) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut rx = controller.subscribe_local();

    info!("local WebSocket client connected");

    let forward_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    if ws_sender.send(Message::Text(message.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "local client lagging, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                controller.handle_local_message(text.to_string()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Binary, Ping, Pong -- ignore
            }
            Err(e) => {
                warn!(error = %e, "local WebSocket receive error");
                break;
            }
        }
    }

    forward_task.abort();
    info!("local WebSocket client disconnected");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use hearth_core::BridgeConfig;

    async fn serve() -> (String, Controller) {
        let controller = Controller::new(BridgeConfig::default()).unwrap();
        let app = router(controller.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), controller)
    }

    #[tokio::test]
    async fn status_endpoint_returns_fixed_body() {
        let (base, _controller) = serve().await;

        let body: Value = reqwest::get(format!("{base}/status/"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn api_get_serves_cached_resources_offline() {
        let (base, controller) = serve().await;
        controller
            .resources()
            .cache()
            .add("devices", json!({"uuid": "d1", "name": "Desk plug"}));

        let body: Value = reqwest::get(format!("{base}/api/devices/d1"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["name"], "Desk plug");
    }

    #[tokio::test]
    async fn api_rejects_unsupported_methods() {
        let (base, _controller) = serve().await;

        let status = reqwest::Client::new()
            .patch(format!("{base}/api/devices/d1"))
            .send()
            .await
            .unwrap()
            .status();

        assert_eq!(status, reqwest::StatusCode::METHOD_NOT_ALLOWED);
    }
}
