//! # Wildlife Camera Lifecycle Server
//!
//! The public-facing gateway around the track lifecycle core. It adapts the
//! wire to the `lib_tracking` engine and contains no lifecycle logic itself.
//!
//! ## Core Responsibilities:
//! - **Detection Ingestion:** `POST /api/detections` accepts one frame's
//!   detections (plus an optional base64 JPEG of the frame) from the external
//!   detector/tracker and runs one reconciliation pass.
//! - **Event Fan-out:** `/ws` clients are registered as broadcast-hub
//!   subscribers and receive every `track_new` / `track_removed` /
//!   `track_updated` event as JSON text frames.
//! - **Mode Control:** `GET`/`POST /api/mode` reads and switches the
//!   identification backend (local Ollama vs. cloud OpenRouter).
//! - **Introspection:** `GET /api/tracks`, `GET /api/stats`, `/health`.
//! - **Lifecycle:** fern logging, layered configuration and graceful
//!   shutdown on `CTRL+C`.

mod wildlife_logic;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use futures_util::StreamExt;
use image::RgbImage;
use serde::Deserialize;
use serde_json::json;

use lib_tracking::backends::{OllamaBackend, OpenRouterBackend};
use lib_tracking::{
    BroadcastHub, Detection, EnrichmentGateway, ManagerOptions, MemoryStore, TrackingManager,
    VlmMode,
};

use wildlife_logic::config::{load_config, Config};
use wildlife_logic::logger::setup_logging;

/// Shared state for all routes. The manager hands out the hub and gateway.
#[derive(Clone)]
struct AppState {
    manager: TrackingManager,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();

    let log_dir = config
        .log_dir
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    setup_logging(&log_dir, &log_level)?;

    let manager = build_manager(&config).await;
    let app_state = AppState { manager };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/api/detections", post(detections_handler))
        .route("/api/tracks", get(tracks_handler))
        .route("/api/mode", get(get_mode_handler).post(set_mode_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port.unwrap_or(8000)));
    log::info!("Wildlife lifecycle server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Wildlife lifecycle server shutting down.");
        })
        .await?;

    Ok(())
}

/// Wire the store, both identification backends, the gateway, the hub and
/// the lifecycle manager together from the merged configuration.
async fn build_manager(config: &Config) -> TrackingManager {
    let local = Arc::new(OllamaBackend::new(
        config
            .ollama_url
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
        config
            .ollama_model
            .clone()
            .unwrap_or_else(|| "llava:13b".to_string()),
    ));
    let cloud = Arc::new(OpenRouterBackend::new(
        config
            .openrouter_url
            .clone()
            .unwrap_or_else(|| "https://openrouter.ai/api/v1/chat/completions".to_string()),
        config
            .openrouter_model
            .clone()
            .unwrap_or_else(|| "google/gemini-2.0-flash-001".to_string()),
        config.openrouter_api_key.clone().unwrap_or_default(),
    ));

    let initial_mode = match config.vlm_mode.as_deref() {
        Some(value) => value.parse::<VlmMode>().unwrap_or_else(|()| {
            log::warn!("Invalid vlm_mode '{}' in config, defaulting to cloud", value);
            VlmMode::Cloud
        }),
        None => VlmMode::Cloud,
    };
    let gateway = Arc::new(EnrichmentGateway::new(local, cloud, initial_mode));

    let options = ManagerOptions {
        grace_period: Duration::from_secs(config.grace_period_seconds.unwrap_or(10)),
        enrichment_enabled: config.enable_enrichment.unwrap_or(true),
        enrichment_timeout: Duration::from_secs(config.enrichment_timeout_seconds.unwrap_or(30)),
        history_limit: config.history_limit.unwrap_or(2),
        jpeg_quality: config.jpeg_quality.unwrap_or(85),
    };

    TrackingManager::new(
        Arc::new(MemoryStore::new()),
        gateway,
        Arc::new(BroadcastHub::new()),
        options,
    )
    .await
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (subscriber_id, mut events) = state.manager.hub().register();

    loop {
        tokio::select! {
            // Clients only listen; any inbound traffic except Close is ignored.
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(event.as_ref()) {
                    Ok(payload) => {
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break; // client disconnected
                        }
                    }
                    Err(e) => log::error!("Failed to serialize event: {}", e),
                }
            }
        }
    }

    state.manager.hub().unregister(subscriber_id);
}

#[derive(Debug, Deserialize)]
struct DetectionsRequest {
    /// Base64-encoded JPEG of the full frame, if the caller wants
    /// thumbnails captured.
    frame: Option<String>,
    #[serde(default)]
    detections: Vec<Detection>,
}

async fn detections_handler(
    State(state): State<AppState>,
    Json(request): Json<DetectionsRequest>,
) -> impl IntoResponse {
    let frame = request.frame.as_deref().and_then(decode_frame);
    state
        .manager
        .process_detections(frame.as_ref(), &request.detections, Utc::now())
        .await;

    Json(json!({ "status": "ok", "detections": request.detections.len() }))
}

/// An undecodable frame is dropped (detections are still reconciled, their
/// tracks just get no thumbnail).
fn decode_frame(encoded: &str) -> Option<RgbImage> {
    let bytes = match general_purpose::STANDARD.decode(encoded) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Ignoring frame with invalid base64: {}", e);
            return None;
        }
    };
    match image::load_from_memory(&bytes) {
        Ok(img) => Some(img.to_rgb8()),
        Err(e) => {
            log::warn!("Ignoring undecodable frame: {}", e);
            None
        }
    }
}

async fn tracks_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.active_tracks().await {
        Ok(tracks) => (StatusCode::OK, Json(json!(tracks))),
        Err(e) => {
            log::error!("Failed to read active tracks: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "store unavailable" })),
            )
        }
    }
}

async fn get_mode_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "mode": state.manager.gateway().mode() }))
}

#[derive(Debug, Deserialize)]
struct ModeRequest {
    mode: String,
}

async fn set_mode_handler(
    State(state): State<AppState>,
    Json(request): Json<ModeRequest>,
) -> impl IntoResponse {
    if state.manager.gateway().set_mode(&request.mode) {
        (
            StatusCode::OK,
            Json(json!({ "mode": state.manager.gateway().mode() })),
        )
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("invalid mode: {}", request.mode) })),
        )
    }
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.get_stats().await)
}
