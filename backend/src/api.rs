use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderValue, Method},
    routing::get,
};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    config::normalize_origin,
    downloader::{DownloadResult, Downloader},
    error::ApiError,
};

const HEALTH_MESSAGE: &str = "Telegram Music Bot API";

#[derive(Clone)]
pub struct AppState {
    downloader: Arc<Downloader>,
    download_semaphore: Arc<Semaphore>,
}

impl AppState {
    pub fn new(downloader: Downloader, max_concurrent_downloads: usize) -> Self {
        Self {
            downloader: Arc::new(downloader),
            download_semaphore: Arc::new(Semaphore::new(max_concurrent_downloads)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookRequest {
    url: Option<String>,
    search_query: Option<String>,
}

pub fn router(state: AppState, allowed_origins: Option<HashSet<String>>) -> Router {
    let app = Router::new()
        .route("/", get(health).post(webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    match allowed_origins {
        Some(origins) => app.layer(build_cors_layer(origins)),
        None => app,
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "message": HEALTH_MESSAGE}))
}

async fn webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DownloadResult>, ApiError> {
    let payload: WebhookRequest =
        serde_json::from_slice(&body).map_err(|error| ApiError::internal(error.to_string()))?;

    let _download_permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("No se pudo reservar capacidad de descarga."))?;

    info!(
        "Webhook recibido url={:?} search_query={:?}",
        payload.url, payload.search_query
    );

    let result = state
        .downloader
        .download(payload.url.as_deref(), payload.search_query.as_deref())
        .await;

    Ok(Json(result))
}

fn build_cors_layer(origins: HashSet<String>) -> CorsLayer {
    info!("CORS habilitado para {:?}", origins);

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        origin
            .to_str()
            .ok()
            .and_then(normalize_origin)
            .is_some_and(|value| origins.contains(&value))
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}
