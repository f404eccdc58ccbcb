use crate::{
    catalog::Product,
    engine::{EngineStatus, FillReport, MatchEngine, MatchError, MatchOutcome},
    engine::model::ModelStatus,
};
use axum::{
    extract::{DefaultBodyLimit, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{fmt::Debug, sync::Arc};
use tokio::signal;

#[derive(Clone)]
pub struct SharedState {
    engine: Arc<MatchEngine>,
    catalog: Arc<Vec<Product>>,
}

impl SharedState {
    pub fn new(engine: Arc<MatchEngine>, catalog: Vec<Product>) -> Self {
        Self {
            engine,
            catalog: Arc::new(catalog),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down");
}

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/match", post(match_image))
        .route("/api/status", get(status))
        .route("/api/precompute", post(precompute))
        .route("/api/cache/clear", post(clear_cache))
        .route("/api/model/reload", post(reload_model))
        .layer(DefaultBodyLimit::max(20 * 1024 * 1024))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

pub async fn serve(state: SharedState, listen: &str) -> anyhow::Result<()> {
    let state = Arc::new(state);

    // warm up in the background; requests arriving meanwhile join the same load
    let engine = state.engine.clone();
    let catalog = state.catalog.clone();
    tokio::spawn(async move {
        match engine.precompute(&catalog).await {
            Ok(report) => log::info!(
                "catalog ready: {} vectors, {} failures",
                report.skipped + report.succeeded,
                report.failed.len()
            ),
            Err(err) => log::error!("model unavailable, serving in degraded mode: {err}"),
        }
    });

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[derive(Debug)]
pub enum HttpError {
    Match(MatchError),
    BadRequest(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            HttpError::BadRequest(message) => (axum::http::StatusCode::BAD_REQUEST, message),
            HttpError::Match(err) => {
                let status = if err.is_input_error() {
                    axum::http::StatusCode::BAD_REQUEST
                } else if err.is_initialization() {
                    log::error!("{err:?}");
                    axum::http::StatusCode::SERVICE_UNAVAILABLE
                } else if matches!(err, MatchError::ImageInaccessible(_)) {
                    axum::http::StatusCode::BAD_GATEWAY
                } else {
                    log::error!("{err:?}");
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, err.to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<MatchError> for HttpError {
    fn from(err: MatchError) -> Self {
        HttpError::Match(err)
    }
}

#[derive(Deserialize, Serialize)]
pub struct MatchRequest {
    /// http(s) URL or data URI
    pub image: String,

    /// Minimum similarity; configured policy applies when absent.
    pub threshold: Option<f32>,

    /// Return at most this many results
    pub limit: Option<usize>,
}

impl Debug for MatchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let image = if self.image.starts_with("data:") {
            "[REDACTED]"
        } else {
            self.image.as_str()
        };
        write!(
            f,
            "MatchRequest {{ image: {image:?}, threshold: {:?}, limit: {:?} }}",
            self.threshold, self.limit
        )
    }
}

async fn match_image(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<MatchRequest>,
) -> Result<Json<MatchOutcome>, HttpError> {
    log::debug!("payload: {payload:?}");

    if let Some(threshold) = payload.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(HttpError::BadRequest(format!(
                "threshold must be between 0.0 and 1.0, got {threshold}"
            )));
        }
    }

    let mut outcome = state
        .engine
        .match_image(&payload.image, &state.catalog, payload.threshold)
        .await?;

    if let Some(limit) = payload.limit {
        outcome.results.truncate(limit);
    }

    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub engine: EngineStatus,
    pub catalog_size: usize,
}

async fn status(State(state): State<Arc<SharedState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        engine: state.engine.status(),
        catalog_size: state.catalog.len(),
    })
}

async fn precompute(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<FillReport>, HttpError> {
    let report = state.engine.precompute(&state.catalog).await?;
    Ok(Json(report))
}

async fn clear_cache(State(state): State<Arc<SharedState>>) -> Json<EngineStatus> {
    state.engine.clear_caches();
    Json(state.engine.status())
}

async fn reload_model(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<ModelStatus>, HttpError> {
    let status = state.engine.reload().await?;
    Ok(Json(status))
}
