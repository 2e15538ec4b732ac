pub mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Host, Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::errors::{AppError, Result};
use crate::lifecycle::Shutdown;
use crate::registry::FileRegistry;
use crate::utils::safe_json_parse;
use pipeline::{Pipeline, ProcessRequest};

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<Pipeline>,
    pub registry: FileRegistry,
    pub shutdown: Shutdown,
}

impl ApiState {
    pub fn new(cache_dir: PathBuf, registry: FileRegistry, shutdown: Shutdown) -> Result<Self> {
        let pipeline = Pipeline::new(registry.clone(), cache_dir)?;
        Ok(Self {
            pipeline: Arc::new(pipeline),
            registry,
            shutdown,
        })
    }
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    success: bool,
    download_url: String,
    file_id: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/process-music", post(process_music))
        .route("/download/:file_id", get(download_artifact))
        .route("/status", get(status))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

/// Binds the router to the listener and serves until the shutdown drain
/// window has elapsed.
pub async fn serve(listener: tokio::net::TcpListener, state: ApiState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

/// The API layer is the single place failures map to HTTP status codes.
fn error_status(error: &AppError) -> StatusCode {
    match error {
        AppError::InvalidInput(_) | AppError::Json(_) => StatusCode::BAD_REQUEST,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: AppError) -> Response {
    let status = error_status(&error);
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn shutting_down_response() -> Response {
    error_response(AppError::Unavailable("server is shutting down".to_string()))
}

async fn process_music(
    State(state): State<ApiState>,
    Host(host): Host,
    body: Bytes,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return shutting_down_response();
    }

    let request: ProcessRequest = match safe_json_parse(&body) {
        Ok(request) => request,
        Err(e) => {
            log::error!("rejecting unparseable request body: {e}");
            return error_response(AppError::InvalidInput(
                "invalid JSON request body".to_string(),
            ));
        }
    };
    log::info!(
        "processing request: {}",
        request.title.as_deref().unwrap_or("<missing title>")
    );

    match state.pipeline.process(request).await {
        Ok(outcome) => {
            let download_url = format!("http://{host}/download/{}", outcome.file_id);
            Json(ProcessResponse {
                success: true,
                download_url,
                file_id: outcome.file_id,
                message: "file processed successfully".to_string(),
            })
            .into_response()
        }
        Err(e) => {
            log::error!("processing failed: {e}");
            error_response(e)
        }
    }
}

async fn download_artifact(
    State(state): State<ApiState>,
    UrlPath(file_id): UrlPath<String>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return shutting_down_response();
    }

    let Some(artifact) = state.registry.resolve(&file_id).await else {
        return error_response(AppError::NotFound(
            "file does not exist or has expired".to_string(),
        ));
    };

    let file = match tokio::fs::File::open(&artifact.path).await {
        Ok(file) => file,
        Err(e) => {
            log::error!("registered artifact missing on disk ({:?}): {e}", artifact.path);
            return error_response(AppError::NotFound("file not found".to_string()));
        }
    };

    let body = Body::from_stream(ReaderStream::new(file));
    let disposition = format!("attachment; filename=\"processed_{}\"", artifact.filename);
    match Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(body)
    {
        Ok(response) => response,
        Err(e) => error_response(AppError::Download(format!(
            "failed to build download response: {e}"
        ))),
    }
}

async fn status(State(state): State<ApiState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusResponse {
                status: "shutting_down",
                message: None,
            }),
        )
            .into_response();
    }

    Json(StatusResponse {
        status: "success",
        message: Some("server running"),
    })
    .into_response()
}

async fn shutdown(State(state): State<ApiState>) -> Response {
    state.shutdown.begin();
    Json(StatusResponse {
        status: "shutting_down",
        message: Some("server is shutting down"),
    })
    .into_response()
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "status": "running",
        "endpoints": {
            "process_music": "POST /process-music",
            "download": "GET /download/<file_id>",
            "status": "GET /status",
            "shutdown": "POST /shutdown",
        }
    }))
}
