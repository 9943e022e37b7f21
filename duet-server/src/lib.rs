use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use duet_core::{
    app::{AppSpec, FunctionSpec, COMPLETION_MESSAGE},
    image_to_png, ActivityLog, FunctionResult, GenerationParams, GenerationRequest,
    ImageResponse, ModelLike, RequestError,
};
use image::DynamicImage;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Route of the OpenAI-style endpoint returning the image inline.
pub const GENERATIONS_ROUTE: &str = "/v1/images/generations";
pub const HEALTH_ROUTE: &str = "/health";

// Application state containing the preloaded models and the function declaration.
pub struct AppState {
    pub app: AppSpec,
    pub function: FunctionSpec,
    pub model: Arc<dyn ModelLike>,
    /// Where the function persists its image.
    pub output_path: PathBuf,
    pub activity: Option<ActivityLog>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(model: Arc<dyn ModelLike>, function: FunctionSpec, output_path: PathBuf) -> Self {
        Self {
            app: AppSpec::default(),
            function,
            model,
            output_path,
            activity: None,
        }
    }

    pub fn with_activity_log(mut self, activity: ActivityLog) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Logs the final outcome of a call. A missing request stands for a body that could
    /// not be parsed.
    async fn record<T>(
        &self,
        request: Option<&GenerationRequest>,
        outcome: &Result<T, CallError>,
    ) {
        let error = match outcome {
            Ok(_) => None,
            Err(e) => {
                let message = e.message();
                tracing::error!("Error generating image: {message}");
                Some(message)
            }
        };
        let Some(activity) = self.activity.clone() else {
            return;
        };
        let username = request.and_then(|r| r.username.clone());
        let prompt = request.map(|r| r.prompt.clone()).unwrap_or_default();
        let written = tokio::task::spawn_blocking(move || {
            let outcome = error.as_deref().map_or(Ok(()), Err);
            activity.record(username.as_deref(), &prompt, outcome)
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("failed to write activity log: {e}"),
            Err(e) => tracing::warn!("activity log task failed: {e}"),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

/// Why a function call did not produce an image.
#[derive(Debug)]
pub enum CallError {
    BadRequest(RequestError),
    Timeout(Duration),
    Failed(anyhow::Error),
}

impl CallError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::BadRequest(e) => e.to_string(),
            Self::Timeout(timeout) => {
                format!("function timed out after {}s", timeout.as_secs_f64())
            }
            Self::Failed(e) => format!("{e:#}"),
        }
    }
}

impl From<anyhow::Error> for CallError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<RequestError>() {
            Ok(e) => Self::BadRequest(e),
            Err(e) => Self::Failed(e),
        }
    }
}

impl IntoResponse for CallError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            success: false,
            error: self.message(),
        };
        (status, Json(body)).into_response()
    }
}

/// Runs the model on the blocking pool, bounded by the function timeout.
async fn run_model(
    state: &AppState,
    request: &GenerationRequest,
) -> Result<DynamicImage, CallError> {
    GenerationParams::try_from(request).map_err(CallError::BadRequest)?;

    tracing::info!(
        function = %state.function.name,
        prompt = %request.prompt,
        "This code is running on a remote worker!"
    );
    let model = state.model.clone();
    let request = request.clone();
    let task = tokio::task::spawn_blocking(move || model.run(request));
    match tokio::time::timeout(state.function.timeout, task).await {
        Err(_) => Err(CallError::Timeout(state.function.timeout)),
        Ok(Err(join_error)) => Err(CallError::Failed(join_error.into())),
        Ok(Ok(result)) => Ok(result?),
    }
}

fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    Ok(BASE64_STANDARD.encode(image_to_png(img)?))
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Replaces `path` with `bytes`. Readers see either the old or the new file, never a
/// partial one.
async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("output path {} has no file name", path.display()))?;
    let temp = path.with_file_name(format!(
        ".{}.{}-{}.tmp",
        file_name.to_string_lossy(),
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::write(&temp, bytes)
        .await
        .with_context(|| format!("failed to write {}", temp.display()))?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e).with_context(|| format!("failed to replace {}", path.display()));
    }
    Ok(())
}

fn parse_body(
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<GenerationRequest, CallError> {
    payload.map(|Json(request)| request).map_err(|rejection| {
        CallError::BadRequest(RequestError::InvalidBody(rejection.body_text()))
    })
}

/// The remote function: generate, persist the image, report completion.
async fn generate_image_handler(
    State(state): State<SharedState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<FunctionResult>, CallError> {
    let request = match parse_body(payload) {
        Ok(request) => request,
        Err(e) => {
            let outcome = Err(e);
            state.record(None, &outcome).await;
            return outcome;
        }
    };
    let outcome = generate_and_save(&state, &request).await;
    state.record(Some(&request), &outcome).await;
    outcome
}

async fn generate_and_save(
    state: &AppState,
    request: &GenerationRequest,
) -> Result<Json<FunctionResult>, CallError> {
    let image = run_model(state, request).await?;
    write_atomic(&state.output_path, image_to_png(&image)?).await?;
    tracing::info!(path = %state.output_path.display(), "saved generated image");
    Ok(Json(FunctionResult {
        result: COMPLETION_MESSAGE.to_string(),
    }))
}

async fn generations_handler(
    State(state): State<SharedState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<ImageResponse>, CallError> {
    let request = match parse_body(payload) {
        Ok(request) => request,
        Err(e) => {
            let outcome = Err(e);
            state.record(None, &outcome).await;
            return outcome;
        }
    };
    let outcome = generate_encoded(&state, &request).await;
    state.record(Some(&request), &outcome).await;
    outcome
}

async fn generate_encoded(
    state: &AppState,
    request: &GenerationRequest,
) -> Result<Json<ImageResponse>, CallError> {
    let image = run_model(state, request).await?;
    Ok(Json(ImageResponse {
        image: image_to_base64_png(&image)?,
    }))
}

async fn health_handler(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "app": state.app.name,
        "image": state.app.image.to_string(),
        "function": state.function.name,
        "timeout_secs": state.function.timeout.as_secs(),
    }))
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route(&state.function.route(), post(generate_image_handler))
        .route(GENERATIONS_ROUTE, post(generations_handler))
        .route(HEALTH_ROUTE, get(health_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: SharedState) -> Result<()> {
    tracing::info!(
        app = %state.app.name,
        image = %state.app.image,
        "Started server on {}",
        listener.local_addr()?
    );
    axum::serve(listener, router(state).into_make_service()).await?;
    Ok(())
}
