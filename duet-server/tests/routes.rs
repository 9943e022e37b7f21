use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use base64::{prelude::BASE64_STANDARD, Engine};
use duet_core::{
    app::FunctionSpec, ActivityLog, FunctionResult, GenerationRequest, ImageResponse, ModelLike,
};
use duet_server::{router, AppState, GENERATIONS_ROUTE, HEALTH_ROUTE};
use image::DynamicImage;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::net::TcpListener;

enum Behavior {
    Solid,
    Slow(Duration),
    Fail,
}

struct MockModel(Behavior);

impl ModelLike for MockModel {
    fn run(&self, request: GenerationRequest) -> Result<DynamicImage> {
        match self.0 {
            Behavior::Solid => {}
            Behavior::Slow(delay) => std::thread::sleep(delay),
            Behavior::Fail => anyhow::bail!("CUDA out of memory"),
        }
        let width = request.width.unwrap_or(16) as u32;
        let height = request.height.unwrap_or(16) as u32;
        Ok(DynamicImage::new_rgb8(width, height))
    }
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("duet-server-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn spawn(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::new(state));
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    addr
}

fn solid_state(dir: &Path) -> AppState {
    AppState::new(
        Arc::new(MockModel(Behavior::Solid)),
        FunctionSpec::generate_image(),
        dir.join("generated_image.png"),
    )
}

#[tokio::test]
async fn health_reports_app_and_function() {
    let dir = scratch_dir("health");
    let addr = spawn(solid_state(&dir)).await;

    let body: Value = reqwest::get(format!("http://{addr}{HEALTH_ROUTE}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["app"], "stable-diffusion-xl-example");
    assert_eq!(body["image"], "dockerfile: ./Dockerfile");
    assert_eq!(body["function"], "generate_image");
    assert_eq!(body["timeout_secs"], 3600);
}

#[tokio::test]
async fn function_writes_png_and_reports_completion() {
    let dir = scratch_dir("function");
    let output = dir.join("generated_image.png");
    let addr = spawn(solid_state(&dir)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/functions/generate_image"))
        .json(&GenerationRequest::new("A majestic lion"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result: FunctionResult = response.json().await.unwrap();
    assert_eq!(result.result, "Image generation complete!");

    let saved = image::open(&output).unwrap();
    assert_eq!((saved.width(), saved.height()), (16, 16));
}

#[tokio::test]
async fn generations_returns_base64_png() {
    let dir = scratch_dir("generations");
    let addr = spawn(solid_state(&dir)).await;

    let mut request = GenerationRequest::new("a lion");
    request.width = Some(32);
    request.height = Some(24);
    let response: ImageResponse = reqwest::Client::new()
        .post(format!("http://{addr}{GENERATIONS_ROUTE}"))
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let bytes = BASE64_STANDARD.decode(response.image).unwrap();
    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (32, 24));
}

#[tokio::test]
async fn empty_prompt_is_rejected_and_logged() {
    let dir = scratch_dir("empty-prompt");
    let activity = ActivityLog::new(dir.join("logs"));
    let addr = spawn(solid_state(&dir).with_activity_log(activity.clone())).await;

    let mut request = GenerationRequest::new("   ");
    request.username = Some("alice".to_string());
    let response = reqwest::Client::new()
        .post(format!("http://{addr}{GENERATIONS_ROUTE}"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Prompt text is required");

    let log = std::fs::read_to_string(activity.path_for(Some("alice"))).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("Success: false - Error: Prompt text is required"));
    assert!(!dir.join("generated_image.png").exists());
}

#[tokio::test]
async fn successful_calls_are_logged() {
    let dir = scratch_dir("logged");
    let activity = ActivityLog::new(dir.join("logs"));
    let addr = spawn(solid_state(&dir).with_activity_log(activity.clone())).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/functions/generate_image"))
        .json(&GenerationRequest::new("a lion at night"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let log = std::fs::read_to_string(activity.path_for(None)).unwrap();
    assert!(log.contains("Prompt: a lion at night - Success: true - Error: N/A"));
}

#[tokio::test]
async fn slow_calls_time_out() {
    let dir = scratch_dir("timeout");
    let state = AppState::new(
        Arc::new(MockModel(Behavior::Slow(Duration::from_secs(2)))),
        FunctionSpec::generate_image().with_timeout(Duration::from_millis(100)),
        dir.join("generated_image.png"),
    );
    let addr = spawn(state).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/functions/generate_image"))
        .json(&GenerationRequest::new("a lion"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "function timed out after 0.1s");
    assert!(!dir.join("generated_image.png").exists());
}

#[tokio::test]
async fn model_failures_are_internal_errors() {
    let dir = scratch_dir("failure");
    let state = AppState::new(
        Arc::new(MockModel(Behavior::Fail)),
        FunctionSpec::generate_image(),
        dir.join("generated_image.png"),
    );
    let addr = spawn(state).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}{GENERATIONS_ROUTE}"))
        .json(&GenerationRequest::new("a lion"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "CUDA out of memory");
}

#[tokio::test]
async fn unwritable_output_is_a_logged_failure() {
    let dir = scratch_dir("unwritable");
    let activity = ActivityLog::new(dir.join("logs"));
    let state = AppState::new(
        Arc::new(MockModel(Behavior::Solid)),
        FunctionSpec::generate_image(),
        dir.join("missing").join("generated_image.png"),
    )
    .with_activity_log(activity.clone());
    let addr = spawn(state).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/functions/generate_image"))
        .json(&GenerationRequest::new("a lion"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);

    let log = std::fs::read_to_string(activity.path_for(None)).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("Prompt: a lion - Success: false"));
    assert!(!log.contains("Success: true"));
}

#[tokio::test]
async fn concurrent_calls_leave_a_complete_png() {
    let dir = scratch_dir("concurrent");
    let output = dir.join("generated_image.png");
    let addr = spawn(solid_state(&dir)).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/functions/generate_image");

    let mut small = GenerationRequest::new("a small lion");
    small.width = Some(16);
    small.height = Some(16);
    let mut large = GenerationRequest::new("a large lion");
    large.width = Some(512);
    large.height = Some(384);

    let (a, b) = tokio::join!(
        client.post(&url).json(&small).send(),
        client.post(&url).json(&large).send(),
    );
    assert_eq!(a.unwrap().status(), StatusCode::OK);
    assert_eq!(b.unwrap().status(), StatusCode::OK);

    let saved = image::open(&output).unwrap();
    assert!(matches!(
        (saved.width(), saved.height()),
        (16, 16) | (512, 384)
    ));
    // Only the output file remains next to it.
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
}

#[tokio::test]
async fn malformed_body_is_a_json_bad_request() {
    let dir = scratch_dir("malformed");
    let activity = ActivityLog::new(dir.join("logs"));
    let addr = spawn(solid_state(&dir).with_activity_log(activity.clone())).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}{GENERATIONS_ROUTE}"))
        .header("content-type", "application/json")
        .body(r#"{"text": "a lion"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    let error = body["error"].as_str().unwrap();
    assert!(error.starts_with("invalid request body"), "{error}");

    let log = std::fs::read_to_string(activity.path_for(None)).unwrap();
    assert!(log.contains("Prompt:  - Success: false - Error: invalid request body"));
}
