//! A2A-style HTTP surface.
//!
//! `POST /v1/message:send` creates a task and returns it immediately; the
//! pipeline runs in the background and clients poll `GET /v1/tasks/:id`.
//! Artifacts are served read-only under `/download`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use forma_agent::{spawn_pipeline_task, Orchestrator, PipelineRequest};
use forma_core::config::ServerConfig;
use forma_executor::{Message, TaskStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub store: TaskStore,
    pub orchestrator: Arc<Orchestrator>,
    pub server: Arc<ServerConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No text content found in message")]
    EmptyMessage,
    #[error("Task not found")]
    TaskNotFound,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::EmptyMessage => StatusCode::BAD_REQUEST,
            Self::TaskNotFound => StatusCode::NOT_FOUND,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Body of `message:send`. Other A2A fields (`configuration`, `metadata`)
/// are accepted and ignored.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub message: Message,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    #[serde(rename = "type")]
    pub card_type: &'static str,
    pub version: &'static str,
    pub identity: Value,
    pub capabilities: Value,
    pub supported_interfaces: Vec<Value>,
}

pub fn router(state: AppState, output_dir: &Path) -> Router {
    Router::new()
        .route("/v1/message:send", post(send_message))
        .route("/v1/tasks/:id", get(get_task))
        .route("/v1/extendedAgentCard", get(agent_card))
        .route("/.well-known/agent-card.json", get(agent_card))
        .nest_service("/download", ServeDir::new(output_dir))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: AppState, output_dir: &Path) -> Result<()> {
    let addr = state.server.bind_addr.clone();
    let app = router(state, output_dir);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, output_dir = %output_dir.display(), "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("gateway server error")?;
    Ok(())
}

/// Text parts, each newline-terminated, trimmed as a whole.
fn prompt_from(message: &Message) -> String {
    message
        .parts
        .iter()
        .filter_map(|p| p.as_text())
        .filter(|t| !t.is_empty())
        .map(|t| format!("{}\n", t))
        .collect::<String>()
        .trim()
        .to_string()
}

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let prompt = prompt_from(&request.message);
    if prompt.is_empty() {
        return Err(ApiError::EmptyMessage);
    }

    let task = state.store.create(request.message.context_id.as_deref());
    tracing::info!(task_id = %task.id, context_id = %task.context_id, "task submitted");
    spawn_pipeline_task(
        Arc::clone(&state.orchestrator),
        state.store.clone(),
        PipelineRequest::new(&prompt, &task.context_id, &task.id),
    );
    Ok(Json(json!({ "task": task })))
}

async fn get_task(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state.store.get(&id).ok_or(ApiError::TaskNotFound)?;
    Ok(Json(json!({ "task": task })))
}

async fn agent_card(State(state): State<AppState>, headers: HeaderMap) -> Json<AgentCard> {
    let base_url = state.server.public_url.clone().unwrap_or_else(|| {
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{}", host)
    });
    Json(AgentCard {
        card_type: "agent-card",
        version: "1.0",
        identity: json!({
            "name": "FormaAI 3D Agent",
            "description": "Generates 3D models (STL/STEP) from natural language descriptions using build123d.",
            "author": "FormaAI Team",
            "license": "MIT",
            "service": state.server.app_name,
        }),
        capabilities: json!({
            "input_types": ["text/plain"],
            "output_types": ["model/stl", "model/step", "text/x-python"],
        }),
        supported_interfaces: vec![json!({
            "transport": "http",
            "url": format!("{}/v1/message:send", base_url),
        })],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use forma_agent::{Generation, GenerationRequest, GenerationStep, ModelExecutor, RenderStep};
    use forma_core::config::PipelineSettings;
    use forma_sandbox::{ExecutionResult, RenderedPreview, SandboxError};
    use std::path::PathBuf;
    use tower::ServiceExt;

    struct OfflineStep;

    #[async_trait]
    impl GenerationStep for OfflineStep {
        async fn invoke(&self, _request: GenerationRequest) -> anyhow::Result<Generation> {
            anyhow::bail!("LLM API request failed: connection refused")
        }
    }

    struct NoSandbox(PathBuf);

    #[async_trait]
    impl ModelExecutor for NoSandbox {
        async fn execute(&self, _code: &str, _task_id: &str) -> ExecutionResult {
            Err(SandboxError::Worker("disabled".to_string()))
        }

        fn output_dir(&self) -> &Path {
            &self.0
        }
    }

    #[async_trait]
    impl RenderStep for NoSandbox {
        async fn render(&self, mesh: &Path) -> Result<RenderedPreview, SandboxError> {
            Err(SandboxError::ArtifactMissing(mesh.to_path_buf()))
        }
    }

    fn app(dir: &Path) -> (Router, TaskStore) {
        let sandbox = Arc::new(NoSandbox(dir.to_path_buf()));
        let orchestrator = Orchestrator::new(
            Arc::new(OfflineStep),
            Arc::new(OfflineStep),
            sandbox.clone(),
            sandbox,
            PipelineSettings::default(),
        );
        let store = TaskStore::new();
        let state = AppState {
            store: store.clone(),
            orchestrator: Arc::new(orchestrator),
            server: Arc::new(ServerConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                app_name: "forma-ai-service".to_string(),
                public_url: None,
            }),
        };
        (router(state, dir), store)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_message(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/message:send")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_message_creates_task_and_runs_it() {
        let dir = tempfile::tempdir().unwrap();
        let (app, store) = app(dir.path());

        let response = app
            .oneshot(post_message(json!({
                "message": {
                    "messageId": "m1",
                    "contextId": "ctx-1",
                    "role": "ROLE_USER",
                    "parts": [{"text": "A 10x10x10 cm cube"}, {"text": "with a 5mm hole"}]
                }
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["task"]["contextId"], "ctx-1");
        assert_eq!(body["task"]["status"]["state"], "TASK_STATE_SUBMITTED");
        let id = body["task"]["id"].as_str().unwrap().to_string();

        // the offline backend fails the run; the failure lands in the store
        let mut state = None;
        for _ in 0..100 {
            let task = store.get(&id).unwrap();
            if task.status.state.is_terminal() {
                state = Some(task);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let task = state.expect("task never finished");
        let text = task.status.message.unwrap().text_content();
        assert!(text.starts_with("Internal error during generation:"));
    }

    #[tokio::test]
    async fn test_send_message_without_text_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (app, store) = app(dir.path());

        let response = app
            .oneshot(post_message(json!({
                "message": {"role": "ROLE_USER", "parts": [{"text": "   "}, {"data": {"k": 1}}]}
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["detail"], "No text content found in message");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_get_task_roundtrip_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (app, store) = app(dir.path());
        let task = store.create(None);

        let response = app
            .clone()
            .oneshot(Request::get(format!("/v1/tasks/{}", task.id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["task"]["id"], task.id.as_str());

        let response = app
            .oneshot(Request::get("/v1/tasks/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["detail"], "Task not found");
    }

    #[tokio::test]
    async fn test_agent_card_advertises_send_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());

        for uri in ["/v1/extendedAgentCard", "/.well-known/agent-card.json"] {
            let response = app
                .clone()
                .oneshot(
                    Request::get(uri)
                        .header("host", "cad.example:8000")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let card = body_json(response).await;
            assert_eq!(card["type"], "agent-card");
            assert_eq!(
                card["supportedInterfaces"][0]["url"],
                "http://cad.example:8000/v1/message:send"
            );
            assert_eq!(card["capabilities"]["output_types"][0], "model/stl");
        }
    }

    #[tokio::test]
    async fn test_download_serves_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t_1.stl"), b"solid t\nendsolid t\n").unwrap();
        let (app, _) = app(dir.path());

        let response = app
            .clone()
            .oneshot(Request::get("/download/t_1.stl").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        assert!(bytes.starts_with(b"solid t"));

        let response = app
            .oneshot(Request::get("/download/nope.stl").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_send_request_ignores_configuration() {
        let request: SendMessageRequest = serde_json::from_value(json!({
            "message": {"role": "ROLE_USER", "parts": [{"text": "a washer"}]},
            "configuration": {"acceptedOutputModes": ["model/stl"], "blocking": false}
        }))
        .unwrap();
        assert_eq!(prompt_from(&request.message), "a washer");
    }

    #[test]
    fn test_prompt_joins_text_parts() {
        let message: Message = serde_json::from_value(json!({
            "parts": [{"text": "cube"}, {"file": {"fileWithUri": "/x"}}, {"text": "with hole"}]
        }))
        .unwrap();
        assert_eq!(prompt_from(&message), "cube\nwith hole");
    }
}
