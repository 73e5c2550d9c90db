//! HTTP surface tests, driven in-process through `tower::ServiceExt::oneshot`.

use anyhow::Result;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use echo_orchestrator::orchestrator::{DispatcherConfig, Edge, EngineConfig, Guard, MemoryCheckpointer, Node};
use echo_orchestrator::server::{router, AppState};
use echo_orchestrator::{
    Capability, CapabilityOutput, CapabilityRegistry, Dispatcher, Graph, ModelFactory, OrchestratorResult, Session,
    SessionStore,
};

/// Replies "pong" and loops forever unless asked to stop.
struct Pong;

#[async_trait]
impl Capability for Pong {
    fn name(&self) -> &str {
        "pong"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn invoke(&self, _session: &Session, input: Option<&str>) -> OrchestratorResult<CapabilityOutput> {
        let stop = input.is_some_and(|i| i.contains("stop"));
        Ok(CapabilityOutput::text("pong").set("stop", stop))
    }
}

async fn app() -> Result<Router> {
    let registry = Arc::new(CapabilityRegistry::new());
    registry.register(Arc::new(Pong)).await?;
    registry.activate("pong", "1.0.0").await?;

    let graph = Graph::builder("ping")
        .node(Node::agent("ping", "pong"))
        .node(Node::terminal("done"))
        .edge(Edge::new("ping", "done").when(Guard::truthy("stop")).otherwise("ping"))
        .build()?;
    let dispatcher = Dispatcher::new(
        Arc::new(graph),
        registry,
        Arc::new(SessionStore::new(
            Arc::new(MemoryCheckpointer::new()),
            Duration::from_secs(600),
        )),
        Arc::new(ModelFactory::new()),
        DispatcherConfig {
            engine: EngineConfig {
                max_steps: 2,
                max_commit_attempts: 5,
            },
            max_concurrent_sessions: 4,
        },
    );
    Ok(router(AppState {
        dispatcher: Arc::new(dispatcher),
    }))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Result<(StatusCode, Value)> {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => request.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, json))
}

#[tokio::test]
async fn test_health() -> Result<()> {
    let app = app().await?;
    let (status, body) = send(&app, "GET", "/health", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
    Ok(())
}

#[tokio::test]
async fn test_turn_then_read_session() -> Result<()> {
    let app = app().await?;
    let (status, body) = send(&app, "POST", "/v1/sessions/s1/turns", Some(json!({ "input": "stop" }))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], "s1");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["output"], "pong");
    assert_eq!(body["revision"], 2);
    assert_eq!(body["steps"], 1);

    let (status, session) = send(&app, "GET", "/v1/sessions/s1", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["current_node"], "done");
    assert_eq!(session["turns"][0]["role"], "user");
    Ok(())
}

#[tokio::test]
async fn test_submit_generates_session_id() -> Result<()> {
    let app = app().await?;
    let (status, body) = send(&app, "POST", "/v1/submit", Some(json!({ "input": "please stop" }))).await?;
    assert_eq!(status, StatusCode::OK);
    let session_id = body["session_id"].as_str().unwrap_or_default();
    assert!(uuid::Uuid::parse_str(session_id).is_ok());
    Ok(())
}

#[tokio::test]
async fn test_error_mapping() -> Result<()> {
    let app = app().await?;

    let (status, body) = send(&app, "GET", "/v1/sessions/missing", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, body) = send(&app, "POST", "/v1/sessions/loop/turns", Some(json!({ "input": "again" }))).await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "step_budget_exceeded");
    assert!(body["error"].as_str().unwrap_or_default().contains("step budget"));
    assert_eq!(body["output"], "pong\n\npong");
    Ok(())
}

#[tokio::test]
async fn test_capabilities_listing() -> Result<()> {
    let app = app().await?;
    let (status, body) = send(&app, "GET", "/v1/capabilities", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([{ "name": "pong", "version": "1.0.0", "kind": "agent", "state": "active" }])
    );
    Ok(())
}
