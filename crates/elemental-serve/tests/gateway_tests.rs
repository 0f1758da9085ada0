// ABOUTME: Gateway end-to-end: start an agent over HTTP, follow its SSE stream, stop it.
// ABOUTME: Runs against a scripted shell provider and an empty in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use elemental_core::store::{
    AgentRecord, AgentSessionUpdate, Assignment, AssignmentContext, IdleWorker, ReadyTask,
    TaskRecord, TaskStatus, TaskStore,
};
use elemental_core::{
    ChannelHub, DispatchConfig, DispatchDaemon, EventBus, OrchestratorConfig, OrchestratorError,
    Provider, Result, SessionManager, Spawner, TaskOrchestratorMeta,
};
use elemental_serve::{build_router, AppState};

/// Echo agent: init immediately, then reflect stdin records.
const ECHO_SCRIPT: &str = r#"
printf '{"type":"system","subtype":"init","session_id":"u-gw"}\n'
while read line; do printf '%s\n' "$line"; done
"#;

struct ScriptProvider;

impl Provider for ScriptProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn binary(&self) -> &str {
        "/bin/sh"
    }

    fn headless_args(&self, _resume_upstream_id: Option<&str>) -> Vec<String> {
        vec!["-c".to_string(), ECHO_SCRIPT.to_string()]
    }

    fn interactive_invocation(&self, _resume_upstream_id: Option<&str>) -> String {
        "cat".to_string()
    }
}

struct EmptyStore;

#[async_trait]
impl TaskStore for EmptyStore {
    async fn get_ready_tasks(&self, _limit: usize) -> Result<Vec<ReadyTask>> {
        Ok(Vec::new())
    }

    async fn get_idle_workers(&self) -> Result<Vec<IdleWorker>> {
        Ok(Vec::new())
    }

    async fn assign_task_atomic(
        &self,
        task_id: &str,
        _agent_id: &str,
        _ctx: AssignmentContext,
    ) -> Result<Assignment> {
        Err(OrchestratorError::Conflict(task_id.to_string()))
    }

    async fn get_assigned_tasks(
        &self,
        _agent_id: &str,
        _statuses: &[TaskStatus],
        _limit: usize,
    ) -> Result<Vec<ReadyTask>> {
        Ok(Vec::new())
    }

    async fn update_agent_session(
        &self,
        _agent_id: &str,
        _update: AgentSessionUpdate,
    ) -> Result<()> {
        Ok(())
    }

    async fn update_task_orchestrator_meta(
        &self,
        _task_id: &str,
        _meta: TaskOrchestratorMeta,
    ) -> Result<()> {
        Ok(())
    }

    async fn get_task(&self, _task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(None)
    }

    async fn get_agent(&self, _agent_id: &str) -> Result<Option<AgentRecord>> {
        Ok(None)
    }
}

async fn spawn_gateway() -> String {
    let store: Arc<dyn TaskStore> = Arc::new(EmptyStore);
    let config = OrchestratorConfig {
        workspace_root: Some(std::env::temp_dir()),
        ..Default::default()
    };
    let hub = Arc::new(ChannelHub::default());
    let bus = Arc::new(EventBus::default().with_hub(hub.clone()));
    let spawner = Arc::new(Spawner::new(Arc::new(ScriptProvider), bus, config));
    let manager = Arc::new(SessionManager::new(spawner, store.clone(), hub.clone()));
    let daemon = Arc::new(DispatchDaemon::new(store, hub.clone(), DispatchConfig::default()));

    let app = build_router(Arc::new(AppState {
        manager,
        daemon,
        hub,
    }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn start_stream_message_stop_round_trip() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    // Start.
    let response = client
        .post(format!("{base}/agents/a-1/start"))
        .json(&serde_json::json!({ "initial_prompt": "hi", "role": "worker" }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    let session_id = body["session_id"].as_str().unwrap().to_string();
    assert!(!session_id.is_empty());

    // Open the SSE stream before provoking events so nothing is missed.
    let stream_response = client
        .get(format!("{base}/agents/a-1/stream"))
        .send()
        .await
        .unwrap();
    assert!(stream_response.status().is_success());
    let content_type = stream_response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let collector = tokio::spawn(async move {
        let mut collected = String::new();
        let mut body = stream_response.bytes_stream();
        while let Some(Ok(bytes)) = body.next().await {
            collected.push_str(&String::from_utf8_lossy(&bytes));
        }
        collected
    });

    // Message the agent; the echo script reflects it back onto the stream.
    let response = client
        .post(format!("{base}/agents/a-1/message"))
        .json(&serde_json::json!({ "content": "ping" }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Stop; the stream must close with the terminal result.
    let response = client
        .post(format!("{base}/agents/a-1/stop"))
        .json(&serde_json::json!({ "graceful": false }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let collected = tokio::time::timeout(Duration::from_secs(5), collector)
        .await
        .expect("stream closes after stop")
        .unwrap();
    assert!(collected.contains("event: user"), "echoed message missing:\n{collected}");
    assert!(collected.contains("\\\"ping\\\"") || collected.contains("\"ping\""));
    assert!(collected.contains("event: result"), "terminal event missing");
}

#[tokio::test]
async fn messaging_an_unknown_agent_is_not_found() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/agents/ghost/message"))
        .json(&serde_json::json!({ "content": "hello?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn health_and_poll_now_respond() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/health")).send().await.unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let response = client
        .post(format!("{base}/dispatch/poll-now"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}
