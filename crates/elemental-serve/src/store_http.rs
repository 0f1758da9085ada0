// ABOUTME: HTTP client for the external element store service.
// ABOUTME: Transport failures surface as upstream_unavailable so dispatch can back off.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;

use elemental_core::store::{
    AgentRecord, AgentSessionUpdate, Assignment, AssignmentContext, IdleWorker, ReadyTask,
    TaskRecord, TaskStatus, TaskStore,
};
use elemental_core::{OrchestratorError, Result, TaskOrchestratorMeta};

/// Talks to the element store service over JSON/HTTP.
pub struct HttpTaskStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTaskStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OrchestratorError::Other(format!("http client build failed: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(unreachable_store)?;
        decode(response).await
    }
}

fn unreachable_store(e: reqwest::Error) -> OrchestratorError {
    OrchestratorError::UpstreamUnavailable(e.to_string())
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(OrchestratorError::NotFound {
            kind: "store record",
            id: response.url().path().to_string(),
        });
    }
    if !status.is_success() {
        return Err(OrchestratorError::UpstreamUnavailable(format!(
            "store returned {status}"
        )));
    }
    response
        .json()
        .await
        .map_err(|e| OrchestratorError::ParseFailure(format!("store response: {e}")))
}

#[async_trait]
impl TaskStore for HttpTaskStore {
    async fn get_ready_tasks(&self, limit: usize) -> Result<Vec<ReadyTask>> {
        self.get_json(&format!("/tasks/ready?limit={limit}")).await
    }

    async fn get_idle_workers(&self) -> Result<Vec<IdleWorker>> {
        #[derive(serde::Deserialize)]
        struct Wire {
            agent_id: String,
            name: String,
            #[serde(default)]
            capabilities: elemental_core::CapabilitySet,
            #[serde(default)]
            currently_assigned_count: usize,
        }
        let workers: Vec<Wire> = self.get_json("/agents/idle").await?;
        Ok(workers
            .into_iter()
            .map(|w| IdleWorker {
                agent_id: w.agent_id,
                name: w.name,
                capabilities: w.capabilities,
                assigned_count: w.currently_assigned_count,
            })
            .collect())
    }

    async fn assign_task_atomic(
        &self,
        task_id: &str,
        agent_id: &str,
        ctx: AssignmentContext,
    ) -> Result<Assignment> {
        let response = self
            .client
            .post(self.url(&format!("/tasks/{task_id}/assign")))
            .json(&json!({ "agent_id": agent_id, "context": ctx }))
            .send()
            .await
            .map_err(unreachable_store)?;
        match response.status() {
            StatusCode::CONFLICT => Ok(Assignment::Conflict),
            StatusCode::NOT_FOUND => Err(OrchestratorError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            }),
            status if status.is_success() => Ok(Assignment::Assigned),
            status => Err(OrchestratorError::UpstreamUnavailable(format!(
                "assign returned {status}"
            ))),
        }
    }

    async fn get_assigned_tasks(
        &self,
        agent_id: &str,
        statuses: &[TaskStatus],
        limit: usize,
    ) -> Result<Vec<ReadyTask>> {
        let statuses: Vec<String> = statuses
            .iter()
            .map(|s| serde_json::to_value(s).expect("status serializes"))
            .map(|v| v.as_str().unwrap_or_default().to_string())
            .collect();
        self.get_json(&format!(
            "/agents/{agent_id}/queue?statuses={}&limit={limit}",
            statuses.join(",")
        ))
        .await
    }

    async fn update_agent_session(&self, agent_id: &str, update: AgentSessionUpdate) -> Result<()> {
        let response = self
            .client
            .patch(self.url(&format!("/agents/{agent_id}/session")))
            .json(&update)
            .send()
            .await
            .map_err(unreachable_store)?;
        if !response.status().is_success() {
            return Err(OrchestratorError::UpstreamUnavailable(format!(
                "agent session update returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn update_task_orchestrator_meta(
        &self,
        task_id: &str,
        meta: TaskOrchestratorMeta,
    ) -> Result<()> {
        let response = self
            .client
            .patch(self.url(&format!("/tasks/{task_id}/orchestrator")))
            .json(&meta)
            .send()
            .await
            .map_err(unreachable_store)?;
        if !response.status().is_success() {
            return Err(OrchestratorError::UpstreamUnavailable(format!(
                "task meta update returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        match self.get_json(&format!("/tasks/{task_id}")).await {
            Ok(task) => Ok(Some(task)),
            Err(OrchestratorError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        match self.get_json(&format!("/agents/{agent_id}")).await {
            Ok(agent) => Ok(Some(agent)),
            Err(OrchestratorError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
