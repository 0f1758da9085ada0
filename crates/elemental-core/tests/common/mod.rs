// ABOUTME: Shared fixtures for integration tests.
// ABOUTME: Scripted shell provider standing in for the LLM CLI, plus an in-memory store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use elemental_core::store::{
    AgentRecord, AgentSessionUpdate, Assignment, AssignmentContext, IdleWorker, ReadyTask,
    TaskRecord, TaskStatus, TaskStore,
};
use elemental_core::{
    AgentOrchestratorMeta, AgentRole, ChannelHub, EventBus, OrchestratorConfig, OrchestratorError,
    Provider, Result, SessionManager, SpawnOptions, Spawner, TaskOrchestratorMeta,
};

/// Provider that runs a shell script instead of a real LLM CLI. A resume
/// id, when present, is passed as `$1` so scripts can echo it back.
pub struct ScriptProvider {
    script: String,
}

impl ScriptProvider {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl Provider for ScriptProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn binary(&self) -> &str {
        "/bin/sh"
    }

    fn headless_args(&self, resume_upstream_id: Option<&str>) -> Vec<String> {
        let mut args = vec!["-c".to_string(), self.script.clone(), "sh".to_string()];
        if let Some(id) = resume_upstream_id {
            args.push(id.to_string());
        }
        args
    }

    fn interactive_invocation(&self, _resume_upstream_id: Option<&str>) -> String {
        self.script.clone()
    }
}

/// Fast timeouts so failure paths stay test-sized.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        init_timeout_secs: 10,
        grace_timeout_secs: 1,
        ..Default::default()
    }
}

pub fn spawner_with(script: &str) -> (Arc<Spawner>, Arc<EventBus>) {
    let bus = Arc::new(EventBus::default());
    let spawner = Arc::new(Spawner::new(
        Arc::new(ScriptProvider::new(script)),
        bus.clone(),
        test_config(),
    ));
    (spawner, bus)
}

pub fn manager_with(script: &str, store: Arc<dyn TaskStore>) -> Arc<SessionManager> {
    let (spawner, _bus) = spawner_with(script);
    Arc::new(SessionManager::new(
        spawner,
        store,
        Arc::new(ChannelHub::default()),
    ))
}

pub fn worker_spawn_opts(agent_id: &str) -> SpawnOptions {
    SpawnOptions::new(agent_id, AgentRole::Worker, std::env::temp_dir())
}

/// In-memory store: enough state for resume rehydration and queue checks.
#[derive(Default)]
pub struct MemoryStore {
    pub agents: Mutex<HashMap<String, AgentRecord>>,
    pub queues: Mutex<HashMap<String, Vec<ReadyTask>>>,
    pub session_updates: Mutex<Vec<(String, AgentSessionUpdate)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_agent(&self, agent_id: &str, role: AgentRole, upstream_id: Option<&str>) {
        self.agents.lock().unwrap().insert(
            agent_id.to_string(),
            AgentRecord {
                agent_id: agent_id.to_string(),
                name: agent_id.to_string(),
                working_dir: Some(PathBuf::from(std::env::temp_dir())),
                orchestrator: AgentOrchestratorMeta {
                    agent_role: role,
                    worker_mode: None,
                    steward_focus: None,
                    session_status: "terminated".to_string(),
                    session_id: upstream_id.map(String::from),
                    capabilities: Default::default(),
                    max_concurrent_tasks: 1,
                },
            },
        );
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
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
        agent_id: &str,
        _statuses: &[TaskStatus],
        limit: usize,
    ) -> Result<Vec<ReadyTask>> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(agent_id)
            .map(|tasks| tasks.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn update_agent_session(&self, agent_id: &str, update: AgentSessionUpdate) -> Result<()> {
        self.session_updates
            .lock()
            .unwrap()
            .push((agent_id.to_string(), update));
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

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.agents.lock().unwrap().get(agent_id).cloned())
    }
}
