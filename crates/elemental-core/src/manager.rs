// ABOUTME: Session manager - logical session identity atop the spawner.
// ABOUTME: Resume-by-upstream-id, per-(agent, role) history, and send buffering while starting.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventStream};
use crate::error::{OrchestratorError, Result};
use crate::hub::{Channel, ChannelHub};
use crate::ready::{check_ready_queue, ReadyQueueOptions};
use crate::session::{SessionHistoryEntry, SessionSnapshot, SessionStatus};
use crate::spawner::{SessionHandle, SpawnOptions, Spawner};
use crate::store::{AgentSessionUpdate, TaskStore};
use crate::types::{AgentRole, SessionMode, WorkerMode};

/// Caller-facing options for starting a session.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub mode: Option<SessionMode>,
    pub worker_mode: Option<WorkerMode>,
    pub initial_prompt: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub init_timeout: Option<Duration>,
    /// Consult the ready queue after a worker starts.
    pub run_ready_check: bool,
    /// Flag anchored work for auto-start in the ready-queue report.
    pub auto_start: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    pub start: StartOptions,
    /// Start fresh when no resumable session exists.
    pub fall_back_to_start: bool,
    /// Refuse to resume a worker with nothing anchored to it.
    pub require_anchored_work: bool,
}

enum Outbox {
    /// Session not yet running; messages wait here in arrival order.
    Buffering(Vec<String>),
    Open,
}

type HistoryKey = (String, AgentRole);

/// Owns logical sessions across subprocess restarts and federates the
/// spawner upward.
pub struct SessionManager {
    spawner: Arc<Spawner>,
    store: Arc<dyn TaskStore>,
    bus: Arc<EventBus>,
    hub: Arc<ChannelHub>,
    history: Mutex<HashMap<HistoryKey, Vec<SessionHistoryEntry>>>,
    outbox: AsyncMutex<HashMap<String, Outbox>>,
}

impl SessionManager {
    pub fn new(spawner: Arc<Spawner>, store: Arc<dyn TaskStore>, hub: Arc<ChannelHub>) -> Self {
        let bus = spawner.bus();
        Self {
            spawner,
            store,
            bus,
            hub,
            history: Mutex::new(HashMap::new()),
            outbox: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Start a session for an agent and wait for it to become running.
    /// Returns the internal session id.
    pub async fn start(
        &self,
        agent_id: &str,
        role: AgentRole,
        opts: StartOptions,
    ) -> Result<String> {
        self.start_inner(agent_id, role, opts, None).await
    }

    /// Resume the most recent prior session for (agent, role) whose upstream
    /// id is known. Falls back to the store's agent metadata after a process
    /// restart, and to a fresh start when allowed.
    pub async fn resume(
        &self,
        agent_id: &str,
        role: AgentRole,
        opts: ResumeOptions,
    ) -> Result<String> {
        if role == AgentRole::Worker && opts.require_anchored_work {
            let report =
                check_ready_queue(self.store.as_ref(), agent_id, &ReadyQueueOptions::default())
                    .await?;
            if report.is_empty() {
                return Err(OrchestratorError::Other(format!(
                    "refusing to resume worker {agent_id}: no work anchored to it"
                )));
            }
        }

        match self.find_resumable_upstream_id(agent_id, role).await? {
            Some(upstream_id) => {
                info!(agent_id = %agent_id, upstream_id = %upstream_id, "resuming prior session");
                self.start_inner(agent_id, role, opts.start, Some(upstream_id))
                    .await
            }
            None if opts.fall_back_to_start => {
                debug!(agent_id = %agent_id, "nothing to resume, starting fresh");
                self.start_inner(agent_id, role, opts.start, None).await
            }
            None => Err(OrchestratorError::NotFound {
                kind: "resumable session",
                id: format!("{agent_id}/{role}"),
            }),
        }
    }

    async fn start_inner(
        &self,
        agent_id: &str,
        role: AgentRole,
        opts: StartOptions,
        resume_upstream_id: Option<String>,
    ) -> Result<String> {
        let working_dir = self
            .resolve_working_dir(agent_id, opts.working_dir.clone())
            .await?;
        let spawn_opts = SpawnOptions {
            agent_id: agent_id.to_string(),
            role,
            worker_mode: opts.worker_mode,
            mode: opts.mode.unwrap_or(SessionMode::Headless),
            working_dir,
            initial_prompt: opts.initial_prompt.clone(),
            resume_upstream_id,
            init_timeout: opts.init_timeout,
        };

        let handle = self.spawner.spawn(spawn_opts).await?;
        let session_id = handle.id.clone();
        // or_insert: a message may have raced in and opened the buffer first.
        self.outbox
            .lock()
            .await
            .entry(session_id.clone())
            .or_insert_with(|| Outbox::Buffering(Vec::new()));

        if let Err(e) = self.spawner.await_ready(&handle, opts.init_timeout).await {
            // The session never reached running; pending sends are dead.
            if let Some(Outbox::Buffering(pending)) =
                self.outbox.lock().await.remove(&session_id)
            {
                for message in pending {
                    warn!(
                        session_id = %session_id,
                        preview = %truncate(&message, 80),
                        "dropping queued message: session never reached running"
                    );
                }
            }
            self.record_history(&handle);
            return Err(e);
        }

        self.flush_outbox(&session_id).await?;
        self.record_history(&handle);
        self.push_agent_status(agent_id, &handle).await;
        info!(
            agent_id = %agent_id,
            session_id = %session_id,
            role = %role,
            "session running"
        );

        if role == AgentRole::Worker && opts.run_ready_check {
            let queue_opts = ReadyQueueOptions {
                auto_start: opts.auto_start,
                ..Default::default()
            };
            match check_ready_queue(self.store.as_ref(), agent_id, &queue_opts).await {
                Ok(report) if !report.is_empty() => {
                    self.hub.publish(
                        Channel::Tasks,
                        serde_json::json!({
                            "kind": "ready_queue",
                            "agent_id": agent_id,
                            "session_id": session_id,
                            "report": report,
                        }),
                    );
                }
                Ok(_) => {}
                // The session is up; a queue-check failure must not undo it.
                Err(e) => warn!(agent_id = %agent_id, error = %e, "ready-queue check failed"),
            }
        }

        Ok(session_id)
    }

    /// Stop a session and settle its history entry.
    pub async fn stop(&self, session_id: &str, graceful: bool) -> Result<()> {
        let handle = self.spawner.get(session_id)?;
        self.spawner.terminate(session_id, graceful).await?;
        self.outbox.lock().await.remove(session_id);
        self.record_history(&handle);
        self.push_agent_status(&handle.agent_id, &handle).await;
        Ok(())
    }

    /// Park a session for later resume, keeping its upstream id.
    pub async fn suspend(&self, session_id: &str) -> Result<()> {
        let handle = self.spawner.get(session_id)?;
        self.spawner.suspend(session_id).await?;
        self.outbox.lock().await.remove(session_id);
        self.record_history(&handle);
        self.push_agent_status(&handle.agent_id, &handle).await;
        Ok(())
    }

    /// Deliver one user turn. While the session is still starting the
    /// message is buffered and flushed, in order, once it reaches running.
    pub async fn send(&self, session_id: &str, text: &str) -> Result<()> {
        let handle = self.spawner.get(session_id)?;
        {
            let mut outbox = self.outbox.lock().await;
            if handle.status() == SessionStatus::Terminated {
                outbox.remove(session_id);
            } else {
                match outbox.get_mut(session_id) {
                    Some(Outbox::Buffering(pending)) => {
                        debug!(session_id = %session_id, "buffering message while session starts");
                        pending.push(text.to_string());
                        return Ok(());
                    }
                    Some(Outbox::Open) => {}
                    None => {
                        // The session may be racing through start(); catch it.
                        if handle.status() == SessionStatus::Starting {
                            outbox.insert(
                                session_id.to_string(),
                                Outbox::Buffering(vec![text.to_string()]),
                            );
                            return Ok(());
                        }
                    }
                }
            }
        }
        self.spawner.send_input(session_id, text).await
    }

    /// Subscribe to a session's event stream from this moment on.
    pub fn stream(&self, session_id: &str) -> Result<EventStream> {
        self.spawner.get(session_id)?;
        Ok(self.bus.subscribe(session_id))
    }

    pub fn get(&self, session_id: &str) -> Result<SessionSnapshot> {
        Ok(self.spawner.get(session_id)?.snapshot())
    }

    pub fn list_active(&self) -> Vec<SessionSnapshot> {
        self.spawner.list_active()
    }

    pub fn list_all(&self) -> Vec<SessionSnapshot> {
        self.spawner.list_all()
    }

    pub fn list_by_agent(&self, agent_id: &str) -> Vec<SessionSnapshot> {
        self.spawner.list_by_agent(agent_id)
    }

    pub fn most_recent_for_agent(&self, agent_id: &str) -> Option<SessionSnapshot> {
        self.spawner.most_recent_for_agent(agent_id)
    }

    /// Prior sessions for (agent, role), oldest first. Entries for sessions
    /// still in the spawner's table are refreshed from live state.
    pub fn history(&self, agent_id: &str, role: AgentRole) -> Vec<SessionHistoryEntry> {
        let mut entries = {
            let history = self.history.lock().expect("history lock poisoned");
            history
                .get(&(agent_id.to_string(), role))
                .cloned()
                .unwrap_or_default()
        };
        for entry in &mut entries {
            if let Ok(handle) = self.spawner.get(&entry.session_id) {
                *entry = SessionHistoryEntry::from(&handle.snapshot());
            }
        }
        entries
    }

    async fn find_resumable_upstream_id(
        &self,
        agent_id: &str,
        role: AgentRole,
    ) -> Result<Option<String>> {
        let entries = self.history(agent_id, role);
        if let Some(entry) = entries.iter().rev().find(|e| e.is_resumable()) {
            return Ok(entry.upstream_session_id.clone());
        }
        // Cross-restart rehydration: the store's agent metadata keeps the
        // last upstream id even when this process has no in-memory history.
        if let Some(agent) = self.store.get_agent(agent_id).await? {
            if agent.orchestrator.agent_role == role {
                return Ok(agent.orchestrator.session_id);
            }
        }
        Ok(None)
    }

    async fn flush_outbox(&self, session_id: &str) -> Result<()> {
        let mut outbox = self.outbox.lock().await;
        if let Some(entry) = outbox.get_mut(session_id) {
            if let Outbox::Buffering(pending) = entry {
                let pending = std::mem::take(pending);
                for message in pending {
                    self.spawner.send_input(session_id, &message).await?;
                }
            }
            *entry = Outbox::Open;
        }
        Ok(())
    }

    fn record_history(&self, handle: &SessionHandle) {
        let snapshot = handle.snapshot();
        let entry = SessionHistoryEntry::from(&snapshot);
        let mut history = self.history.lock().expect("history lock poisoned");
        let entries = history
            .entry((snapshot.agent_id.clone(), snapshot.role))
            .or_default();
        match entries
            .iter_mut()
            .find(|e| e.session_id == entry.session_id)
        {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    async fn push_agent_status(&self, agent_id: &str, handle: &SessionHandle) {
        let snapshot = handle.snapshot();
        let update = AgentSessionUpdate {
            session_id: snapshot.upstream_session_id.clone(),
            status: snapshot.status.as_str().to_string(),
            last_seen: Utc::now(),
        };
        if let Err(e) = self.store.update_agent_session(agent_id, update).await {
            // Status pushes are best-effort; the store will catch up on the
            // next lifecycle change.
            warn!(agent_id = %agent_id, error = %e, "agent status push failed");
        }
    }

    async fn resolve_working_dir(
        &self,
        agent_id: &str,
        explicit: Option<PathBuf>,
    ) -> Result<PathBuf> {
        if let Some(dir) = explicit {
            return Ok(dir);
        }
        if let Some(agent) = self.store.get_agent(agent_id).await? {
            if let Some(dir) = agent.working_dir {
                return Ok(dir);
            }
        }
        if let Some(root) = &self.spawner.config.workspace_root {
            return Ok(root.clone());
        }
        std::env::current_dir().map_err(OrchestratorError::Io)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::spawner::ClaudeProvider;
    use crate::store::{
        AgentRecord, Assignment, AssignmentContext, IdleWorker, ReadyTask, TaskRecord, TaskStatus,
    };
    use crate::types::{AgentOrchestratorMeta, TaskOrchestratorMeta};
    use async_trait::async_trait;

    /// Store that knows one agent with a stored upstream session id.
    struct RehydratingStore {
        upstream_id: Option<String>,
    }

    #[async_trait]
    impl TaskStore for RehydratingStore {
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

        async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
            Ok(Some(AgentRecord {
                agent_id: agent_id.to_string(),
                name: "Backend Dev".to_string(),
                working_dir: None,
                orchestrator: AgentOrchestratorMeta {
                    agent_role: AgentRole::Worker,
                    worker_mode: Some(WorkerMode::Persistent),
                    steward_focus: None,
                    session_status: "terminated".to_string(),
                    session_id: self.upstream_id.clone(),
                    capabilities: Default::default(),
                    max_concurrent_tasks: 1,
                },
            }))
        }
    }

    fn manager_with(store: Arc<dyn TaskStore>) -> SessionManager {
        let bus = Arc::new(EventBus::default());
        let spawner = Arc::new(Spawner::new(
            Arc::new(ClaudeProvider::new()),
            bus,
            OrchestratorConfig::default(),
        ));
        SessionManager::new(spawner, store, Arc::new(ChannelHub::default()))
    }

    #[tokio::test]
    async fn resume_without_history_rehydrates_from_store() {
        let manager = manager_with(Arc::new(RehydratingStore {
            upstream_id: Some("u-abc".to_string()),
        }));
        let found = manager
            .find_resumable_upstream_id("a-1", AgentRole::Worker)
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("u-abc"));
    }

    #[tokio::test]
    async fn resume_role_mismatch_finds_nothing() {
        let manager = manager_with(Arc::new(RehydratingStore {
            upstream_id: Some("u-abc".to_string()),
        }));
        let found = manager
            .find_resumable_upstream_id("a-1", AgentRole::Director)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn resume_without_fallback_errors_when_nothing_stored() {
        let manager = manager_with(Arc::new(RehydratingStore { upstream_id: None }));
        let err = manager
            .resume("a-1", AgentRole::Worker, ResumeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn resume_requiring_anchored_work_refuses_an_empty_queue() {
        let manager = manager_with(Arc::new(RehydratingStore {
            upstream_id: Some("u-abc".to_string()),
        }));
        let opts = ResumeOptions {
            require_anchored_work: true,
            ..Default::default()
        };
        let err = manager
            .resume("a-1", AgentRole::Worker, opts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no work anchored"));
    }

    #[tokio::test]
    async fn stream_of_unknown_session_is_not_found() {
        let manager = manager_with(Arc::new(RehydratingStore { upstream_id: None }));
        let err = manager.stream("nope").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn send_to_unknown_session_is_not_found() {
        let manager = manager_with(Arc::new(RehydratingStore { upstream_id: None }));
        let err = manager.send("nope", "hi").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
