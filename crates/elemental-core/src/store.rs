// ABOUTME: The consumed task-store interface; the core persists nothing itself.
// ABOUTME: All durable state (tasks, agents, assignments) lives behind this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;
use crate::matcher::{CapabilitySet, TaskRequirements};
use crate::types::{AgentOrchestratorMeta, TaskOrchestratorMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Done,
    Cancelled,
}

/// A task the store considers ready: open, unblocked, unassigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyTask {
    pub task_id: String,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub requirements: TaskRequirements,
}

/// A worker with no running session, available for dispatch.
#[derive(Debug, Clone)]
pub struct IdleWorker {
    pub agent_id: String,
    pub name: String,
    pub capabilities: CapabilitySet,
    pub assigned_count: usize,
}

/// Context recorded alongside an assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Outcome of the store's single-row compare-and-swap on `assignee IS NULL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Assigned,
    /// Another dispatcher won the row.
    Conflict,
}

/// Session-status update pushed onto an agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default)]
    pub orchestrator: TaskOrchestratorMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub orchestrator: AgentOrchestratorMeta,
}

/// External element/task store consumed by the core.
///
/// "Ready" is the store's predicate (open, no unsatisfied blockers,
/// unassigned); the core never second-guesses it. Assignment races are
/// resolved by the store's atomic update, not by the dispatcher.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Ready tasks, priority ascending then created_at ascending, capped.
    async fn get_ready_tasks(&self, limit: usize) -> Result<Vec<ReadyTask>>;

    /// Worker agents with no running session.
    async fn get_idle_workers(&self) -> Result<Vec<IdleWorker>>;

    /// Compare-and-swap assignment; `Conflict` when the row was taken.
    async fn assign_task_atomic(
        &self,
        task_id: &str,
        agent_id: &str,
        ctx: AssignmentContext,
    ) -> Result<Assignment>;

    /// Tasks anchored to an agent in the given statuses, priority order.
    async fn get_assigned_tasks(
        &self,
        agent_id: &str,
        statuses: &[TaskStatus],
        limit: usize,
    ) -> Result<Vec<ReadyTask>>;

    async fn update_agent_session(&self, agent_id: &str, update: AgentSessionUpdate) -> Result<()>;

    async fn update_task_orchestrator_meta(
        &self,
        task_id: &str,
        meta: TaskOrchestratorMeta,
    ) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>>;
}
