// ABOUTME: Shared identity and metadata types for the orchestration core.
// ABOUTME: Roles, modes, and the orchestrator metadata blobs stored on task/agent records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::matcher::CapabilitySet;

/// Role an agent plays in the coordination graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Director,
    Worker,
    Steward,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Director => "director",
            AgentRole::Worker => "worker",
            AgentRole::Steward => "steward",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "director" => Ok(AgentRole::Director),
            "worker" => Ok(AgentRole::Worker),
            "steward" => Ok(AgentRole::Steward),
            other => Err(format!("unknown agent role: {other}")),
        }
    }
}

/// How a worker session relates to its agent across tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// One session per task; torn down when the task completes.
    Ephemeral,
    /// One long-lived session reused across tasks.
    Persistent,
}

/// How the subprocess is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Line-delimited JSON over stdin/stdout.
    Headless,
    /// Pseudo-terminal with opaque byte forwarding.
    Interactive,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionMode::Headless => "headless",
            SessionMode::Interactive => "interactive",
        })
    }
}

/// One handoff of a task between sessions, kept on the task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    pub handoff_at: DateTime<Utc>,
}

/// Orchestrator-owned metadata blob stored on a task record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOrchestratorMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_request_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handoff_history: Vec<HandoffRecord>,
}

/// Orchestrator-owned metadata blob stored on an agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOrchestratorMeta {
    pub agent_role: AgentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_mode: Option<WorkerMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steward_focus: Option<String>,
    pub session_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub max_concurrent_tasks: usize,
}
