// ABOUTME: Session lifecycle types shared by the spawner and session manager.
// ABOUTME: Status machine, read-only snapshots, and per-(agent, role) history entries.

mod status;

pub use status::{transition, SessionStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::{AgentRole, SessionMode, WorkerMode};

/// Point-in-time view of a live or finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub agent_id: String,
    pub role: AgentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_mode: Option<WorkerMode>,
    pub mode: SessionMode,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_session_id: Option<String>,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Ordered record of a prior session for one (agent, role) pair.
///
/// Entries are derived from sessions that reached `suspended` or
/// `terminated`; the manager uses them to find the most recent resumable
/// session. They can be persisted to the store as agent metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHistoryEntry {
    pub session_id: String,
    pub agent_id: String,
    pub role: AgentRole,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_session_id: Option<String>,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionHistoryEntry {
    /// A session can be resumed when we know its upstream id and it is no
    /// longer live.
    pub fn is_resumable(&self) -> bool {
        self.upstream_session_id.is_some()
            && matches!(
                self.status,
                SessionStatus::Suspended | SessionStatus::Terminated
            )
    }
}

impl From<&SessionSnapshot> for SessionHistoryEntry {
    fn from(snap: &SessionSnapshot) -> Self {
        Self {
            session_id: snap.id.clone(),
            agent_id: snap.agent_id.clone(),
            role: snap.role,
            status: snap.status,
            upstream_session_id: snap.upstream_session_id.clone(),
            working_dir: snap.working_dir.clone(),
            created_at: snap.created_at,
            started_at: snap.started_at,
            ended_at: snap.ended_at,
        }
    }
}
