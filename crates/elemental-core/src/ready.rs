// ABOUTME: Ready-queue check - on start, an agent must run the work anchored to it.
// ABOUTME: Reports only; starting the task is the caller's move against the store.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::{ReadyTask, TaskStatus, TaskStore};

pub const DEFAULT_QUEUE_LIMIT: usize = 5;

#[derive(Debug, Clone)]
pub struct ReadyQueueOptions {
    /// Flag the first task for auto-start in the report.
    pub auto_start: bool,
    /// How many anchored tasks to fetch.
    pub limit: usize,
}

impl Default for ReadyQueueOptions {
    fn default() -> Self {
        Self {
            auto_start: false,
            limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

/// What the check found for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct ReadyQueueReport {
    pub agent_id: String,
    /// Highest-priority task anchored to the agent, if any.
    pub next_task: Option<ReadyTask>,
    /// Total anchored tasks seen (capped at the fetch limit).
    pub queued: usize,
    /// Set when auto_start was requested and work exists. The caller uses
    /// this to invoke the store's start-task operation; the check itself
    /// never mutates task state.
    pub should_start: bool,
}

impl ReadyQueueReport {
    pub fn is_empty(&self) -> bool {
        self.next_task.is_none()
    }
}

/// Look up work already anchored to the agent: open or in-progress tasks,
/// priority order.
pub async fn check_ready_queue(
    store: &dyn TaskStore,
    agent_id: &str,
    opts: &ReadyQueueOptions,
) -> Result<ReadyQueueReport> {
    let tasks = store
        .get_assigned_tasks(
            agent_id,
            &[TaskStatus::Open, TaskStatus::InProgress],
            opts.limit.max(1),
        )
        .await?;

    let queued = tasks.len();
    let next_task = tasks.into_iter().next();
    let should_start = opts.auto_start && next_task.is_some();

    match &next_task {
        Some(task) => info!(
            agent_id = %agent_id,
            task_id = %task.task_id,
            queued,
            auto_start = should_start,
            "anchored work found"
        ),
        None => debug!(agent_id = %agent_id, "ready queue empty"),
    }

    Ok(ReadyQueueReport {
        agent_id: agent_id.to_string(),
        next_task,
        queued,
        should_start,
    })
}
