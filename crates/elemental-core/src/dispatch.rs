// ABOUTME: Dispatch daemon - polls the store for ready tasks and binds them to idle workers.
// ABOUTME: Assignment is won by the store's compare-and-swap; local scoring is advisory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::error::{OrchestratorError, Result};
use crate::hub::{Channel, ChannelHub};
use crate::matcher::{rank, Candidate};
use crate::store::{Assignment, AssignmentContext, IdleWorker, TaskStore};

/// Operator-visible dispatch counters.
#[derive(Default)]
pub struct DispatchStats {
    assigned: AtomicU64,
    conflicts: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DispatchStatsSnapshot {
    pub assigned: u64,
    pub conflicts: u64,
    pub failures: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            assigned: self.assigned.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

struct DispatchInner {
    store: Arc<dyn TaskStore>,
    hub: Arc<ChannelHub>,
    config: DispatchConfig,
    poke: Notify,
    shutdown: watch::Sender<bool>,
    stats: DispatchStats,
}

/// Background loop matching ready tasks with idle workers.
pub struct DispatchDaemon {
    inner: Arc<DispatchInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchDaemon {
    pub fn new(store: Arc<dyn TaskStore>, hub: Arc<ChannelHub>, config: DispatchConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(DispatchInner {
                store,
                hub,
                config,
                poke: Notify::new(),
                shutdown,
                stats: DispatchStats::default(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the loop. Idempotent: a second call is a no-op while running.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let inner = self.inner.clone();
        info!(tick_secs = inner.config.tick_secs, "dispatch daemon starting");
        *task = Some(tokio::spawn(run_loop(inner)));
    }

    /// Signal the loop to exit at its next boundary and wait for it.
    /// In-flight store calls are never killed.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch loop join failed");
            }
        }
        info!("dispatch daemon stopped");
    }

    /// Kick a poll ahead of the next tick.
    pub fn poll_now(&self) {
        self.inner.poke.notify_one();
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// One dispatch pass, exposed for tests and the poll-now endpoint.
    pub async fn run_once(&self) -> Result<usize> {
        dispatch_pass(&self.inner).await
    }
}

async fn run_loop(inner: Arc<DispatchInner>) {
    let tick = inner.config.tick();
    let mut delay = tick;
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.poke.notified() => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }

        match dispatch_pass(&inner).await {
            Ok(assigned) => {
                if assigned > 0 {
                    debug!(assigned, "dispatch pass complete");
                }
                delay = tick;
            }
            Err(OrchestratorError::UpstreamUnavailable(message)) => {
                // Exponential back-off while the store is down, then resume
                // normal ticking once a pass succeeds.
                delay = (delay * 2).min(inner.config.max_backoff());
                warn!(
                    error = %message,
                    retry_secs = delay.as_secs(),
                    "task store unreachable, backing off"
                );
            }
            Err(e) => {
                // The loop never dies on a dispatch error.
                warn!(error = %e, "dispatch pass failed");
                delay = tick;
            }
        }
    }
}

async fn dispatch_pass(inner: &DispatchInner) -> Result<usize> {
    let store_timeout = inner.config.store_timeout();

    let tasks = with_deadline(
        store_timeout,
        "get_ready_tasks",
        inner.store.get_ready_tasks(inner.config.batch_size),
    )
    .await?;
    if tasks.is_empty() {
        return Ok(0);
    }

    let workers = with_deadline(
        store_timeout,
        "get_idle_workers",
        inner.store.get_idle_workers(),
    )
    .await?;
    let mut pool: Vec<Candidate> = workers.iter().map(candidate_from).collect();

    let mut assigned = 0usize;
    for task in &tasks {
        if pool.is_empty() {
            break;
        }
        let best_id = {
            let ranked = rank(&pool, &task.requirements);
            ranked.first().map(|c| c.agent_id.clone())
        };
        let Some(agent_id) = best_id else {
            debug!(task_id = %task.task_id, "no eligible worker");
            continue;
        };

        let outcome = with_deadline(
            store_timeout,
            "assign_task_atomic",
            inner
                .store
                .assign_task_atomic(&task.task_id, &agent_id, AssignmentContext::default()),
        )
        .await;
        match outcome {
            Ok(Assignment::Assigned) => {
                pool.retain(|c| c.agent_id != agent_id);
                inner.stats.assigned.fetch_add(1, Ordering::Relaxed);
                info!(task_id = %task.task_id, agent_id = %agent_id, "task assigned");
                inner.hub.publish(
                    Channel::Tasks,
                    serde_json::json!({
                        "kind": "task_assigned",
                        "task_id": task.task_id,
                        "agent_id": agent_id,
                        "priority": task.priority,
                    }),
                );
                assigned += 1;
            }
            Ok(Assignment::Conflict) => {
                // Someone else won the row; skip and move on.
                inner.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = %task.task_id, "assignment lost the race");
            }
            Err(e) => {
                inner.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %task.task_id, error = %e, "assignment failed");
            }
        }
    }
    Ok(assigned)
}

async fn with_deadline<T>(
    deadline: Duration,
    operation: &'static str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| OrchestratorError::Timeout {
            operation,
            timeout: deadline,
        })?
}

fn candidate_from(worker: &IdleWorker) -> Candidate {
    Candidate {
        agent_id: worker.agent_id.clone(),
        capabilities: worker.capabilities.clone(),
        assigned_count: worker.assigned_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{CapabilitySet, TaskRequirements};
    use crate::store::{
        AgentRecord, AgentSessionUpdate, ReadyTask, TaskRecord, TaskStatus,
    };
    use crate::types::TaskOrchestratorMeta;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    /// Store with three ready tasks and five equally capable workers;
    /// assignment is first-caller-wins per task.
    struct ScriptedStore {
        assigned: StdMutex<HashSet<String>>,
        unreachable: StdMutex<bool>,
    }

    impl ScriptedStore {
        fn new() -> Self {
            Self {
                assigned: StdMutex::new(HashSet::new()),
                unreachable: StdMutex::new(false),
            }
        }

        fn ready(task_id: &str, priority: i64) -> ReadyTask {
            ReadyTask {
                task_id: task_id.to_string(),
                priority,
                created_at: Utc::now(),
                requirements: TaskRequirements::new(
                    vec!["rust"],
                    Vec::<&str>::new(),
                    Vec::<&str>::new(),
                    Vec::<&str>::new(),
                ),
            }
        }
    }

    #[async_trait]
    impl TaskStore for ScriptedStore {
        async fn get_ready_tasks(&self, limit: usize) -> Result<Vec<ReadyTask>> {
            if *self.unreachable.lock().unwrap() {
                return Err(OrchestratorError::UpstreamUnavailable(
                    "connection refused".to_string(),
                ));
            }
            let assigned = self.assigned.lock().unwrap();
            Ok(["t-1", "t-2", "t-3"]
                .iter()
                .filter(|id| !assigned.contains(**id))
                .take(limit)
                .enumerate()
                .map(|(i, id)| Self::ready(id, i as i64))
                .collect())
        }

        async fn get_idle_workers(&self) -> Result<Vec<IdleWorker>> {
            Ok((1..=5)
                .map(|n| IdleWorker {
                    agent_id: format!("w-{n}"),
                    name: format!("worker {n}"),
                    capabilities: CapabilitySet::new(vec!["rust"], vec![], 2),
                    assigned_count: 0,
                })
                .collect())
        }

        async fn assign_task_atomic(
            &self,
            task_id: &str,
            _agent_id: &str,
            _ctx: AssignmentContext,
        ) -> Result<Assignment> {
            // Artificially slow so concurrent passes overlap.
            tokio::time::sleep(Duration::from_millis(5)).await;
            let mut assigned = self.assigned.lock().unwrap();
            if assigned.insert(task_id.to_string()) {
                Ok(Assignment::Assigned)
            } else {
                Ok(Assignment::Conflict)
            }
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

    fn daemon_with(store: Arc<ScriptedStore>) -> DispatchDaemon {
        DispatchDaemon::new(store, Arc::new(ChannelHub::default()), DispatchConfig::default())
    }

    #[tokio::test]
    async fn every_task_is_assigned_to_exactly_one_worker() {
        let store = Arc::new(ScriptedStore::new());
        let daemon = Arc::new(daemon_with(store.clone()));

        // Two passes racing over the same tasks: conflicts must be skipped,
        // every task assigned exactly once, no errors escaping.
        let a = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run_once().await.unwrap() })
        };
        let b = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run_once().await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a + b, 3, "each task assigned exactly once across passes");
        assert_eq!(store.assigned.lock().unwrap().len(), 3);
        let stats = daemon.stats();
        assert_eq!(stats.assigned, 3);
    }

    #[tokio::test]
    async fn assignments_are_announced_on_the_tasks_channel() {
        let store = Arc::new(ScriptedStore::new());
        let hub = Arc::new(ChannelHub::default());
        let daemon =
            DispatchDaemon::new(store, hub.clone(), DispatchConfig::default());
        let mut rx = hub.subscribe();

        let assigned = daemon.run_once().await.unwrap();
        assert_eq!(assigned, 3);
        for _ in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.channel, Channel::Tasks);
            assert_eq!(event.payload["kind"], "task_assigned");
        }
    }

    #[tokio::test]
    async fn unreachable_store_surfaces_for_backoff() {
        let store = Arc::new(ScriptedStore::new());
        *store.unreachable.lock().unwrap() = true;
        let daemon = daemon_with(store);

        let err = daemon.run_once().await.unwrap_err();
        assert_eq!(err.kind(), "upstream_unavailable");
    }

    #[tokio::test]
    async fn start_and_stop_join_cleanly() {
        let store = Arc::new(ScriptedStore::new());
        let daemon = daemon_with(store.clone());
        daemon.start().await;
        daemon.poll_now();
        tokio::time::sleep(Duration::from_millis(100)).await;
        daemon.stop().await;
        assert_eq!(store.assigned.lock().unwrap().len(), 3);
    }
}
