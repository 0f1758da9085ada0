// ABOUTME: Agent orchestration core - spawn, supervise, and route work to CLI-backed agents.
// ABOUTME: Event bus, spawner, session manager, shared-server pool, matcher, dispatch daemon.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod hub;
pub mod manager;
pub mod matcher;
pub mod ready;
pub mod server_pool;
pub mod session;
pub mod spawner;
pub mod store;
pub mod types;

pub use bus::{EventBus, EventStream};
pub use config::{DispatchConfig, OrchestratorConfig};
pub use dispatch::{DispatchDaemon, DispatchStatsSnapshot};
pub use error::{OrchestratorError, Result};
pub use event::{SessionEvent, SessionEventKind};
pub use hub::{Channel, ChannelEvent, ChannelHub};
pub use manager::{ResumeOptions, SessionManager, StartOptions};
pub use matcher::{CapabilitySet, TaskRequirements};
pub use ready::{check_ready_queue, ReadyQueueOptions, ReadyQueueReport};
pub use server_pool::{ServerConfig, ServerLauncher, ServerLease, ServerPool, UpstreamServer};
pub use session::{SessionHistoryEntry, SessionSnapshot, SessionStatus};
pub use spawner::{ClaudeProvider, Provider, ProviderRegistry, SessionHandle, SpawnOptions, Spawner};
pub use store::{
    AgentRecord, AgentSessionUpdate, Assignment, AssignmentContext, IdleWorker, ReadyTask,
    TaskRecord, TaskStatus, TaskStore,
};
pub use types::{AgentOrchestratorMeta, AgentRole, SessionMode, TaskOrchestratorMeta, WorkerMode};
