// ABOUTME: Refcounted sharing of an embedded upstream provider process.
// ABOUTME: Concurrent acquires during startup all await one Shared future and settle together.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};

/// A running upstream server shared by many sessions.
///
/// The contract is `close()` only; there is deliberately no model-listing
/// helper here.
#[async_trait]
pub trait UpstreamServer: Send + Sync {
    fn endpoint(&self) -> String;
    async fn close(&self) -> Result<()>;
}

/// Launch parameters for an upstream server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<(String, String)>,
}

/// Starts the actual process; injected so tests can script startups.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, key: &str, config: &ServerConfig) -> Result<Arc<dyn UpstreamServer>>;
}

type StartupFuture =
    Shared<BoxFuture<'static, std::result::Result<Arc<dyn UpstreamServer>, String>>>;

#[derive(Default)]
struct Lease {
    refcount: usize,
    handle: Option<Arc<dyn UpstreamServer>>,
    pending: Option<StartupFuture>,
}

/// Per-key refcounted leases over upstream servers.
///
/// Quiescent invariant (no startup in flight): refcount > 0 iff a handle
/// exists. During a startup, refcounts are speculative and are rolled back
/// if the startup fails.
pub struct ServerPool {
    launcher: Arc<dyn ServerLauncher>,
    leases: Mutex<HashMap<String, Lease>>,
}

impl ServerPool {
    pub fn new(launcher: Arc<dyn ServerLauncher>) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            leases: Mutex::new(HashMap::new()),
        })
    }

    /// Acquire a lease on the server for `key`, starting it if nobody has.
    ///
    /// Callers that arrive during a startup share its outcome: all succeed
    /// with the same handle or all fail together.
    pub async fn acquire(self: &Arc<Self>, key: &str, config: &ServerConfig) -> Result<ServerLease> {
        let startup: StartupFuture = {
            let mut leases = self.leases.lock().await;
            let lease = leases.entry(key.to_string()).or_default();
            lease.refcount += 1;

            if let Some(handle) = &lease.handle {
                debug!(key, refcount = lease.refcount, "sharing live upstream server");
                return Ok(ServerLease::new(self.clone(), key, handle.clone()));
            }
            match &lease.pending {
                Some(pending) => pending.clone(),
                None => {
                    info!(key, "starting upstream server");
                    let launcher = self.launcher.clone();
                    let launch_key = key.to_string();
                    let launch_config = config.clone();
                    let fut = async move {
                        launcher
                            .launch(&launch_key, &launch_config)
                            .await
                            .map_err(|e| e.to_string())
                    }
                    .boxed()
                    .shared();
                    lease.pending = Some(fut.clone());
                    fut
                }
            }
        };

        match startup.await {
            Ok(handle) => {
                let mut leases = self.leases.lock().await;
                if let Some(lease) = leases.get_mut(key) {
                    if lease.handle.is_none() {
                        lease.handle = Some(handle.clone());
                    }
                    lease.pending = None;
                }
                Ok(ServerLease::new(self.clone(), key, handle))
            }
            Err(message) => {
                // Roll back the speculative +1 taken at entry.
                let mut leases = self.leases.lock().await;
                if let Some(lease) = leases.get_mut(key) {
                    lease.refcount = lease.refcount.saturating_sub(1);
                    lease.pending = None;
                    if lease.refcount == 0 && lease.handle.is_none() {
                        leases.remove(key);
                    }
                }
                Err(OrchestratorError::SpawnFailure(format!(
                    "upstream server startup failed: {}",
                    message
                )))
            }
        }
    }

    async fn release_key(&self, key: &str) {
        let to_close = {
            let mut leases = self.leases.lock().await;
            let Some(lease) = leases.get_mut(key) else {
                return;
            };
            lease.refcount = lease.refcount.saturating_sub(1);
            if lease.refcount == 0 {
                let handle = lease.handle.take();
                leases.remove(key);
                handle
            } else {
                debug!(key, refcount = lease.refcount, "released shared server");
                None
            }
        };
        if let Some(handle) = to_close {
            info!(key, "last lease released, closing upstream server");
            if let Err(e) = handle.close().await {
                warn!(key, error = %e, "upstream server close failed");
            }
        }
    }

    pub async fn refcount(&self, key: &str) -> usize {
        self.leases
            .lock()
            .await
            .get(key)
            .map(|l| l.refcount)
            .unwrap_or(0)
    }

    pub async fn has_handle(&self, key: &str) -> bool {
        self.leases
            .lock()
            .await
            .get(key)
            .map(|l| l.handle.is_some())
            .unwrap_or(false)
    }
}

/// Scoped lease: holds the handle, releases on `release()` or on drop, on
/// every exit path.
pub struct ServerLease {
    pool: Arc<ServerPool>,
    key: String,
    handle: Arc<dyn UpstreamServer>,
    released: AtomicBool,
}

impl std::fmt::Debug for ServerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLease")
            .field("key", &self.key)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl ServerLease {
    fn new(pool: Arc<ServerPool>, key: &str, handle: Arc<dyn UpstreamServer>) -> Self {
        Self {
            pool,
            key: key.to_string(),
            handle,
            released: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &Arc<dyn UpstreamServer> {
        &self.handle
    }

    pub fn endpoint(&self) -> String {
        self.handle.endpoint()
    }

    /// Release explicitly; preferred over drop so close errors are awaited
    /// in-line.
    pub async fn release(self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.pool.release_key(&self.key).await;
        }
    }
}

impl Drop for ServerLease {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            let pool = self.pool.clone();
            let key = self.key.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { pool.release_key(&key).await });
            } else {
                warn!(key = %key, "server lease dropped outside a runtime; leaking refcount");
            }
        }
    }
}
