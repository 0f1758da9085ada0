// ABOUTME: Orchestrator configuration with TOML layering.
// ABOUTME: Precedence: explicit path > .elemental/orchestrator.toml > ~/.config/elemental/.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Floor for the init handshake timeout; callers may raise it per call.
pub const MIN_INIT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Provider name resolved through the registry ("claude" by default).
    pub provider: String,
    /// Init handshake deadline for headless spawns, clamped to >= 5s.
    pub init_timeout_secs: u64,
    /// Grace window between soft shutdown and force kill.
    pub grace_timeout_secs: u64,
    /// Deadline for a single stdin write under pipe back-pressure.
    pub write_timeout_secs: u64,
    /// Per-subscriber event buffer depth.
    pub subscriber_buffer: usize,
    /// Interactive terminal dimensions.
    pub pty_rows: u16,
    pub pty_cols: u16,
    /// Workspace root forwarded to spawned agents as ELEMENTAL_ROOT.
    pub workspace_root: Option<PathBuf>,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Seconds between polls when idle.
    pub tick_secs: u64,
    /// Max ready tasks fetched per pass.
    pub batch_size: usize,
    /// Deadline per store call.
    pub store_timeout_secs: u64,
    /// Ceiling for the unreachable-store back-off.
    pub max_backoff_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider: "claude".to_string(),
            init_timeout_secs: 120,
            grace_timeout_secs: 5,
            write_timeout_secs: 5,
            subscriber_buffer: 64,
            pty_rows: 30,
            pty_cols: 120,
            workspace_root: None,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            batch_size: 16,
            store_timeout_secs: 30,
            max_backoff_secs: 60,
        }
    }
}

impl OrchestratorConfig {
    /// Load with the standard precedence. `ELEMENTAL_ROOT` overrides the
    /// configured workspace root.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_path(explicit) {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading orchestrator config");
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("failed to parse config file: {}", path.display()))?
            }
            None => Self::default(),
        };

        if let Some(root) = std::env::var_os("ELEMENTAL_ROOT") {
            config.workspace_root = Some(PathBuf::from(root));
        }
        config.init_timeout_secs = config.init_timeout_secs.max(MIN_INIT_TIMEOUT_SECS);
        config.subscriber_buffer = config.subscriber_buffer.max(1);
        Ok(config)
    }

    fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(cwd) = std::env::current_dir() {
            let project = cwd.join(".elemental").join("orchestrator.toml");
            if project.exists() {
                return Some(project);
            }
        }
        let global = dirs::config_dir()?
            .join("elemental")
            .join("orchestrator.toml");
        global.exists().then_some(global)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs.max(MIN_INIT_TIMEOUT_SECS))
    }

    /// Per-call override, still clamped to the floor.
    pub fn clamp_init_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(d) => d.max(Duration::from_secs(MIN_INIT_TIMEOUT_SECS)),
            None => self.init_timeout(),
        }
    }

    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.grace_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl DispatchConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}
