// ABOUTME: Provider adapters describing how to invoke an LLM CLI binary.
// ABOUTME: Absence of a binary is reported by is_available(), never by a spawn-time surprise.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{OrchestratorError, Result};

/// An upstream LLM CLI the spawner can drive.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// The executable, resolved on PATH at spawn time.
    fn binary(&self) -> &str;

    /// Whether the binary can be found right now.
    fn is_available(&self) -> bool {
        binary_on_path(self.binary())
    }

    /// Arguments for headless mode: line-delimited JSON on both ends, no
    /// interactive permission prompts. The initial prompt is never an
    /// argument; it goes down stdin as the first JSON record.
    fn headless_args(&self, resume_upstream_id: Option<&str>) -> Vec<String>;

    /// Command line run inside the login shell for interactive mode.
    fn interactive_invocation(&self, resume_upstream_id: Option<&str>) -> String;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

fn binary_on_path(binary: &str) -> bool {
    let path = Path::new(binary);
    if path.components().count() > 1 {
        return path.is_file();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
}

/// The default provider: the Claude Code CLI.
pub struct ClaudeProvider {
    binary: String,
}

impl ClaudeProvider {
    pub fn new() -> Self {
        Self {
            binary: "claude".to_string(),
        }
    }

    /// Point at a specific executable (tests use scripted stand-ins).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for ClaudeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn headless_args(&self, resume_upstream_id: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if let Some(id) = resume_upstream_id {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        args
    }

    fn interactive_invocation(&self, resume_upstream_id: Option<&str>) -> String {
        match resume_upstream_id {
            Some(id) => format!("{} --resume {}", self.binary, id),
            None => self.binary.clone(),
        }
    }
}

/// Name-to-provider lookup built from configuration.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry with the built-in providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeProvider::new()));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "provider",
                id: name.to_string(),
            })
    }

    /// Providers whose binaries are currently reachable.
    pub fn available(&self) -> Vec<&'static str> {
        self.providers
            .values()
            .filter(|p| p.is_available())
            .map(|p| p.name())
            .collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
