//! Configuration management for Backspace
//!
//! Settings are read from `backspace.toml` when present, fall back to
//! defaults otherwise, and are then overridden by a handful of environment
//! variables (`SANDBOX_DIR`, `MAX_REPO_SIZE_MB`, `DEFAULT_MODEL`,
//! `OLLAMA_BASE_URL`, `BACKSPACE_ADDR`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{BackspaceError, Result};

/// Default config file name
pub const CONFIG_FILE: &str = "backspace.toml";

const MIB: u64 = 1024 * 1024;

/// Top-level Backspace configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackspaceConfig {
    /// Workspace location and global quotas
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Per-job defaults
    #[serde(default)]
    pub jobs: JobDefaults,

    /// Progress event retention
    #[serde(default)]
    pub events: EventConfig,

    /// Inference backend
    #[serde(default)]
    pub model: ModelConfig,

    /// Publishing
    #[serde(default)]
    pub github: GitHubConfig,

    /// HTTP transport
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Directory under which per-job workspaces are created
    #[serde(default = "default_sandbox_root")]
    pub root: PathBuf,

    /// Quota for one workspace when the job does not set one
    #[serde(default = "default_quota_bytes")]
    pub default_quota_bytes: u64,

    /// Sum of all live workspace quotas
    #[serde(default = "default_total_budget_bytes")]
    pub total_budget_bytes: u64,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Workspace directories older than this with no live job are reaped
    #[serde(default = "default_orphan_max_age_secs")]
    pub orphan_max_age_secs: u64,

    /// Files agents may never touch, relative to the workspace root
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Upper bound on one generator call
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Per validation command, unless the command sets its own
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// How long a cancelled job may take to wind down
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Finished jobs (status, report, events) are forgotten after this long
    #[serde(default = "default_finished_ttl_secs")]
    pub finished_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Events kept per job for late subscribers
    #[serde(default = "default_retention")]
    pub retention: usize,
}

/// Supported inference backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelBackend {
    Ollama,
    OpenAi,
}

impl std::fmt::Display for ModelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ollama => write!(f, "ollama"),
            Self::OpenAi => write!(f, "openai"),
        }
    }
}

impl std::str::FromStr for ModelBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            _ => Err(format!("Unknown model backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_backend")]
    pub backend: ModelBackend,

    /// Model name passed to the backend
    #[serde(default = "default_model")]
    pub name: String,

    #[serde(default = "default_model_base_url")]
    pub base_url: String,

    /// Environment variable containing the API key (OpenAI-compatible backends)
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_github_api")]
    pub api_base: String,

    /// Environment variable containing the access token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Accept local paths and `file://` URLs from HTTP clients
    #[serde(default)]
    pub allow_local_sources: bool,
}

// Default value providers
fn default_sandbox_root() -> PathBuf {
    std::env::temp_dir().join("backspace-sandbox")
}

fn default_quota_bytes() -> u64 {
    100 * MIB
}

fn default_total_budget_bytes() -> u64 {
    2048 * MIB
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_orphan_max_age_secs() -> u64 {
    3600
}

fn default_protected_paths() -> Vec<String> {
    vec![
        ".git".to_string(),
        ".env".to_string(),
        ".secrets".to_string(),
    ]
}

fn default_retry_budget() -> u32 {
    3
}

fn default_deadline_secs() -> u64 {
    900
}

fn default_attempt_timeout_secs() -> u64 {
    300
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_cancel_grace_ms() -> u64 {
    2000
}

fn default_finished_ttl_secs() -> u64 {
    3600
}

fn default_retention() -> usize {
    1024
}

fn default_backend() -> ModelBackend {
    ModelBackend::Ollama
}

fn default_model() -> String {
    "codellama".to_string()
}

fn default_model_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_addr() -> String {
    "127.0.0.1:8000".to_string()
}

impl BackspaceConfig {
    /// Load configuration from `path` (or `./backspace.toml`) or use defaults,
    /// then apply environment overrides
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content).map_err(|e| {
                BackspaceError::Config(format!(
                    "Failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else if path.is_some() {
            return Err(BackspaceError::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        } else {
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from environment variables
    ///
    /// `lookup` is injected so tests need not touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("SANDBOX_DIR").filter(|v| !v.is_empty()) {
            self.sandbox.root = PathBuf::from(dir);
        }
        if let Some(mb) = lookup("MAX_REPO_SIZE_MB").filter(|v| !v.is_empty()) {
            let mb: u64 = mb.trim().parse().map_err(|_| {
                BackspaceError::Config(format!("MAX_REPO_SIZE_MB is not a number: {}", mb))
            })?;
            self.sandbox.default_quota_bytes = mb * MIB;
        }
        if let Some(model) = lookup("DEFAULT_MODEL").filter(|v| !v.is_empty()) {
            self.model.name = model;
        }
        if let Some(url) = lookup("OLLAMA_BASE_URL").filter(|v| !v.is_empty()) {
            self.model.base_url = url;
        }
        if let Some(addr) = lookup("BACKSPACE_ADDR").filter(|v| !v.is_empty()) {
            self.server.addr = addr;
        }
        Ok(())
    }

    /// Write default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&Self::default()).map_err(|e| {
            BackspaceError::Config(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl JobDefaults {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn finished_ttl(&self) -> Duration {
        Duration::from_secs(self.finished_ttl_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
            default_quota_bytes: default_quota_bytes(),
            total_budget_bytes: default_total_budget_bytes(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            orphan_max_age_secs: default_orphan_max_age_secs(),
            protected_paths: default_protected_paths(),
        }
    }
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            deadline_secs: default_deadline_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            cancel_grace_ms: default_cancel_grace_ms(),
            finished_ttl_secs: default_finished_ttl_secs(),
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            name: default_model(),
            base_url: default_model_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: default_github_api(),
            token_env: default_token_env(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            allow_local_sources: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BackspaceConfig::default();
        assert_eq!(config.sandbox.default_quota_bytes, 100 * MIB);
        assert_eq!(config.jobs.retry_budget, 3);
        assert_eq!(config.events.retention, 1024);
        assert_eq!(config.model.backend, ModelBackend::Ollama);
        assert_eq!(config.server.addr, "127.0.0.1:8000");
        assert!(!config.server.allow_local_sources);
        assert_eq!(config.jobs.finished_ttl(), Duration::from_secs(3600));
        assert!(config.sandbox.protected_paths.contains(&".git".to_string()));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[jobs]\nretry_budget = 5\n\n[model]\nbackend = \"openai\"\nname = \"gpt-4o-mini\"\n",
        )
        .unwrap();

        let config = BackspaceConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.jobs.retry_budget, 5);
        assert_eq!(config.jobs.deadline_secs, 900);
        assert_eq!(config.model.backend, ModelBackend::OpenAi);
        assert_eq!(config.sandbox.max_concurrent_jobs, 4);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let temp = TempDir::new().unwrap();
        let result = BackspaceConfig::load_or_default(Some(&temp.path().join("nope.toml")));
        assert!(matches!(result, Err(BackspaceError::Config(_))));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(&path, "[jobs\nretry_budget = ").unwrap();
        let result = BackspaceConfig::load_or_default(Some(&path));
        assert!(matches!(result, Err(BackspaceError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SANDBOX_DIR", "/srv/sandbox"),
            ("MAX_REPO_SIZE_MB", "25"),
            ("DEFAULT_MODEL", "deepseek-coder"),
            ("BACKSPACE_ADDR", "0.0.0.0:9000"),
        ]
        .into_iter()
        .collect();

        let mut config = BackspaceConfig::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.sandbox.root, PathBuf::from("/srv/sandbox"));
        assert_eq!(config.sandbox.default_quota_bytes, 25 * MIB);
        assert_eq!(config.model.name, "deepseek-coder");
        assert_eq!(config.model.base_url, "http://localhost:11434");
        assert_eq!(config.server.addr, "0.0.0.0:9000");
    }

    #[test]
    fn test_bad_size_override() {
        let mut config = BackspaceConfig::default();
        let result = config.apply_env_overrides(|k| {
            (k == "MAX_REPO_SIZE_MB").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_write_default_roundtrips() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conf").join(CONFIG_FILE);
        BackspaceConfig::write_default(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: BackspaceConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed.jobs.cancel_grace_ms, 2000);
        assert_eq!(parsed.github.token_env, "GITHUB_TOKEN");
    }
}
