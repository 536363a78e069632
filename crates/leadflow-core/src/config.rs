use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LeadflowError, Result};

/// Top-level leadflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dispatch: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound between scheduler ticks when nothing is due sooner.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Steps a cursor may execute in one run before it must wait.
    /// Guards against condition branches that loop backwards.
    #[serde(default = "default_max_steps_per_run")]
    pub max_steps_per_run: usize,
    /// Consecutive stage_change handoffs allowed in one settle pass.
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: usize,
    /// What moving a lead into its current stage does.
    #[serde(default)]
    pub reentry: ReentryPolicy,
    /// Capacity of the inbound message channel feeding the runner.
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_steps_per_run: default_max_steps_per_run(),
            max_handoffs: default_max_handoffs(),
            reentry: ReentryPolicy::default(),
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

fn default_poll_interval() -> u64 { 30 }
fn default_max_steps_per_run() -> usize { 100 }
fn default_max_handoffs() -> usize { 8 }
fn default_inbound_buffer() -> usize { 256 }

/// Policy for moving a lead into the stage it already occupies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReentryPolicy {
    /// No-op: the active cursor keeps running.
    #[default]
    Ignore,
    /// Stop the active cursor and start the stage's sequence again.
    Restart,
}

/// Retry policy for message dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total send attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. `~/` is expanded.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.leadflow/leadflow.db".to_string() }

/// HTTP dispatcher target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 { 10 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| LeadflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| LeadflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_attempts == 0 {
            return Err(LeadflowError::Config(
                "dispatch.max_attempts must be at least 1".into(),
            ));
        }
        if self.engine.max_steps_per_run == 0 {
            return Err(LeadflowError::Config(
                "engine.max_steps_per_run must be at least 1".into(),
            ));
        }
        if self.engine.poll_interval_secs == 0 {
            return Err(LeadflowError::Config(
                "engine.poll_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the database path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }
}

/// Default config location: `~/.leadflow/config.toml`.
pub fn home_config_path() -> Option<PathBuf> {
    dirs_home().map(|h| h.join(".leadflow").join("config.toml"))
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
