//! Application configuration.
//!
//! Everything the pipeline treats as policy (limits, windows, thresholds,
//! which commands may run for real) lives here, is read once at startup and
//! then frozen into the components built from it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::security::{AllowlistEntry, MonitorConfig};
use crate::session::DEFAULT_LOG_CAPACITY;
use crate::shell::DEFAULT_ENV_ALLOWLIST;

/// Overrides `execution.allow_real_execution` when set to 1/0, true/false.
pub const ALLOW_REAL_ENV: &str = "TERMINAL_FORGE_ALLOW_REAL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_commands: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_commands: 10,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Global switch; a command also needs to be listed in `real_commands`.
    pub allow_real_execution: bool,
    pub real_commands: Vec<String>,
    pub timeout_ms: u64,
    /// Per-stream cap on captured output.
    pub max_output_bytes: usize,
    pub working_dir: Option<PathBuf>,
    pub env_allowlist: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            allow_real_execution: false,
            real_commands: Vec::new(),
            timeout_ms: 30_000,
            max_output_bytes: 50 * 1024,
            working_dir: None,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub rate_limit: RateLimitConfig,
    pub monitor: MonitorConfig,
    pub execution: ExecutionConfig,
    /// Reject every command from a session the monitor flags as suspicious.
    pub block_suspicious_sessions: bool,
    pub session_idle_secs: u64,
    /// Transcript entries kept per session.
    pub history_capacity: usize,
    /// Added to (or replacing) built-in allowlist entries.
    pub extra_commands: Vec<AllowlistEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            monitor: MonitorConfig::default(),
            execution: ExecutionConfig::default(),
            block_suspicious_sessions: true,
            session_idle_secs: 3600,
            history_capacity: DEFAULT_LOG_CAPACITY,
            extra_commands: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    /// Resolve the configuration for a run.
    ///
    /// An explicit path must exist. Without one, the default path is used
    /// when present, otherwise built-in defaults. The environment override is
    /// applied last.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match explicit {
            Some(path) => load(path)?,
            None => {
                let path = default_config_path();
                if path.is_file() {
                    load(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_override(std::env::var(ALLOW_REAL_ENV).ok().as_deref());
        Ok(config)
    }

    /// Apply the value of [`ALLOW_REAL_ENV`], if any.
    pub fn apply_env_override(&mut self, value: Option<&str>) {
        let Some(value) = value else {
            return;
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => self.execution.allow_real_execution = true,
            "0" | "false" | "no" | "off" | "" => self.execution.allow_real_execution = false,
            other => warn!("Ignoring {}={:?}: expected 1/0 or true/false", ALLOW_REAL_ENV, other),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(".terminal-forge").join("config.json")
}

pub fn load(path: &Path) -> anyhow::Result<AppConfig> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let config: AppConfig =
        serde_json::from_str(&raw).with_context(|| format!("Invalid config JSON at {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

pub fn save(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).with_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {} with {}", path.display(), tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::ExecMode;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.rate_limit.max_commands, 10);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(config.monitor.capacity, 1000);
        assert!(!config.execution.allow_real_execution);
        assert_eq!(config.execution.timeout(), Duration::from_secs(30));
        assert_eq!(config.execution.max_output_bytes, 51_200);
        assert!(config.execution.env_allowlist.iter().any(|n| n == "PATH"));
        assert!(config.block_suspicious_sessions);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "rate_limit": { "max_commands": 3 },
                "execution": { "allow_real_execution": true, "real_commands": ["echo"] },
                "extra_commands": [
                    { "command": "rustup", "allowed_args": ["show"], "mode": "real" }
                ]
            }"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.rate_limit.max_commands, 3);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert!(config.execution.allow_real_execution);
        assert_eq!(config.execution.real_commands, vec!["echo".to_string()]);
        assert_eq!(config.execution.timeout_ms, 30_000);
        assert_eq!(config.monitor.suspicious_threshold, 3);

        let extra = &config.extra_commands[0];
        assert_eq!(extra.command, "rustup");
        assert_eq!(extra.max_args, 10);
        assert_eq!(extra.mode, ExecMode::Real);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = AppConfig::default();
        config.session_idle_secs = 120;

        save(&path, &config).unwrap();
        assert_eq!(load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid config JSON"));
    }

    #[test]
    fn test_explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::resolve(Some(&dir.path().join("missing.json"))).is_err());
    }

    #[test]
    fn test_env_override() {
        let mut config = AppConfig::default();
        config.apply_env_override(Some("1"));
        assert!(config.execution.allow_real_execution);
        config.apply_env_override(Some("bogus"));
        assert!(config.execution.allow_real_execution);
        config.apply_env_override(Some("false"));
        assert!(!config.execution.allow_real_execution);
        config.apply_env_override(None);
        assert!(!config.execution.allow_real_execution);
    }
}
