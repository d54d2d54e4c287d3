//! Agent Configuration
//!
//! Defines the configuration for the node agent including:
//! - Control-plane endpoint and polling cadence
//! - Container resource profiles
//! - Location of the local identity and token files

use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONTROL_PLANE_URL: &str = "https://sharedcloud.io";
pub const DATA_DIR_NAME: &str = ".node-agent";
pub const CONFIG_FILE_NAME: &str = "agent.toml";
pub const INSTANCE_FILE_NAME: &str = "instance_config";
pub const TOKEN_FILE_NAME: &str = "client_config";

/// Default per-job timeout (30 minutes)
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 1800;

/// Complete agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the control-plane API
    pub control_plane_url: String,
    /// Pause between two polls
    pub poll_interval_secs: u64,
    /// Per-request timeout for control-plane calls
    pub request_timeout_secs: u64,
    /// Container execution settings
    pub execution: ExecutionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_plane_url: DEFAULT_CONTROL_PLANE_URL.to_string(),
            poll_interval_secs: 5,
            request_timeout_secs: 60,
            execution: ExecutionConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load `agent.toml` from the data directory, falling back to defaults
    pub fn load(data_dir: &Path) -> AgentResult<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: AgentConfig = toml::from_str(&contents)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Container execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Memory cap for CPU jobs (e.g., "1024m")
    pub memory_limit: String,
    /// CPU cap for CPU jobs (1.0 = 1 CPU)
    pub cpu_limit: f64,
    /// Docker runtime used for GPU jobs
    pub gpu_runtime: String,
    /// Environment variable that carries the job payload
    pub payload_env: String,
    /// Images pulled by `download-dependencies` and at startup
    pub dependency_images: Vec<String>,
    /// Auxiliary containers removed on shutdown
    pub auxiliary_containers: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            memory_limit: "1024m".to_string(),
            cpu_limit: 1.0,
            gpu_runtime: "nvidia".to_string(),
            payload_env: "CODE".to_string(),
            dependency_images: vec!["sharedcloud/sharedcloud-tunnel-client".to_string()],
            auxiliary_containers: vec![
                "sharedcloud-instance-tunnel".to_string(),
                "sharedcloud-session".to_string(),
                "sharedcloud-session-tunnel".to_string(),
            ],
        }
    }
}

/// Files kept in the per-user data directory
#[derive(Debug, Clone)]
pub struct LocalState {
    data_dir: PathBuf,
}

impl LocalState {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// `~/.node-agent`
    pub fn default_dir() -> AgentResult<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| AgentError::Config("Could not determine home directory".to_string()))?;
        Ok(home.join(DATA_DIR_NAME))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn instance_file(&self) -> PathBuf {
        self.data_dir.join(INSTANCE_FILE_NAME)
    }

    pub fn token_file(&self) -> PathBuf {
        self.data_dir.join(TOKEN_FILE_NAME)
    }

    /// Instance id written by the registration flow
    pub fn instance_id(&self) -> AgentResult<String> {
        read_trimmed(&self.instance_file())
            .ok_or_else(|| AgentError::Config("Instance not found in this computer".to_string()))
    }

    /// Auth token written by the login flow
    pub fn token(&self) -> AgentResult<String> {
        read_trimmed(&self.token_file()).ok_or_else(|| {
            AgentError::Config("You seem to be logged out. Please log in first".to_string())
        })
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.execution.memory_limit, "1024m");
        assert_eq!(config.execution.payload_env, "CODE");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(dir.path()).unwrap();
        assert_eq!(config.control_plane_url, DEFAULT_CONTROL_PLANE_URL);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "poll_interval_secs = 2\n\n[execution]\ncpu_limit = 2.5\n",
        )
        .unwrap();

        let config = AgentConfig::load(dir.path()).unwrap();
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.execution.cpu_limit, 2.5);
        assert_eq!(config.execution.memory_limit, "1024m");
        assert_eq!(config.request_timeout_secs, 60);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "poll_interval_secs = \"x\"").unwrap();
        assert!(matches!(
            AgentConfig::load(dir.path()),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_local_state_reads_trimmed_values() {
        let dir = tempfile::tempdir().unwrap();
        let state = LocalState::new(dir.path());
        std::fs::write(state.instance_file(), "8b8b6cc2\n").unwrap();
        std::fs::write(state.token_file(), "  secret ").unwrap();

        assert_eq!(state.instance_id().unwrap(), "8b8b6cc2");
        assert_eq!(state.token().unwrap(), "secret");
    }

    #[test]
    fn test_local_state_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = LocalState::new(dir.path());

        let err = state.instance_id().unwrap_err();
        assert!(err.to_string().contains("Instance not found"));
        let err = state.token().unwrap_err();
        assert!(err.to_string().contains("logged out"));
    }
}
