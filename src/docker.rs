//! Container engine client for running jobs in isolated containers

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

/// Resource limits applied to a job container
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceProfile {
    /// Memory cap (e.g., "1024m") and CPU cap (1.0 = 1 CPU)
    Cpu { memory_limit: String, cpu_limit: f64 },
    /// Alternate container runtime exposing the GPUs (e.g., "nvidia")
    Gpu { runtime: String },
}

/// Everything needed to run one job container
#[derive(Clone, Debug)]
pub struct RunSpec {
    pub image: String,
    /// Container name, always the job id
    pub name: String,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub profile: ResourceProfile,
}

/// Output of a finished container
#[derive(Clone, Debug, Default)]
pub struct RunOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Operations the agent issues against the local container engine
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Fails when the engine daemon is unreachable
    async fn ping(&self) -> EngineResult<()>;

    /// Make the image available locally; a present image is a fast no-op.
    /// Returns the engine output for build logs.
    async fn ensure_image(&self, reference: &str) -> EngineResult<String>;

    /// Pull the image from its registry even if present locally
    async fn pull_image(&self, reference: &str) -> EngineResult<String>;

    /// Create, start and wait for a container, collecting its output
    async fn run_container(&self, spec: &RunSpec) -> EngineResult<RunOutput>;

    /// Kill and remove a container by name
    async fn remove_container(&self, name: &str) -> EngineResult<()>;

    async fn remove_image(&self, reference: &str) -> EngineResult<String>;
}

/// Docker implementation of [`ContainerEngine`]
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the local Docker daemon
    pub fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(Self { docker })
    }

    async fn pull(&self, reference: &str) -> EngineResult<String> {
        info!("Pulling image: {}", reference);

        let options = CreateImageOptions {
            from_image: reference,
            ..Default::default()
        };

        let mut logs = String::new();
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                        match info.id {
                            Some(id) => logs.push_str(&format!("{}: {}\n", id, status)),
                            None => logs.push_str(&format!("{}\n", status)),
                        }
                    }
                }
                Err(e) => {
                    logs.push_str(&format!("{}\n", e));
                    return Err(map_error("pull", e, logs));
                }
            }
        }

        info!("Image {} pulled successfully", reference);
        Ok(logs)
    }

    async fn wait(&self, name: &str) -> EngineResult<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(name, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as a wait error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_error("wait", e, String::new())),
            None => Err(EngineError::Failed {
                operation: "wait".to_string(),
                output: "container wait stream ended unexpectedly".to_string(),
            }),
        }
    }

    async fn logs(&self, name: &str) -> (String, String) {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stream = self.docker.logs(name, Some(options));

        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                Ok(_) => {}
                Err(e) => {
                    warn!("Error reading logs of {}: {}", name, e);
                    break;
                }
            }
        }

        (
            String::from_utf8_lossy(&stdout).to_string(),
            String::from_utf8_lossy(&stderr).to_string(),
        )
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        debug!("Connected to Docker daemon");
        Ok(())
    }

    async fn ensure_image(&self, reference: &str) -> EngineResult<String> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => {
                debug!("Image {} already exists", reference);
                Ok(format!("Image {} is up to date\n", reference))
            }
            Err(_) => self.pull(reference).await,
        }
    }

    async fn pull_image(&self, reference: &str) -> EngineResult<String> {
        self.pull(reference).await
    }

    async fn run_container(&self, spec: &RunSpec) -> EngineResult<RunOutput> {
        let host_config = match &spec.profile {
            ResourceProfile::Cpu {
                memory_limit,
                cpu_limit,
            } => HostConfig {
                memory: Some(parse_memory_limit(memory_limit)?),
                nano_cpus: Some((cpu_limit * 1_000_000_000.0) as i64),
                auto_remove: Some(false),
                ..Default::default()
            },
            ResourceProfile::Gpu { runtime } => HostConfig {
                runtime: Some(runtime.clone()),
                auto_remove: Some(false),
                ..Default::default()
            },
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| map_error("create container", e, String::new()))?;

        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error("start container", e, String::new()))?;

        info!("Started container: {}", spec.name);

        let exit_code = self.wait(&spec.name).await?;
        let (stdout, stderr) = self.logs(&spec.name).await;

        debug!(
            "Container {} exited with code {}, stdout len={}",
            spec.name,
            exit_code,
            stdout.len()
        );

        Ok(RunOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn remove_container(&self, name: &str) -> EngineResult<()> {
        if let Err(e) = self
            .docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await
        {
            debug!("Kill of {} skipped: {}", name, e);
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| map_error("remove container", e, String::new()))?;

        debug!("Removed container: {}", name);
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> EngineResult<String> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        let deleted = self
            .docker
            .remove_image(reference, Some(options), None)
            .await
            .map_err(|e| map_error("remove image", e, String::new()))?;

        let mut logs = String::new();
        for item in deleted {
            if let Some(untagged) = item.untagged {
                logs.push_str(&format!("Untagged: {}\n", untagged));
            }
            if let Some(removed) = item.deleted {
                logs.push_str(&format!("Deleted: {}\n", removed));
            }
        }

        info!("Removed image: {}", reference);
        Ok(logs)
    }
}

/// Map a bollard error, keeping 404s distinguishable
fn map_error(operation: &str, err: bollard::errors::Error, mut output: String) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        other => {
            if output.is_empty() {
                output = other.to_string();
            }
            EngineError::Failed {
                operation: operation.to_string(),
                output,
            }
        }
    }
}

/// Parse memory limit string (e.g., "2g", "512m") to bytes
pub fn parse_memory_limit(limit: &str) -> EngineResult<i64> {
    let limit = limit.trim().to_lowercase();
    let invalid = || EngineError::Failed {
        operation: "parse memory limit".to_string(),
        output: format!("Invalid memory limit: {}", limit),
    };

    let (digits, multiplier) = if let Some(num) = limit.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        (num, 1024)
    } else {
        (limit.as_str(), 1)
    };

    let n: i64 = digits.parse().map_err(|_| invalid())?;
    n.checked_mul(multiplier).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024m").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024k").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_limit("4096").unwrap(), 4096);
        assert!(parse_memory_limit("lots").is_err());
        assert!(parse_memory_limit("99999999999999g").is_err());
        assert!(parse_memory_limit(&i64::MAX.to_string()).is_ok());
    }

    #[test]
    fn test_map_error_not_found() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: j-1".to_string(),
        };
        assert!(map_error("remove container", err, String::new()).is_not_found());
    }

    #[test]
    fn test_map_error_keeps_collected_output() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "manifest unknown".to_string(),
        };
        let mapped = map_error("pull", err, "Pulling fs layer\n".to_string());
        assert_eq!(mapped.output(), "Pulling fs layer\n");
    }

    #[test]
    fn test_run_output_success() {
        let output = RunOutput {
            exit_code: 1,
            ..Default::default()
        };
        assert!(!output.success());
        assert!(RunOutput::default().success());
    }
}
