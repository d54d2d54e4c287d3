//! Job Execution Unit
//!
//! Owns the lifecycle of exactly one job:
//! 1. Ensure the image is present (engine output becomes the build logs)
//! 2. Run the container named after the job id with the payload injected
//! 3. Split the return value out of stdout
//! 4. Classify the outcome by exit code
//! 5. Remove the container
//! 6. Report the outcome to the control-plane

use crate::config::ExecutionConfig;
use crate::control_plane::ControlPlane;
use crate::docker::{ContainerEngine, ResourceProfile, RunSpec};
use crate::error::AgentResult;
use crate::output::split_output;
use crate::types::{Job, JobStatus, Outcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Right to send a job's terminal report.
///
/// Shared between the Execution Unit, the Dispatcher's timeout path and
/// shutdown cleanup; only the first successful claim may report. A claim
/// carrying a deadline refuses the unit once that deadline has passed, so a
/// late finish never overrides the TIMEOUT.
#[derive(Clone, Debug, Default)]
pub struct ReportClaim {
    taken: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl ReportClaim {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn until(deadline: Instant) -> Self {
        Self {
            taken: Arc::default(),
            deadline: Some(deadline),
        }
    }

    pub fn try_claim(&self) -> bool {
        !self.taken.swap(true, Ordering::SeqCst)
    }

    /// Claim on behalf of the unit; fails once the deadline is reached
    pub fn try_claim_in_time(&self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => false,
            _ => self.try_claim(),
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.taken.load(Ordering::SeqCst)
    }
}

pub struct JobExecutor {
    engine: Arc<dyn ContainerEngine>,
    control_plane: Arc<dyn ControlPlane>,
    execution: ExecutionConfig,
}

impl JobExecutor {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        control_plane: Arc<dyn ControlPlane>,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            engine,
            control_plane,
            execution,
        }
    }

    pub fn resource_profile(&self, job: &Job) -> ResourceProfile {
        if job.requires_gpu {
            ResourceProfile::Gpu {
                runtime: self.execution.gpu_runtime.clone(),
            }
        } else {
            ResourceProfile::Cpu {
                memory_limit: self.execution.memory_limit.clone(),
                cpu_limit: self.execution.cpu_limit,
            }
        }
    }

    /// Run the job to completion without reporting it
    pub async fn execute(&self, job: &Job) -> Outcome {
        let build_logs = match self.engine.ensure_image(&job.image_reference).await {
            Ok(logs) => logs,
            Err(e) => {
                // Recorded here, the run below decides the status
                warn!(job_id = %job.job_id, "Image {} not ready: {}", job.image_reference, e);
                e.output()
            }
        };

        let spec = RunSpec {
            image: job.image_reference.clone(),
            name: job.job_id.clone(),
            env: vec![format!("{}={}", self.execution.payload_env, job.payload)],
            profile: self.resource_profile(job),
        };

        let outcome = match self.engine.run_container(&spec).await {
            Ok(output) => {
                // Both streams may carry the frame; stdout takes precedence
                let out = split_output(&output.stdout);
                let err = split_output(&output.stderr);

                if output.success() {
                    Outcome {
                        status: JobStatus::Succeeded,
                        build_logs,
                        stdout: out.text,
                        stderr: err.text,
                        result: out.result.or(err.result).unwrap_or_default(),
                    }
                } else {
                    error!(job_id = %job.job_id, exit_code = output.exit_code, "Job has failed");
                    if job.requires_gpu {
                        warn!("GPU instances should keep their parallel job limit below 3");
                    }
                    Outcome {
                        status: JobStatus::Failed,
                        build_logs,
                        stdout: out.text,
                        stderr: err.text,
                        result: String::new(),
                    }
                }
            }
            Err(e) => {
                error!(job_id = %job.job_id, "Container could not run: {}", e);
                Outcome {
                    status: JobStatus::Failed,
                    build_logs,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    result: String::new(),
                }
            }
        };

        // The container may never have been created
        if let Err(e) = self.engine.remove_container(&job.job_id).await {
            debug!(job_id = %job.job_id, "Container cleanup skipped: {}", e);
        }

        outcome
    }

    /// Execute the job and send its terminal report.
    ///
    /// A failed report is returned to the caller; the job's remote status may
    /// then stay IN_PROGRESS.
    pub async fn run(&self, job: Job, claim: ReportClaim) -> AgentResult<JobStatus> {
        info!(job_id = %job.job_id, "Starting job");
        let outcome = self.execute(&job).await;
        let status = outcome.status;

        if !claim.try_claim_in_time() {
            debug!(job_id = %job.job_id, "Terminal status reported elsewhere, dropping outcome");
            return Ok(status);
        }

        self.control_plane
            .patch_job(&job.job_id, &outcome.into_update())
            .await?;

        info!(job_id = %job.job_id, status = %status, "Job finished");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ContainerScript, MockControlPlane, MockEngine};
    use crate::types::InstanceType;
    use std::time::Duration;

    const IMAGE: &str = "sharedcloud/web-crawling-python36:latest";

    fn job(id: &str, requires_gpu: bool) -> Job {
        Job {
            job_id: id.to_string(),
            status: JobStatus::InProgress,
            requires_gpu,
            image_reference: IMAGE.to_string(),
            payload: "print('hi')".to_string(),
        }
    }

    fn executor(engine: &MockEngine, cp: &MockControlPlane) -> JobExecutor {
        JobExecutor::new(
            Arc::new(engine.clone()),
            Arc::new(cp.clone()),
            ExecutionConfig::default(),
        )
    }

    #[test]
    fn test_report_claim_is_exclusive() {
        let claim = ReportClaim::new();
        let other = claim.clone();
        assert!(claim.try_claim());
        assert!(!other.try_claim());
        assert!(other.is_claimed());
    }

    #[test]
    fn test_resource_profiles_are_exclusive() {
        let exec = executor(&MockEngine::new(), &MockControlPlane::new("i", InstanceType::Cpu));
        assert_eq!(
            exec.resource_profile(&job("a", false)),
            ResourceProfile::Cpu {
                memory_limit: "1024m".to_string(),
                cpu_limit: 1.0
            }
        );
        assert_eq!(
            exec.resource_profile(&job("b", true)),
            ResourceProfile::Gpu {
                runtime: "nvidia".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_success_extracts_result() {
        let engine = MockEngine::new();
        let cp = MockControlPlane::new("i", InstanceType::Cpu);
        engine.script("j-1", ContainerScript::success("Hello World 1\nRESP|42|END\n"));

        let outcome = executor(&engine, &cp).execute(&job("j-1", false)).await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.result, "42");
        assert_eq!(outcome.stdout, "Hello World 1\n");
        assert!(outcome.build_logs.contains("Pulling"));

        let runs = engine.runs();
        assert_eq!(runs[0].name, "j-1");
        assert_eq!(runs[0].env, vec!["CODE=print('hi')".to_string()]);
        assert!(engine.live_containers().is_empty());
    }

    #[tokio::test]
    async fn test_present_image_is_not_pulled() {
        let engine = MockEngine::new();
        engine.add_local_image(IMAGE);
        let cp = MockControlPlane::new("i", InstanceType::Cpu);

        let outcome = executor(&engine, &cp).execute(&job("j-1", false)).await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert!(engine.pulls().is_empty());
        assert!(outcome.build_logs.contains("up to date"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_with_stderr() {
        let engine = MockEngine::new();
        let cp = MockControlPlane::new("i", InstanceType::Cpu);
        engine.script("j-1", ContainerScript::failure(1, "boom\n"));

        let outcome = executor(&engine, &cp).execute(&job("j-1", false)).await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.stderr.contains("boom"));
        assert_eq!(outcome.result, "");
    }

    #[tokio::test]
    async fn test_failed_marker_is_not_a_result() {
        let engine = MockEngine::new();
        let cp = MockControlPlane::new("i", InstanceType::Cpu);
        let mut script = ContainerScript::failure(2, "trace");
        script.stdout = "RESP|7|END\n".to_string();
        engine.script("j-1", script);

        let outcome = executor(&engine, &cp).execute(&job("j-1", false)).await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.result, "");
    }

    #[tokio::test]
    async fn test_result_frame_on_stderr() {
        let engine = MockEngine::new();
        let cp = MockControlPlane::new("i", InstanceType::Cpu);
        let mut script = ContainerScript::success("plain\n");
        script.stderr = "warning\nRESP|{\"n\": 3}|END\n".to_string();
        engine.script("j-1", script);

        let outcome = executor(&engine, &cp).execute(&job("j-1", false)).await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.result, "{\"n\": 3}");
        assert_eq!(outcome.stderr, "warning\n");
        assert_eq!(outcome.stdout, "plain\n");
    }

    #[tokio::test]
    async fn test_stdout_frame_wins_over_stderr() {
        let engine = MockEngine::new();
        let cp = MockControlPlane::new("i", InstanceType::Cpu);
        let mut script = ContainerScript::success("RESP|out|END\n");
        script.stderr = "RESP|err|END\n".to_string();
        engine.script("j-1", script);

        let outcome = executor(&engine, &cp).execute(&job("j-1", false)).await;
        assert_eq!(outcome.result, "out");
        assert_eq!(outcome.stderr, "");
    }

    #[tokio::test]
    async fn test_pull_failure_is_reported_inline() {
        let engine = MockEngine::new();
        engine.fail_pull(IMAGE);
        let cp = MockControlPlane::new("i", InstanceType::Cpu);

        let outcome = executor(&engine, &cp).execute(&job("j-1", false)).await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.build_logs.contains("manifest"));
        assert!(outcome.stderr.contains("No such image"));
        // Removal of the never-created container was attempted and swallowed
        assert_eq!(engine.removed_containers(), vec!["j-1".to_string()]);
    }

    #[tokio::test]
    async fn test_run_reports_once() {
        let engine = MockEngine::new();
        let cp = MockControlPlane::new("i", InstanceType::Cpu);
        engine.script("j-1", ContainerScript::success("RESP|7|END"));

        let status = executor(&engine, &cp)
            .run(job("j-1", false), ReportClaim::new())
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Succeeded);
        assert_eq!(cp.job_statuses("j-1"), vec![JobStatus::Succeeded]);
        let update = cp.terminal_update("j-1").unwrap();
        assert_eq!(update.result.as_deref(), Some("7"));
        assert!(update.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_run_skips_report_when_claim_taken() {
        let engine = MockEngine::new();
        let cp = MockControlPlane::new("i", InstanceType::Cpu);
        let claim = ReportClaim::new();
        assert!(claim.try_claim());

        executor(&engine, &cp)
            .run(job("j-1", false), claim)
            .await
            .unwrap();
        assert!(cp.job_statuses("j-1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_after_deadline_does_not_report() {
        let engine = MockEngine::new();
        let cp = MockControlPlane::new("i", InstanceType::Cpu);
        engine.script("j-1", ContainerScript::success("RESP|7|END").after(Duration::from_secs(3)));
        let claim = ReportClaim::until(Instant::now() + Duration::from_secs(2));

        executor(&engine, &cp)
            .run(job("j-1", false), claim.clone())
            .await
            .unwrap();

        assert!(cp.job_statuses("j-1").is_empty());
        // The timeout path can still take the report
        assert!(claim.try_claim());
    }

    #[tokio::test]
    async fn test_claim_in_time_before_deadline() {
        let claim = ReportClaim::until(Instant::now() + Duration::from_secs(60));
        assert!(claim.try_claim_in_time());
        assert!(!claim.try_claim());
    }

    #[tokio::test]
    async fn test_run_surfaces_report_failure() {
        let engine = MockEngine::new();
        let cp = MockControlPlane::new("i", InstanceType::Cpu);
        cp.fail_patch("j-1", JobStatus::Succeeded);

        let result = executor(&engine, &cp)
            .run(job("j-1", false), ReportClaim::new())
            .await;
        assert!(result.is_err());
    }
}
