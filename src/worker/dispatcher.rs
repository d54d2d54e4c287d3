//! Batch dispatcher
//!
//! Marks every job of a poll batch IN_PROGRESS, launches one Execution Unit
//! per accepted job and supervises all of them at once, each against its own
//! deadline. A unit still running at its deadline is aborted, its container
//! killed and removed, and the job reported TIMEOUT. `dispatch_batch` returns
//! only once every accepted job has a terminal report.

use super::executor::{JobExecutor, ReportClaim};
use super::AgentContext;
use crate::control_plane::ControlPlane;
use crate::docker::ContainerEngine;
use crate::error::AgentResult;
use crate::types::{Batch, JobStatus, JobUpdate};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-batch tally of job outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Jobs whose IN_PROGRESS hand-off failed and were never run
    pub skipped: usize,
    /// Jobs whose terminal report could not be delivered
    pub report_errors: usize,
}

impl BatchSummary {
    /// Count one supervised job; `None` is a terminal report that failed
    fn record(&mut self, reported: Option<JobStatus>) {
        match reported {
            Some(JobStatus::Succeeded) => self.succeeded += 1,
            Some(JobStatus::Failed) => self.failed += 1,
            Some(JobStatus::Timeout) => self.timed_out += 1,
            Some(JobStatus::Created | JobStatus::InProgress) => {}
            None => self.report_errors += 1,
        }
    }

    /// Jobs that reached a terminal outcome locally
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed + self.timed_out + self.report_errors
    }
}

/// Local Execution Handle for one launched job.
///
/// Dropping the handle aborts the unit, so an abandoned batch never leaves
/// detached tasks behind.
struct ExecutionHandle {
    job_id: String,
    started_at: Instant,
    deadline: Instant,
    claim: ReportClaim,
    task: JoinHandle<AgentResult<JobStatus>>,
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Dispatcher {
    executor: Arc<JobExecutor>,
    control_plane: Arc<dyn ControlPlane>,
    engine: Arc<dyn ContainerEngine>,
    context: Arc<AgentContext>,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<JobExecutor>,
        control_plane: Arc<dyn ControlPlane>,
        engine: Arc<dyn ContainerEngine>,
        context: Arc<AgentContext>,
    ) -> Self {
        Self {
            executor,
            control_plane,
            engine,
            context,
        }
    }

    pub async fn dispatch_batch(&self, jobs: Batch, timeout: Duration) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            if self.context.is_shutting_down() {
                warn!(job_id = %job.job_id, "Shutting down, job not started");
                summary.skipped += 1;
                continue;
            }

            // Hand-off point: once IN_PROGRESS no other instance picks the job up
            if let Err(e) = self
                .control_plane
                .patch_job(&job.job_id, &JobUpdate::status(JobStatus::InProgress))
                .await
            {
                error!(job_id = %job.job_id, "Could not mark job in progress, skipping: {}", e);
                summary.skipped += 1;
                continue;
            }

            let started_at = Instant::now();
            let deadline = started_at + timeout;
            let claim = ReportClaim::until(deadline);
            self.context.track(&job.job_id, claim.clone());

            let executor = self.executor.clone();
            let unit_claim = claim.clone();
            let job_id = job.job_id.clone();
            let task = tokio::spawn(async move { executor.run(job, unit_claim).await });

            handles.push(ExecutionHandle {
                job_id,
                started_at,
                deadline,
                claim,
                task,
            });
        }

        // Every deadline is armed at once; no job waits on a sibling's report
        let mut supervisors: FuturesUnordered<_> = handles
            .into_iter()
            .map(|handle| self.supervise(handle))
            .collect();

        while let Some((job_id, reported)) = supervisors.next().await {
            summary.record(reported);
            self.context.untrack(&job_id);
        }

        summary
    }

    async fn supervise(&self, mut handle: ExecutionHandle) -> (String, Option<JobStatus>) {
        let reported = self.await_unit(&mut handle).await;
        (handle.job_id.clone(), reported)
    }

    async fn await_unit(&self, handle: &mut ExecutionHandle) -> Option<JobStatus> {
        match tokio::time::timeout_at(handle.deadline, &mut handle.task).await {
            // Finished on the deadline tick, outcome dropped unreported
            Ok(Ok(_)) if handle.claim.try_claim() => self.report_timeout(handle).await,
            Ok(joined) => self.record_joined(handle, joined).await,
            Err(_) if handle.claim.try_claim() => self.report_timeout(handle).await,
            Err(_) => {
                // The unit claimed the report before its deadline; let it finish
                debug!(job_id = %handle.job_id, "Deadline passed during report, waiting");
                let joined = (&mut handle.task).await;
                self.record_joined(handle, joined).await
            }
        }
    }

    /// Timeout path; the caller holds the claim
    async fn report_timeout(&self, handle: &ExecutionHandle) -> Option<JobStatus> {
        warn!(
            job_id = %handle.job_id,
            "Job timed out after {:?}",
            handle.started_at.elapsed()
        );
        handle.task.abort();
        self.kill_container(&handle.job_id).await;

        match self
            .control_plane
            .patch_job(&handle.job_id, &JobUpdate::terminal(JobStatus::Timeout))
            .await
        {
            Ok(()) => Some(JobStatus::Timeout),
            Err(e) => {
                error!(job_id = %handle.job_id, "Could not report timeout: {}", e);
                None
            }
        }
    }

    async fn record_joined(
        &self,
        handle: &ExecutionHandle,
        joined: Result<AgentResult<JobStatus>, tokio::task::JoinError>,
    ) -> Option<JobStatus> {
        match joined {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                error!(job_id = %handle.job_id, "Could not report job result: {}", e);
                None
            }
            Err(join_error) => {
                error!(job_id = %handle.job_id, "Execution unit crashed: {}", join_error);
                if !handle.claim.try_claim() {
                    // Crashed after claiming: the report may never have gone out
                    return None;
                }
                self.kill_container(&handle.job_id).await;

                let mut update = JobUpdate::terminal(JobStatus::Failed);
                update.stderr = Some(format!("Execution unit crashed: {}", join_error));
                match self.control_plane.patch_job(&handle.job_id, &update).await {
                    Ok(()) => Some(JobStatus::Failed),
                    Err(e) => {
                        error!(job_id = %handle.job_id, "Could not report failure: {}", e);
                        None
                    }
                }
            }
        }
    }

    async fn kill_container(&self, job_id: &str) {
        if let Err(e) = self.engine.remove_container(job_id).await {
            debug!(job_id = %job_id, "Container removal skipped: {}", e);
        } else {
            info!(job_id = %job_id, "Removed container of interrupted job");
        }
    }
}
