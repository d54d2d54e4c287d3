//! Worker loop
//!
//! Startup, the poll-dispatch cycle and orderly shutdown. The loop only ever
//! ends with an error; a termination signal is turned into
//! [`AgentError::Interrupted`] and goes through the same cleanup path.

use super::dispatcher::Dispatcher;
use super::executor::JobExecutor;
use super::AgentContext;
use crate::config::AgentConfig;
use crate::control_plane::ControlPlane;
use crate::docker::ContainerEngine;
use crate::error::{AgentError, AgentResult, ApiError, EngineError};
use crate::types::{JobStatus, JobUpdate};
use crate::images::ImageCache;
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Why the worker loop ended and whether the instance was marked stopped
#[derive(Debug)]
pub struct RunExit {
    pub cause: AgentError,
    pub stopped_remotely: bool,
}

impl RunExit {
    /// The loop only ends on an error, a signal included, so this is always 1
    pub fn exit_code(&self) -> i32 {
        1
    }
}

const INTERRUPTED_STDERR: &str = "Instance stopped before the job finished";

pub struct Agent {
    control_plane: Arc<dyn ControlPlane>,
    engine: Arc<dyn ContainerEngine>,
    config: AgentConfig,
    context: Arc<AgentContext>,
}

impl Agent {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        engine: Arc<dyn ContainerEngine>,
        config: AgentConfig,
        instance_id: &str,
        job_timeout: Duration,
    ) -> Self {
        Self {
            control_plane,
            engine,
            config,
            context: Arc::new(AgentContext::new(instance_id, job_timeout)),
        }
    }

    pub fn context(&self) -> Arc<AgentContext> {
        self.context.clone()
    }

    /// Run until an instance-level error or until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> RunExit
    where
        F: Future<Output = ()>,
    {
        let started = AtomicBool::new(false);

        let cause = tokio::select! {
            result = self.serve(&started) => match result {
                Ok(never) => match never {},
                Err(e) => e,
            },
            _ = shutdown => AgentError::Interrupted,
        };

        self.context.begin_shutdown();
        match &cause {
            AgentError::Interrupted => info!("Shutting down instance {}", self.context.instance_id()),
            other => error!("Worker stopped: {}", other),
        }

        if !started.load(Ordering::SeqCst) {
            return RunExit {
                cause,
                stopped_remotely: false,
            };
        }

        self.cleanup().await;

        let stopped_remotely = match self
            .control_plane
            .stop_instance(self.context.instance_id())
            .await
        {
            Ok(()) => {
                info!("Instance {} stopped", self.context.instance_id());
                true
            }
            Err(e) => {
                error!("Failed to stop instance: {}", e);
                false
            }
        };

        RunExit {
            cause,
            stopped_remotely,
        }
    }

    async fn serve(&self, started: &AtomicBool) -> AgentResult<Infallible> {
        let instance_id = self.context.instance_id().to_string();

        self.engine.ping().await.map_err(|e| {
            EngineError::Connection(format!(
                "Is the Docker daemon running in your machine? ({})",
                e.output()
            ))
        })?;

        for image in &self.config.execution.dependency_images {
            if let Err(e) = self.engine.ensure_image(image).await {
                warn!("Could not pull dependency image {}: {}", image, e);
            }
        }

        let instance = self
            .control_plane
            .start_instance(&instance_id)
            .await
            .map_err(|e| self.instance_error(e))?;
        started.store(true, Ordering::SeqCst);
        info!(
            "Instance {} started ({}, up to {} parallel jobs)",
            instance.name.as_deref().unwrap_or(&instance_id),
            instance.kind.label(),
            instance.max_parallel_jobs
        );

        let images = ImageCache::new(
            self.control_plane.clone(),
            self.engine.clone(),
            instance_id.clone(),
        );
        match images.update_all().await {
            Ok(summary) if !summary.failed.is_empty() => {
                warn!("{} images could not be updated", summary.failed.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Could not update images: {}", e),
        }

        let executor = Arc::new(JobExecutor::new(
            self.engine.clone(),
            self.control_plane.clone(),
            self.config.execution.clone(),
        ));
        let dispatcher = Dispatcher::new(
            executor,
            self.control_plane.clone(),
            self.engine.clone(),
            self.context.clone(),
        );

        info!("Waiting for jobs...");
        loop {
            let jobs = self
                .control_plane
                .poll_jobs(&instance_id)
                .await
                .map_err(|e| self.instance_error(e))?;

            if jobs.is_empty() {
                debug!("No jobs received");
            } else {
                info!("Received {} jobs", jobs.len());
                let summary = dispatcher
                    .dispatch_batch(jobs, self.context.job_timeout())
                    .await;
                info!(
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    timed_out = summary.timed_out,
                    skipped = summary.skipped,
                    report_errors = summary.report_errors,
                    "Batch finished"
                );
            }

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    fn instance_error(&self, err: ApiError) -> AgentError {
        if err.is_not_found() {
            AgentError::InstanceNotFound(self.context.instance_id().to_string())
        } else {
            err.into()
        }
    }

    /// Remove job containers still registered and the auxiliary containers.
    /// Jobs nobody reported yet are closed as FAILED. Every failure is swallowed.
    async fn cleanup(&self) {
        for (job_id, claim) in self.context.in_flight_claims() {
            self.remove_container(&job_id).await;

            if !claim.try_claim() {
                continue;
            }
            let mut update = JobUpdate::terminal(JobStatus::Failed);
            update.stderr = Some(INTERRUPTED_STDERR.to_string());
            match self.control_plane.patch_job(&job_id, &update).await {
                Ok(()) => info!(job_id = %job_id, "Job reported FAILED on shutdown"),
                Err(e) => warn!(job_id = %job_id, "Failed to report job on shutdown: {}", e),
            }
            self.context.untrack(&job_id);
        }

        for name in &self.config.execution.auxiliary_containers {
            self.remove_container(name).await;
        }
    }

    async fn remove_container(&self, name: &str) {
        match self.engine.remove_container(name).await {
            Ok(()) => info!("Removed container {}", name),
            Err(e) => debug!("Container {} not removed: {}", name, e),
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await;

    info!("Received shutdown signal");
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        futures::future::pending::<()>().await;
    }
}
