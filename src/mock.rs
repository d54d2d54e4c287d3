//! In-memory control-plane and container engine for tests
//!
//! Both mocks record every call so tests can assert on ordering and counts.

use crate::control_plane::ControlPlane;
use crate::docker::{ContainerEngine, RunOutput, RunSpec};
use crate::error::{ApiError, ApiResult, EngineError, EngineResult};
use crate::types::{
    Batch, Image, Instance, InstanceStatus, InstanceType, JobStatus, JobUpdate,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// CONTROL PLANE
// ============================================================================

/// Scripted response to one poll
#[derive(Clone, Debug)]
pub enum PollResponse {
    Jobs(Batch),
    /// HTTP status of a failed poll (404 maps to not-found)
    Error(u16),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ControlPlaneCall {
    GetInstance(String),
    StartInstance(String),
    Poll(String),
    StopInstance(String),
    PatchJob(String, JobUpdate),
    ListImages(Option<String>),
    AddImage(String, String),
    RemoveImage(String, String),
}

#[derive(Default)]
struct ControlPlaneState {
    calls: Vec<ControlPlaneCall>,
    polls: VecDeque<PollResponse>,
    start_error: Option<u16>,
    stop_error: Option<u16>,
    failing_patches: HashSet<(String, JobStatus)>,
    patch_delays: HashMap<JobStatus, Duration>,
    catalog: Vec<Image>,
    inventory: Vec<String>,
}

#[derive(Clone)]
pub struct MockControlPlane {
    instance: Instance,
    state: Arc<Mutex<ControlPlaneState>>,
}

impl MockControlPlane {
    pub fn new(instance_id: &str, kind: InstanceType) -> Self {
        Self {
            instance: Instance {
                instance_id: instance_id.to_string(),
                name: Some("test-instance".to_string()),
                status: InstanceStatus::NotAvailable,
                kind,
                max_parallel_jobs: 3,
            },
            state: Arc::new(Mutex::new(ControlPlaneState::default())),
        }
    }

    /// Queue responses for successive polls; once drained, polls return empty batches
    pub fn push_poll(&self, response: PollResponse) {
        self.state.lock().polls.push_back(response);
    }

    pub fn fail_start(&self, status: u16) {
        self.state.lock().start_error = Some(status);
    }

    pub fn fail_stop(&self, status: u16) {
        self.state.lock().stop_error = Some(status);
    }

    /// Make the patch that sets `status` on `job_id` fail with a 500
    pub fn fail_patch(&self, job_id: &str, status: JobStatus) {
        self.state
            .lock()
            .failing_patches
            .insert((job_id.to_string(), status));
    }

    /// Hold every patch that sets `status` for `delay` before answering
    pub fn delay_patch(&self, status: JobStatus, delay: Duration) {
        self.state.lock().patch_delays.insert(status, delay);
    }

    pub fn add_catalog_image(&self, reference: &str, requires_gpu: bool) {
        self.state.lock().catalog.push(Image {
            uuid: None,
            reference: reference.to_string(),
            requires_gpu,
            description: None,
        });
    }

    pub fn set_inventory(&self, references: &[&str]) {
        self.state.lock().inventory = references.iter().map(|r| r.to_string()).collect();
    }

    pub fn inventory(&self) -> Vec<String> {
        self.state.lock().inventory.clone()
    }

    pub fn calls(&self) -> Vec<ControlPlaneCall> {
        self.state.lock().calls.clone()
    }

    /// Statuses patched onto `job_id`, in order
    pub fn job_statuses(&self, job_id: &str) -> Vec<JobStatus> {
        self.patches(job_id)
            .into_iter()
            .filter_map(|update| update.status)
            .collect()
    }

    pub fn patches(&self, job_id: &str) -> Vec<JobUpdate> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ControlPlaneCall::PatchJob(id, update) if id == job_id => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    /// Last terminal update sent for `job_id`
    pub fn terminal_update(&self, job_id: &str) -> Option<JobUpdate> {
        self.patches(job_id)
            .into_iter()
            .filter(|u| u.status.map(JobStatus::is_terminal).unwrap_or(false))
            .last()
    }

    pub fn terminal_report_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| match call {
                ControlPlaneCall::PatchJob(_, update) => {
                    update.status.map(JobStatus::is_terminal).unwrap_or(false)
                }
                _ => false,
            })
            .count()
    }

    pub fn count(&self, matches: impl Fn(&ControlPlaneCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| matches(c)).count()
    }

    fn record(&self, call: ControlPlaneCall) {
        self.state.lock().calls.push(call);
    }
}

fn status_error(status: u16, what: &str) -> ApiError {
    if status == 404 {
        ApiError::NotFound(what.to_string())
    } else {
        ApiError::Status {
            status,
            body: format!("mock {} error", what),
        }
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn get_instance(&self, instance_id: &str) -> ApiResult<Instance> {
        self.record(ControlPlaneCall::GetInstance(instance_id.to_string()));
        if instance_id != self.instance.instance_id {
            return Err(ApiError::NotFound(format!("instance {}", instance_id)));
        }
        Ok(self.instance.clone())
    }

    async fn start_instance(&self, instance_id: &str) -> ApiResult<Instance> {
        self.record(ControlPlaneCall::StartInstance(instance_id.to_string()));
        if let Some(status) = self.state.lock().start_error {
            return Err(status_error(status, "start"));
        }
        Ok(Instance {
            status: InstanceStatus::Available,
            ..self.instance.clone()
        })
    }

    async fn poll_jobs(&self, instance_id: &str) -> ApiResult<Batch> {
        self.record(ControlPlaneCall::Poll(instance_id.to_string()));
        match self.state.lock().polls.pop_front() {
            Some(PollResponse::Jobs(jobs)) => Ok(jobs),
            Some(PollResponse::Error(status)) => Err(status_error(status, "ping")),
            None => Ok(Vec::new()),
        }
    }

    async fn stop_instance(&self, instance_id: &str) -> ApiResult<()> {
        self.record(ControlPlaneCall::StopInstance(instance_id.to_string()));
        match self.state.lock().stop_error {
            Some(status) => Err(status_error(status, "stop")),
            None => Ok(()),
        }
    }

    async fn patch_job(&self, job_id: &str, update: &JobUpdate) -> ApiResult<()> {
        self.record(ControlPlaneCall::PatchJob(job_id.to_string(), update.clone()));
        let delay = update
            .status
            .and_then(|s| self.state.lock().patch_delays.get(&s).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = update
            .status
            .map(|s| {
                self.state
                    .lock()
                    .failing_patches
                    .contains(&(job_id.to_string(), s))
            })
            .unwrap_or(false);
        if failing {
            return Err(status_error(500, "patch"));
        }
        Ok(())
    }

    async fn list_images(&self, instance_id: Option<&str>) -> ApiResult<Vec<Image>> {
        self.record(ControlPlaneCall::ListImages(instance_id.map(str::to_string)));
        let state = self.state.lock();
        match instance_id {
            None => Ok(state.catalog.clone()),
            Some(_) => Ok(state
                .inventory
                .iter()
                .map(|reference| {
                    state
                        .catalog
                        .iter()
                        .find(|image| &image.reference == reference)
                        .cloned()
                        .unwrap_or(Image {
                            uuid: None,
                            reference: reference.clone(),
                            requires_gpu: false,
                            description: None,
                        })
                })
                .collect()),
        }
    }

    async fn add_image(&self, instance_id: &str, reference: &str) -> ApiResult<()> {
        self.record(ControlPlaneCall::AddImage(
            instance_id.to_string(),
            reference.to_string(),
        ));
        self.state.lock().inventory.push(reference.to_string());
        Ok(())
    }

    async fn remove_image(&self, instance_id: &str, reference: &str) -> ApiResult<()> {
        self.record(ControlPlaneCall::RemoveImage(
            instance_id.to_string(),
            reference.to_string(),
        ));
        self.state.lock().inventory.retain(|r| r != reference);
        Ok(())
    }
}

// ============================================================================
// CONTAINER ENGINE
// ============================================================================

/// How a mocked container behaves when run
#[derive(Clone, Debug, Default)]
pub struct ContainerScript {
    pub delay: Duration,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// Never exit
    pub hang: bool,
    /// Panic inside the engine call
    pub panic: bool,
}

impl ContainerScript {
    pub fn success(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i64, stderr: &str) -> Self {
        Self {
            exit_code,
            stderr: stderr.to_string(),
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct EngineState {
    scripts: HashMap<String, ContainerScript>,
    images: HashSet<String>,
    failing_pulls: HashSet<String>,
    containers: HashSet<String>,
    runs: Vec<RunSpec>,
    pulls: Vec<String>,
    removed_containers: Vec<String>,
    removed_images: Vec<String>,
    offline: bool,
}

#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaviour of the container named `name` (the job id)
    pub fn script(&self, name: &str, script: ContainerScript) {
        self.state.lock().scripts.insert(name.to_string(), script);
    }

    pub fn add_local_image(&self, reference: &str) {
        self.state.lock().images.insert(reference.to_string());
    }

    pub fn fail_pull(&self, reference: &str) {
        self.state.lock().failing_pulls.insert(reference.to_string());
    }

    pub fn set_offline(&self) {
        self.state.lock().offline = true;
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state.lock().images.contains(reference)
    }

    /// Containers created and not yet removed
    pub fn live_containers(&self) -> HashSet<String> {
        self.state.lock().containers.clone()
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.state.lock().runs.clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().pulls.clone()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.state.lock().removed_containers.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state.lock().removed_images.clone()
    }

    fn do_pull(&self, reference: &str) -> EngineResult<String> {
        let mut state = self.state.lock();
        state.pulls.push(reference.to_string());
        if state.failing_pulls.contains(reference) {
            return Err(EngineError::Failed {
                operation: "pull".to_string(),
                output: format!("Error response from daemon: manifest for {} not found\n", reference),
            });
        }
        state.images.insert(reference.to_string());
        Ok(format!("Pulling from {}\nStatus: Downloaded newer image\n", reference))
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> EngineResult<()> {
        if self.state.lock().offline {
            return Err(EngineError::Connection("daemon not running".to_string()));
        }
        Ok(())
    }

    async fn ensure_image(&self, reference: &str) -> EngineResult<String> {
        if self.has_image(reference) {
            return Ok(format!("Image {} is up to date\n", reference));
        }
        self.do_pull(reference)
    }

    async fn pull_image(&self, reference: &str) -> EngineResult<String> {
        self.do_pull(reference)
    }

    async fn run_container(&self, spec: &RunSpec) -> EngineResult<RunOutput> {
        let script = {
            let mut state = self.state.lock();
            state.runs.push(spec.clone());
            if !state.images.contains(&spec.image) {
                return Err(EngineError::NotFound(format!("No such image: {}", spec.image)));
            }
            if !state.containers.insert(spec.name.clone()) {
                return Err(EngineError::Failed {
                    operation: "create container".to_string(),
                    output: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
                });
            }
            state.scripts.get(&spec.name).cloned().unwrap_or_default()
        };

        if script.panic {
            panic!("engine crashed while running {}", spec.name);
        }
        if script.hang {
            futures::future::pending::<()>().await;
        }
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        Ok(RunOutput {
            exit_code: script.exit_code,
            stdout: script.stdout,
            stderr: script.stderr,
        })
    }

    async fn remove_container(&self, name: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.removed_containers.push(name.to_string());
        if state.containers.remove(name) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("No such container: {}", name)))
        }
    }

    async fn remove_image(&self, reference: &str) -> EngineResult<String> {
        let mut state = self.state.lock();
        state.removed_images.push(reference.to_string());
        if state.images.remove(reference) {
            Ok(format!("Untagged: {}\n", reference))
        } else {
            Err(EngineError::NotFound(format!("No such image: {}", reference)))
        }
    }
}
