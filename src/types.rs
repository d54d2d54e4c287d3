//! Control-plane records consumed by the agent
//!
//! Enum discriminants match the integer codes the control-plane uses on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// JOBS
// ============================================================================

/// Job status as tracked by the control-plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum JobStatus {
    Created,
    InProgress,
    Succeeded,
    Failed,
    Timeout,
}

impl JobStatus {
    /// Terminal statuses are reported exactly once per job
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Timeout)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            Self::Created => next == Self::InProgress,
            Self::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

impl From<JobStatus> for u8 {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Created => 1,
            JobStatus::InProgress => 2,
            JobStatus::Succeeded => 3,
            JobStatus::Failed => 4,
            JobStatus::Timeout => 5,
        }
    }
}

impl TryFrom<u8> for JobStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Created),
            2 => Ok(Self::InProgress),
            3 => Ok(Self::Succeeded),
            4 => Ok(Self::Failed),
            5 => Ok(Self::Timeout),
            other => Err(format!("unknown job status code {}", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

fn default_job_status() -> JobStatus {
    JobStatus::Created
}

/// A unit of remote work assigned to this instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "job_uuid")]
    pub job_id: String,
    #[serde(default = "default_job_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub requires_gpu: bool,
    #[serde(rename = "image_registry_path")]
    pub image_reference: String,
    /// Code blob injected into the container environment
    #[serde(rename = "wrapped_code", default)]
    pub payload: String,
}

/// Jobs returned by a single poll
pub type Batch = Vec<Job>;

/// Partial update sent with `PATCH /jobs/{id}/`
///
/// Unset fields are left out of the body so the control-plane keeps its values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_logs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Terminal update stamped with the current time
    pub fn terminal(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            finished_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

/// Final result of one Execution Unit
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: JobStatus,
    pub build_logs: String,
    pub stdout: String,
    pub stderr: String,
    pub result: String,
}

impl Outcome {
    pub fn into_update(self) -> JobUpdate {
        JobUpdate {
            status: Some(self.status),
            build_logs: Some(self.build_logs),
            stdout: Some(self.stdout),
            stderr: Some(self.stderr),
            result: Some(self.result),
            finished_at: Some(Utc::now()),
        }
    }
}

// ============================================================================
// INSTANCES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum InstanceStatus {
    NotAvailable,
    Available,
}

impl From<InstanceStatus> for u8 {
    fn from(status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::NotAvailable => 1,
            InstanceStatus::Available => 2,
        }
    }
}

impl TryFrom<u8> for InstanceStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::NotAvailable),
            2 => Ok(Self::Available),
            other => Err(format!("unknown instance status code {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum InstanceType {
    Cpu,
    Gpu,
}

impl InstanceType {
    pub fn is_gpu(self) -> bool {
        self == Self::Gpu
    }

    /// Name used in user-facing validation messages
    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "STANDARD",
            Self::Gpu => "GPU",
        }
    }
}

impl From<InstanceType> for u8 {
    fn from(kind: InstanceType) -> Self {
        match kind {
            InstanceType::Cpu => 1,
            InstanceType::Gpu => 2,
        }
    }
}

impl TryFrom<u8> for InstanceType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Cpu),
            2 => Ok(Self::Gpu),
            other => Err(format!("unknown instance type code {}", other)),
        }
    }
}

/// This machine's remote identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(rename = "uuid")]
    pub instance_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub status: InstanceStatus,
    #[serde(rename = "type")]
    pub kind: InstanceType,
    #[serde(rename = "max_num_parallel_jobs", default = "default_parallel_jobs")]
    pub max_parallel_jobs: u32,
}

fn default_parallel_jobs() -> u32 {
    1
}

// ============================================================================
// IMAGES
// ============================================================================

/// Catalog entry for a runnable image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(rename = "registry_path")]
    pub reference: String,
    #[serde(default)]
    pub requires_gpu: bool,
    #[serde(default)]
    pub description: Option<String>,
}
