//! Compute marketplace node agent
//!
//! Registers this machine as an instance with the control-plane, polls it for
//! jobs and runs each job in its own container, reporting the outcome back.
//!
//! ## Module Structure
//!
//! - `types`: wire types (Job, JobStatus, Instance, Image)
//! - `error`: error taxonomy for the clients and the worker
//! - `config`: agent configuration and the local data directory
//! - `control_plane`: control-plane REST client
//! - `docker`: container engine client
//! - `output`: return value framing in container output
//! - `images`: image cache manager
//! - `worker`: worker loop, dispatcher and execution units
//! - `mock`: in-memory control-plane and engine for tests (`testkit` feature)

pub mod config;
pub mod control_plane;
pub mod docker;
pub mod error;
pub mod images;
#[cfg(any(test, feature = "testkit"))]
pub mod mock;
pub mod output;
pub mod types;
pub mod worker;

pub use config::{AgentConfig, ExecutionConfig, LocalState, DEFAULT_JOB_TIMEOUT_SECS};
pub use control_plane::{ControlPlane, HttpControlPlane};
pub use docker::{ContainerEngine, DockerEngine, ResourceProfile, RunOutput, RunSpec};
pub use error::{AgentError, AgentResult, ApiError, ApiResult, EngineError, EngineResult};
pub use images::{ImageCache, UpdateSummary};
pub use output::{split_output, SplitOutput};
pub use types::{Batch, Image, Instance, InstanceStatus, InstanceType, Job, JobStatus, JobUpdate, Outcome};
pub use worker::{shutdown_signal, Agent, AgentContext, BatchSummary, Dispatcher, JobExecutor, RunExit};
