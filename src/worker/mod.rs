//! Instance worker: poll loop, batch dispatch and per-job execution.

pub mod agent;
pub mod dispatcher;
pub mod executor;

pub use agent::{shutdown_signal, Agent, RunExit};
pub use dispatcher::{BatchSummary, Dispatcher};
pub use executor::{JobExecutor, ReportClaim};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Process-wide worker state, passed explicitly to the loop and dispatcher.
///
/// The shutdown flag is set by the worker loop only. The in-flight registry
/// maps the ids of jobs whose containers may still exist to their report
/// claims, so shutdown can remove the containers and close the jobs.
pub struct AgentContext {
    instance_id: String,
    job_timeout: Duration,
    shutting_down: AtomicBool,
    in_flight: RwLock<HashMap<String, ReportClaim>>,
}

impl AgentContext {
    pub fn new(instance_id: impl Into<String>, job_timeout: Duration) -> Self {
        Self {
            instance_id: instance_id.into(),
            job_timeout,
            shutting_down: AtomicBool::new(false),
            in_flight: RwLock::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn track(&self, job_id: &str, claim: ReportClaim) {
        self.in_flight.write().insert(job_id.to_string(), claim);
    }

    pub fn untrack(&self, job_id: &str) {
        self.in_flight.write().remove(job_id);
    }

    /// Snapshot of job ids whose containers may still be running
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.in_flight.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// In-flight jobs with their report claims, sorted by job id
    pub fn in_flight_claims(&self) -> Vec<(String, ReportClaim)> {
        let mut claims: Vec<(String, ReportClaim)> = self
            .in_flight
            .read()
            .iter()
            .map(|(id, claim)| (id.clone(), claim.clone()))
            .collect();
        claims.sort_by(|a, b| a.0.cmp(&b.0));
        claims
    }
}
