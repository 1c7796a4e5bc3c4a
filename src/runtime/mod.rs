//! Pod runtimes that back sandboxes.
//!
//! The lifecycle manager only talks to the [`PodRuntime`] trait:
//! - `docker`: each pod container is a Docker container
//! - `simulated`: in-process pods, for tests and dry runs
//!
//! The runtime is selected via `[runtime].provider` in agent-sandbox.toml.

mod docker;
mod error;
mod simulated;

pub(crate) use docker::DockerRuntime;
pub(crate) use error::ProvisionError;
pub(crate) use simulated::SimulatedRuntime;
#[cfg(test)]
pub(crate) use simulated::SimResponse;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::resources::{PodHandle, PodTemplate};

/// Observed state of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PodState {
    /// Created but not serving yet.
    Pending,
    /// Every container is running.
    Running,
    /// A container exited or died.
    Failed { reason: String },
    /// The runtime has no such pod.
    Gone,
}

/// Creates and removes the pods behind sandboxes.
#[async_trait]
pub(crate) trait PodRuntime: Send + Sync {
    /// Returns the runtime name for display.
    fn name(&self) -> &'static str;

    /// Creates and starts the pod for sandbox `name`.
    ///
    /// Must be idempotent by name: a second call for a pod that already
    /// exists returns its handle instead of failing.
    async fn create_pod(&self, name: &str, template: &PodTemplate)
        -> Result<PodHandle, ProvisionError>;

    /// Reports the pod's current state.
    async fn pod_state(&self, handle: &PodHandle) -> Result<PodState, ProvisionError>;

    /// Removes the pod. Removing an absent pod succeeds.
    async fn delete_pod(&self, handle: &PodHandle) -> Result<(), ProvisionError>;

    /// Removes every pod this runtime created. Returns the number removed.
    async fn cleanup_orphaned(&self) -> Result<u32, ProvisionError>;
}

/// Supported runtimes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum RuntimeKind {
    /// Docker containers via the local daemon.
    #[default]
    Docker,
    /// In-process pods.
    Simulated,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "simulated" => Ok(Self::Simulated),
            _ => anyhow::bail!("Unknown runtime: '{s}'. Supported: docker, simulated"),
        }
    }
}

/// Builds the configured runtime.
pub(crate) fn build(kind: RuntimeKind, config: &RuntimeConfig) -> Result<Arc<dyn PodRuntime>> {
    let runtime: Arc<dyn PodRuntime> = match kind {
        RuntimeKind::Docker => Arc::new(DockerRuntime::connect(config.docker.clone())?),
        RuntimeKind::Simulated => Arc::new(SimulatedRuntime::new(config.simulated.startup_delay())),
    };
    Ok(runtime)
}
