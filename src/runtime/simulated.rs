//! In-process pod runtime.
//!
//! Pods are entries in a map that report `Running` once a configurable
//! startup delay has passed. Scripted responses make provisioning fail on
//! demand, and call counters let tests assert how often the runtime was hit.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{PodRuntime, PodState, ProvisionError};
use crate::resources::{PodHandle, PodTemplate};

/// Scripted outcome of one `create_pod` call.
#[derive(Debug, Clone)]
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) enum SimResponse {
    /// Create the pod normally.
    Succeed,
    /// Refuse the spec (not retryable).
    Reject(String),
    /// Fail the call (retryable).
    Fail(String),
    /// Create the pod, which then reports `Failed`.
    CrashOnStart(String),
}

#[derive(Debug)]
struct SimPod {
    started: Instant,
    crashed: Option<String>,
}

/// A runtime whose pods live in memory.
#[derive(Debug)]
pub(crate) struct SimulatedRuntime {
    pods: Mutex<HashMap<String, SimPod>>,
    startup_delay: Duration,
    /// Responses to `create_pod` in order. Cycles; empty means always succeed.
    script: Arc<Vec<SimResponse>>,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl SimulatedRuntime {
    /// Creates a runtime whose pods become ready after `startup_delay`.
    pub fn new(startup_delay: Duration) -> Self {
        Self {
            pods: Mutex::new(HashMap::new()),
            startup_delay,
            script: Arc::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    /// Creates a runtime that answers `create_pod` from `script`.
    #[cfg(test)]
    pub fn scripted(startup_delay: Duration, script: Vec<SimResponse>) -> Self {
        Self {
            script: Arc::new(script),
            ..Self::new(startup_delay)
        }
    }

    /// Number of times `create_pod` was called.
    #[cfg(test)]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of times `delete_pod` was called.
    #[cfg(test)]
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Number of live pods.
    #[cfg(test)]
    pub fn pod_count(&self) -> usize {
        self.pods().len()
    }

    fn pods(&self) -> std::sync::MutexGuard<'_, HashMap<String, SimPod>> {
        self.pods.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_response(&self) -> SimResponse {
        let count = self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.is_empty() {
            SimResponse::Succeed
        } else {
            self.script[count % self.script.len()].clone()
        }
    }
}

#[async_trait]
impl PodRuntime for SimulatedRuntime {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn create_pod(
        &self,
        name: &str,
        template: &PodTemplate,
    ) -> Result<PodHandle, ProvisionError> {
        let response = self.next_response();
        let handle = PodHandle {
            id: name.to_string(),
            containers: template
                .spec
                .containers
                .iter()
                .map(|c| format!("{name}-{}", c.name))
                .collect(),
        };

        if self.pods().contains_key(name) {
            return Ok(handle);
        }

        template.validate().map_err(ProvisionError::rejected)?;

        let crashed = match response {
            SimResponse::Succeed => None,
            SimResponse::Reject(message) => return Err(ProvisionError::rejected(message)),
            SimResponse::Fail(message) => return Err(ProvisionError::failed(message)),
            SimResponse::CrashOnStart(reason) => Some(reason),
        };

        debug!(pod = %name, "simulated pod created");
        self.pods().insert(
            name.to_string(),
            SimPod {
                started: Instant::now(),
                crashed,
            },
        );
        Ok(handle)
    }

    async fn pod_state(&self, handle: &PodHandle) -> Result<PodState, ProvisionError> {
        let pods = self.pods();
        let state = match pods.get(&handle.id) {
            None => PodState::Gone,
            Some(SimPod {
                crashed: Some(reason),
                ..
            }) => PodState::Failed {
                reason: reason.clone(),
            },
            Some(pod) if pod.started.elapsed() >= self.startup_delay => PodState::Running,
            Some(_) => PodState::Pending,
        };
        Ok(state)
    }

    async fn delete_pod(&self, handle: &PodHandle) -> Result<(), ProvisionError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.pods().remove(&handle.id).is_some() {
            debug!(pod = %handle.id, "simulated pod removed");
        }
        Ok(())
    }

    async fn cleanup_orphaned(&self) -> Result<u32, ProvisionError> {
        let mut pods = self.pods();
        let removed = u32::try_from(pods.len()).unwrap_or(u32::MAX);
        pods.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Container, PodMetadata, PodSpec};

    fn template() -> PodTemplate {
        PodTemplate {
            metadata: PodMetadata::default(),
            spec: PodSpec {
                containers: vec![Container {
                    name: "runtime".into(),
                    image: "python:3.12".into(),
                    ..Default::default()
                }],
                restart_policy: None,
            },
        }
    }

    #[tokio::test]
    async fn test_pod_runs_after_startup_delay() {
        let runtime = SimulatedRuntime::new(Duration::ZERO);
        let handle = runtime.create_pod("sb-1", &template()).await.unwrap();
        assert_eq!(handle.containers, vec!["sb-1-runtime".to_string()]);
        assert_eq!(runtime.pod_state(&handle).await.unwrap(), PodState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_pending_before_startup_delay() {
        let runtime = SimulatedRuntime::new(Duration::from_secs(5));
        let handle = runtime.create_pod("sb-1", &template()).await.unwrap();
        assert_eq!(runtime.pod_state(&handle).await.unwrap(), PodState::Pending);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(runtime.pod_state(&handle).await.unwrap(), PodState::Running);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_by_name() {
        let runtime = SimulatedRuntime::new(Duration::ZERO);
        runtime.create_pod("sb-1", &template()).await.unwrap();
        runtime.create_pod("sb-1", &template()).await.unwrap();
        assert_eq!(runtime.pod_count(), 1);
        assert_eq!(runtime.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_delete_absent_pod_succeeds() {
        let runtime = SimulatedRuntime::new(Duration::ZERO);
        let handle = PodHandle::for_sandbox("never-created");
        assert!(runtime.delete_pod(&handle).await.is_ok());
        assert_eq!(runtime.pod_state(&handle).await.unwrap(), PodState::Gone);
        assert_eq!(runtime.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_responses_cycle() {
        let runtime = SimulatedRuntime::scripted(
            Duration::ZERO,
            vec![
                SimResponse::Fail("busy".into()),
                SimResponse::Succeed,
            ],
        );

        let first = runtime.create_pod("a", &template()).await.unwrap_err();
        assert!(first.is_retryable());
        runtime.create_pod("b", &template()).await.unwrap();
        assert!(runtime.create_pod("c", &template()).await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_spec_is_not_retryable() {
        let runtime =
            SimulatedRuntime::scripted(Duration::ZERO, vec![SimResponse::Reject("bad".into())]);
        let err = runtime.create_pod("a", &template()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(runtime.pod_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_template_is_rejected() {
        let runtime = SimulatedRuntime::new(Duration::ZERO);
        let mut bad = template();
        bad.spec.containers.clear();
        let err = runtime.create_pod("a", &bad).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_crash_on_start_reports_failed() {
        let runtime = SimulatedRuntime::scripted(
            Duration::ZERO,
            vec![SimResponse::CrashOnStart("exit 1".into())],
        );
        let handle = runtime.create_pod("a", &template()).await.unwrap();
        assert_eq!(
            runtime.pod_state(&handle).await.unwrap(),
            PodState::Failed {
                reason: "exit 1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_cleanup_orphaned_removes_all() {
        let runtime = SimulatedRuntime::new(Duration::ZERO);
        runtime.create_pod("a", &template()).await.unwrap();
        runtime.create_pod("b", &template()).await.unwrap();
        assert_eq!(runtime.cleanup_orphaned().await.unwrap(), 2);
        assert_eq!(runtime.pod_count(), 0);
    }

    #[test]
    fn test_simulated_runtime_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SimulatedRuntime>();
    }
}
