//! Shared state handed to every reconcile pass.
//!
//! All store and runtime calls go through here so each one is bounded by the
//! configured call timeout.

use std::future::Future;
use std::sync::Arc;

use super::backoff::Backoff;
use super::template_store::TemplateStore;
use crate::config::ControllerConfig;
use crate::resources::{PodHandle, PodTemplate};
use crate::runtime::{PodRuntime, PodState, ProvisionError};
use crate::store::{Store, StoreError, Stored};

pub(crate) struct Context {
    pub store: Arc<Store>,
    pub runtime: Arc<dyn PodRuntime>,
    pub settings: ControllerConfig,
}

impl Context {
    pub fn new(store: Arc<Store>, runtime: Arc<dyn PodRuntime>, settings: ControllerConfig) -> Self {
        Self {
            store,
            runtime,
            settings,
        }
    }

    pub fn templates(&self) -> TemplateStore<'_> {
        TemplateStore::new(self)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.settings.backoff_base(), self.settings.backoff_max())
    }

    async fn store_call<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let timeout = self.settings.call_timeout();
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| StoreError::timeout(timeout))?
    }

    async fn runtime_call<T>(
        &self,
        call: impl Future<Output = Result<T, ProvisionError>>,
    ) -> Result<T, ProvisionError> {
        let timeout = self.settings.call_timeout();
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ProvisionError::timeout(timeout))?
    }

    /// Reads an object, mapping absence to `None`.
    pub async fn get<T: Stored>(&self, name: &str) -> Result<Option<T>, StoreError> {
        match self.store_call(self.store.get::<T>(name)).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list<T: Stored>(&self) -> Result<Vec<T>, StoreError> {
        self.store_call(self.store.list::<T>()).await
    }

    pub async fn create<T: Stored>(&self, obj: T) -> Result<T, StoreError> {
        self.store_call(self.store.create(obj)).await
    }

    pub async fn replace_status<T: Stored>(&self, obj: &T) -> Result<T, StoreError> {
        self.store_call(self.store.replace_status(obj)).await
    }

    pub async fn delete<T: Stored>(&self, name: &str, version: Option<u64>) -> Result<T, StoreError> {
        self.store_call(self.store.delete::<T>(name, version)).await
    }

    pub async fn create_pod(
        &self,
        name: &str,
        template: &PodTemplate,
    ) -> Result<PodHandle, ProvisionError> {
        self.runtime_call(self.runtime.create_pod(name, template)).await
    }

    pub async fn pod_state(&self, handle: &PodHandle) -> Result<PodState, ProvisionError> {
        self.runtime_call(self.runtime.pod_state(handle)).await
    }

    pub async fn delete_pod(&self, handle: &PodHandle) -> Result<(), ProvisionError> {
        self.runtime_call(self.runtime.delete_pod(handle)).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the reconciler tests.

    use super::*;
    use crate::resources::{Container, PodMetadata, PodSpec, SandboxTemplate, SandboxTemplateSpec};
    use crate::resources::{ObjectMeta, SandboxTemplateStatus};
    use crate::runtime::SimulatedRuntime;
    use std::time::Duration;

    pub fn settings() -> ControllerConfig {
        ControllerConfig {
            workers: 2,
            pending_poll_interval_ms: 50,
            provision_poll_interval_ms: 10,
            call_timeout_secs: 5,
            backoff_base_ms: 1,
            backoff_max_secs: 1,
            ..ControllerConfig::default()
        }
    }

    pub fn harness(runtime: SimulatedRuntime) -> (Arc<Context>, Arc<SimulatedRuntime>) {
        let runtime = Arc::new(runtime);
        let dyn_runtime: Arc<dyn PodRuntime> = runtime.clone();
        let ctx = Context::new(Arc::new(Store::new()), dyn_runtime, settings());
        (Arc::new(ctx), runtime)
    }

    pub fn simulated() -> SimulatedRuntime {
        SimulatedRuntime::new(Duration::ZERO)
    }

    pub fn template(name: &str, image: &str) -> SandboxTemplate {
        SandboxTemplate {
            metadata: ObjectMeta::named(name),
            spec: SandboxTemplateSpec {
                pod_template: crate::resources::PodTemplate {
                    metadata: PodMetadata::default(),
                    spec: PodSpec {
                        containers: vec![Container {
                            name: "runtime".into(),
                            image: image.into(),
                            ..Default::default()
                        }],
                        restart_policy: None,
                    },
                },
            },
            status: SandboxTemplateStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::resources::SandboxWarmPool;
    use crate::runtime::{SimResponse, SimulatedRuntime};
    use std::time::Duration;

    #[tokio::test]
    async fn test_get_maps_missing_to_none() {
        let (ctx, _) = harness(simulated());
        assert!(ctx.get::<SandboxWarmPool>("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_errors_pass_through() {
        let (ctx, _) = harness(simulated());
        ctx.store
            .inject_failure(StoreError::unavailable("maintenance"));
        let err = ctx.list::<SandboxWarmPool>().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_call_times_out() {
        let runtime: Arc<dyn PodRuntime> = Arc::new(simulated());
        let store = Arc::new(Store::new().with_latency(Duration::from_secs(30)));
        let ctx = Context::new(store, runtime, settings());

        let err = ctx
            .create(SandboxWarmPool::new("p", "t", 1))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::timeout(Duration::from_secs(5)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_runtime_errors_pass_through() {
        let (ctx, runtime) = harness(SimulatedRuntime::scripted(
            Duration::ZERO,
            vec![SimResponse::Fail("daemon busy".into())],
        ));
        let t = template("python", "python:3.12");
        let err = ctx
            .create_pod("sb", &t.spec.pod_template)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(runtime.create_calls(), 1);
    }
}
