//! Docker-backed pod runtime.
//!
//! A pod is a set of containers named `<sandbox>-<container>`, all carrying
//! the label `<prefix>.sandbox=<sandbox>`. Lookups and removal go through
//! that label, so a pod can be found from the sandbox name alone.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::service::ContainerStateStatusEnum;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{PodRuntime, PodState, ProvisionError};
use crate::config::DockerConfig;
use crate::resources::{Container, PodHandle, PodTemplate};

/// Runs sandbox pods as Docker containers
pub(crate) struct DockerRuntime {
    docker: Docker,
    config: DockerConfig,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon.
    ///
    /// Fails with `RuntimeUnavailable` when no Docker socket is found. A
    /// daemon that stops answering later surfaces per call, as a retryable
    /// `RuntimeUnavailable`.
    pub fn connect(config: DockerConfig) -> Result<Self, ProvisionError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            ProvisionError::runtime_unavailable(format!("Failed to connect to Docker: {e}"))
        })?;
        Ok(Self { docker, config })
    }

    /// Lists the names of the containers carrying the sandbox label.
    async fn list_pod_containers(&self, sandbox: Option<&str>) -> Result<Vec<String>, ProvisionError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: label_filter(&self.config, sandbox),
                ..Default::default()
            }))
            .await
            .map_err(|e| classify(e, "list containers"))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|names| names.into_iter().next()))
            .map(|name| name.trim_start_matches('/').to_string())
            .collect())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ProvisionError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !self.config.pull_images {
            return Err(ProvisionError::image_not_found(image));
        }

        info!("Pulling image {}...", image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => {
                    if let Some(error) = output.error {
                        return Err(ProvisionError::image_not_found(format!("{image}: {error}")));
                    }
                }
                Err(DockerError::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(ProvisionError::image_not_found(image)),
                Err(e) => return Err(classify(e, "pull image")),
            }
        }
        Ok(())
    }

    async fn create_container(
        &self,
        sandbox: &str,
        container: &Container,
        template: &PodTemplate,
    ) -> Result<String, ProvisionError> {
        let container_name = format!("{sandbox}-{}", container.name);
        self.ensure_image(&container.image).await?;

        debug!("Creating container: {}", container_name);
        match self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                build_container_config(&self.config, sandbox, container, template),
            )
            .await
        {
            Ok(_) => {}
            // Left over from an earlier attempt for the same sandbox.
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => debug!("Container {} already exists, reusing", container_name),
            Err(e) => return Err(classify(e, "create container")),
        }

        debug!("Starting container: {}", container_name);
        match self
            .docker
            .start_container::<String>(&container_name, None)
            .await
        {
            // 304: already started
            Ok(())
            | Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(container_name),
            Err(e) => Err(classify(e, "start container")),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), ProvisionError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(())
            | Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, "remove container")),
        }
    }
}

#[async_trait]
impl PodRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_pod(
        &self,
        name: &str,
        template: &PodTemplate,
    ) -> Result<PodHandle, ProvisionError> {
        template.validate().map_err(ProvisionError::rejected)?;

        self.docker.ping().await.map_err(|e| {
            ProvisionError::runtime_unavailable(format!("Cannot ping Docker daemon: {e}"))
        })?;

        let mut created = Vec::with_capacity(template.spec.containers.len());
        for container in &template.spec.containers {
            match self.create_container(name, container, template).await {
                Ok(container_name) => created.push(container_name),
                Err(e) => {
                    // Do not leave half a pod behind.
                    for leftover in &created {
                        if let Err(cleanup) = self.remove_container(leftover).await {
                            warn!("Failed to remove container {}: {}", leftover, cleanup);
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!(pod = %name, containers = created.len(), "Pod started");
        Ok(PodHandle {
            id: name.to_string(),
            containers: created,
        })
    }

    async fn pod_state(&self, handle: &PodHandle) -> Result<PodState, ProvisionError> {
        let containers = self.list_pod_containers(Some(&handle.id)).await?;
        if containers.is_empty() {
            return Ok(PodState::Gone);
        }

        let mut all_running = true;
        for container in &containers {
            let inspect = match self
                .docker
                .inspect_container(container, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspect) => inspect,
                Err(DockerError::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Ok(PodState::Gone),
                Err(e) => return Err(classify(e, "inspect container")),
            };

            let Some(state) = inspect.state else {
                all_running = false;
                continue;
            };
            match state.status {
                Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD) => {
                    let reason = match (state.exit_code, state.error.filter(|e| !e.is_empty())) {
                        (_, Some(error)) => format!("container {container}: {error}"),
                        (Some(code), None) => format!("container {container} exited with {code}"),
                        (None, None) => format!("container {container} stopped"),
                    };
                    return Ok(PodState::Failed { reason });
                }
                _ => all_running &= state.running.unwrap_or(false),
            }
        }

        Ok(if all_running {
            PodState::Running
        } else {
            PodState::Pending
        })
    }

    async fn delete_pod(&self, handle: &PodHandle) -> Result<(), ProvisionError> {
        let mut containers = self.list_pod_containers(Some(&handle.id)).await?;
        for known in &handle.containers {
            if !containers.contains(known) {
                containers.push(known.clone());
            }
        }

        for container in &containers {
            debug!("Removing container: {}", container);
            self.remove_container(container).await?;
        }
        Ok(())
    }

    async fn cleanup_orphaned(&self) -> Result<u32, ProvisionError> {
        let containers = self.list_pod_containers(None).await?;
        let mut removed = 0;
        for container in &containers {
            match self.remove_container(container).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove orphaned container {}: {}", container, e),
            }
        }
        if removed > 0 {
            info!("Removed {} orphaned sandbox containers", removed);
        }
        Ok(removed)
    }
}

fn sandbox_label(config: &DockerConfig) -> String {
    format!("{}.sandbox", config.label_prefix)
}

/// List filter matching one sandbox's containers, or all sandbox containers.
fn label_filter(config: &DockerConfig, sandbox: Option<&str>) -> HashMap<String, Vec<String>> {
    let label = match sandbox {
        Some(name) => format!("{}={name}", sandbox_label(config)),
        None => sandbox_label(config),
    };
    HashMap::from([("label".to_string(), vec![label])])
}

fn build_container_config(
    config: &DockerConfig,
    sandbox: &str,
    container: &Container,
    template: &PodTemplate,
) -> ContainerConfig<String> {
    let mut labels: HashMap<String, String> = template
        .metadata
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(sandbox_label(config), sandbox.to_string());
    labels.insert(
        format!("{}.container", config.label_prefix),
        container.name.clone(),
    );

    let env: Vec<String> = container
        .env
        .iter()
        .map(|e| format!("{}={}", e.name, e.value))
        .collect();

    let exposed_ports: HashMap<String, HashMap<(), ()>> = container
        .ports
        .iter()
        .map(|p| {
            let protocol = p.protocol.as_deref().unwrap_or("tcp").to_lowercase();
            (format!("{}/{protocol}", p.container_port), HashMap::new())
        })
        .collect();

    ContainerConfig {
        image: Some(container.image.clone()),
        hostname: Some(sandbox.to_string()),
        entrypoint: (!container.command.is_empty()).then(|| container.command.clone()),
        cmd: (!container.args.is_empty()).then(|| container.args.clone()),
        env: (!env.is_empty()).then_some(env),
        labels: Some(labels),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        ..Default::default()
    }
}

/// Maps a Docker API error to a provisioning error.
fn classify(err: DockerError, operation: &str) -> ProvisionError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 400,
            message,
        } => ProvisionError::rejected(format!("{operation}: {message}")),
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } if operation == "create container" => ProvisionError::image_not_found(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => ProvisionError::failed(format!("{operation} ({status_code}): {message}")),
        DockerError::RequestTimeoutError => {
            ProvisionError::failed(format!("{operation}: request timed out"))
        }
        other => ProvisionError::runtime_unavailable(format!("{operation}: {other}")),
    }
}
