//! `SandboxTemplate`: the pod specification sandboxes are built from.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

use super::{impl_resource, Kind, ObjectMeta};

/// Number of hex characters kept from the template digest.
const HASH_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SandboxTemplate {
    pub metadata: ObjectMeta,
    pub spec: SandboxTemplateSpec,
    #[serde(default)]
    pub status: SandboxTemplateStatus,
}

impl_resource!(
    SandboxTemplate,
    Kind::Template,
    SandboxTemplateSpec,
    SandboxTemplateStatus
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SandboxTemplateSpec {
    pub pod_template: PodTemplate,
}

/// Templates carry no observed state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SandboxTemplateStatus {}

/// Pod metadata. Only labels and annotations are used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PodMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PodTemplate {
    #[serde(default)]
    pub metadata: PodMetadata,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PodSpec {
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ContainerPort {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl PodTemplate {
    /// Deterministic digest of the template, used to match sandboxes against
    /// the template they were built from.
    ///
    /// Field order is fixed by the struct layout and maps are ordered, so
    /// equal templates always hash equally.
    pub fn hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        let mut hash = hex::encode(digest);
        hash.truncate(HASH_LEN);
        hash
    }

    /// Checks the template is something a runtime could start.
    pub fn validate(&self) -> Result<(), String> {
        if self.spec.containers.is_empty() {
            return Err("pod template must declare at least one container".to_string());
        }

        let mut seen = HashSet::new();
        for container in &self.spec.containers {
            if !is_dns_label(&container.name) {
                return Err(format!(
                    "container name '{}' must be a lowercase DNS label",
                    container.name
                ));
            }
            if !seen.insert(container.name.as_str()) {
                return Err(format!("duplicate container name '{}'", container.name));
            }
            if container.image.trim().is_empty() {
                return Err(format!("container '{}' has no image", container.name));
            }
            if let Some(env) = container.env.iter().find(|e| e.name.is_empty()) {
                return Err(format!(
                    "container '{}' has an env var with an empty name (value '{}')",
                    container.name, env.value
                ));
            }
        }

        Ok(())
    }
}

/// Returns true for names usable as object and container names.
pub(crate) fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
