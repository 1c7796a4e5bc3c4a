//! `SandboxWarmPool`: a declared number of ready sandboxes for a template.

use serde::{Deserialize, Serialize};

use super::{impl_resource, Condition, Kind, ObjectMeta};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SandboxWarmPool {
    pub metadata: ObjectMeta,
    pub spec: SandboxWarmPoolSpec,
    #[serde(default)]
    pub status: SandboxWarmPoolStatus,
}

impl_resource!(
    SandboxWarmPool,
    Kind::WarmPool,
    SandboxWarmPoolSpec,
    SandboxWarmPoolStatus
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SandboxWarmPoolSpec {
    pub template_ref: String,
    pub desired_ready: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SandboxWarmPoolStatus {
    #[serde(default)]
    pub ready_count: u32,
    #[serde(default)]
    pub provisioning_count: u32,
    #[serde(default)]
    pub claimed_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_hash: Option<String>,
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Condition type recording whether the pool's template resolves.
pub(crate) const CONDITION_TEMPLATE_VALID: &str = "TemplateValid";

/// Condition type recording the last provisioning failure in the pool.
pub(crate) const CONDITION_PROVISION_FAILED: &str = "ProvisionFailed";

impl SandboxWarmPool {
    pub fn new(name: &str, template_ref: &str, desired_ready: u32) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: SandboxWarmPoolSpec {
                template_ref: template_ref.to_string(),
                desired_ready,
            },
            status: SandboxWarmPoolStatus::default(),
        }
    }
}
