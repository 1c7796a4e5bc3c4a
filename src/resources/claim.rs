//! `SandboxClaim`: a request for exactly one sandbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{impl_resource, Kind, ObjectMeta};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SandboxClaim {
    pub metadata: ObjectMeta,
    pub spec: SandboxClaimSpec,
    #[serde(default)]
    pub status: SandboxClaimStatus,
}

impl_resource!(SandboxClaim, Kind::Claim, SandboxClaimSpec, SandboxClaimStatus);

/// A claim names either a pool or a template, never both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SandboxClaimSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Failed,
}

impl fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Bound => write!(f, "Bound"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SandboxClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_sandbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_at: Option<DateTime<Utc>>,
    /// Sandboxes reserved for this claim that failed to provision in a
    /// row. Reset by a bind or a spec change.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub failed_reservations: u32,
    #[serde(default)]
    pub observed_generation: u64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// What a claim resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ClaimTarget<'a> {
    Pool(&'a str),
    Template(&'a str),
}

impl SandboxClaimSpec {
    /// Returns the claim's target, or a validation message.
    pub fn target(&self) -> Result<ClaimTarget<'_>, String> {
        match (self.pool_ref.as_deref(), self.template_ref.as_deref()) {
            (Some(pool), None) if !pool.is_empty() => Ok(ClaimTarget::Pool(pool)),
            (None, Some(template)) if !template.is_empty() => Ok(ClaimTarget::Template(template)),
            (Some(_), Some(_)) => Err("claim must reference a pool or a template, not both".into()),
            _ => Err("claim must reference a pool or a template".into()),
        }
    }
}

impl SandboxClaim {
    pub fn for_pool(name: &str, pool: &str) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: SandboxClaimSpec {
                pool_ref: Some(pool.to_string()),
                template_ref: None,
            },
            status: SandboxClaimStatus::default(),
        }
    }

    pub fn for_template(name: &str, template: &str) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: SandboxClaimSpec {
                pool_ref: None,
                template_ref: Some(template.to_string()),
            },
            status: SandboxClaimStatus::default(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status.phase == ClaimPhase::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_pool() {
        let claim = SandboxClaim::for_pool("c", "pool");
        assert_eq!(claim.spec.target(), Ok(ClaimTarget::Pool("pool")));
    }

    #[test]
    fn test_target_template() {
        let claim = SandboxClaim::for_template("c", "python");
        assert_eq!(claim.spec.target(), Ok(ClaimTarget::Template("python")));
    }

    #[test]
    fn test_target_rejects_both_and_neither() {
        let both = SandboxClaimSpec {
            pool_ref: Some("p".into()),
            template_ref: Some("t".into()),
        };
        assert!(both.target().unwrap_err().contains("not both"));

        let neither = SandboxClaimSpec::default();
        assert!(neither.target().is_err());

        let empty = SandboxClaimSpec {
            pool_ref: Some(String::new()),
            template_ref: None,
        };
        assert!(empty.target().is_err());
    }

    #[test]
    fn test_new_claim_is_pending() {
        assert!(SandboxClaim::for_pool("c", "p").is_pending());
        assert_eq!(ClaimPhase::default().to_string(), "Pending");
    }
}
