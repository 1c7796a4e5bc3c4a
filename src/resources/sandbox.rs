//! `Sandbox`: one concrete runtime instance and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{impl_resource, Kind, ObjectMeta};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Sandbox {
    pub metadata: ObjectMeta,
    pub spec: SandboxSpec,
    #[serde(default)]
    pub status: SandboxStatus,
}

impl_resource!(Sandbox, Kind::Sandbox, SandboxSpec, SandboxStatus);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SandboxSpec {
    pub template_ref: String,
    pub template_hash: String,

    /// Set on sandboxes created for a claim that names a template directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_for: Option<ClaimRef>,
}

/// Identity of a claim, robust against a claim being re-created under the
/// same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct ClaimRef {
    pub name: String,
    pub uid: String,
}

/// Runtime handle of the pod backing a sandbox.
///
/// The id is always the sandbox name, so a pod can be deleted even when the
/// handle was never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PodHandle {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<String>,
}

impl PodHandle {
    pub fn for_sandbox(name: &str) -> Self {
        Self {
            id: name.to_string(),
            containers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum SandboxPhase {
    #[default]
    Provisioning,
    Ready,
    Claimed,
    Terminating,
    Terminated,
}

impl fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Claimed => write!(f, "Claimed"),
            Self::Terminating => write!(f, "Terminating"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

impl SandboxPhase {
    /// Returns true if the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SandboxPhase::{Claimed, Provisioning, Ready, Terminated, Terminating};
        matches!(
            (self, next),
            (Provisioning, Ready | Terminating | Terminated)
                | (Ready, Claimed | Terminating)
                | (Claimed, Ready | Terminating)
                | (Terminating, Terminated)
        )
    }

    /// Terminating and Terminated sandboxes are on their way out.
    pub fn is_retiring(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }
}

/// Rejected phase change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sandbox transition {from} -> {to}")]
pub(crate) struct InvalidTransition {
    pub from: SandboxPhase,
    pub to: SandboxPhase,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SandboxStatus {
    #[serde(default)]
    pub phase: SandboxPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_claim: Option<ClaimRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodHandle>,
    #[serde(default)]
    pub provision_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// No provisioning attempt is made before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Sandbox {
    /// Name of the owning pool, if any.
    pub fn owner_pool(&self) -> Option<&str> {
        self.metadata
            .owner
            .as_ref()
            .filter(|o| o.kind == Kind::WarmPool)
            .map(|o| o.name.as_str())
    }

    pub fn phase(&self) -> SandboxPhase {
        self.status.phase
    }

    /// Ready and unbound: the only state a claim may bind to.
    pub fn is_available(&self) -> bool {
        self.status.phase == SandboxPhase::Ready && self.status.bound_claim.is_none()
    }

    /// Returns true if this sandbox is bound to exactly `claim`.
    pub fn is_bound_to(&self, claim: &ClaimRef) -> bool {
        self.status.bound_claim.as_ref() == Some(claim)
    }

    /// Moves to `next`, keeping the bound-claim invariants.
    ///
    /// Leaving `Claimed` always clears the bound claim. Entering `Claimed`
    /// goes through [`Sandbox::bind`] instead.
    pub fn transition(&mut self, next: SandboxPhase) -> Result<(), InvalidTransition> {
        let from = self.status.phase;
        if !from.can_transition_to(next) || next == SandboxPhase::Claimed {
            return Err(InvalidTransition { from, to: next });
        }
        self.status.phase = next;
        match next {
            SandboxPhase::Ready => {
                self.status.bound_claim = None;
                self.status.claimed_at = None;
                self.status.ready_at = Some(Utc::now());
            }
            SandboxPhase::Terminating | SandboxPhase::Terminated => {
                self.status.bound_claim = None;
            }
            SandboxPhase::Provisioning | SandboxPhase::Claimed => {}
        }
        Ok(())
    }

    /// Binds this sandbox to `claim`: `Ready -> Claimed`.
    pub fn bind(&mut self, claim: ClaimRef) -> Result<(), InvalidTransition> {
        if !self.is_available() {
            return Err(InvalidTransition {
                from: self.status.phase,
                to: SandboxPhase::Claimed,
            });
        }
        self.status.phase = SandboxPhase::Claimed;
        self.status.bound_claim = Some(claim);
        self.status.claimed_at = Some(Utc::now());
        Ok(())
    }
}
