//! Declarative resource kinds managed by the controller.
//!
//! Every object carries an [`ObjectMeta`] plus a `spec` written by users and
//! a `status` written by the reconcilers. The store treats the two halves
//! separately: spec writes bump `generation`, status writes never touch spec.

mod claim;
mod sandbox;
mod template;
mod warm_pool;

pub(crate) use claim::{ClaimPhase, ClaimTarget, SandboxClaim, SandboxClaimSpec, SandboxClaimStatus};
pub(crate) use sandbox::{
    ClaimRef, InvalidTransition, PodHandle, Sandbox, SandboxPhase, SandboxSpec, SandboxStatus,
};
pub(crate) use template::{
    is_dns_label, Container, ContainerPort, EnvVar, PodMetadata, PodSpec, PodTemplate, SandboxTemplate,
    SandboxTemplateSpec, SandboxTemplateStatus,
};
pub(crate) use warm_pool::{
    SandboxWarmPool, SandboxWarmPoolSpec, SandboxWarmPoolStatus, CONDITION_PROVISION_FAILED,
    CONDITION_TEMPLATE_VALID,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Resource kinds known to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) enum Kind {
    /// `SandboxTemplate`
    Template,
    /// `SandboxWarmPool`
    WarmPool,
    /// `SandboxClaim`
    Claim,
    /// `Sandbox`
    Sandbox,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template => write!(f, "SandboxTemplate"),
            Self::WarmPool => write!(f, "SandboxWarmPool"),
            Self::Claim => write!(f, "SandboxClaim"),
            Self::Sandbox => write!(f, "Sandbox"),
        }
    }
}

/// Reference from an owned object to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OwnerRef {
    pub kind: Kind,
    pub name: String,
    pub uid: String,
}

/// Standard object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ObjectMeta {
    pub name: String,

    /// Assigned by the store on create. Distinguishes re-created objects
    /// that reuse a name.
    #[serde(default)]
    pub uid: String,

    /// Store-wide revision of the last write to this object.
    #[serde(default)]
    pub resource_version: u64,

    /// Bumped on spec changes only.
    #[serde(default)]
    pub generation: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
}

impl ObjectMeta {
    /// Creates metadata carrying only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns an owner reference pointing at this object.
    pub fn owner_ref(&self, kind: Kind) -> OwnerRef {
        OwnerRef {
            kind,
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }
}

/// Orders objects oldest first. Ties on timestamp fall back to name.
pub(crate) fn by_age(a: &ObjectMeta, b: &ObjectMeta) -> Ordering {
    a.creation_timestamp
        .cmp(&b.creation_timestamp)
        .then_with(|| a.name.cmp(&b.name))
}

/// A typed, persisted object with separately written spec and status.
pub(crate) trait Resource: Clone + fmt::Debug + Send + Sync + 'static {
    /// Kind tag used in keys, events and errors.
    const KIND: Kind;

    /// User-written desired state.
    type Spec: Clone + PartialEq + fmt::Debug + Send + Sync;

    /// Controller-written observed state.
    type Status: Clone + Default + PartialEq + fmt::Debug + Send + Sync;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn spec(&self) -> &Self::Spec;
    fn spec_mut(&mut self) -> &mut Self::Spec;
    fn status(&self) -> &Self::Status;
    fn status_mut(&mut self) -> &mut Self::Status;

    fn name(&self) -> &str {
        &self.meta().name
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr, $spec:ty, $status:ty) => {
        impl $crate::resources::Resource for $ty {
            const KIND: $crate::resources::Kind = $kind;
            type Spec = $spec;
            type Status = $status;

            fn meta(&self) -> &$crate::resources::ObjectMeta {
                &self.metadata
            }
            fn meta_mut(&mut self) -> &mut $crate::resources::ObjectMeta {
                &mut self.metadata
            }
            fn spec(&self) -> &Self::Spec {
                &self.spec
            }
            fn spec_mut(&mut self) -> &mut Self::Spec {
                &mut self.spec
            }
            fn status(&self) -> &Self::Status {
                &self.status
            }
            fn status_mut(&mut self) -> &mut Self::Status {
                &mut self.status
            }
        }
    };
}

pub(crate) use impl_resource;

/// A status condition, as surfaced to users on pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: bool,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Inserts or updates a condition by type.
///
/// The transition time is preserved when neither status, reason nor message
/// changed, so writing the same condition twice leaves the list identical.
pub(crate) fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing)
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message => {}
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

/// Removes a condition by type.
pub(crate) fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(Kind::Template.to_string(), "SandboxTemplate");
        assert_eq!(Kind::WarmPool.to_string(), "SandboxWarmPool");
        assert_eq!(Kind::Claim.to_string(), "SandboxClaim");
        assert_eq!(Kind::Sandbox.to_string(), "Sandbox");
    }

    #[test]
    fn test_by_age_orders_by_timestamp_then_name() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);

        let mut older = ObjectMeta::named("zeta");
        older.creation_timestamp = Some(t0);
        let mut newer = ObjectMeta::named("alpha");
        newer.creation_timestamp = Some(t1);
        assert_eq!(by_age(&older, &newer), Ordering::Less);

        let mut same = ObjectMeta::named("beta");
        same.creation_timestamp = Some(t1);
        assert_eq!(by_age(&newer, &same), Ordering::Less);
    }

    #[test]
    fn test_set_condition_is_stable_when_unchanged() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("TemplateValid", false, "NotFound", "missing"),
        );
        let before = conditions.clone();

        set_condition(
            &mut conditions,
            Condition::new("TemplateValid", false, "NotFound", "missing"),
        );
        assert_eq!(conditions, before);

        set_condition(
            &mut conditions,
            Condition::new("TemplateValid", true, "Resolved", ""),
        );
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].status);

        remove_condition(&mut conditions, "TemplateValid");
        assert!(conditions.is_empty());
    }
}
