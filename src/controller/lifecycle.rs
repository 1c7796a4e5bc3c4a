//! Sandbox lifecycle: creating records, provisioning pods, retiring them.
//!
//! ```text
//! Provisioning -> Ready -> Claimed -> Terminating -> Terminated
//!      |            |        |  ^          ^
//!      |            |        +--+ release  |
//!      |            +----------------------+
//!      +-----------------------------------+ (also straight to Terminated)
//! ```

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use super::binder;
use super::context::Context;
use super::error::ReconcileError;
use super::template_store::ResolvedTemplate;
use super::Action;
use crate::resources::{
    ClaimPhase, ClaimRef, Kind, ObjectMeta, OwnerRef, PodHandle, Sandbox, SandboxClaim,
    SandboxPhase, SandboxSpec, SandboxStatus, SandboxWarmPool,
};
use crate::runtime::PodState;
use crate::store::StoreError;

const SUFFIX_CHARS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const SUFFIX_LEN: usize = 5;
const NAME_ATTEMPTS: usize = 5;

fn generate_name(prefix: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| char::from(SUFFIX_CHARS[rng.random_range(0..SUFFIX_CHARS.len())]))
        .collect();
    format!("{prefix}-{suffix}")
}

/// Writes a new `Provisioning` sandbox named `<prefix>-<suffix>`.
pub(crate) async fn create_sandbox(
    ctx: &Context,
    template: &ResolvedTemplate,
    prefix: &str,
    owner: Option<OwnerRef>,
    reserved_for: Option<ClaimRef>,
) -> Result<Sandbox, ReconcileError> {
    for _ in 0..NAME_ATTEMPTS {
        let mut metadata = ObjectMeta::named(generate_name(prefix));
        metadata.owner.clone_from(&owner);
        let sandbox = Sandbox {
            metadata,
            spec: SandboxSpec {
                template_ref: template.name.clone(),
                template_hash: template.hash.clone(),
                reserved_for: reserved_for.clone(),
            },
            status: SandboxStatus::default(),
        };

        match ctx.create(sandbox).await {
            Ok(created) => {
                info!(
                    sandbox = %created.metadata.name,
                    template = %template.name,
                    hash = %template.hash,
                    "sandbox created"
                );
                return Ok(created);
            }
            Err(StoreError::AlreadyExists { name, .. }) => {
                debug!(sandbox = %name, "name taken, picking another");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::unavailable(format!("could not find a free sandbox name for '{prefix}'")).into())
}

/// Starts retiring `sandbox`, conditional on the version it was read at.
///
/// Returns false when the sandbox is already retiring, is gone, or changed
/// since it was read (for example it was just claimed).
pub(crate) async fn delete_sandbox(ctx: &Context, sandbox: &Sandbox) -> Result<bool, ReconcileError> {
    if sandbox.phase().is_retiring() {
        return Ok(false);
    }

    let mut retiring = sandbox.clone();
    if sandbox.phase() == SandboxPhase::Provisioning {
        // Earlier attempts that were retried are not the reason it goes.
        retiring.status.failure_reason = None;
        retiring.status.retry_at = None;
    }
    retiring.transition(SandboxPhase::Terminating)?;
    match ctx.replace_status(&retiring).await {
        Ok(_) => {
            info!(sandbox = %sandbox.metadata.name, from = %sandbox.phase(), "sandbox retiring");
            Ok(true)
        }
        Err(e) if e.is_conflict() || e.is_not_found() => {
            debug!(sandbox = %sandbox.metadata.name, "sandbox changed before delete, skipping");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Drives one sandbox a single step through its lifecycle.
pub(crate) async fn reconcile_sandbox(ctx: &Context, name: &str) -> Result<Action, ReconcileError> {
    let Some(sandbox) = ctx.get::<Sandbox>(name).await? else {
        return Ok(Action::Done);
    };

    match sandbox.phase() {
        SandboxPhase::Provisioning => provision(ctx, sandbox).await,
        SandboxPhase::Ready => check_ready(ctx, sandbox).await,
        SandboxPhase::Claimed => check_claimed(ctx, sandbox).await,
        SandboxPhase::Terminating => tear_down(ctx, sandbox).await,
        SandboxPhase::Terminated => prune(ctx, &sandbox).await,
    }
}

async fn provision(ctx: &Context, mut sandbox: Sandbox) -> Result<Action, ReconcileError> {
    let template = match ctx.templates().resolve(&sandbox.spec.template_ref).await {
        Ok(template) => template,
        Err(ReconcileError::Validation { message, .. }) => {
            let reason = format!("template '{}': {message}", sandbox.spec.template_ref);
            return record_failure(ctx, sandbox, reason, false).await;
        }
        Err(e) => return Err(e),
    };

    if template.hash != sandbox.spec.template_hash {
        debug!(sandbox = %sandbox.metadata.name, "template changed during provisioning");
        delete_sandbox(ctx, &sandbox).await?;
        return Ok(Action::Done);
    }

    let Some(handle) = sandbox.status.pod.clone() else {
        if let Some(wait) = sandbox
            .status
            .retry_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
        {
            return Ok(Action::Requeue(wait));
        }

        return match ctx
            .create_pod(&sandbox.metadata.name, &template.pod_template)
            .await
        {
            Ok(handle) => {
                debug!(sandbox = %sandbox.metadata.name, containers = handle.containers.len(), "pod created");
                sandbox.status.pod = Some(handle);
                sandbox.status.retry_at = None;
                ctx.replace_status(&sandbox).await?;
                Ok(Action::Requeue(ctx.settings.provision_poll_interval()))
            }
            Err(e) => {
                let retryable = e.is_retryable();
                record_failure(ctx, sandbox, e.to_string(), retryable).await
            }
        };
    };

    match ctx.pod_state(&handle).await? {
        PodState::Running => {
            sandbox.transition(SandboxPhase::Ready)?;
            sandbox.status.failure_reason = None;
            ctx.replace_status(&sandbox).await?;
            info!(sandbox = %sandbox.metadata.name, "sandbox ready");
            Ok(Action::Done)
        }
        PodState::Pending => Ok(Action::Requeue(ctx.settings.provision_poll_interval())),
        PodState::Failed { reason } => {
            ctx.delete_pod(&handle).await?;
            sandbox.status.pod = None;
            record_failure(ctx, sandbox, reason, true).await
        }
        PodState::Gone => {
            sandbox.status.pod = None;
            record_failure(ctx, sandbox, "pod disappeared during startup".into(), true).await
        }
    }
}

/// Counts a failed provisioning attempt. Gives up with `Terminated` once the
/// failure is permanent or attempts run out.
async fn record_failure(
    ctx: &Context,
    mut sandbox: Sandbox,
    reason: String,
    retryable: bool,
) -> Result<Action, ReconcileError> {
    sandbox.status.provision_attempts += 1;
    let attempts = sandbox.status.provision_attempts;

    if !retryable || attempts >= ctx.settings.max_provision_attempts {
        warn!(sandbox = %sandbox.metadata.name, attempts, reason = %reason, "provisioning failed");
        // A create that timed out may still have left a pod behind.
        if let Err(e) = ctx.delete_pod(&PodHandle::for_sandbox(&sandbox.metadata.name)).await {
            debug!(sandbox = %sandbox.metadata.name, error = %e, "pod cleanup after failure deferred");
        }
        sandbox.status.failure_reason = Some(reason);
        sandbox.status.retry_at = None;
        sandbox.transition(SandboxPhase::Terminated)?;
        ctx.replace_status(&sandbox).await?;
        return Ok(Action::Done);
    }

    let delay = ctx.backoff().delay(attempts);
    warn!(
        sandbox = %sandbox.metadata.name,
        attempts,
        retry_in_ms = delay.as_millis(),
        reason = %reason,
        "provisioning attempt failed"
    );
    sandbox.status.failure_reason = Some(reason);
    sandbox.status.retry_at = chrono::Duration::from_std(delay)
        .ok()
        .map(|d| Utc::now() + d);
    ctx.replace_status(&sandbox).await?;
    Ok(Action::Requeue(delay))
}

/// A Ready sandbox whose pod died is retired so its pool replaces it.
async fn check_ready(ctx: &Context, sandbox: Sandbox) -> Result<Action, ReconcileError> {
    let handle = sandbox
        .status
        .pod
        .clone()
        .unwrap_or_else(|| PodHandle::for_sandbox(&sandbox.metadata.name));

    let reason = match ctx.pod_state(&handle).await? {
        PodState::Running | PodState::Pending => return Ok(Action::Done),
        PodState::Failed { reason } => reason,
        PodState::Gone => "pod is gone".to_string(),
    };

    warn!(sandbox = %sandbox.metadata.name, reason = %reason, "ready sandbox lost its pod");
    let mut lost = sandbox;
    lost.status.failure_reason = Some(reason);
    delete_sandbox(ctx, &lost).await?;
    Ok(Action::Done)
}

/// Releases a Claimed sandbox whose claim no longer holds it.
async fn check_claimed(ctx: &Context, sandbox: Sandbox) -> Result<Action, ReconcileError> {
    let Some(bound) = sandbox.status.bound_claim.clone() else {
        return binder::release(ctx, &sandbox).await;
    };

    let holds = match ctx.get::<SandboxClaim>(&bound.name).await? {
        Some(claim) if claim.metadata.uid == bound.uid => {
            // Pending may be mid-bind. Bound holds only its own sandbox.
            match claim.status.phase {
                ClaimPhase::Pending => true,
                ClaimPhase::Bound => {
                    claim.status.bound_sandbox.as_deref() == Some(sandbox.metadata.name.as_str())
                }
                ClaimPhase::Failed => false,
            }
        }
        _ => false,
    };

    if holds {
        Ok(Action::Done)
    } else {
        debug!(sandbox = %sandbox.metadata.name, claim = %bound.name, "claim released sandbox");
        binder::release(ctx, &sandbox).await
    }
}

async fn tear_down(ctx: &Context, mut sandbox: Sandbox) -> Result<Action, ReconcileError> {
    let handle = sandbox
        .status
        .pod
        .take()
        .unwrap_or_else(|| PodHandle::for_sandbox(&sandbox.metadata.name));
    ctx.delete_pod(&handle).await?;

    sandbox.transition(SandboxPhase::Terminated)?;
    let sandbox = ctx.replace_status(&sandbox).await?;
    info!(sandbox = %sandbox.metadata.name, "sandbox terminated");
    prune(ctx, &sandbox).await
}

/// Deletes the record of a Terminated sandbox, unless someone still has to
/// read its failure reason: a live owning pool, or a Pending claim it was
/// reserved for. Those delete it themselves.
async fn prune(ctx: &Context, sandbox: &Sandbox) -> Result<Action, ReconcileError> {
    if let Some(owner) = sandbox
        .metadata
        .owner
        .as_ref()
        .filter(|o| o.kind == Kind::WarmPool)
    {
        let pool = ctx.get::<SandboxWarmPool>(&owner.name).await?;
        if pool.is_some_and(|p| p.metadata.uid == owner.uid) {
            return Ok(Action::Done);
        }
    }

    if let Some(reserved) = sandbox
        .spec
        .reserved_for
        .as_ref()
        .filter(|_| sandbox.status.failure_reason.is_some())
    {
        let claim = ctx.get::<SandboxClaim>(&reserved.name).await?;
        if claim.is_some_and(|c| c.metadata.uid == reserved.uid && c.is_pending()) {
            return Ok(Action::Done);
        }
    }

    delete_record(ctx, sandbox).await?;
    Ok(Action::Done)
}

/// Removes a Terminated sandbox from the store, conditional on the version
/// it was read at.
pub(crate) async fn delete_record(ctx: &Context, sandbox: &Sandbox) -> Result<(), ReconcileError> {
    match ctx
        .delete::<Sandbox>(&sandbox.metadata.name, Some(sandbox.metadata.resource_version))
        .await
    {
        Ok(_) => debug!(sandbox = %sandbox.metadata.name, "sandbox record deleted"),
        Err(e) if e.is_not_found() || e.is_conflict() => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
