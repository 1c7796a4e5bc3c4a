//! Binds claims to Ready sandboxes and releases them again.
//!
//! Binding is two compare-and-swap writes and no lock: first the sandbox
//! (`Ready -> Claimed`), then the claim (`Bound`). A worker that loses the
//! sandbox write requeues and looks again. A worker that wins it but fails
//! the claim write leaves a sandbox pointing at the claim, which the next
//! pass finds and completes.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::context::Context;
use super::error::ReconcileError;
use super::lifecycle;
use super::template_store::ResolvedTemplate;
use super::Action;
use crate::resources::{
    by_age, ClaimPhase, ClaimRef, ClaimTarget, Kind, Sandbox, SandboxClaim, SandboxClaimStatus,
    SandboxPhase, SandboxWarmPool,
};

pub(crate) const REASON_VALIDATION: &str = "ValidationError";
pub(crate) const REASON_SANDBOX_LOST: &str = "SandboxLost";
pub(crate) const REASON_PROVISION_FAILED: &str = "ProvisionFailed";

/// Reserved sandboxes a template claim may lose to provisioning failures in
/// a row before it fails.
const MAX_FAILED_RESERVATIONS: u32 = 3;

/// Where a claim's sandbox comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Pool { name: String, uid: String },
    Template { name: String },
}

#[derive(Debug)]
struct Resolved {
    source: Source,
    template: ResolvedTemplate,
}

impl Resolved {
    /// Returns true if `sandbox` is free for this claim to take.
    fn offers(&self, sandbox: &Sandbox, claim: &ClaimRef) -> bool {
        if !sandbox.is_available() || sandbox.spec.template_hash != self.template.hash {
            return false;
        }
        match &self.source {
            Source::Pool { name, uid } => sandbox
                .metadata
                .owner
                .as_ref()
                .is_some_and(|o| o.kind == Kind::WarmPool && &o.name == name && &o.uid == uid),
            Source::Template { .. } => {
                sandbox.metadata.owner.is_none()
                    && sandbox
                        .spec
                        .reserved_for
                        .as_ref()
                        .is_none_or(|reserved| reserved == claim)
            }
        }
    }
}

fn claim_ref(claim: &SandboxClaim) -> ClaimRef {
    ClaimRef {
        name: claim.metadata.name.clone(),
        uid: claim.metadata.uid.clone(),
    }
}

/// Reconciles claim `name` against the current sandboxes.
pub(crate) async fn reconcile_claim(ctx: &Context, name: &str) -> Result<Action, ReconcileError> {
    // Claim first: any sandbox bound before the claim write is then visible.
    let claim = ctx.get::<SandboxClaim>(name).await?;
    let sandboxes = ctx.list::<Sandbox>().await?;
    let Some(mut claim) = claim else {
        return clean_up_deleted(ctx, name, &sandboxes).await;
    };

    if claim.status.phase == ClaimPhase::Failed
        && claim.status.observed_generation == claim.metadata.generation
    {
        return Ok(Action::Done);
    }

    let me = claim_ref(&claim);
    drop_stale_reservations(ctx, &me, &sandboxes).await?;

    if let Err(message) = claim.spec.target() {
        return fail(ctx, &claim, REASON_VALIDATION, message).await;
    }

    if claim.status.phase == ClaimPhase::Bound {
        return verify_bound(ctx, &claim, &me, &sandboxes).await;
    }

    // The spec changed since the claim failed: start over.
    if claim.status.phase == ClaimPhase::Failed {
        claim.status = SandboxClaimStatus::default();
    }

    let failed: Vec<&Sandbox> = sandboxes
        .iter()
        .filter(|s| {
            s.metadata.owner.is_none()
                && s.phase() == SandboxPhase::Terminated
                && s.status.failure_reason.is_some()
                && s.spec.reserved_for.as_ref() == Some(&me)
        })
        .collect();
    if !failed.is_empty() {
        return record_failed_reservations(ctx, claim, &failed).await;
    }

    let resolved = match resolve(ctx, &claim).await {
        Ok(resolved) => resolved,
        Err(ReconcileError::Validation { message, .. }) => {
            return fail(ctx, &claim, REASON_VALIDATION, message).await;
        }
        Err(e) => return Err(e),
    };

    // A previous pass won a sandbox but did not record it on the claim.
    let mut mine: Vec<&Sandbox> = sandboxes
        .iter()
        .filter(|s| s.phase() == SandboxPhase::Claimed && s.is_bound_to(&me))
        .collect();
    mine.sort_by(|a, b| {
        a.status
            .claimed_at
            .cmp(&b.status.claimed_at)
            .then_with(|| by_age(&a.metadata, &b.metadata))
    });
    if let Some((&won, extra)) = mine.split_first() {
        for sandbox in extra {
            release(ctx, sandbox).await?;
        }
        debug!(claim = %name, sandbox = %won.metadata.name, "completing interrupted bind");
        return record_binding(ctx, claim, won).await;
    }

    let candidate = match pick_candidate(ctx, &claim, &me, &resolved, &sandboxes).await? {
        Some(candidate) => candidate,
        None => return wait_for_capacity(ctx, claim, &me, &resolved, &sandboxes).await,
    };

    let mut bound = candidate.clone();
    bound.bind(me)?;
    let bound = match ctx.replace_status(&bound).await {
        Ok(bound) => bound,
        Err(e) if e.is_conflict() || e.is_not_found() => {
            debug!(claim = %name, sandbox = %candidate.metadata.name, "lost sandbox to another writer");
            return Ok(Action::Requeue(ctx.backoff().delay(1)));
        }
        Err(e) => return Err(e.into()),
    };

    record_binding(ctx, claim, &bound).await
}

/// Resolves the pool or template a claim points at.
async fn resolve(ctx: &Context, claim: &SandboxClaim) -> Result<Resolved, ReconcileError> {
    let target = claim
        .spec
        .target()
        .map_err(|message| ReconcileError::validation(Kind::Claim, &claim.metadata.name, message))?;

    match target {
        ClaimTarget::Pool(pool_name) => {
            let pool = ctx
                .get::<SandboxWarmPool>(pool_name)
                .await?
                .ok_or_else(|| {
                    ReconcileError::validation(
                        Kind::WarmPool,
                        pool_name,
                        format!("pool '{pool_name}' not found"),
                    )
                })?;
            let template = ctx
                .templates()
                .resolve(&pool.spec.template_ref)
                .await
                .map_err(|e| match e {
                    ReconcileError::Validation { name, message, .. } => ReconcileError::validation(
                        Kind::WarmPool,
                        pool_name,
                        format!("template '{name}': {message}"),
                    ),
                    other => other,
                })?;
            Ok(Resolved {
                source: Source::Pool {
                    name: pool.metadata.name,
                    uid: pool.metadata.uid,
                },
                template,
            })
        }
        ClaimTarget::Template(template_name) => {
            let template = ctx
                .templates()
                .resolve(template_name)
                .await
                .map_err(|e| match e {
                    ReconcileError::Validation { message, .. } => ReconcileError::validation(
                        Kind::Template,
                        template_name,
                        format!("template '{template_name}': {message}"),
                    ),
                    other => other,
                })?;
            Ok(Resolved {
                source: Source::Template {
                    name: template_name.to_string(),
                },
                template,
            })
        }
    }
}

/// Picks the sandbox this claim should try to bind.
///
/// Pending claims on the same target are ranked oldest first; the claim at
/// rank `r` gets the `r`-th oldest candidate, so with one free sandbox only
/// the oldest claim goes for it. A sandbox reserved for this claim is taken
/// before any shared one.
async fn pick_candidate<'s>(
    ctx: &Context,
    claim: &SandboxClaim,
    me: &ClaimRef,
    resolved: &Resolved,
    sandboxes: &'s [Sandbox],
) -> Result<Option<&'s Sandbox>, ReconcileError> {
    let mut candidates: Vec<&Sandbox> = sandboxes
        .iter()
        .filter(|s| resolved.offers(s, me))
        .collect();
    candidates.sort_by(|a, b| by_age(&a.metadata, &b.metadata));

    if let Some(&reserved) = candidates
        .iter()
        .find(|s| s.spec.reserved_for.as_ref() == Some(me))
    {
        return Ok(Some(reserved));
    }
    candidates.retain(|s| s.spec.reserved_for.is_none());
    if candidates.is_empty() {
        return Ok(None);
    }

    let claims = ctx.list::<SandboxClaim>().await?;
    let mut queue: Vec<&SandboxClaim> = claims
        .iter()
        .filter(|c| c.is_pending() && c.spec == claim.spec && c.metadata.uid != me.uid)
        .chain(std::iter::once(claim))
        .collect();
    queue.sort_by(|a, b| by_age(&a.metadata, &b.metadata));
    let rank = queue
        .iter()
        .position(|c| c.metadata.uid == me.uid)
        .unwrap_or(0);

    if rank > 0 {
        debug!(claim = %me.name, rank, candidates = candidates.len(), "older claims go first");
    }
    Ok(candidates.get(rank).copied())
}

/// Writes `Bound` on the claim for a sandbox already bound to it.
async fn record_binding(
    ctx: &Context,
    mut claim: SandboxClaim,
    sandbox: &Sandbox,
) -> Result<Action, ReconcileError> {
    claim.status = SandboxClaimStatus {
        phase: ClaimPhase::Bound,
        bound_sandbox: Some(sandbox.metadata.name.clone()),
        template_hash: Some(sandbox.spec.template_hash.clone()),
        reason: None,
        message: None,
        bound_at: Some(sandbox.status.claimed_at.unwrap_or_else(Utc::now)),
        failed_reservations: 0,
        observed_generation: claim.metadata.generation,
    };

    match ctx.replace_status(&claim).await {
        Ok(_) => {
            info!(claim = %claim.metadata.name, sandbox = %sandbox.metadata.name, "claim bound");
            Ok(Action::Done)
        }
        // The sandbox already points at the claim; the next pass finishes.
        Err(e) if e.is_conflict() => Ok(Action::Requeue(ctx.backoff().delay(1))),
        Err(e) => Err(e.into()),
    }
}

/// Checks a Bound claim and its sandbox still point at each other.
async fn verify_bound(
    ctx: &Context,
    claim: &SandboxClaim,
    me: &ClaimRef,
    sandboxes: &[Sandbox],
) -> Result<Action, ReconcileError> {
    let bound_name = claim.status.bound_sandbox.as_deref();

    // Left over from a duplicate bind that lost the claim write.
    for sandbox in sandboxes.iter().filter(|s| {
        s.phase() == SandboxPhase::Claimed
            && s.is_bound_to(me)
            && Some(s.metadata.name.as_str()) != bound_name
    }) {
        release(ctx, sandbox).await?;
    }

    let holds = bound_name.and_then(|n| sandboxes.iter().find(|s| s.metadata.name == n));
    match holds {
        Some(sandbox) if sandbox.phase() == SandboxPhase::Claimed && sandbox.is_bound_to(me) => {
            Ok(Action::Done)
        }
        Some(sandbox) => {
            let message = format!(
                "sandbox '{}' is {} and no longer bound to this claim",
                sandbox.metadata.name,
                sandbox.phase()
            );
            fail(ctx, claim, REASON_SANDBOX_LOST, message).await
        }
        None => {
            let message = format!("sandbox '{}' no longer exists", bound_name.unwrap_or_default());
            fail(ctx, claim, REASON_SANDBOX_LOST, message).await
        }
    }
}

/// Leaves the claim Pending and makes sure capacity is on its way.
async fn wait_for_capacity(
    ctx: &Context,
    claim: SandboxClaim,
    me: &ClaimRef,
    resolved: &Resolved,
    sandboxes: &[Sandbox],
) -> Result<Action, ReconcileError> {
    let message = match &resolved.source {
        Source::Pool { name, .. } => format!("waiting for a ready sandbox in pool '{name}'"),
        Source::Template { name } => {
            let mut on_the_way = false;
            for sandbox in sandboxes.iter().filter(|s| {
                s.metadata.owner.is_none()
                    && s.spec.reserved_for.as_ref() == Some(me)
                    && matches!(s.phase(), SandboxPhase::Provisioning | SandboxPhase::Ready)
            }) {
                if sandbox.spec.template_hash == resolved.template.hash {
                    on_the_way = true;
                } else {
                    lifecycle::delete_sandbox(ctx, sandbox).await?;
                }
            }
            if !on_the_way {
                lifecycle::create_sandbox(ctx, &resolved.template, name, None, Some(me.clone()))
                    .await?;
            }
            format!("waiting for a sandbox from template '{name}'")
        }
    };

    // The last provisioning failure stays visible while a retry is on its way.
    let status = if claim.status.failed_reservations > 0 {
        SandboxClaimStatus {
            phase: ClaimPhase::Pending,
            reason: claim.status.reason.clone(),
            message: claim.status.message.clone(),
            failed_reservations: claim.status.failed_reservations,
            observed_generation: claim.metadata.generation,
            ..SandboxClaimStatus::default()
        }
    } else {
        SandboxClaimStatus {
            phase: ClaimPhase::Pending,
            message: Some(message),
            observed_generation: claim.metadata.generation,
            ..SandboxClaimStatus::default()
        }
    };
    if claim.status != status {
        let mut pending = claim;
        pending.status = status;
        match ctx.replace_status(&pending).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Action::Requeue(ctx.settings.pending_poll_interval()))
}

/// Surfaces the failure of sandboxes that were reserved for `claim` and
/// gave up provisioning, then deletes their records.
///
/// The claim keeps waiting, with a fresh reservation on the next pass,
/// until [`MAX_FAILED_RESERVATIONS`] have failed in a row.
async fn record_failed_reservations(
    ctx: &Context,
    mut claim: SandboxClaim,
    failed: &[&Sandbox],
) -> Result<Action, ReconcileError> {
    let Some(&latest) = failed.iter().max_by(|a, b| by_age(&a.metadata, &b.metadata)) else {
        return Ok(Action::Done);
    };
    let count = u32::try_from(failed.len()).unwrap_or(u32::MAX);
    let attempts = claim.status.failed_reservations.saturating_add(count);
    let give_up = attempts >= MAX_FAILED_RESERVATIONS;

    claim.status = SandboxClaimStatus {
        phase: if give_up {
            ClaimPhase::Failed
        } else {
            ClaimPhase::Pending
        },
        reason: Some(REASON_PROVISION_FAILED.to_string()),
        message: Some(format!(
            "sandbox '{}' failed to provision: {}",
            latest.metadata.name,
            latest.status.failure_reason.as_deref().unwrap_or_default()
        )),
        failed_reservations: attempts,
        observed_generation: claim.metadata.generation,
        ..SandboxClaimStatus::default()
    };
    match ctx.replace_status(&claim).await {
        Ok(_) => {}
        // Records stay until the claim has counted them.
        Err(e) if e.is_conflict() => return Ok(Action::Requeue(ctx.backoff().delay(1))),
        Err(e) => return Err(e.into()),
    }
    warn!(
        claim = %claim.metadata.name,
        attempts,
        give_up,
        message = claim.status.message.as_deref().unwrap_or_default(),
        "reserved sandbox failed to provision"
    );

    for sandbox in failed {
        lifecycle::delete_record(ctx, sandbox).await?;
    }

    Ok(if give_up {
        Action::Done
    } else {
        Action::Requeue(ctx.backoff().delay(attempts))
    })
}

async fn fail(
    ctx: &Context,
    claim: &SandboxClaim,
    reason: &str,
    message: String,
) -> Result<Action, ReconcileError> {
    let status = SandboxClaimStatus {
        phase: ClaimPhase::Failed,
        reason: Some(reason.to_string()),
        message: Some(message),
        observed_generation: claim.metadata.generation,
        ..SandboxClaimStatus::default()
    };
    if claim.status != status {
        warn!(
            claim = %claim.metadata.name,
            reason,
            message = status.message.as_deref().unwrap_or_default(),
            "claim failed"
        );
        let mut failed = claim.clone();
        failed.status = status;
        ctx.replace_status(&failed).await?;
    }
    Ok(Action::Done)
}

/// Lets go of everything held for a claim that no longer exists.
async fn clean_up_deleted(
    ctx: &Context,
    name: &str,
    sandboxes: &[Sandbox],
) -> Result<Action, ReconcileError> {
    let mut requeue = false;
    for sandbox in sandboxes {
        let bound_here = sandbox.phase() == SandboxPhase::Claimed
            && sandbox
                .status
                .bound_claim
                .as_ref()
                .is_some_and(|c| c.name == name);
        let reserved_here = sandbox.metadata.owner.is_none()
            && sandbox
                .spec
                .reserved_for
                .as_ref()
                .is_some_and(|c| c.name == name);

        if bound_here {
            requeue |= release(ctx, sandbox).await? != Action::Done;
        } else if reserved_here && sandbox.phase() == SandboxPhase::Terminated {
            lifecycle::delete_record(ctx, sandbox).await?;
        } else if reserved_here {
            lifecycle::delete_sandbox(ctx, sandbox).await?;
        }
    }

    Ok(if requeue {
        Action::Requeue(ctx.backoff().delay(1))
    } else {
        Action::Done
    })
}

/// Retires unclaimed sandboxes reserved for an earlier claim of the same name.
async fn drop_stale_reservations(
    ctx: &Context,
    me: &ClaimRef,
    sandboxes: &[Sandbox],
) -> Result<(), ReconcileError> {
    for sandbox in sandboxes.iter().filter(|s| {
        s.metadata.owner.is_none()
            && matches!(s.phase(), SandboxPhase::Provisioning | SandboxPhase::Ready)
            && s
                .spec
                .reserved_for
                .as_ref()
                .is_some_and(|r| r.name == me.name && r.uid != me.uid)
    }) {
        lifecycle::delete_sandbox(ctx, sandbox).await?;
    }
    Ok(())
}

/// Returns a sandbox whose claim let go of it.
///
/// It goes back to `Ready` when its pool still exists and still builds
/// sandboxes from the same template; otherwise it is retired. Sandboxes
/// made for a template claim are always retired.
pub(crate) async fn release(ctx: &Context, sandbox: &Sandbox) -> Result<Action, ReconcileError> {
    let back_to_pool = match sandbox
        .metadata
        .owner
        .as_ref()
        .filter(|o| o.kind == Kind::WarmPool)
    {
        Some(owner) => match ctx.get::<SandboxWarmPool>(&owner.name).await? {
            Some(pool) if pool.metadata.uid == owner.uid => {
                match ctx.templates().resolve(&pool.spec.template_ref).await {
                    Ok(template) => template.hash == sandbox.spec.template_hash,
                    Err(ReconcileError::Validation { .. }) => false,
                    Err(e) => return Err(e),
                }
            }
            _ => false,
        },
        None => false,
    };

    let next = if back_to_pool {
        SandboxPhase::Ready
    } else {
        SandboxPhase::Terminating
    };
    let previous = sandbox.status.bound_claim.as_ref().map(|c| c.name.clone());
    let mut released = sandbox.clone();
    released.transition(next)?;

    match ctx.replace_status(&released).await {
        Ok(_) => {
            info!(
                sandbox = %sandbox.metadata.name,
                claim = previous.as_deref().unwrap_or_default(),
                phase = %next,
                "sandbox released"
            );
            Ok(Action::Done)
        }
        Err(e) if e.is_conflict() => Ok(Action::Requeue(ctx.backoff().delay(1))),
        Err(e) if e.is_not_found() => Ok(Action::Done),
        Err(e) => Err(e.into()),
    }
}
