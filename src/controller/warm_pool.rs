//! Keeps each warm pool at its desired number of Ready sandboxes.

use tracing::{debug, info};

use super::context::Context;
use super::error::ReconcileError;
use super::lifecycle;
use super::Action;
use crate::resources::{
    by_age, remove_condition, set_condition, Condition, Kind, Sandbox, SandboxPhase,
    SandboxWarmPool, SandboxWarmPoolStatus, CONDITION_PROVISION_FAILED, CONDITION_TEMPLATE_VALID,
};

/// Owned sandboxes sorted by what the pool should do with them.
#[derive(Debug, Default)]
struct Classified {
    ready: Vec<Sandbox>,
    provisioning: Vec<Sandbox>,
    claimed: Vec<Sandbox>,
    stale: Vec<Sandbox>,
    terminated: Vec<Sandbox>,
}

impl Classified {
    fn new(sandboxes: Vec<Sandbox>, hash: &str) -> Self {
        let mut out = Self::default();
        for sandbox in sandboxes {
            let current = sandbox.spec.template_hash == hash;
            match sandbox.phase() {
                SandboxPhase::Claimed => out.claimed.push(sandbox),
                SandboxPhase::Terminated => out.terminated.push(sandbox),
                SandboxPhase::Terminating => {}
                SandboxPhase::Ready | SandboxPhase::Provisioning if !current => {
                    out.stale.push(sandbox);
                }
                SandboxPhase::Ready if sandbox.status.bound_claim.is_none() => {
                    out.ready.push(sandbox);
                }
                SandboxPhase::Ready => out.claimed.push(sandbox),
                SandboxPhase::Provisioning => out.provisioning.push(sandbox),
            }
        }
        out.ready.sort_by(|a, b| by_age(&a.metadata, &b.metadata));
        out.provisioning
            .sort_by(|a, b| by_age(&a.metadata, &b.metadata));
        out
    }
}

/// Converges pool `name` toward its desired Ready count.
pub(crate) async fn reconcile_pool(ctx: &Context, name: &str) -> Result<Action, ReconcileError> {
    let sandboxes = ctx.list::<Sandbox>().await?;
    let Some(pool) = ctx.get::<SandboxWarmPool>(name).await? else {
        collect_orphans(ctx, name, None, &sandboxes).await?;
        return Ok(Action::Done);
    };

    // Sandboxes left behind by an earlier pool with the same name.
    collect_orphans(ctx, name, Some(&pool.metadata.uid), &sandboxes).await?;

    let template = match ctx.templates().resolve(&pool.spec.template_ref).await {
        Ok(template) => template,
        Err(ReconcileError::Validation { message, .. }) => {
            let mut status = pool.status.clone();
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_TEMPLATE_VALID, false, "ValidationError", message),
            );
            status.template_hash = None;
            status.observed_generation = pool.metadata.generation;
            write_status(ctx, &pool, status).await?;
            // Retried when the pool or its template changes.
            return Ok(Action::Done);
        }
        Err(e) => return Err(e),
    };

    let owned: Vec<Sandbox> = sandboxes
        .into_iter()
        .filter(|s| {
            s.metadata
                .owner
                .as_ref()
                .is_some_and(|o| o.kind == Kind::WarmPool && o.name == name && o.uid == pool.metadata.uid)
        })
        .collect();
    let classified = Classified::new(owned, &template.hash);
    let desired = pool.spec.desired_ready as usize;

    for sandbox in &classified.stale {
        debug!(pool = %name, sandbox = %sandbox.metadata.name, "retiring sandbox from old template");
        lifecycle::delete_sandbox(ctx, sandbox).await?;
    }

    let mut ready = classified.ready.len();
    let mut provisioning = classified.provisioning.len();
    let supply = ready + provisioning;

    if supply < desired {
        let owner = pool.metadata.owner_ref(Kind::WarmPool);
        for _ in supply..desired {
            lifecycle::create_sandbox(ctx, &template, name, Some(owner.clone()), None).await?;
            provisioning += 1;
        }
        info!(pool = %name, created = desired - supply, "scaling up");
    } else if supply > desired {
        let excess = supply - desired;
        info!(pool = %name, excess, "scaling down");
        // Oldest Ready first, then oldest Provisioning.
        let victims = classified
            .ready
            .iter()
            .map(|s| (s, true))
            .chain(classified.provisioning.iter().map(|s| (s, false)))
            .take(excess);
        for (sandbox, was_ready) in victims {
            if lifecycle::delete_sandbox(ctx, sandbox).await? {
                if was_ready {
                    ready -= 1;
                } else {
                    provisioning -= 1;
                }
            }
        }
    }

    let mut status = pool.status.clone();
    prune_terminated(ctx, name, &classified.terminated, &mut status.conditions).await?;
    if classified.terminated.is_empty() && ready >= desired {
        remove_condition(&mut status.conditions, CONDITION_PROVISION_FAILED);
    }
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_TEMPLATE_VALID, true, "TemplateResolved", ""),
    );
    status.ready_count = count(ready);
    status.provisioning_count = count(provisioning);
    status.claimed_count = count(classified.claimed.len());
    status.template_hash = Some(template.hash);
    status.observed_generation = pool.metadata.generation;
    write_status(ctx, &pool, status).await?;

    Ok(Action::Done)
}

/// Deletes Terminated sandboxes, surfacing the latest failure reason.
async fn prune_terminated(
    ctx: &Context,
    pool: &str,
    terminated: &[Sandbox],
    conditions: &mut Vec<Condition>,
) -> Result<(), ReconcileError> {
    let latest_failure = terminated
        .iter()
        .filter(|s| s.status.failure_reason.is_some())
        .max_by(|a, b| by_age(&a.metadata, &b.metadata));
    if let Some(failed) = latest_failure {
        let reason = failed.status.failure_reason.clone().unwrap_or_default();
        set_condition(
            conditions,
            Condition::new(
                CONDITION_PROVISION_FAILED,
                true,
                "ProvisionFailed",
                format!("sandbox {}: {reason}", failed.metadata.name),
            ),
        );
    }

    for sandbox in terminated {
        match ctx
            .delete::<Sandbox>(&sandbox.metadata.name, Some(sandbox.metadata.resource_version))
            .await
        {
            Ok(_) => debug!(pool = %pool, sandbox = %sandbox.metadata.name, "pruned terminated sandbox"),
            Err(e) if e.is_not_found() || e.is_conflict() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Retires sandboxes owned by a pool named `name` whose uid is not `live_uid`.
///
/// Claimed ones stay until their claim lets go.
async fn collect_orphans(
    ctx: &Context,
    name: &str,
    live_uid: Option<&str>,
    sandboxes: &[Sandbox],
) -> Result<(), ReconcileError> {
    let orphans = sandboxes.iter().filter(|s| {
        s.metadata.owner.as_ref().is_some_and(|o| {
            o.kind == Kind::WarmPool && o.name == name && Some(o.uid.as_str()) != live_uid
        })
    });

    for sandbox in orphans {
        match sandbox.phase() {
            SandboxPhase::Claimed => {}
            SandboxPhase::Terminated => {
                if let Err(e) = ctx
                    .delete::<Sandbox>(&sandbox.metadata.name, Some(sandbox.metadata.resource_version))
                    .await
                {
                    debug!(sandbox = %sandbox.metadata.name, error = %e, "orphan prune deferred");
                }
            }
            _ => {
                if lifecycle::delete_sandbox(ctx, sandbox).await? {
                    debug!(pool = %name, sandbox = %sandbox.metadata.name, "retired orphaned sandbox");
                }
            }
        }
    }
    Ok(())
}

async fn write_status(
    ctx: &Context,
    pool: &SandboxWarmPool,
    status: SandboxWarmPoolStatus,
) -> Result<(), ReconcileError> {
    if pool.status == status {
        return Ok(());
    }
    let mut updated = pool.clone();
    updated.status = status;
    ctx.replace_status(&updated).await?;
    Ok(())
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
