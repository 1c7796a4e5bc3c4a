//! The reconciliation engine.
//!
//! A [`Controller`] owns a deduplicating [`WorkQueue`] of object keys and a
//! fixed set of workers. Store change events, a periodic resync and the
//! reconcilers' own requeue requests feed the queue; workers pop keys and
//! run the reconciler for the key's kind. Every reconciler reads current
//! state and converges it, so handling a key twice is harmless.

mod backoff;
mod binder;
mod context;
mod error;
mod lifecycle;
mod queue;
mod template_store;
mod warm_pool;

use context::Context;
use error::ReconcileError;
use queue::{ObjectKey, WorkQueue};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ControllerConfig;
use crate::resources::{Kind, Sandbox, SandboxClaim, SandboxWarmPool};
use crate::runtime::PodRuntime;
use crate::store::{Store, StoreError, WatchAction, WatchEvent};

/// What a reconcile pass asks of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Converged; wait for the next event.
    Done,
    /// Look again after this long, event or not.
    Requeue(Duration),
}

/// Runs the warm-pool, claim and sandbox reconcilers over one store.
pub(crate) struct Controller {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
}

impl Controller {
    pub fn new(store: Arc<Store>, runtime: Arc<dyn PodRuntime>, settings: ControllerConfig) -> Self {
        let ctx = Arc::new(Context::new(store, runtime, settings));
        let queue = Arc::new(WorkQueue::new(ctx.backoff()));
        Self { ctx, queue }
    }

    /// Runs until `shutdown` turns true.
    ///
    /// In-flight passes finish before this returns; queued keys are dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // Subscribe before the initial listing so nothing falls in between.
        let mut events = self.ctx.store.watch();
        self.enqueue_all().await;

        let workers = self.ctx.settings.workers.max(1);
        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let ctx = Arc::clone(&self.ctx);
            let queue = Arc::clone(&self.queue);
            tasks.spawn(worker(id, ctx, queue));
        }
        info!(
            workers,
            runtime = self.ctx.runtime.name(),
            resync_secs = self.ctx.settings.resync_interval_secs,
            "controller started"
        );

        let mut resync = tokio::time::interval(self.ctx.settings.resync_interval());
        resync.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.enqueue_for(&event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "watch fell behind, resyncing");
                        self.enqueue_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = resync.tick() => {
                    debug!("periodic resync");
                    self.enqueue_all().await;
                }
            }
        }

        info!(queued = self.queue.len(), "controller stopping");
        self.queue.shut_down();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker panicked");
            }
        }
        info!("controller stopped");
    }

    async fn enqueue_for(&self, event: &WatchEvent) {
        match keys_for(&self.ctx, event).await {
            Ok(keys) => {
                for key in keys {
                    self.queue.add(key);
                }
            }
            Err(e) => {
                warn!(error = %e, kind = %event.kind, name = %event.meta.name, "could not map event, resyncing");
                self.enqueue_all().await;
            }
        }
    }

    async fn enqueue_all(&self) {
        match all_keys(&self.ctx).await {
            Ok(keys) => {
                for key in keys {
                    self.queue.add(key);
                }
            }
            Err(e) => warn!(error = %e, "resync listing failed"),
        }
    }
}

async fn worker(id: usize, ctx: Arc<Context>, queue: Arc<WorkQueue>) {
    while let Some(key) = queue.get().await {
        let span = info_span!("reconcile", worker = id, key = %key);
        let result = reconcile(&ctx, &key).instrument(span).await;

        match result {
            Ok(Action::Done) => queue.forget(&key),
            Ok(Action::Requeue(delay)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            // The object went away mid-pass; its deletion event covers it.
            Err(e) if e.is_not_found() => {
                debug!(key = %key, error = %e, "object vanished");
                queue.forget(&key);
            }
            Err(e) if e.is_transient() => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(key = %key, error = %e, retry_ms = delay.as_millis(), "reconcile failed, retrying");
            }
            Err(e) => {
                error!(key = %key, error = %e, "reconcile failed");
                queue.forget(&key);
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker exiting");
}

async fn reconcile(ctx: &Context, key: &ObjectKey) -> Result<Action, ReconcileError> {
    match key.kind {
        Kind::WarmPool => warm_pool::reconcile_pool(ctx, &key.name).await,
        Kind::Claim => binder::reconcile_claim(ctx, &key.name).await,
        Kind::Sandbox => lifecycle::reconcile_sandbox(ctx, &key.name).await,
        // Templates carry no state of their own; their dependents are
        // queued from the change event.
        Kind::Template => Ok(Action::Done),
    }
}

/// Keys whose reconcile outcome may depend on the changed object.
async fn keys_for(ctx: &Context, event: &WatchEvent) -> Result<BTreeSet<ObjectKey>, StoreError> {
    let name = event.meta.name.as_str();
    let mut keys = BTreeSet::new();

    match event.kind {
        Kind::Sandbox => {
            keys.insert(ObjectKey::new(Kind::Sandbox, name));
            if let Some(owner) = event.meta.owner.as_ref().filter(|o| o.kind == Kind::WarmPool) {
                keys.insert(ObjectKey::new(Kind::WarmPool, owner.name.clone()));
            }
            // A sandbox turning Ready may satisfy any waiting claim; one
            // going away matters to the claim bound to it.
            for claim in ctx.list::<SandboxClaim>().await? {
                if claim.is_pending() || claim.status.bound_sandbox.as_deref() == Some(name) {
                    keys.insert(ObjectKey::new(Kind::Claim, claim.metadata.name));
                }
            }
        }
        Kind::WarmPool => {
            keys.insert(ObjectKey::new(Kind::WarmPool, name));
            for claim in ctx.list::<SandboxClaim>().await? {
                if claim.spec.pool_ref.as_deref() == Some(name) {
                    keys.insert(ObjectKey::new(Kind::Claim, claim.metadata.name));
                }
            }
            // Orphans of a deleted pool are collected by their own passes.
            if event.action == WatchAction::Deleted {
                for sandbox in ctx.list::<Sandbox>().await? {
                    if sandbox.owner_pool() == Some(name) {
                        keys.insert(ObjectKey::new(Kind::Sandbox, sandbox.metadata.name));
                    }
                }
            }
        }
        Kind::Template => {
            for pool in ctx.list::<SandboxWarmPool>().await? {
                keys.insert(ObjectKey::new(Kind::WarmPool, pool.metadata.name));
            }
            for claim in ctx.list::<SandboxClaim>().await? {
                keys.insert(ObjectKey::new(Kind::Claim, claim.metadata.name));
            }
        }
        Kind::Claim => {
            keys.insert(ObjectKey::new(Kind::Claim, name));
        }
    }

    Ok(keys)
}

async fn all_keys(ctx: &Context) -> Result<Vec<ObjectKey>, StoreError> {
    let mut keys = Vec::new();
    keys.extend(
        ctx.list::<SandboxWarmPool>()
            .await?
            .into_iter()
            .map(|p| ObjectKey::new(Kind::WarmPool, p.metadata.name)),
    );
    keys.extend(
        ctx.list::<SandboxClaim>()
            .await?
            .into_iter()
            .map(|c| ObjectKey::new(Kind::Claim, c.metadata.name)),
    );
    keys.extend(
        ctx.list::<Sandbox>()
            .await?
            .into_iter()
            .map(|s| ObjectKey::new(Kind::Sandbox, s.metadata.name)),
    );
    Ok(keys)
}
