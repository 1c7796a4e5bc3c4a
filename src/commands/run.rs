//! Run the controller against the declared manifest.
//!
//! The store lives for the length of the command. Its contents are written to
//! `.agent-sandbox/state.toml` every few seconds so `status` (and anything
//! else interested in claim bindings) can read them.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::controller::Controller;
use crate::manifest::{self, Manifest};
use crate::runtime::{self, PodRuntime, RuntimeKind};
use crate::store::Store;

/// How often `--watch` checks the manifest's modification time.
const MANIFEST_POLL: Duration = Duration::from_secs(1);

/// Upper bound on tearing down pods at exit.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for `run`, as given on the command line.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunOptions {
    pub manifest: PathBuf,
    pub runtime: Option<RuntimeKind>,
    pub workers: Option<usize>,
    pub watch: bool,
    pub duration: Option<Duration>,
}

pub(crate) async fn run(options: RunOptions) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let mut config = Config::load(&cwd)?;
    let kind = apply_overrides(&mut config, &options)?;

    let manifest_path = cwd.join(&options.manifest);
    let manifest = Manifest::load(&manifest_path)?;

    let runtime = runtime::build(kind, &config.runtime)?;
    let store = Arc::new(Store::new());
    let summary = manifest::apply(&store, &manifest).await?;

    println!(
        "\n{} Controller starting ({} runtime, {} workers)",
        "▶".green().bold(),
        kind.to_string().cyan(),
        config.controller.workers.to_string().cyan()
    );
    println!("  Manifest: {} ({summary})", manifest_path.display());
    if options.watch {
        println!("  Watching manifest for changes");
    }
    println!("  Press {} to stop\n", "Ctrl-C".yellow());

    let (stop_tx, stop_rx) = watch::channel(false);
    let controller = Controller::new(Arc::clone(&store), Arc::clone(&runtime), config.controller.clone());
    let controller = tokio::spawn(controller.run(stop_rx));

    let mut snapshots = interval(config.controller.snapshot_interval());
    snapshots.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut manifest_poll = interval(MANIFEST_POLL);
    manifest_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_modified = modified(&manifest_path);

    let deadline = async {
        match options.duration {
            Some(duration) => sleep_until(Instant::now() + duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted, shutting down");
                break;
            }
            () = &mut deadline => {
                info!("run duration elapsed, shutting down");
                break;
            }
            _ = snapshots.tick() => write_snapshot(&store, &cwd),
            _ = manifest_poll.tick(), if options.watch => {
                let now = modified(&manifest_path);
                if manifest_changed(last_modified, now) {
                    last_modified = now;
                    reapply(&store, &manifest_path).await;
                }
            }
        }
    }

    // A send error only means the controller already stopped.
    let _ = stop_tx.send(true);
    if let Err(e) = controller.await {
        warn!(error = %e, "controller task failed");
    }
    write_snapshot(&store, &cwd);

    match remove_pods(runtime.as_ref(), CLEANUP_TIMEOUT).await {
        Some(0) | None => {}
        Some(removed) => println!("  {} Removed {removed} pod(s)", "✗".red()),
    }

    println!("\n{} Controller stopped", "■".yellow());
    Ok(())
}

/// Folds command-line overrides into `config` and picks the runtime.
fn apply_overrides(config: &mut Config, options: &RunOptions) -> Result<RuntimeKind> {
    if let Some(workers) = options.workers {
        config.controller.workers = workers.max(1);
    }
    match options.runtime {
        Some(kind) => {
            config.runtime.provider = kind.to_string();
            Ok(kind)
        }
        None => config.runtime.get_provider(),
    }
}

/// Removes every pod the runtime labelled, claimed ones included: bindings
/// live in the store, which ends with this process.
async fn remove_pods(runtime: &dyn PodRuntime, limit: Duration) -> Option<u32> {
    match tokio::time::timeout(limit, runtime.cleanup_orphaned()).await {
        Ok(Ok(removed)) => Some(removed),
        Ok(Err(e)) => {
            warn!(error = %e, "pod cleanup failed");
            None
        }
        Err(_) => {
            warn!("pod cleanup timed out");
            None
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn manifest_changed(last: Option<SystemTime>, now: Option<SystemTime>) -> bool {
    match (last, now) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(last), Some(now)) => now != last,
    }
}

async fn reapply(store: &Store, path: &Path) {
    let manifest = match Manifest::load(path) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "manifest changed but could not be loaded");
            return;
        }
    };
    match manifest::apply(store, &manifest).await {
        Ok(summary) => {
            info!(%summary, "manifest re-applied");
            println!("  {} Manifest re-applied ({summary})", "↻".blue());
        }
        Err(e) => warn!(error = %format!("{e:#}"), "manifest changed but was not applied"),
    }
}

fn write_snapshot(store: &Store, dir: &Path) {
    match store.snapshot().save(dir) {
        Ok(()) => debug!("snapshot written"),
        Err(e) => warn!(error = %format!("{e:#}"), "failed to write snapshot"),
    }
}
