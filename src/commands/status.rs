//! Print pools, claims and sandboxes from the last snapshot written by `run`.

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use std::fmt::Write;

use crate::resources::{by_age, ClaimPhase, SandboxPhase, CONDITION_PROVISION_FAILED, CONDITION_TEMPLATE_VALID};
use crate::state::StateSnapshot;

pub(crate) fn run() -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    match StateSnapshot::load(&cwd)? {
        Some(snapshot) => print!("{}", format_status(&snapshot)),
        None => {
            println!("\n{} No snapshot found.", "ℹ".blue());
            println!("  Run {} to start the controller.", "agent-sandbox run".green());
        }
    }

    Ok(())
}

fn sandbox_phase(phase: SandboxPhase) -> ColoredString {
    let text = phase.to_string();
    match phase {
        SandboxPhase::Ready => text.green(),
        SandboxPhase::Claimed => text.cyan(),
        SandboxPhase::Provisioning => text.yellow(),
        SandboxPhase::Terminating | SandboxPhase::Terminated => text.dimmed(),
    }
}

fn claim_phase(phase: ClaimPhase) -> ColoredString {
    let text = phase.to_string();
    match phase {
        ClaimPhase::Bound => text.green(),
        ClaimPhase::Pending => text.yellow(),
        ClaimPhase::Failed => text.red().bold(),
    }
}

fn format_status(snapshot: &StateSnapshot) -> String {
    let mut out = String::new();

    writeln!(&mut out, "\n{}", "━".repeat(60).dimmed()).unwrap();
    writeln!(&mut out, "{}", "   Agent Sandbox Status".yellow().bold()).unwrap();
    writeln!(
        &mut out,
        "   snapshot at {} (revision {})",
        snapshot.written_at.format("%Y-%m-%d %H:%M:%S UTC"),
        snapshot.revision
    )
    .unwrap();
    writeln!(&mut out, "{}", "━".repeat(60).dimmed()).unwrap();

    writeln!(&mut out, "\n{}", "Pools".bold()).unwrap();
    if snapshot.pools.is_empty() {
        writeln!(&mut out, "  {}", "none".dimmed()).unwrap();
    }
    for pool in &snapshot.pools {
        writeln!(
            &mut out,
            "  {}  template={}  ready {}/{}  provisioning {}  claimed {}",
            pool.metadata.name.cyan(),
            pool.spec.template_ref,
            pool.status.ready_count,
            pool.spec.desired_ready,
            pool.status.provisioning_count,
            pool.status.claimed_count
        )
        .unwrap();
        for condition in &pool.status.conditions {
            let failing = (condition.type_ == CONDITION_TEMPLATE_VALID && !condition.status)
                || (condition.type_ == CONDITION_PROVISION_FAILED && condition.status);
            if failing {
                writeln!(
                    &mut out,
                    "    {} {}: {}",
                    "⚠".yellow(),
                    condition.type_,
                    condition.message
                )
                .unwrap();
            }
        }
    }

    writeln!(&mut out, "\n{}", "Claims".bold()).unwrap();
    if snapshot.claims.is_empty() {
        writeln!(&mut out, "  {}", "none".dimmed()).unwrap();
    }
    for claim in &snapshot.claims {
        let target = claim
            .spec
            .pool_ref
            .as_deref()
            .map(|p| format!("pool={p}"))
            .or_else(|| claim.spec.template_ref.as_deref().map(|t| format!("template={t}")))
            .unwrap_or_default();
        let detail = match claim.status.phase {
            ClaimPhase::Bound => claim.status.bound_sandbox.clone().unwrap_or_default(),
            _ => claim.status.message.clone().unwrap_or_default(),
        };
        writeln!(
            &mut out,
            "  {}  {}  {}  {}",
            claim.metadata.name.cyan(),
            target,
            claim_phase(claim.status.phase),
            detail.dimmed()
        )
        .unwrap();
    }

    writeln!(&mut out, "\n{}", "Sandboxes".bold()).unwrap();
    if snapshot.sandboxes.is_empty() {
        writeln!(&mut out, "  {}", "none".dimmed()).unwrap();
    }
    let mut sandboxes: Vec<_> = snapshot.sandboxes.iter().collect();
    sandboxes.sort_by(|a, b| by_age(&a.metadata, &b.metadata));
    for sandbox in sandboxes {
        let owner = sandbox
            .owner_pool()
            .map_or_else(|| "direct".to_string(), |p| format!("pool={p}"));
        let claim = sandbox
            .status
            .bound_claim
            .as_ref()
            .map(|c| format!("claim={}", c.name))
            .unwrap_or_default();
        writeln!(
            &mut out,
            "  {}  {}  {}  {}",
            sandbox.metadata.name.cyan(),
            sandbox_phase(sandbox.phase()),
            owner,
            claim
        )
        .unwrap();
        if let Some(reason) = &sandbox.status.failure_reason {
            writeln!(&mut out, "    {} {}", "✗".red(), reason).unwrap();
        }
    }

    writeln!(&mut out, "{}", "━".repeat(60).dimmed()).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        Condition, ObjectMeta, SandboxClaim, SandboxWarmPool, Sandbox, SandboxSpec, SandboxStatus,
    };
    use chrono::Utc;

    fn snapshot() -> StateSnapshot {
        let mut pool = SandboxWarmPool::new("python-pool", "python", 2);
        pool.status.ready_count = 1;
        pool.status.claimed_count = 1;
        pool.status.conditions.push(Condition::new(
            CONDITION_PROVISION_FAILED,
            true,
            "ProvisionFailed",
            "sandbox python-pool-x: image not found",
        ));

        let mut claim = SandboxClaim::for_pool("agent-1", "python-pool");
        claim.status.phase = ClaimPhase::Bound;
        claim.status.bound_sandbox = Some("python-pool-abcde".into());

        let mut meta = ObjectMeta::named("python-pool-abcde");
        meta.owner = Some(pool.metadata.owner_ref(crate::resources::Kind::WarmPool));
        let sandbox = Sandbox {
            metadata: meta,
            spec: SandboxSpec {
                template_ref: "python".into(),
                template_hash: "h1".into(),
                reserved_for: None,
            },
            status: SandboxStatus {
                phase: SandboxPhase::Claimed,
                ..SandboxStatus::default()
            },
        };

        StateSnapshot {
            written_at: Utc::now(),
            revision: 42,
            templates: Vec::new(),
            pools: vec![pool],
            claims: vec![claim],
            sandboxes: vec![sandbox],
        }
    }

    #[test]
    fn test_format_status_lists_everything() {
        let output = format_status(&snapshot());
        assert!(output.contains("revision 42"));
        assert!(output.contains("python-pool"));
        assert!(output.contains("ready 1/2"));
        assert!(output.contains("agent-1"));
        assert!(output.contains("Bound"));
        assert!(output.contains("pool=python-pool"));
        assert!(output.contains("image not found"));
    }

    #[test]
    fn test_format_status_empty() {
        let empty = StateSnapshot {
            written_at: Utc::now(),
            revision: 0,
            templates: Vec::new(),
            pools: Vec::new(),
            claims: Vec::new(),
            sandboxes: Vec::new(),
        };
        let output = format_status(&empty);
        assert_eq!(output.matches("none").count(), 3);
    }
}
