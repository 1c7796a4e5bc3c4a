use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::resources::{Sandbox, SandboxClaim, SandboxTemplate, SandboxWarmPool};

pub(crate) const STATE_FILE: &str = ".agent-sandbox/state.toml";

/// Point-in-time copy of every object in the store.
///
/// Written periodically by `run` so that `status` and external claimants can
/// observe pool and claim status without talking to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StateSnapshot {
    pub written_at: DateTime<Utc>,
    pub revision: u64,
    #[serde(default)]
    pub templates: Vec<SandboxTemplate>,
    #[serde(default)]
    pub pools: Vec<SandboxWarmPool>,
    #[serde(default)]
    pub claims: Vec<SandboxClaim>,
    #[serde(default)]
    pub sandboxes: Vec<Sandbox>,
}

impl StateSnapshot {
    /// Load the snapshot if one was written
    pub fn load(project_dir: &Path) -> Result<Option<Self>> {
        let state_path = project_dir.join(STATE_FILE);

        if !state_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&state_path)
            .with_context(|| format!("Failed to read state file: {}", state_path.display()))?;

        let state: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", state_path.display()))?;

        Ok(Some(state))
    }

    /// Save snapshot to file
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let state_path = project_dir.join(STATE_FILE);

        if let Some(parent) = state_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize state")?;

        // Write then rename so readers never see a half-written file.
        let tmp_path = state_path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write state file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &state_path)
            .with_context(|| format!("Failed to write state file: {}", state_path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        ClaimPhase, Container, ObjectMeta, PodMetadata, PodSpec, PodTemplate,
        SandboxTemplateSpec, SandboxTemplateStatus,
    };
    use tempfile::tempdir;

    fn snapshot() -> StateSnapshot {
        let mut meta = ObjectMeta::named("python");
        meta.creation_timestamp = Some(Utc::now());
        meta.labels.insert("team".into(), "ml".into());

        let template = SandboxTemplate {
            metadata: meta,
            spec: SandboxTemplateSpec {
                pod_template: PodTemplate {
                    metadata: PodMetadata::default(),
                    spec: PodSpec {
                        containers: vec![Container {
                            name: "runtime".into(),
                            image: "python:3.12".into(),
                            ..Default::default()
                        }],
                        restart_policy: None,
                    },
                },
            },
            status: SandboxTemplateStatus::default(),
        };

        let mut claim = SandboxClaim::for_pool("c1", "pool");
        claim.status.phase = ClaimPhase::Bound;
        claim.status.bound_sandbox = Some("pool-abcde".into());

        StateSnapshot {
            written_at: Utc::now(),
            revision: 7,
            templates: vec![template],
            pools: vec![SandboxWarmPool::new("pool", "python", 2)],
            claims: vec![claim],
            sandboxes: Vec::new(),
        }
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let dir = tempdir().unwrap();
        let state = snapshot();

        state.save(dir.path()).unwrap();
        let loaded = StateSnapshot::load(dir.path()).unwrap().unwrap();

        assert_eq!(loaded.revision, 7);
        assert_eq!(loaded.templates, state.templates);
        assert_eq!(loaded.pools, state.pools);
        assert_eq!(loaded.claims[0].status.phase, ClaimPhase::Bound);
        assert!(!dir.path().join(".agent-sandbox/state.toml.tmp").exists());
    }

    #[test]
    fn test_load_nonexistent() {
        let dir = tempdir().unwrap();
        let result = StateSnapshot::load(dir.path()).unwrap();
        assert!(result.is_none());
    }
}
