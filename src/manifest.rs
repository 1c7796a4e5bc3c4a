//! Declared objects, loaded from `manifest.toml` and synced into the store.
//!
//! The manifest is the user-facing way to create templates, pools and
//! claims. Applying it is declarative: objects are created or updated to
//! match, and templates, pools and claims no longer listed are deleted.
//! Sandboxes are never declared; the controller owns them.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::resources::{
    is_dns_label, ClaimTarget, ObjectMeta, Resource, SandboxClaim, SandboxClaimSpec,
    SandboxClaimStatus, SandboxTemplate, SandboxTemplateSpec, SandboxTemplateStatus,
    SandboxWarmPool, SandboxWarmPoolSpec, SandboxWarmPoolStatus,
};
use crate::store::{Store, Stored};

pub(crate) const MANIFEST_FILE: &str = "manifest.toml";

/// Attempts at a replace that keeps losing to concurrent status writes.
const REPLACE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    #[serde(default)]
    pub templates: Vec<TemplateEntry>,
    #[serde(default)]
    pub pools: Vec<PoolEntry>,
    #[serde(default)]
    pub claims: Vec<ClaimEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TemplateEntry {
    pub name: String,
    #[serde(flatten)]
    pub spec: SandboxTemplateSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PoolEntry {
    pub name: String,
    #[serde(flatten)]
    pub spec: SandboxWarmPoolSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ClaimEntry {
    pub name: String,
    #[serde(flatten)]
    pub spec: SandboxClaimSpec,
}

/// What an [`apply`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ApplySummary {
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

impl fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted",
            self.created, self.updated, self.deleted
        )
    }
}

impl Manifest {
    /// Loads and parses the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }

    /// Lists everything wrong with the manifest. Empty means valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        check_names("template", self.templates.iter().map(|t| &t.name), &mut problems);
        check_names("pool", self.pools.iter().map(|p| &p.name), &mut problems);
        check_names("claim", self.claims.iter().map(|c| &c.name), &mut problems);

        for template in &self.templates {
            if let Err(message) = template.spec.pod_template.validate() {
                problems.push(format!("template '{}': {message}", template.name));
            }
        }

        let templates: HashSet<&str> = self.templates.iter().map(|t| t.name.as_str()).collect();
        let pools: HashSet<&str> = self.pools.iter().map(|p| p.name.as_str()).collect();

        for pool in &self.pools {
            if !templates.contains(pool.spec.template_ref.as_str()) {
                problems.push(format!(
                    "pool '{}': template '{}' is not declared",
                    pool.name, pool.spec.template_ref
                ));
            }
        }

        for claim in &self.claims {
            match claim.spec.target() {
                Ok(ClaimTarget::Pool(pool)) if !pools.contains(pool) => {
                    problems.push(format!("claim '{}': pool '{pool}' is not declared", claim.name));
                }
                Ok(ClaimTarget::Template(template)) if !templates.contains(template) => {
                    problems.push(format!(
                        "claim '{}': template '{template}' is not declared",
                        claim.name
                    ));
                }
                Ok(_) => {}
                Err(message) => problems.push(format!("claim '{}': {message}", claim.name)),
            }
        }

        problems
    }

    /// Fails with every problem found, one per line.
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            return Ok(());
        }
        bail!("Invalid manifest:\n  {}", problems.join("\n  "))
    }

    fn template_objects(&self) -> Vec<SandboxTemplate> {
        self.templates
            .iter()
            .map(|t| SandboxTemplate {
                metadata: ObjectMeta::named(&t.name),
                spec: t.spec.clone(),
                status: SandboxTemplateStatus::default(),
            })
            .collect()
    }

    fn pool_objects(&self) -> Vec<SandboxWarmPool> {
        self.pools
            .iter()
            .map(|p| SandboxWarmPool {
                metadata: ObjectMeta::named(&p.name),
                spec: p.spec.clone(),
                status: SandboxWarmPoolStatus::default(),
            })
            .collect()
    }

    fn claim_objects(&self) -> Vec<SandboxClaim> {
        self.claims
            .iter()
            .map(|c| SandboxClaim {
                metadata: ObjectMeta::named(&c.name),
                spec: c.spec.clone(),
                status: SandboxClaimStatus::default(),
            })
            .collect()
    }
}

fn check_names<'a>(
    kind: &str,
    names: impl Iterator<Item = &'a String>,
    problems: &mut Vec<String>,
) {
    let mut seen = HashSet::new();
    for name in names {
        if !is_dns_label(name) {
            problems.push(format!("{kind} name '{name}' must be a lowercase DNS label"));
        }
        if !seen.insert(name.as_str()) {
            problems.push(format!("duplicate {kind} '{name}'"));
        }
    }
}

/// Makes the store's templates, pools and claims match `manifest`.
///
/// Referenced objects are written before the objects referring to them, and
/// deleted after them.
pub(crate) async fn apply(store: &Store, manifest: &Manifest) -> Result<ApplySummary> {
    manifest.validate()?;
    let mut summary = ApplySummary::default();

    sync(store, manifest.template_objects(), &mut summary).await?;
    sync(store, manifest.pool_objects(), &mut summary).await?;
    sync(store, manifest.claim_objects(), &mut summary).await?;

    prune::<SandboxClaim>(store, manifest.claims.iter().map(|c| c.name.as_str()), &mut summary)
        .await?;
    prune::<SandboxWarmPool>(store, manifest.pools.iter().map(|p| p.name.as_str()), &mut summary)
        .await?;
    prune::<SandboxTemplate>(
        store,
        manifest.templates.iter().map(|t| t.name.as_str()),
        &mut summary,
    )
    .await?;

    if !summary.is_empty() {
        info!(
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            "manifest applied"
        );
    }
    Ok(summary)
}

async fn sync<T: Stored>(store: &Store, desired: Vec<T>, summary: &mut ApplySummary) -> Result<()> {
    for object in desired {
        let name = object.name().to_string();
        match store.get::<T>(&name).await {
            Ok(current) => {
                if replace_spec(store, current, object.spec()).await? {
                    debug!(kind = %T::KIND, name = %name, "spec updated");
                    summary.updated += 1;
                }
            }
            Err(e) if e.is_not_found() => {
                store
                    .create(object)
                    .await
                    .with_context(|| format!("Failed to create {} '{name}'", T::KIND))?;
                debug!(kind = %T::KIND, name = %name, "created");
                summary.created += 1;
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {} '{name}'", T::KIND)),
        }
    }
    Ok(())
}

/// Writes `spec` onto `current`, re-reading on conflict. Returns false if
/// the spec already matched.
async fn replace_spec<T: Stored>(store: &Store, mut current: T, spec: &T::Spec) -> Result<bool> {
    let name = current.name().to_string();
    for _ in 0..REPLACE_ATTEMPTS {
        if current.spec() == spec {
            return Ok(false);
        }
        let mut updated = current.clone();
        *updated.spec_mut() = spec.clone();
        match store.replace(&updated).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_conflict() => {
                current = store
                    .get::<T>(&name)
                    .await
                    .with_context(|| format!("Failed to re-read {} '{name}'", T::KIND))?;
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to update {} '{name}'", T::KIND)),
        }
    }
    bail!("Gave up updating {} '{name}' after {REPLACE_ATTEMPTS} conflicts", T::KIND)
}

async fn prune<'a, T: Stored>(
    store: &Store,
    declared: impl Iterator<Item = &'a str>,
    summary: &mut ApplySummary,
) -> Result<()> {
    let declared: HashSet<&str> = declared.collect();
    for object in store.list::<T>().await? {
        if declared.contains(object.name()) {
            continue;
        }
        match store.delete::<T>(object.name(), None).await {
            Ok(_) => {
                debug!(kind = %T::KIND, name = %object.name(), "deleted");
                summary.deleted += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to delete {} '{}'", T::KIND, object.name()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ClaimPhase;
    use tempfile::tempdir;

    const MANIFEST: &str = r#"
[[templates]]
name = "python"

[[templates.podTemplate.spec.containers]]
name = "runtime"
image = "python:3.12-slim"
command = ["sleep", "infinity"]

[[pools]]
name = "python-pool"
templateRef = "python"
desiredReady = 2

[[claims]]
name = "agent-1"
poolRef = "python-pool"
"#;

    fn manifest() -> Manifest {
        toml::from_str(MANIFEST).unwrap()
    }

    #[test]
    fn test_parse_manifest() {
        let m = manifest();
        assert_eq!(m.templates.len(), 1);
        assert_eq!(m.templates[0].spec.pod_template.spec.containers[0].image, "python:3.12-slim");
        assert_eq!(m.pools[0].spec.desired_ready, 2);
        assert_eq!(m.claims[0].spec.pool_ref.as_deref(), Some("python-pool"));
        assert!(m.problems().is_empty());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        fs::write(&path, "[[pools]]\nname = 1\n").unwrap();

        let err = Manifest::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse manifest"));
        assert!(Manifest::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_problems_catch_bad_references() {
        let mut m = manifest();
        m.pools.push(PoolEntry {
            name: "node-pool".into(),
            spec: SandboxWarmPoolSpec {
                template_ref: "node".into(),
                desired_ready: 1,
            },
        });
        m.claims.push(ClaimEntry {
            name: "agent-2".into(),
            spec: SandboxClaimSpec {
                pool_ref: Some("python-pool".into()),
                template_ref: Some("python".into()),
            },
        });
        m.claims.push(ClaimEntry {
            name: "agent-1".into(),
            spec: SandboxClaimSpec {
                pool_ref: Some("ghost".into()),
                template_ref: None,
            },
        });

        let problems = m.problems();
        assert!(problems.iter().any(|p| p.contains("template 'node' is not declared")));
        assert!(problems.iter().any(|p| p.contains("not both")));
        assert!(problems.iter().any(|p| p.contains("duplicate claim 'agent-1'")));
        assert!(problems.iter().any(|p| p.contains("pool 'ghost' is not declared")));
    }

    #[test]
    fn test_problems_catch_invalid_template_and_names() {
        let mut m = manifest();
        m.templates[0].spec.pod_template.spec.containers[0].image = String::new();
        m.pools[0].name = "Python_Pool".into();

        let problems = m.problems();
        assert!(problems.iter().any(|p| p.contains("has no image")));
        assert!(problems.iter().any(|p| p.contains("must be a lowercase DNS label")));
        assert!(m.validate().unwrap_err().to_string().contains("Invalid manifest"));
    }

    #[tokio::test]
    async fn test_apply_creates_then_is_idempotent() {
        let store = Store::new();
        let summary = apply(&store, &manifest()).await.unwrap();
        assert_eq!(summary.created, 3);

        let pool = store.get::<SandboxWarmPool>("python-pool").await.unwrap();
        let again = apply(&store, &manifest()).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(
            store
                .get::<SandboxWarmPool>("python-pool")
                .await
                .unwrap()
                .metadata
                .resource_version,
            pool.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_apply_updates_spec_and_keeps_status() {
        let store = Store::new();
        apply(&store, &manifest()).await.unwrap();

        let mut claim = store.get::<SandboxClaim>("agent-1").await.unwrap();
        claim.status.phase = ClaimPhase::Failed;
        store.replace_status(&claim).await.unwrap();

        let mut m = manifest();
        m.pools[0].spec.desired_ready = 5;
        let summary = apply(&store, &m).await.unwrap();
        assert_eq!(summary.updated, 1);

        let pool = store.get::<SandboxWarmPool>("python-pool").await.unwrap();
        assert_eq!(pool.spec.desired_ready, 5);
        assert_eq!(pool.metadata.generation, 2);
        let claim = store.get::<SandboxClaim>("agent-1").await.unwrap();
        assert_eq!(claim.status.phase, ClaimPhase::Failed);
    }

    #[tokio::test]
    async fn test_apply_deletes_undeclared_objects() {
        let store = Store::new();
        apply(&store, &manifest()).await.unwrap();

        let mut m = manifest();
        m.claims.clear();
        let summary = apply(&store, &m).await.unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(store.get::<SandboxClaim>("agent-1").await.unwrap_err().is_not_found());
        assert!(store.get::<SandboxWarmPool>("python-pool").await.is_ok());
    }

    #[tokio::test]
    async fn test_apply_rejects_invalid_manifest() {
        let store = Store::new();
        let mut m = manifest();
        m.pools[0].spec.template_ref = "ghost".into();
        assert!(apply(&store, &m).await.is_err());
        assert!(store.list::<SandboxTemplate>().await.unwrap().is_empty());
    }
}
