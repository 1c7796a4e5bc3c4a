//! Check a manifest without starting the controller.

use anyhow::{bail, Result};
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;

use crate::manifest::Manifest;

pub(crate) fn run(manifest_path: &Path) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let problems = manifest.problems();

    print!("{}", format_report(manifest_path, &manifest, &problems));

    if !problems.is_empty() {
        bail!("{} problem(s) in {}", problems.len(), manifest_path.display());
    }
    Ok(())
}

fn format_report(path: &Path, manifest: &Manifest, problems: &[String]) -> String {
    let mut out = String::new();

    if !problems.is_empty() {
        writeln!(&mut out, "\n{} {} is invalid:", "✗".red().bold(), path.display()).unwrap();
        for problem in problems {
            writeln!(&mut out, "  - {problem}").unwrap();
        }
        return out;
    }

    writeln!(&mut out, "\n{} {} is valid", "✓".green().bold(), path.display()).unwrap();
    for template in &manifest.templates {
        writeln!(
            &mut out,
            "  template {}  hash {}",
            template.name.cyan(),
            template.spec.pod_template.hash().dimmed()
        )
        .unwrap();
    }
    for pool in &manifest.pools {
        writeln!(
            &mut out,
            "  pool {}  template={}  desiredReady={}",
            pool.name.cyan(),
            pool.spec.template_ref,
            pool.spec.desired_ready
        )
        .unwrap();
    }
    writeln!(&mut out, "  {} claim(s)", manifest.claims.len()).unwrap();
    out
}
