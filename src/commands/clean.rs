//! Remove the state snapshot and, with `--all`, the config and manifest.
//!
//! Which files go is decided from an existence check passed in as a
//! closure; IO happens only in [`run`].

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::CONFIG_FILE;
use crate::manifest::MANIFEST_FILE;
use crate::state::STATE_FILE;

/// Files written by `run`
fn state_files() -> Vec<PathBuf> {
    vec![PathBuf::from(STATE_FILE)]
}

/// Files written by `init`, removed with --all
fn config_files() -> Vec<PathBuf> {
    vec![PathBuf::from(CONFIG_FILE), PathBuf::from(MANIFEST_FILE)]
}

fn files_to_clean<E>(all: bool, exists: E) -> Vec<PathBuf>
where
    E: Fn(&Path) -> bool,
{
    let mut files = state_files();
    if all {
        files.extend(config_files());
    }
    files.into_iter().filter(|f| exists(f)).collect()
}

/// Removes the files that exist and returns their paths.
fn clean_files<E, R>(all: bool, exists: E, mut remove: R) -> Result<Vec<PathBuf>>
where
    E: Fn(&Path) -> bool,
    R: FnMut(&Path) -> Result<()>,
{
    let to_remove = files_to_clean(all, &exists);
    let mut removed = Vec::new();

    for file in to_remove {
        remove(&file)?;
        removed.push(file);
    }

    Ok(removed)
}

fn format_results(removed: &[PathBuf]) -> String {
    let mut out = String::new();
    if removed.is_empty() {
        writeln!(&mut out, "\n{} Nothing to clean.", "ℹ".blue()).unwrap();
    } else {
        writeln!(&mut out, "\n{} Removed:", "✓".green()).unwrap();
        for file in removed {
            writeln!(&mut out, "  {} {}", "✗".red(), file.display().to_string().dimmed()).unwrap();
        }
    }
    out
}

pub(crate) fn run(all: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    let removed = clean_files(
        all,
        |path| cwd.join(path).exists(),
        |path| {
            fs::remove_file(cwd.join(path))
                .with_context(|| format!("Failed to remove {}", path.display()))
        },
    )?;

    print!("{}", format_results(&removed));
    Ok(())
}
