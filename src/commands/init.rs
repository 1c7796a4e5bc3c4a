//! Write sample configuration and manifest files into a directory.
//!
//! The core logic takes closures for filesystem operations so it can be
//! tested without touching disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::manifest::MANIFEST_FILE;
use crate::templates;

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Runs the init command in the current directory.
pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    info!(dir = %cwd.display(), "initializing agent-sandbox");

    let files = init_files();

    let results = init_project(
        &files,
        force,
        |path| cwd.join(path).exists(),
        |path, content| {
            fs::write(cwd.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_results(&results, &files));

    Ok(())
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

/// File to be written during init.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    path: PathBuf,
    content: &'static str,
    description: &'static str,
}

/// Result of attempting to write a file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    /// Already there and `--force` not given.
    Skipped,
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

fn init_files() -> Vec<InitFile> {
    vec![
        InitFile {
            path: PathBuf::from(CONFIG_FILE),
            content: templates::AGENT_SANDBOX_TOML,
            description: "Controller and runtime configuration",
        },
        InitFile {
            path: PathBuf::from(MANIFEST_FILE),
            content: templates::MANIFEST_TOML,
            description: "Templates, pools and claims",
        },
    ]
}

/// Writes each file unless it exists, or always with `force`.
fn init_project<E, W>(
    files: &[InitFile],
    force: bool,
    exists: E,
    mut write_file: W,
) -> Result<Vec<(PathBuf, WriteResult)>>
where
    E: Fn(&Path) -> bool,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let mut results = Vec::new();

    for file in files {
        let existed = exists(&file.path);
        let result = match (existed, force) {
            (true, false) => WriteResult::Skipped,
            (true, true) => {
                write_file(&file.path, file.content)?;
                WriteResult::Overwritten
            }
            (false, _) => {
                write_file(&file.path, file.content)?;
                WriteResult::Created
            }
        };
        results.push((file.path.clone(), result));
    }

    Ok(results)
}

fn format_results(results: &[(PathBuf, WriteResult)], files: &[InitFile]) -> String {
    use std::fmt::Write;
    let mut out = String::new();

    writeln!(&mut out, "\n{} agent-sandbox initialized\n", "✓".green().bold()).unwrap();

    for (path, result) in results {
        let desc = files
            .iter()
            .find(|f| &f.path == path)
            .map_or("", |f| f.description);

        match result {
            WriteResult::Created => {
                writeln!(&mut out, "  {} - {}", path.display().to_string().cyan(), desc).unwrap();
            }
            WriteResult::Overwritten => {
                writeln!(&mut out, "  {} {} (overwritten)", "↻".blue(), path.display()).unwrap();
            }
            WriteResult::Skipped => {
                writeln!(
                    &mut out,
                    "  {} {} (already exists, use --force to overwrite)",
                    "⊘".yellow(),
                    path.display()
                )
                .unwrap();
            }
        }
    }

    writeln!(&mut out, "\n{}", "Next steps:".yellow().bold()).unwrap();
    writeln!(
        &mut out,
        "  1. Edit {} to declare templates, pools and claims",
        MANIFEST_FILE.cyan()
    )
    .unwrap();
    writeln!(&mut out, "  2. Run {} to check it", "agent-sandbox validate".green()).unwrap();
    writeln!(
        &mut out,
        "  3. Run {} to start the controller",
        "agent-sandbox run --watch".green()
    )
    .unwrap();

    out
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_init_files_cover_config_and_manifest() {
        let files = init_files();
        assert!(files.iter().any(|f| f.path.as_path() == Path::new(CONFIG_FILE)));
        assert!(files.iter().any(|f| f.path.as_path() == Path::new(MANIFEST_FILE)));
    }

    #[test]
    fn test_init_project_creates_files() {
        let files = init_files();
        let mut written = HashMap::new();

        let results = init_project(&files, false, |_| false, |path, content| {
            written.insert(path.to_path_buf(), content.to_string());
            Ok(())
        })
        .unwrap();

        assert!(results.iter().all(|(_, r)| *r == WriteResult::Created));
        assert_eq!(written.len(), files.len());
    }

    #[test]
    fn test_init_project_skips_existing_without_force() {
        let files = init_files();
        let mut writes = 0;

        let results = init_project(&files, false, |_| true, |_, _| {
            writes += 1;
            Ok(())
        })
        .unwrap();

        assert!(results.iter().all(|(_, r)| *r == WriteResult::Skipped));
        assert_eq!(writes, 0);
    }

    #[test]
    fn test_init_project_overwrites_with_force() {
        let files = init_files();
        let mut writes = 0;

        let results = init_project(&files, true, |_| true, |_, _| {
            writes += 1;
            Ok(())
        })
        .unwrap();

        assert!(results.iter().all(|(_, r)| *r == WriteResult::Overwritten));
        assert_eq!(writes, files.len());
    }

    #[test]
    fn test_init_project_mixed_exists() {
        let files = init_files();
        let results = init_project(
            &files,
            false,
            |path| path == Path::new(CONFIG_FILE),
            |_, _| Ok(()),
        )
        .unwrap();

        assert_eq!(results[0], (PathBuf::from(CONFIG_FILE), WriteResult::Skipped));
        assert_eq!(results[1], (PathBuf::from(MANIFEST_FILE), WriteResult::Created));
    }

    #[test]
    fn test_format_results() {
        let files = init_files();
        let results = vec![
            (PathBuf::from(CONFIG_FILE), WriteResult::Skipped),
            (PathBuf::from(MANIFEST_FILE), WriteResult::Created),
        ];

        let output = format_results(&results, &files);
        assert!(output.contains("initialized"));
        assert!(output.contains("already exists"));
        assert!(output.contains("Templates, pools and claims"));
        assert!(output.contains("Next steps"));
    }
}
