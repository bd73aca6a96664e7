use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lock::FileLock;
use crate::worktree::WorktreeManager;

/// Spec directories live under `specs/` as `NNN-slug`.
pub const SPECS_DIR: &str = "specs";

/// Reserve the next globally unique spec number for `slug` and create its
/// directory, all inside one exclusive critical section.
///
/// The scan covers the main checkout and every task worktree so two
/// parallel spec-creation flows in sibling worktrees can never collide on
/// the same `NNN`.
pub fn reserve_spec_dir(
    manager: &WorktreeManager,
    slug: &str,
    timeout: Duration,
) -> Result<PathBuf> {
    let repo_root = manager.repo_root();
    let sentinel_target = repo_root.join(".auto-claude").join("spec_number");
    let _lock = FileLock::acquire(&sentinel_target, timeout)?;

    let mut roots = vec![repo_root.to_path_buf()];
    for worktree in manager.list_worktrees().unwrap_or_default() {
        roots.push(worktree.path);
    }

    let number = next_spec_number(&roots);
    let dir_name = format!("{number:03}-{slug}");
    let spec_dir = repo_root.join(SPECS_DIR).join(&dir_name);

    std::fs::create_dir_all(&spec_dir).map_err(|e| {
        Error::SpecNumber(format!(
            "failed to create spec dir {}: {e}",
            spec_dir.display()
        ))
    })?;

    info!(number, dir = %spec_dir.display(), "reserved spec directory");
    Ok(spec_dir)
}

/// `max(existing) + 1` across the spec directories of every root, or 1.
fn next_spec_number(roots: &[PathBuf]) -> u32 {
    roots
        .iter()
        .filter_map(|root| max_spec_number_in(&root.join(SPECS_DIR)))
        .max()
        .unwrap_or(0)
        + 1
}

fn max_spec_number_in(specs_dir: &Path) -> Option<u32> {
    let entries = std::fs::read_dir(specs_dir).ok()?;
    let prefix = spec_prefix_regex();
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            prefix
                .captures(&name)
                .and_then(|c| c[1].parse::<u32>().ok())
        })
        .max()
}

fn spec_prefix_regex() -> Regex {
    Regex::new(r"^(\d{3})-").expect("static regex")
}

/// Parse the numeric prefix from a spec directory name.
pub fn parse_spec_number(dir_name: &str) -> Option<u32> {
    spec_prefix_regex()
        .captures(dir_name)
        .and_then(|c| c[1].parse::<u32>().ok())
}

/// Find a spec directory by id (`NNN`), full name (`NNN-slug`) or bare slug.
pub fn find_spec_dir(repo_root: &Path, id_or_slug: &str) -> Result<Option<PathBuf>> {
    let specs = repo_root.join(SPECS_DIR);
    let entries = match std::fs::read_dir(&specs) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let wanted_number = id_or_slug.parse::<u32>().ok();
    for entry in entries.filter_map(|e| e.ok()) {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == id_or_slug {
            return Ok(Some(entry.path()));
        }
        if let Some(number) = parse_spec_number(&name) {
            if wanted_number == Some(number) {
                return Ok(Some(entry.path()));
            }
            if name
                .strip_prefix(&format!("{number:03}-"))
                .map(|slug| slug == id_or_slug)
                .unwrap_or(false)
            {
                return Ok(Some(entry.path()));
            }
        }
    }
    debug!(id_or_slug, "no matching spec directory");
    Ok(None)
}

/// List all spec directories in numeric order.
pub fn list_spec_dirs(repo_root: &Path) -> Result<Vec<PathBuf>> {
    let specs = repo_root.join(SPECS_DIR);
    let entries = match std::fs::read_dir(&specs) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs: Vec<(u32, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            parse_spec_number(&name).map(|n| (n, e.path()))
        })
        .collect();
    dirs.sort_by_key(|(n, _)| *n);
    Ok(dirs.into_iter().map(|(_, p)| p).collect())
}
