use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::gh::GhCli;
use crate::retry::retry_transient;

/// Namespace prefix for all task branches.
pub const BRANCH_PREFIX: &str = "auto-claude/";

/// A flat branch with this exact name shadows the `auto-claude/*` namespace
/// in git's ref store and must not exist.
pub const FORBIDDEN_FLAT_BRANCH: &str = "auto-claude";

/// Worktrees considered stale for cleanup after this many days idle.
pub const STALE_AFTER_DAYS: i64 = 7;

/// Validate a task slug: lowercase kebab-case, no path separators.
pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.is_empty() {
        return Err(Error::Worktree("slug must not be empty".to_string()));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::Worktree(format!(
            "slug contains invalid characters (allowed: a-z0-9-): {slug}"
        )));
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return Err(Error::Worktree(format!(
            "slug must not start or end with '-': {slug}"
        )));
    }
    Ok(())
}

/// Create a branch-safe kebab-case slug from free text.
pub fn slugify(title: &str) -> String {
    let mut result = String::new();
    let mut prev_hyphen = true;
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            result.push(c);
            prev_hyphen = false;
        } else if !prev_hyphen {
            result.push('-');
            prev_hyphen = true;
        }
    }
    while result.ends_with('-') {
        result.pop();
    }
    if result.len() > 50 {
        result.truncate(50);
        while result.ends_with('-') {
            result.pop();
        }
    }
    result
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorktreeStats {
    pub commits_ahead: u32,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
    pub last_commit_unix: Option<i64>,
    pub days_since_last_activity: Option<i64>,
}

impl WorktreeStats {
    /// A worktree with nothing ahead of base and a long-idle branch is a
    /// cleanup candidate.
    pub fn is_stale(&self) -> bool {
        self.commits_ahead == 0
            && self
                .days_since_last_activity
                .map(|d| d >= STALE_AFTER_DAYS)
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged,
    AlreadyUpToDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergePreview {
    pub branch: String,
    pub base_branch: String,
    pub files_changed: Vec<String>,
    pub renames_in_base: HashMap<String, String>,
    pub conflicts_expected: bool,
}

/// Manages per-task git worktrees under `.auto-claude/worktrees/tasks/`.
pub struct WorktreeManager {
    repo_root: PathBuf,
    base_branch_override: Option<String>,
    cached_base: OnceLock<String>,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            base_branch_override: None,
            cached_base: OnceLock::new(),
        }
    }

    pub fn with_base_branch(mut self, base: Option<String>) -> Self {
        self.base_branch_override = base;
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn tasks_dir(&self) -> PathBuf {
        self.repo_root
            .join(".auto-claude")
            .join("worktrees")
            .join("tasks")
    }

    pub fn branch_for(slug: &str) -> String {
        format!("{BRANCH_PREFIX}{slug}")
    }

    pub fn worktree_path(&self, slug: &str) -> PathBuf {
        self.tasks_dir().join(slug)
    }

    /// Resolve the base branch once per instance:
    /// explicit override → `DEFAULT_BRANCH` env (if the branch exists) →
    /// `main` → `master` → current branch (with a warning).
    pub fn base_branch(&self) -> String {
        if let Some(ref base) = self.base_branch_override {
            return base.clone();
        }
        self.cached_base
            .get_or_init(|| {
                if let Ok(env_branch) = std::env::var("DEFAULT_BRANCH")
                    && !env_branch.is_empty()
                    && self.branch_exists(&env_branch)
                {
                    return env_branch;
                }
                for candidate in ["main", "master"] {
                    if self.branch_exists(candidate) {
                        return candidate.to_string();
                    }
                }
                let current = self
                    .git(&["rev-parse", "--abbrev-ref", "HEAD"])
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "main".to_string());
                warn!(
                    branch = %current,
                    "no main/master branch found, falling back to current branch"
                );
                current
            })
            .clone()
    }

    fn branch_exists(&self, name: &str) -> bool {
        let local_ref = format!("refs/heads/{name}");
        self.git(&["show-ref", "--verify", "--quiet", &local_ref])
            .is_ok()
    }

    fn remote_ref_exists(&self, name: &str) -> bool {
        let remote_ref = format!("refs/remotes/origin/{name}");
        self.git(&["show-ref", "--verify", "--quiet", &remote_ref])
            .is_ok()
    }

    /// Refuse to operate while a flat `auto-claude` branch exists: it blocks
    /// the whole `auto-claude/*` namespace. The error carries the fix.
    fn check_namespace(&self) -> Result<()> {
        if self.branch_exists(FORBIDDEN_FLAT_BRANCH) {
            return Err(Error::Worktree(format!(
                "a branch named '{FORBIDDEN_FLAT_BRANCH}' exists and blocks the \
                 '{BRANCH_PREFIX}*' namespace; rename it first, e.g. \
                 `git branch -m {FORBIDDEN_FLAT_BRANCH} {FORBIDDEN_FLAT_BRANCH}-old`"
            )));
        }
        Ok(())
    }

    /// Create the worktree for `slug` on branch `auto-claude/<slug>`,
    /// branched from the remote base when reachable, else the local base.
    pub fn create_worktree(&self, slug: &str) -> Result<WorktreeInfo> {
        validate_slug(slug)?;
        self.check_namespace()?;

        let branch = Self::branch_for(slug);
        let path = self.worktree_path(slug);
        let base = self.base_branch();

        std::fs::create_dir_all(self.tasks_dir()).map_err(|e| {
            Error::Worktree(format!(
                "failed to create worktree base dir {}: {e}",
                self.tasks_dir().display()
            ))
        })?;

        // Best-effort fetch; offline creation falls back to the local base.
        if let Err(e) = self.git(&["fetch", "origin", &base]) {
            warn!(base = %base, error = %e.trim(), "fetch failed, using local base branch");
        }

        let start_point = if self.remote_ref_exists(&base) {
            format!("origin/{base}")
        } else {
            base.clone()
        };

        let path_str = path.to_string_lossy().to_string();
        self.git(&["worktree", "add", "-b", &branch, &path_str, &start_point])
            .map_err(|e| {
                Error::Worktree(format!("git worktree add failed for {}: {e}", path.display()))
            })?;

        let canonical = path.canonicalize().unwrap_or(path);
        info!(
            slug,
            path = %canonical.display(),
            branch = %branch,
            start_point = %start_point,
            "created worktree"
        );
        Ok(WorktreeInfo {
            path: canonical,
            branch,
            slug: slug.to_string(),
        })
    }

    /// Idempotent variant: returns the existing worktree when present.
    pub fn get_or_create_worktree(&self, slug: &str) -> Result<WorktreeInfo> {
        validate_slug(slug)?;
        if let Some(existing) = self.find_worktree(slug)? {
            info!(slug, path = %existing.path.display(), "reusing existing worktree");
            return Ok(existing);
        }
        self.create_worktree(slug)
    }

    /// Find an existing worktree for `slug`, if any.
    pub fn find_worktree(&self, slug: &str) -> Result<Option<WorktreeInfo>> {
        let branch = Self::branch_for(slug);
        Ok(self
            .list_worktrees()?
            .into_iter()
            .find(|w| w.branch == branch))
    }

    /// All task worktrees (branches under `auto-claude/`).
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>> {
        let _ = self.git(&["worktree", "prune"]);
        let output = self
            .git(&["worktree", "list", "--porcelain"])
            .map_err(|e| Error::Worktree(format!("failed to list worktrees: {e}")))?;
        Ok(parse_worktree_porcelain(&output))
    }

    /// Remove the worktree (force), prune, and optionally delete the branch.
    /// Falls back to filesystem removal when the git command fails.
    pub fn remove_worktree(&self, slug: &str, delete_branch: bool) -> Result<()> {
        validate_slug(slug)?;
        let branch = Self::branch_for(slug);
        let path = self.worktree_path(slug);
        let path_str = path.to_string_lossy().to_string();

        match self.git(&["worktree", "remove", "--force", &path_str]) {
            Ok(_) => info!(slug, "removed worktree"),
            Err(e) => {
                warn!(slug, error = %e.trim(), "git worktree remove failed, removing directory");
                if path.exists() {
                    std::fs::remove_dir_all(&path).map_err(|err| {
                        Error::Worktree(format!(
                            "failed to remove worktree dir {}: {err}",
                            path.display()
                        ))
                    })?;
                }
            }
        }
        let _ = self.git(&["worktree", "prune"]);

        if delete_branch && self.branch_exists(&branch) {
            match self.git(&["branch", "-D", &branch]) {
                Ok(_) => info!(branch = %branch, "deleted branch"),
                Err(e) => warn!(branch = %branch, error = %e.trim(), "failed to delete branch"),
            }
        }
        Ok(())
    }

    /// Merge the task branch into the base branch with `--no-ff`.
    ///
    /// With `no_commit` the merge is left staged and task-local artifacts
    /// (gitignored paths and anything under `.auto-claude/`) are unstaged so
    /// they never propagate to base. Conflicts abort the merge; "already up
    /// to date" is a success.
    pub fn merge_worktree(
        &self,
        slug: &str,
        no_commit: bool,
        delete_after: bool,
    ) -> Result<MergeOutcome> {
        validate_slug(slug)?;
        let branch = Self::branch_for(slug);
        let base = self.base_branch();

        self.git(&["checkout", &base])
            .map_err(|e| Error::Worktree(format!("failed to checkout {base}: {e}")))?;

        let mut args = vec!["merge", "--no-ff"];
        if no_commit {
            args.push("--no-commit");
        }
        args.push(&branch);

        let outcome = match self.git(&args) {
            Ok(stdout) if stdout.contains("Already up to date") => MergeOutcome::AlreadyUpToDate,
            Ok(_) => MergeOutcome::Merged,
            Err(e) => {
                let _ = self.git(&["merge", "--abort"]);
                return Err(Error::Worktree(format!(
                    "merge of {branch} into {base} conflicted and was aborted: {}",
                    e.trim()
                )));
            }
        };

        if no_commit && outcome == MergeOutcome::Merged {
            self.unstage_task_artifacts()?;
        }

        if delete_after {
            self.remove_worktree(slug, true)?;
        }

        info!(slug, ?outcome, no_commit, "merged worktree into base");
        Ok(outcome)
    }

    /// Unstage files that must not reach the base branch: gitignored paths
    /// and the `.auto-claude/` tree.
    fn unstage_task_artifacts(&self) -> Result<()> {
        let staged = self
            .git(&["diff", "--cached", "--name-only"])
            .map_err(|e| Error::Worktree(format!("failed to list staged files: {e}")))?;

        for file in staged.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let ignored = self.git(&["check-ignore", "-q", file]).is_ok();
            let task_local = file.starts_with(".auto-claude/");
            if ignored || task_local {
                debug!(file, "unstaging task-local artifact from merge");
                self.git(&["reset", "HEAD", "--", file]).map_err(|e| {
                    Error::Worktree(format!("failed to unstage {file}: {e}"))
                })?;
            }
        }
        Ok(())
    }

    /// Push the task branch to origin, retrying transient failures.
    pub fn push_branch(&self, slug: &str) -> Result<()> {
        validate_slug(slug)?;
        let branch = Self::branch_for(slug);
        let path = self.worktree_path(slug);
        retry_transient("git push", 3, Duration::from_secs(2), || {
            let output = Command::new("git")
                .args(["push", "-u", "origin", &branch])
                .current_dir(&path)
                .output()
                .map_err(|e| Error::Worktree(format!("failed to run git push: {e}")))?;
            if output.status.success() {
                Ok(())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                // Auth and rejected pushes are permanent; the message drives
                // Error::is_retryable.
                Err(Error::Worktree(format!("git push failed: {stderr}")))
            }
        })?;
        info!(branch = %branch, "pushed branch");
        Ok(())
    }

    /// Open a PR for the task branch through the VCS helper.
    pub fn create_pull_request(
        &self,
        gh: &GhCli,
        slug: &str,
        target: Option<&str>,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<String> {
        validate_slug(slug)?;
        let branch = Self::branch_for(slug);
        let base = target.map(str::to_string).unwrap_or_else(|| self.base_branch());
        let url = gh.pr_create(&branch, &base, title, body, draft)?;
        info!(branch = %branch, url = %url, "created pull request");
        Ok(url)
    }

    /// Map of old → new paths for files the target branch has renamed since
    /// the merge base. Drives path-mapped reconciliation when the worktree
    /// modified a file at its old location.
    pub fn detect_file_renames(
        &self,
        merge_base: &str,
        target: &str,
    ) -> Result<HashMap<String, String>> {
        let output = self
            .git(&["diff", "--name-status", "-M", merge_base, target])
            .map_err(|e| Error::Worktree(format!("failed to diff for renames: {e}")))?;
        Ok(parse_rename_diff(&output))
    }

    /// Commit/diff statistics for a task worktree relative to base.
    pub fn stats(&self, slug: &str) -> Result<WorktreeStats> {
        validate_slug(slug)?;
        let branch = Self::branch_for(slug);
        let base = self.base_branch();
        let range = format!("{base}..{branch}");

        let commits_ahead = self
            .git(&["rev-list", "--count", &range])
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0);

        let shortstat = self
            .git(&["diff", "--shortstat", &format!("{base}...{branch}")])
            .unwrap_or_default();
        let (files_changed, insertions, deletions) = parse_shortstat(&shortstat);

        let last_commit_unix = self
            .git(&["log", "-1", "--format=%ct", &branch])
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok());

        let days_since_last_activity = last_commit_unix.map(|ts| {
            let now = chrono::Utc::now().timestamp();
            (now - ts).max(0) / 86_400
        });

        Ok(WorktreeStats {
            commits_ahead,
            files_changed,
            insertions,
            deletions,
            last_commit_unix,
            days_since_last_activity,
        })
    }

    /// Predict the effect of merging without writing anything.
    pub fn merge_preview(&self, slug: &str) -> Result<MergePreview> {
        validate_slug(slug)?;
        let branch = Self::branch_for(slug);
        let base = self.base_branch();

        let merge_base = self
            .git(&["merge-base", &base, &branch])
            .map_err(|e| Error::Worktree(format!("failed to find merge base: {e}")))?
            .trim()
            .to_string();

        let files_changed: Vec<String> = self
            .git(&["diff", "--name-only", &format!("{}..{branch}", &merge_base)])
            .unwrap_or_default()
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let renames_in_base = self.detect_file_renames(&merge_base, &base)?;

        // `git merge-tree` emits conflict markers without touching the tree.
        let conflicts_expected = self
            .git(&["merge-tree", &merge_base, &base, &branch])
            .map(|out| out.contains("<<<<<<<"))
            .unwrap_or(false);

        Ok(MergePreview {
            branch,
            base_branch: base,
            files_changed,
            renames_in_base,
            conflicts_expected,
        })
    }

    /// Run a git command in the repo root.
    fn git(&self, args: &[&str]) -> std::result::Result<String, String> {
        git_in_dir(&self.repo_root, args)
    }
}

/// Run a git command in an arbitrary directory.
pub fn git_in_dir(dir: &Path, args: &[&str]) -> std::result::Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| format!("failed to run git: {e}"))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).to_string())
    }
}

/// Parse `git worktree list --porcelain`, keeping entries on task branches.
fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeInfo> {
    let mut results = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;

    let mut flush = |path: &mut Option<PathBuf>, branch: &mut Option<String>| {
        if let (Some(p), Some(b)) = (path.take(), branch.take())
            && let Some(slug) = b.strip_prefix(BRANCH_PREFIX)
        {
            results.push(WorktreeInfo {
                path: p,
                slug: slug.to_string(),
                branch: b,
            });
        }
    };

    for line in output.lines() {
        if let Some(path_str) = line.strip_prefix("worktree ") {
            flush(&mut current_path, &mut current_branch);
            current_path = Some(PathBuf::from(path_str));
        } else if let Some(branch_ref) = line.strip_prefix("branch ") {
            current_branch = branch_ref
                .strip_prefix("refs/heads/")
                .map(|b| b.to_string());
        }
    }
    flush(&mut current_path, &mut current_branch);
    results
}

/// Parse `git diff --name-status -M` output into an old → new rename map.
fn parse_rename_diff(output: &str) -> HashMap<String, String> {
    let mut renames = HashMap::new();
    for line in output.lines() {
        let mut parts = line.split('\t');
        let Some(status) = parts.next() else { continue };
        if !status.starts_with('R') {
            continue;
        }
        if let (Some(old), Some(new)) = (parts.next(), parts.next()) {
            renames.insert(old.to_string(), new.to_string());
        }
    }
    renames
}

/// Parse `git diff --shortstat` output: files changed, insertions, deletions.
fn parse_shortstat(output: &str) -> (u32, u32, u32) {
    let mut files = 0;
    let mut insertions = 0;
    let mut deletions = 0;
    for part in output.split(',') {
        let part = part.trim();
        let number: u32 = part
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        if part.contains("file") {
            files = number;
        } else if part.contains("insertion") {
            insertions = number;
        } else if part.contains("deletion") {
            deletions = number;
        }
    }
    (files, insertions, deletions)
}
