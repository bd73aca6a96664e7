use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::memory::MemoryService;
use crate::worktree::{WorktreeInfo, WorktreeManager};

/// Best-effort filesystem sandbox scoped to a worktree.
///
/// Agent-executed file operations are constrained to the sandbox root; the
/// environment block is handed to the agent process so the CLI enforces the
/// same boundary on its side.
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn scoped_to(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| Error::Workspace(format!("sandbox root unavailable: {e}")))?;
        if !root.is_dir() {
            return Err(Error::Workspace(format!(
                "sandbox root is not a directory: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a path resolves inside the sandbox.
    pub fn contains(&self, path: &Path) -> bool {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        match resolved.canonicalize() {
            Ok(canonical) => canonical.starts_with(&self.root),
            // Non-existent paths are judged by their lexical parent chain.
            Err(_) => {
                let mut current = resolved.as_path();
                while let Some(parent) = current.parent() {
                    if let Ok(canonical) = parent.canonicalize() {
                        return canonical.starts_with(&self.root);
                    }
                    current = parent;
                }
                false
            }
        }
    }

    /// Environment entries that scope the agent CLI to the sandbox.
    pub fn agent_env(&self) -> Vec<(String, String)> {
        vec![
            (
                "CLAUDE_SANDBOX_DIR".to_string(),
                self.root.display().to_string(),
            ),
            ("CLAUDE_RESTRICT_FS".to_string(), "1".to_string()),
        ]
    }
}

/// A task bound to its worktree, optional sandbox and optional memory.
///
/// Sandbox and memory are both best-effort: failure to initialize either
/// degrades with a warning, never an error.
pub struct Workspace {
    pub slug: String,
    pub worktree: WorktreeInfo,
    pub sandbox: Option<Sandbox>,
    pub memory: Option<Box<dyn MemoryService>>,
}

impl Workspace {
    /// Bind `slug` to a worktree, applying the sandbox and memory service
    /// where possible.
    pub fn create(
        manager: &WorktreeManager,
        slug: &str,
        memory: Option<Box<dyn MemoryService>>,
    ) -> Result<Self> {
        let worktree = manager.get_or_create_worktree(slug)?;

        let sandbox = match Sandbox::scoped_to(&worktree.path) {
            Ok(sandbox) => Some(sandbox),
            Err(e) => {
                warn!(slug, error = %e, "sandbox unavailable, continuing without");
                None
            }
        };

        let memory = match memory {
            Some(m) if m.enabled() => Some(m),
            Some(_) => {
                warn!(slug, "memory service disabled, continuing without");
                None
            }
            None => None,
        };

        info!(
            slug,
            path = %worktree.path.display(),
            sandboxed = sandbox.is_some(),
            memory = memory.is_some(),
            "workspace ready"
        );

        Ok(Self {
            slug: slug.to_string(),
            worktree,
            sandbox,
            memory,
        })
    }

    /// Environment block for agent processes running in this workspace.
    pub fn agent_env(&self) -> Vec<(String, String)> {
        self.sandbox
            .as_ref()
            .map(|s| s.agent_env())
            .unwrap_or_default()
    }

    /// Tear down: close memory, optionally remove the worktree. Partial
    /// failures are logged, not raised.
    pub fn cleanup(self, manager: &WorktreeManager, remove_worktree: bool) {
        if let Some(memory) = &self.memory {
            memory.close();
        }
        if remove_worktree
            && let Err(e) = manager.remove_worktree(&self.slug, true)
        {
            warn!(slug = %self.slug, error = %e, "worktree cleanup failed");
        }
        info!(slug = %self.slug, "workspace cleaned up");
    }
}
