use clap::Parser;

/// auto-claude — autonomous coding-agent coordinator
#[derive(Parser, Debug)]
#[command(name = "auto-claude", version, about)]
pub struct Cli {
    /// Task description: generate a new spec and plan for it
    pub task: Option<String>,

    /// List specs
    #[arg(long)]
    pub list: bool,

    /// Spec id or slug for per-spec operations
    #[arg(long)]
    pub spec: Option<String>,

    /// Project directory (defaults to the current directory)
    #[arg(long)]
    pub project_dir: Option<String>,

    /// Model for agent invocations
    #[arg(long)]
    pub model: Option<String>,

    /// Thinking level for agent invocations
    #[arg(long)]
    pub thinking: Option<String>,

    /// Maximum review iterations per PR
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Verbose logging
    #[arg(long)]
    pub verbose: bool,

    /// Run the build in an isolated worktree workspace
    #[arg(long, conflicts_with = "direct")]
    pub isolated: bool,

    /// Run the build directly in the main checkout
    #[arg(long, conflicts_with = "isolated")]
    pub direct: bool,

    /// Merge the spec's worktree into the base branch
    #[arg(long, conflicts_with_all = ["review", "discard", "create_pr"])]
    pub merge: bool,

    /// With --merge: stage the merge without committing
    #[arg(long, requires = "merge")]
    pub no_commit: bool,

    /// Start the PR review loop for the spec's open PR
    #[arg(long, conflicts_with_all = ["merge", "discard", "create_pr"])]
    pub review: bool,

    /// Discard the spec's worktree and branch
    #[arg(long, conflicts_with_all = ["merge", "review", "create_pr"])]
    pub discard: bool,

    /// Push the branch and open a pull request
    #[arg(long, conflicts_with_all = ["merge", "review", "discard"])]
    pub create_pr: bool,

    /// With --create-pr: PR base branch
    #[arg(long, requires = "create_pr")]
    pub pr_target: Option<String>,

    /// With --create-pr: PR title
    #[arg(long, requires = "create_pr")]
    pub pr_title: Option<String>,

    /// With --create-pr: open as draft
    #[arg(long, requires = "create_pr")]
    pub pr_draft: bool,

    /// Predict the merge result as JSON without writing anything
    #[arg(long)]
    pub merge_preview: bool,

    /// Run the QA gate for the spec
    #[arg(long)]
    pub qa: bool,

    /// Show the QA gate status
    #[arg(long)]
    pub qa_status: bool,

    /// Mark QA as intentionally skipped
    #[arg(long)]
    pub skip_qa: bool,

    /// Run a follow-up task from FOLLOWUP_REQUEST.md
    #[arg(long)]
    pub followup: bool,

    /// Show the PR review state for the spec
    #[arg(long)]
    pub review_status: bool,

    /// Non-interactive: continue without prompting
    #[arg(long)]
    pub auto_continue: bool,

    /// Bypass the plan-approval gate (recorded in the audit log)
    #[arg(long)]
    pub force: bool,

    /// List task worktrees with their statistics
    #[arg(long)]
    pub list_worktrees: bool,

    /// Remove stale task worktrees
    #[arg(long)]
    pub cleanup_worktrees: bool,

    /// Base branch override
    #[arg(long)]
    pub base_branch: Option<String>,

    /// Create issue batches from a JSON file of issue numbers
    #[arg(long)]
    pub batch_create: Option<String>,

    /// Show batch statuses
    #[arg(long)]
    pub batch_status: bool,

    /// Remove terminal batches (dry run unless --no-dry-run)
    #[arg(long)]
    pub batch_cleanup: bool,

    /// With --batch-cleanup: actually delete
    #[arg(long, requires = "batch_cleanup")]
    pub no_dry_run: bool,

    /// Drive the review orchestrator for an open PR number
    #[arg(long)]
    pub pr_review: Option<u64>,

    /// Trigger the auto-fix pipeline for an issue number
    #[arg(long)]
    pub autofix_issue: Option<u64>,

    /// Approve the spec's implementation plan
    #[arg(long)]
    pub approve: bool,
}
