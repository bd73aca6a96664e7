use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lock::{DEFAULT_LOCK_TIMEOUT, FileLock, atomic_write, locked_json_update};

/// Hard ceiling on review iterations per PR.
pub const MAX_ITERATIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrReviewStatus {
    Pending,
    AwaitingChecks,
    Reviewing,
    Fixing,
    ReadyToMerge,
    Completed,
    Cancelled,
    Failed,
    MaxIterationsReached,
}

impl PrReviewStatus {
    /// Terminal states are write-once; `ReadyToMerge` is terminal from the
    /// orchestrator's perspective — a human merges out-of-band.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PrReviewStatus::ReadyToMerge
                | PrReviewStatus::Completed
                | PrReviewStatus::Cancelled
                | PrReviewStatus::Failed
                | PrReviewStatus::MaxIterationsReached
        )
    }

    /// The transition table of the review state machine. Cancellation,
    /// failure and the iteration cap are reachable from any active state.
    pub fn can_transition_to(&self, next: PrReviewStatus) -> bool {
        use PrReviewStatus::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Cancelled | Failed | MaxIterationsReached) {
            return true;
        }
        matches!(
            (self, next),
            (Pending, AwaitingChecks)
                | (AwaitingChecks, Reviewing)
                | (AwaitingChecks, ReadyToMerge)
                | (AwaitingChecks, Fixing)
                | (AwaitingChecks, Completed)
                | (AwaitingChecks, AwaitingChecks)
                | (Reviewing, Fixing)
                | (Reviewing, ReadyToMerge)
                | (Fixing, AwaitingChecks)
                | (Fixing, ReadyToMerge)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedFix {
    pub fix_id: String,
    pub finding_id: String,
    pub file_path: String,
    pub description: String,
    pub commit_sha: Option<String>,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    #[serde(default)]
    pub findings_count: u32,
    #[serde(default)]
    pub fixes_applied: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_ci_status: Option<String>,
}

/// Durable record of one PR's review orchestration, keyed by
/// `(repo, pr_number)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrReviewState {
    pub repo: String,
    pub pr_number: u64,
    pub status: PrReviewStatus,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub correlation_id: String,
    #[serde(default)]
    pub pending_findings: Vec<String>,
    #[serde(default)]
    pub resolved_findings: Vec<String>,
    #[serde(default)]
    pub unresolvable_findings: Vec<String>,
    #[serde(default)]
    pub iteration_history: Vec<IterationRecord>,
    #[serde(default)]
    pub applied_fixes: Vec<AppliedFix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_head_sha: Option<String>,
    #[serde(default)]
    pub cancellation_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
    #[serde(default)]
    pub expected_bots: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub last_ci_checks: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub last_bot_statuses: Value,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrReviewState {
    pub fn new(repo: &str, pr_number: u64, expected_bots: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            repo: repo.to_string(),
            pr_number,
            status: PrReviewStatus::Pending,
            current_iteration: 0,
            max_iterations: MAX_ITERATIONS,
            correlation_id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            pending_findings: Vec::new(),
            resolved_findings: Vec::new(),
            unresolvable_findings: Vec::new(),
            iteration_history: Vec::new(),
            applied_fixes: Vec::new(),
            last_known_head_sha: None,
            cancellation_requested: false,
            cancelled_by: None,
            expected_bots,
            last_ci_checks: Value::Null,
            last_bot_statuses: Value::Null,
            error_count: 0,
            consecutive_failures: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a validated transition.
    pub fn transition(&mut self, next: PrReviewStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Review(format!(
                "invalid transition {:?} -> {next:?} for PR #{}",
                self.status, self.pr_number
            )));
        }
        debug!(pr = self.pr_number, from = ?self.status, to = ?next, "review state transition");
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        // updated_at is monotonically non-decreasing per (repo, pr).
        self.updated_at = self.updated_at.max(Utc::now());
    }

    /// Open a new iteration record and bump the counter.
    pub fn start_iteration(&mut self) -> u32 {
        self.current_iteration += 1;
        self.iteration_history.push(IterationRecord {
            iteration: self.current_iteration,
            started_at: Utc::now(),
            completed_at: None,
            status: "in_progress".to_string(),
            findings_count: 0,
            fixes_applied: 0,
            final_ci_status: None,
        });
        self.touch();
        self.current_iteration
    }

    pub fn complete_iteration(
        &mut self,
        status: &str,
        findings_count: u32,
        fixes_applied: u32,
        final_ci_status: Option<&str>,
    ) {
        if let Some(record) = self
            .iteration_history
            .last_mut()
            .filter(|r| r.completed_at.is_none())
        {
            record.completed_at = Some(Utc::now());
            record.status = status.to_string();
            record.findings_count = findings_count;
            record.fixes_applied = fixes_applied;
            record.final_ci_status = final_ci_status.map(str::to_string);
        }
        self.touch();
    }

    /// Move a finding from pending to resolved and record the fix.
    pub fn add_applied_fix(&mut self, fix: AppliedFix) {
        self.pending_findings.retain(|f| f != &fix.finding_id);
        if !self.resolved_findings.contains(&fix.finding_id) {
            self.resolved_findings.push(fix.finding_id.clone());
        }
        self.applied_fixes.push(fix);
        self.touch();
    }

    pub fn mark_unresolvable(&mut self, finding_id: &str) {
        self.pending_findings.retain(|f| f != finding_id);
        if !self.unresolvable_findings.contains(&finding_id.to_string()) {
            self.unresolvable_findings.push(finding_id.to_string());
        }
        self.touch();
    }

    pub fn has_pending_findings(&self) -> bool {
        !self.pending_findings.is_empty()
    }

    pub fn record_error(&mut self, error: &str) {
        self.error_count += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        self.touch();
    }

    pub fn clear_consecutive_failures(&mut self) {
        self.consecutive_failures = 0;
        self.touch();
    }

    pub fn request_cancellation(&mut self, actor: Option<&str>) {
        self.cancellation_requested = true;
        self.cancelled_by = actor.map(str::to_string);
        self.touch();
    }

    /// Budget check at iteration boundaries.
    pub fn iterations_exhausted(&self) -> bool {
        self.current_iteration >= self.max_iterations
    }

    /// Reset waiting bookkeeping after a force push: the new head gets a
    /// fresh wait without consuming iteration budget.
    pub fn reset_for_new_head(&mut self, new_sha: &str) {
        self.last_known_head_sha = Some(new_sha.to_string());
        self.last_ci_checks = Value::Null;
        self.last_bot_statuses = Value::Null;
        self.touch();
    }
}

/// Persistence for review states under
/// `.auto-claude/github/pr_review_state/`, with an index file.
pub struct PrReviewStateStore {
    state_dir: PathBuf,
}

impl PrReviewStateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn default_dir(repo_root: &Path) -> PathBuf {
        repo_root
            .join(".auto-claude")
            .join("github")
            .join("pr_review_state")
    }

    fn state_file(&self, pr_number: u64) -> PathBuf {
        self.state_dir.join(format!("pr_{pr_number}.json"))
    }

    fn index_file(&self) -> PathBuf {
        self.state_dir.join("index.json")
    }

    /// Persist atomically. A state already terminal on disk is write-once:
    /// attempts to change its status are rejected.
    pub fn save(&self, state: &PrReviewState) -> Result<()> {
        let path = self.state_file(state.pr_number);
        let _lock = FileLock::acquire(&path, DEFAULT_LOCK_TIMEOUT)?;

        if let Some(existing) = self.load_unlocked(state.pr_number)?
            && existing.repo == state.repo
            && existing.status.is_terminal()
            && existing.status != state.status
        {
            return Err(Error::Review(format!(
                "state for PR #{} is terminal ({:?}) and write-once",
                state.pr_number, existing.status
            )));
        }

        atomic_write(&path, &serde_json::to_vec_pretty(state)?)?;

        let key = format!("{}#{}", state.repo, state.pr_number);
        let status = state.status;
        let updated_at = state.updated_at;
        locked_json_update(&self.index_file(), DEFAULT_LOCK_TIMEOUT, move |current| {
            let mut index = current.as_object().cloned().unwrap_or_default();
            index.insert(
                key,
                serde_json::json!({
                    "status": status,
                    "updated_at": updated_at,
                }),
            );
            Value::Object(index)
        })?;

        debug!(pr = state.pr_number, status = ?state.status, "review state persisted");
        Ok(())
    }

    fn load_unlocked(&self, pr_number: u64) -> Result<Option<PrReviewState>> {
        match std::fs::read_to_string(self.state_file(pr_number)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn load(&self, repo: &str, pr_number: u64) -> Result<Option<PrReviewState>> {
        let state = self.load_unlocked(pr_number)?;
        Ok(state.filter(|s| s.repo == repo))
    }

    /// Load a resumable (non-terminal) state, or create a fresh one.
    pub fn load_or_create(
        &self,
        repo: &str,
        pr_number: u64,
        expected_bots: Vec<String>,
    ) -> Result<PrReviewState> {
        if let Some(existing) = self.load(repo, pr_number)?
            && !existing.status.is_terminal()
        {
            info!(
                pr = pr_number,
                iteration = existing.current_iteration,
                status = ?existing.status,
                "resuming review state from disk"
            );
            return Ok(existing);
        }
        Ok(PrReviewState::new(repo, pr_number, expected_bots))
    }
}
