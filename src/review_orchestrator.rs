use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{ActorType, AuditLogger, AuditResult};
use crate::bot_detection::BotDetector;
use crate::check_waiter::{CheckWaiter, WaitStatus, WaiterConfig};
use crate::error::{Error, Result};
use crate::gh::GhCli;
use crate::prompts::PromptEngine;
use crate::review_schema::{
    FixStatus, ReviewFinding, Severity, parse_fix_output, parse_review_output,
};
use crate::review_state::{
    AppliedFix, PrReviewState, PrReviewStateStore, PrReviewStatus,
};
use crate::runner::{AgentRunner, AgentTask};
use crate::worktree::git_in_dir;

/// Process-wide ceiling on concurrent PR orchestrations.
pub const DEFAULT_REVIEW_CONCURRENCY: usize = 3;

/// Consecutive operation failures before the orchestration gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Build the process-wide review semaphore; constructed once at startup and
/// passed through the context, never an ambient global.
pub fn new_review_semaphore(permits: usize) -> Arc<Semaphore> {
    Arc::new(Semaphore::new(permits))
}

/// Branch-side git operations the orchestrator needs; a trait seam so tests
/// can run without a repository.
pub trait BranchOps: Send + Sync {
    fn head_sha(&self) -> Option<String>;
    fn push(&self) -> Result<()>;
}

/// Real implementation running in the PR checkout.
pub struct GitBranchOps {
    pub working_dir: PathBuf,
}

impl BranchOps for GitBranchOps {
    fn head_sha(&self) -> Option<String> {
        git_in_dir(&self.working_dir, &["rev-parse", "HEAD"])
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn push(&self) -> Result<()> {
        git_in_dir(&self.working_dir, &["push"])
            .map(|_| ())
            .map_err(|e| Error::Review(format!("push failed: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Whitelist of logins allowed to have their PRs auto-reviewed.
    /// Empty means everyone.
    pub authorized_users: Vec<String>,
    pub expected_bots: Vec<String>,
    pub max_consecutive_failures: u32,
    pub waiter_config: WaiterConfig,
    pub working_dir: PathBuf,
}

impl OrchestratorConfig {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            authorized_users: Vec::new(),
            expected_bots: Vec::new(),
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            waiter_config: WaiterConfig::default(),
            working_dir,
        }
    }
}

/// Crash-recoverable review loop for one `(repo, pr)`: wait for checks,
/// review, fix, re-push — bounded by the iteration budget, gated by the
/// bot detector, and incapable of merging.
pub struct PrReviewOrchestrator<'a, R: AgentRunner> {
    gh: &'a GhCli,
    runner: &'a R,
    prompts: &'a PromptEngine,
    audit: &'a AuditLogger,
    bot_detector: &'a BotDetector,
    store: &'a PrReviewStateStore,
    branch_ops: &'a dyn BranchOps,
    semaphore: Arc<Semaphore>,
    config: OrchestratorConfig,
}

impl<'a, R: AgentRunner> PrReviewOrchestrator<'a, R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gh: &'a GhCli,
        runner: &'a R,
        prompts: &'a PromptEngine,
        audit: &'a AuditLogger,
        bot_detector: &'a BotDetector,
        store: &'a PrReviewStateStore,
        branch_ops: &'a dyn BranchOps,
        semaphore: Arc<Semaphore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            gh,
            runner,
            prompts,
            audit,
            bot_detector,
            store,
            branch_ops,
            semaphore,
            config,
        }
    }

    /// Drive the review loop for one PR to a terminal or parked state.
    pub async fn run(&self, repo: &str, pr_number: u64) -> Result<PrReviewState> {
        // Scoped acquisition: the permit is released on every exit path.
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Review("review semaphore closed".into()))?;

        let mut state =
            self.store
                .load_or_create(repo, pr_number, self.config.expected_bots.clone())?;
        let ctx = self.audit.start_operation("pr_review", ActorType::Automation);
        info!(repo, pr_number, status = ?state.status, "review orchestration starting");

        let mut findings: HashMap<String, ReviewFinding> = HashMap::new();

        loop {
            // Pick up cancellations persisted by other processes.
            if let Some(on_disk) = self.store.load(repo, pr_number)?
                && on_disk.cancellation_requested
            {
                state.cancellation_requested = true;
                state.cancelled_by = on_disk.cancelled_by.clone();
            }
            if state.cancellation_requested {
                self.finish(&mut state, PrReviewStatus::Cancelled, &ctx)?;
                break;
            }

            if state.status.is_terminal() {
                break;
            }

            let snapshot = match self.gh.pr_snapshot(repo, pr_number) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    state.record_error(&e.to_string());
                    self.store.save(&state)?;
                    if state.consecutive_failures >= self.config.max_consecutive_failures {
                        self.finish(&mut state, PrReviewStatus::Failed, &ctx)?;
                        break;
                    }
                    continue;
                }
            };

            // Authorization precedes every review action.
            if !self.config.authorized_users.is_empty() {
                let author = snapshot.author.as_ref().map(|a| a.login.as_str());
                let allowed = author
                    .map(|login| self.config.authorized_users.iter().any(|u| u == login))
                    .unwrap_or(false);
                if !allowed {
                    ctx.log(
                        ctx.entry("authorization", AuditResult::Denied)
                            .with_repo(repo)
                            .with_pr(pr_number)
                            .with_details(json!({"author": author})),
                    );
                    state.record_error("author not in authorization whitelist");
                    self.finish(&mut state, PrReviewStatus::Failed, &ctx)?;
                    break;
                }
            }

            match state.status {
                PrReviewStatus::Pending => {
                    state.transition(PrReviewStatus::AwaitingChecks)?;
                    state.last_known_head_sha = Some(snapshot.head_ref_oid.clone());
                    self.store.save(&state)?;
                }
                PrReviewStatus::AwaitingChecks => {
                    self.run_awaiting_checks(repo, pr_number, &mut state, &ctx).await?;
                }
                PrReviewStatus::Reviewing => {
                    // Bot gate: only a review action reviews the PR's work,
                    // so only here may bot-authored work park the run. The
                    // waiting and fixing arms routinely follow the
                    // orchestrator's own pushed commits and must not trip it.
                    if let Some(reason) = self
                        .bot_detector
                        .should_skip_pr_review(self.gh, pr_number, &snapshot)?
                    {
                        info!(pr_number, %reason, "review skipped by bot detector");
                        ctx.log(
                            ctx.entry("bot_skip", AuditResult::Skipped)
                                .with_repo(repo)
                                .with_pr(pr_number)
                                .with_details(json!({"reason": reason.to_string()})),
                        );
                        // Parked, not terminal: a later event resumes from disk.
                        self.store.save(&state)?;
                        ctx.finish(AuditResult::Skipped, None);
                        return Ok(state);
                    }
                    self.run_reviewing(repo, pr_number, &mut state, &mut findings, &ctx)
                        .await?;
                }
                PrReviewStatus::Fixing => {
                    self.run_fixing(repo, pr_number, &mut state, &mut findings, &ctx)
                        .await?;
                }
                _ => break,
            }

            if state.consecutive_failures >= self.config.max_consecutive_failures {
                self.finish(&mut state, PrReviewStatus::Failed, &ctx)?;
                break;
            }
        }

        if state.status.is_terminal() {
            if state.status == PrReviewStatus::Failed {
                ctx.finish(AuditResult::Failure, state.last_error.as_deref());
            } else {
                ctx.finish(AuditResult::Success, None);
            }
        }
        Ok(state)
    }

    async fn run_awaiting_checks(
        &self,
        repo: &str,
        pr_number: u64,
        state: &mut PrReviewState,
        ctx: &crate::audit::OperationContext<'_>,
    ) -> Result<()> {
        let initial_sha = state
            .last_known_head_sha
            .clone()
            .unwrap_or_default();

        let waiter = CheckWaiter::new(self.gh).with_config(self.config.waiter_config.clone());
        let result = waiter
            .wait_for_checks(repo, pr_number, &initial_sha, &state.expected_bots)
            .await?;

        state.last_ci_checks = serde_json::to_value(&result.checks).unwrap_or_default();
        state.last_bot_statuses = serde_json::to_value(&result.bot_statuses).unwrap_or_default();
        if let Some(ref sha) = result.final_head_sha {
            state.last_known_head_sha = Some(sha.clone());
        }

        match result.status {
            WaitStatus::Success => {
                state.clear_consecutive_failures();
                if state.has_pending_findings() {
                    if self.check_iteration_budget(state, ctx)? {
                        return Ok(());
                    }
                    state.start_iteration();
                    state.transition(PrReviewStatus::Reviewing)?;
                    self.store.save(state)?;
                } else {
                    state.complete_iteration("success", 0, 0, Some("passed"));
                    self.finish(state, PrReviewStatus::ReadyToMerge, ctx)?;
                }
            }
            WaitStatus::CiFailed => {
                state.clear_consecutive_failures();
                if self.check_iteration_budget(state, ctx)? {
                    return Ok(());
                }
                state.start_iteration();
                // Failed checks become findings for the fixer.
                state.pending_findings = result
                    .failures
                    .iter()
                    .map(|f| format!("ci-{}", f.name))
                    .collect();
                state.transition(PrReviewStatus::Fixing)?;
                self.store.save(state)?;
            }
            WaitStatus::PrClosed | WaitStatus::PrMerged => {
                let status_note = if result.status == WaitStatus::PrMerged {
                    "pr_merged"
                } else {
                    "pr_closed"
                };
                state.complete_iteration(status_note, 0, 0, None);
                self.finish(state, PrReviewStatus::Completed, ctx)?;
            }
            WaitStatus::ForcePush { new_sha, old_sha } => {
                info!(pr_number, old_sha, new_sha, "force push: restarting wait");
                // Re-enter awaiting without consuming iteration budget.
                state.reset_for_new_head(&new_sha);
                state.transition(PrReviewStatus::AwaitingChecks)?;
                self.store.save(state)?;
            }
            WaitStatus::Cancelled => {
                state.request_cancellation(None);
                self.store.save(state)?;
            }
            WaitStatus::Timeout | WaitStatus::CircuitOpen => {
                let reason = result
                    .error
                    .unwrap_or_else(|| format!("{:?}", result.status));
                warn!(pr_number, %reason, "wait did not conclude");
                state.record_error(&reason);
                self.store.save(state)?;
            }
        }
        Ok(())
    }

    /// True when the budget is exhausted and the state was finalized.
    fn check_iteration_budget(
        &self,
        state: &mut PrReviewState,
        ctx: &crate::audit::OperationContext<'_>,
    ) -> Result<bool> {
        if state.iterations_exhausted() {
            self.finish(state, PrReviewStatus::MaxIterationsReached, ctx)?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn run_reviewing(
        &self,
        repo: &str,
        pr_number: u64,
        state: &mut PrReviewState,
        findings: &mut HashMap<String, ReviewFinding>,
        ctx: &crate::audit::OperationContext<'_>,
    ) -> Result<()> {
        let mut vars = HashMap::new();
        vars.insert("pr_number".to_string(), pr_number.to_string());
        vars.insert("repo".to_string(), repo.to_string());
        vars.insert(
            "worktree_path".to_string(),
            self.config.working_dir.display().to_string(),
        );
        let prompt = self.prompts.render("pr_review", &vars)?;

        let output = match self
            .runner
            .run(AgentTask::Review, &prompt, &self.config.working_dir)
            .await
            .and_then(|r| parse_review_output(&r.stdout))
        {
            Ok(output) => output,
            Err(e) => {
                state.record_error(&e.to_string());
                self.store.save(state)?;
                return Ok(());
            }
        };

        state.clear_consecutive_failures();
        findings.clear();
        state.pending_findings = output.findings.iter().map(|f| f.id.clone()).collect();
        for finding in output.findings {
            findings.insert(finding.id.clone(), finding);
        }

        ctx.log(
            ctx.entry("review_complete", AuditResult::Success)
                .with_repo(repo)
                .with_pr(pr_number)
                .with_details(json!({"findings": state.pending_findings.len()})),
        );

        // A successful review of this head counts toward cooling-off.
        if let Some(sha) = state.last_known_head_sha.clone() {
            self.bot_detector.mark_reviewed(pr_number, &sha)?;
        }

        if state.pending_findings.is_empty() {
            state.complete_iteration("approved", 0, 0, Some("passed"));
            self.finish(state, PrReviewStatus::ReadyToMerge, ctx)?;
        } else {
            state.transition(PrReviewStatus::Fixing)?;
            self.store.save(state)?;
        }
        Ok(())
    }

    async fn run_fixing(
        &self,
        repo: &str,
        pr_number: u64,
        state: &mut PrReviewState,
        findings: &mut HashMap<String, ReviewFinding>,
        ctx: &crate::audit::OperationContext<'_>,
    ) -> Result<()> {
        let pending = state.pending_findings.clone();
        let findings_count = pending.len() as u32;
        let mut fixes_applied: u32 = 0;
        let mut fix_errors = 0u32;

        for finding_id in pending {
            let finding = findings.get(&finding_id).cloned().unwrap_or_else(|| {
                // CI-failure findings have no review record; synthesize one.
                ReviewFinding {
                    id: finding_id.clone(),
                    file: String::new(),
                    line: 0,
                    severity: Severity::Critical,
                    description: format!(
                        "CI check '{}' failed; inspect its logs and fix the cause",
                        finding_id.trim_start_matches("ci-")
                    ),
                    category: Some("ci".to_string()),
                }
            });

            let mut vars = HashMap::new();
            vars.insert("finding_id".to_string(), finding.id.clone());
            vars.insert("finding_file".to_string(), finding.file.clone());
            vars.insert("finding_line".to_string(), finding.line.to_string());
            vars.insert(
                "finding_severity".to_string(),
                finding.severity.label().to_string(),
            );
            vars.insert(
                "finding_description".to_string(),
                finding.description.clone(),
            );
            vars.insert(
                "worktree_path".to_string(),
                self.config.working_dir.display().to_string(),
            );
            let prompt = self.prompts.render("pr_fix", &vars)?;

            let parsed = self
                .runner
                .run(AgentTask::Fix, &prompt, &self.config.working_dir)
                .await
                .and_then(|r| parse_fix_output(&r.stdout));

            match parsed {
                Ok(output) => match output.status {
                    FixStatus::Fixed => {
                        let commit_sha = self.branch_ops.head_sha();
                        state.add_applied_fix(AppliedFix {
                            fix_id: Uuid::new_v4().simple().to_string(),
                            finding_id: finding.id.clone(),
                            file_path: finding.file.clone(),
                            description: output.summary.clone(),
                            commit_sha,
                            applied_at: Utc::now(),
                        });
                        fixes_applied += 1;
                    }
                    FixStatus::NotApplicable => {
                        state.mark_unresolvable(&finding.id);
                    }
                    FixStatus::Error => {
                        fix_errors += 1;
                        state.record_error(&output.summary);
                    }
                },
                Err(e) => {
                    fix_errors += 1;
                    state.record_error(&e.to_string());
                }
            }
        }

        if fixes_applied > 0 {
            // Persist the applied-fix accounting before touching the remote.
            state.complete_iteration("fixed", findings_count, fixes_applied, None);
            state.transition(PrReviewStatus::AwaitingChecks)?;
            self.store.save(state)?;

            self.branch_ops.push()?;
            if let Some(sha) = self.branch_ops.head_sha() {
                state.reset_for_new_head(&sha);
                self.store.save(state)?;
            }
            ctx.log(
                ctx.entry("fixes_pushed", AuditResult::Success)
                    .with_repo(repo)
                    .with_pr(pr_number)
                    .with_details(json!({"fixes_applied": fixes_applied})),
            );
        } else if !state.has_pending_findings() {
            // Nothing applicable: the fixer is done here.
            state.complete_iteration("nothing_applicable", findings_count, 0, None);
            self.finish(state, PrReviewStatus::ReadyToMerge, ctx)?;
        } else if fix_errors > 0 {
            // Findings remain and the agent could not act on them; errors
            // were recorded and the consecutive-failure guard decides.
            self.store.save(state)?;
        } else {
            self.store.save(state)?;
        }
        Ok(())
    }

    /// Transition to a terminal status, persist, and audit — in that order.
    fn finish(
        &self,
        state: &mut PrReviewState,
        terminal: PrReviewStatus,
        ctx: &crate::audit::OperationContext<'_>,
    ) -> Result<()> {
        state.transition(terminal)?;
        self.store.save(state)?;
        ctx.log(
            ctx.entry("terminal_state", AuditResult::Success)
                .with_repo(&state.repo)
                .with_pr(state.pr_number)
                .with_details(json!({
                    "status": terminal,
                    "iterations": state.current_iteration,
                    "error": state.last_error,
                })),
        );
        info!(
            pr = state.pr_number,
            status = ?terminal,
            iterations = state.current_iteration,
            "review orchestration finished"
        );
        Ok(())
    }
}
