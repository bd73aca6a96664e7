use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tracing::info;

use crate::artifacts::WorkflowType;
use crate::audit::{ActorType, AuditLogger, AuditResult};
use crate::batch::IssueBatch;
use crate::error::{Error, Result};
use crate::gh::{GhCli, Issue};
use crate::lock::DEFAULT_LOCK_TIMEOUT;
use crate::memory::MemoryService;
use crate::override_mgr::{OverrideManager, OverrideRecord, OverrideType};
use crate::pipeline::{
    ApprovalStatus, ProjectAnalyzer, SpecPipeline, TaskRequest, check_approval, ensure_approved,
    record_approval,
};
use crate::prompts::PromptEngine;
use crate::runner::{AgentRunner, AgentTask};
use crate::spec_number::reserve_spec_dir;
use crate::workspace::Workspace;
use crate::worktree::{WorktreeManager, slugify};

/// How the autofix flow ended.
#[derive(Debug)]
pub enum AutofixOutcome {
    /// Grace period was cancelled; nothing was created.
    Cancelled { cancelled_by: Option<String> },
    /// Spec built, branch pushed, PR opened. Review runs next.
    PrOpened { pr_url: String, spec_dir: PathBuf, slug: String },
}

#[derive(Debug, Clone)]
pub struct AutofixConfig {
    pub trigger_label: String,
    /// Approve the generated plan automatically (bypass is audited);
    /// otherwise a prior `/approve` must have recorded an approval.
    pub auto_approve: bool,
    pub pr_draft: bool,
    /// How often the grace-period wait re-samples the entry.
    pub grace_poll: Duration,
}

impl Default for AutofixConfig {
    fn default() -> Self {
        Self {
            trigger_label: "auto-fix".to_string(),
            auto_approve: false,
            pr_draft: false,
            grace_poll: Duration::from_secs(10),
        }
    }
}

/// Issue → spec → build → PR wiring, honouring bot detection upstream and
/// the grace period here. The review orchestrator takes over once the PR
/// exists — and never merges it.
pub struct AutofixPipeline<'a, R: AgentRunner, S: AgentRunner> {
    gh: &'a GhCli,
    runner: &'a R,
    summarizer: &'a S,
    analyzer: &'a dyn ProjectAnalyzer,
    memory: &'a dyn MemoryService,
    prompts: &'a PromptEngine,
    audit: &'a AuditLogger,
    overrides: &'a OverrideManager,
    worktrees: &'a WorktreeManager,
    config: AutofixConfig,
}

impl<'a, R: AgentRunner, S: AgentRunner> AutofixPipeline<'a, R, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gh: &'a GhCli,
        runner: &'a R,
        summarizer: &'a S,
        analyzer: &'a dyn ProjectAnalyzer,
        memory: &'a dyn MemoryService,
        prompts: &'a PromptEngine,
        audit: &'a AuditLogger,
        overrides: &'a OverrideManager,
        worktrees: &'a WorktreeManager,
        config: AutofixConfig,
    ) -> Self {
        Self {
            gh,
            runner,
            summarizer,
            analyzer,
            memory,
            prompts,
            audit,
            overrides,
            worktrees,
            config,
        }
    }

    /// Single-issue trigger: label added or manual kick.
    pub async fn process_issue(&self, issue_number: u64, actor: &str) -> Result<AutofixOutcome> {
        if let Some(outcome) = self.await_grace_period(issue_number, actor).await? {
            return Ok(outcome);
        }

        let issue = self.gh.issue_view(issue_number)?;
        let slug = {
            let s = slugify(&issue.title);
            if s.is_empty() {
                format!("issue-{issue_number}")
            } else {
                s
            }
        };
        let description = synthesize_task(&[&issue]);
        let pr_body = format!("Resolves #{issue_number}\n\nAutomated fix by auto-claude.");
        self.build_and_open_pr(&slug, &description, &pr_body, WorkflowType::Bugfix)
            .await
    }

    /// Batch commitment: one grace period per member issue; any cancel
    /// aborts the whole batch.
    pub async fn process_batch(&self, batch: &IssueBatch, actor: &str) -> Result<AutofixOutcome> {
        for number in batch.issue_numbers() {
            if let Some(outcome) = self.await_grace_period(number, actor).await? {
                return Ok(outcome);
            }
        }

        let issues: Vec<Issue> = batch
            .issue_numbers()
            .iter()
            .map(|n| self.gh.issue_view(*n))
            .collect::<Result<_>>()?;
        let refs: Vec<&Issue> = issues.iter().collect();
        let description = synthesize_task(&refs);
        let resolves = batch
            .issue_numbers()
            .iter()
            .map(|n| format!("Resolves #{n}"))
            .collect::<Vec<_>>()
            .join("\n");
        let pr_body = format!("{resolves}\n\nAutomated batch fix by auto-claude.");
        self.build_and_open_pr(&batch.slug(), &description, &pr_body, WorkflowType::Bugfix)
            .await
    }

    /// Start (or join) the grace period and sleep until it resolves.
    /// Returns `Some(Cancelled)` when the user cancelled inside the window.
    async fn await_grace_period(
        &self,
        issue_number: u64,
        actor: &str,
    ) -> Result<Option<AutofixOutcome>> {
        let entry =
            self.overrides
                .start_grace_period(issue_number, &self.config.trigger_label, actor)?;
        info!(
            issue = issue_number,
            expires_at = %entry.expires_at,
            "grace period running"
        );

        loop {
            let current = self
                .overrides
                .get_grace_period(issue_number)?
                .unwrap_or_else(|| entry.clone());

            if current.cancelled {
                let record = OverrideRecord::new(OverrideType::CancelAutofix, actor)
                    .with_issue(issue_number)
                    .with_states(
                        json!({"autofix": "scheduled"}),
                        json!({"autofix": "cancelled"}),
                    );
                self.overrides.record_override(record, self.audit)?;
                self.audit.log(
                    &crate::audit::AuditEntry::new(
                        "-",
                        "autofix_cancelled",
                        ActorType::User,
                        AuditResult::Success,
                    )
                    .with_issue(issue_number),
                );
                info!(issue = issue_number, "autofix aborted inside grace period");
                return Ok(Some(AutofixOutcome::Cancelled {
                    cancelled_by: current.cancelled_by.clone(),
                }));
            }
            if current.is_expired() {
                return Ok(None);
            }
            tokio::time::sleep(self.config.grace_poll).await;
        }
    }

    async fn build_and_open_pr(
        &self,
        slug: &str,
        description: &str,
        pr_body: &str,
        workflow_type: WorkflowType,
    ) -> Result<AutofixOutcome> {
        let ctx = self.audit.start_operation("autofix", ActorType::Automation);

        // Spec pipeline in a reserved spec directory.
        let spec_dir = reserve_spec_dir(self.worktrees, slug, DEFAULT_LOCK_TIMEOUT)?;
        let task = TaskRequest {
            description: description.to_string(),
            workflow_type,
            spec_dir: spec_dir.clone(),
            project_dir: self.worktrees.repo_root().to_path_buf(),
        };
        let pipeline = SpecPipeline::new(
            self.runner,
            self.summarizer,
            self.analyzer,
            self.memory,
            self.prompts,
            self.audit,
        );
        pipeline.run(&task).await?;

        // Approval gate before the plan is consumed.
        if self.config.auto_approve && check_approval(&spec_dir) != ApprovalStatus::Valid {
            record_approval(&spec_dir, "auto-claude")?;
            ctx.event(
                "approval_auto",
                AuditResult::Granted,
                json!({"spec_dir": spec_dir.display().to_string()}),
            );
        }
        ensure_approved(&spec_dir, false, self.audit)?;

        // Build inside the isolated workspace.
        let workspace = Workspace::create(self.worktrees, slug, None)?;
        let build_result = self.run_build(&task, &workspace).await;
        match build_result {
            Ok(()) => {}
            Err(e) => {
                workspace.cleanup(self.worktrees, false);
                ctx.finish(AuditResult::Failure, Some(&e.to_string()));
                return Err(e);
            }
        }

        // Push the branch and open the PR.
        self.worktrees.push_branch(slug)?;
        let title = first_line(description);
        let pr_url = self.worktrees.create_pull_request(
            self.gh,
            slug,
            None,
            &title,
            pr_body,
            self.config.pr_draft,
        )?;

        ctx.event(
            "pr_opened",
            AuditResult::Success,
            json!({"url": pr_url, "slug": slug}),
        );
        ctx.finish(AuditResult::Success, None);

        Ok(AutofixOutcome::PrOpened {
            pr_url,
            spec_dir,
            slug: slug.to_string(),
        })
    }

    async fn run_build(&self, task: &TaskRequest, workspace: &Workspace) -> Result<()> {
        let mut vars = std::collections::HashMap::new();
        vars.insert(
            "spec_dir".to_string(),
            task.spec_dir.display().to_string(),
        );
        vars.insert(
            "worktree_path".to_string(),
            workspace.worktree.path.display().to_string(),
        );
        vars.insert("task_description".to_string(), task.description.clone());
        let prompt = self.prompts.render("build", &vars)?;

        let result = self
            .runner
            .run(AgentTask::Build, &prompt, &workspace.worktree.path)
            .await?;
        if result.exit_code != 0 {
            return Err(Error::Autofix(format!(
                "build agent exited with {}",
                result.exit_code
            )));
        }
        Ok(())
    }
}

/// One task description from one or more issues.
fn synthesize_task(issues: &[&Issue]) -> String {
    match issues {
        [] => String::new(),
        [single] => format!(
            "Fix issue #{}: {}\n\n{}",
            single.number,
            single.title,
            single.body.as_deref().unwrap_or("")
        ),
        many => {
            let mut parts = vec![format!("Fix {} related issues together:", many.len())];
            for issue in many {
                parts.push(format!(
                    "- #{}: {}\n  {}",
                    issue.number,
                    issue.title,
                    issue.body.as_deref().unwrap_or("").lines().next().unwrap_or("")
                ));
            }
            parts.join("\n")
        }
    }
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("automated fix");
    if line.len() > 72 {
        let mut truncated: String = line.chars().take(69).collect();
        truncated.push_str("...");
        truncated
    } else {
        line.to_string()
    }
}
