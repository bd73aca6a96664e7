use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use auto_claude::artifacts::WorkflowType;
use auto_claude::audit::{ActorType, AuditLogger, AuditResult};
use auto_claude::autofix::{AutofixConfig, AutofixOutcome, AutofixPipeline};
use auto_claude::batch::{BatchEngine, BatchStore};
use auto_claude::bot_detection::BotDetector;
use auto_claude::cli::Cli;
use auto_claude::config::Config;
use auto_claude::error::{Error, Result};
use auto_claude::gh::GhCli;
use auto_claude::linear::sink_from_env;
use auto_claude::memory::{GraphitiMemory, MemoryService, NoopMemory};
use auto_claude::pipeline::{
    BasicAnalyzer, CommandAnalyzer, ProjectAnalyzer, SpecPipeline, TaskRequest, ensure_approved,
    record_approval,
};
use auto_claude::prompts::PromptEngine;
use auto_claude::review_orchestrator::{
    GitBranchOps, OrchestratorConfig, PrReviewOrchestrator, new_review_semaphore,
};
use auto_claude::review_state::PrReviewStateStore;
use auto_claude::runner::ClaudeRunner;
use auto_claude::spec_number::{find_spec_dir, list_spec_dirs, reserve_spec_dir};
use auto_claude::workspace::Workspace;
use auto_claude::worktree::{WorktreeManager, slugify};

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPT: i32 = 130;

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let code = runtime.block_on(async {
        tokio::select! {
            result = run(&cli) => match result {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("error: {e}");
                    EXIT_FAILURE
                }
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted");
                EXIT_INTERRUPT
            }
        }
    });
    std::process::exit(code);
}

/// Everything the command handlers share, built once at startup.
struct AppContext {
    config: Config,
    project_dir: PathBuf,
    gh: GhCli,
    audit: AuditLogger,
    prompts: PromptEngine,
    worktrees: WorktreeManager,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let project_dir = cli
            .project_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let config = Config::load(cli, &project_dir)?;
        let audit = AuditLogger::new(AuditLogger::default_dir(&project_dir));
        let _ = audit.sweep_retention();
        let worktrees = WorktreeManager::new(&project_dir)
            .with_base_branch(config.base_branch.clone());
        Ok(Self {
            prompts: PromptEngine::new(config.prompt_override_dir.clone()),
            config,
            project_dir,
            gh: GhCli::new(),
            audit,
            worktrees,
        })
    }

    fn github_dir(&self) -> PathBuf {
        self.project_dir.join(".auto-claude").join("github")
    }

    fn agent_runner(&self) -> ClaudeRunner {
        ClaudeRunner::new(
            self.config.agent_binary.clone(),
            self.config.model.clone(),
            self.config.thinking.clone(),
            Some(Duration::from_secs(self.config.agent_timeout_secs)),
        )
    }

    fn summarizer(&self) -> ClaudeRunner {
        ClaudeRunner::summarizer(
            self.config.agent_binary.clone(),
            self.config.summarizer_model.clone(),
            Duration::from_secs(120),
        )
    }

    fn analyzer(&self) -> Box<dyn ProjectAnalyzer> {
        match &self.config.analyzer_binary {
            Some(binary) => Box::new(CommandAnalyzer {
                binary: binary.clone(),
            }),
            None => Box::new(BasicAnalyzer),
        }
    }

    fn memory(&self) -> Box<dyn MemoryService> {
        match GraphitiMemory::from_env() {
            Some(memory) => Box::new(memory),
            None => Box::new(NoopMemory),
        }
    }

    fn duplicate_detector(&self) -> Result<auto_claude::duplicates::DuplicateDetector> {
        let backend = match self.config.embedding_backend.as_str() {
            "openai" => auto_claude::duplicates::EmbeddingBackend::OpenAi,
            "voyage" => auto_claude::duplicates::EmbeddingBackend::Voyage,
            _ => auto_claude::duplicates::EmbeddingBackend::Local,
        };
        let api_key = match backend {
            auto_claude::duplicates::EmbeddingBackend::OpenAi => std::env::var("OPENAI_API_KEY").ok(),
            auto_claude::duplicates::EmbeddingBackend::Voyage => std::env::var("VOYAGE_API_KEY").ok(),
            auto_claude::duplicates::EmbeddingBackend::Local => None,
        };
        let provider = auto_claude::duplicates::build_provider(backend, api_key)?;
        Ok(auto_claude::duplicates::DuplicateDetector::new(
            provider,
            self.github_dir().join("embeddings"),
        ))
    }

    fn spec_dir(&self, cli: &Cli) -> Result<PathBuf> {
        let id = cli
            .spec
            .as_deref()
            .ok_or_else(|| Error::ConfigValidation("--spec is required for this operation".into()))?;
        find_spec_dir(&self.project_dir, id)?
            .ok_or_else(|| Error::SpecNumber(format!("no spec matching '{id}'")))
    }

    fn slug_for_spec(&self, spec_dir: &Path) -> Result<String> {
        let name = spec_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        name.split_once('-')
            .map(|(_, slug)| slug.to_string())
            .ok_or_else(|| Error::SpecNumber(format!("malformed spec dir name: {name}")))
    }
}

async fn run(cli: &Cli) -> Result<i32> {
    let ctx = AppContext::new(cli)?;

    if cli.list {
        return cmd_list(&ctx);
    }
    if cli.list_worktrees {
        return cmd_list_worktrees(&ctx);
    }
    if cli.cleanup_worktrees {
        return cmd_cleanup_worktrees(&ctx);
    }
    if let Some(ref file) = cli.batch_create {
        return cmd_batch_create(&ctx, file).await;
    }
    if cli.batch_status {
        return cmd_batch_status(&ctx);
    }
    if cli.batch_cleanup {
        return cmd_batch_cleanup(&ctx, !cli.no_dry_run);
    }
    if let Some(pr_number) = cli.pr_review {
        return cmd_pr_review(&ctx, pr_number).await;
    }
    if let Some(issue) = cli.autofix_issue {
        return cmd_autofix(&ctx, cli, issue).await;
    }

    // Per-spec operations.
    if cli.merge || cli.merge_preview || cli.review || cli.discard || cli.create_pr
        || cli.review_status
        || cli.approve
        || cli.qa
        || cli.qa_status
        || cli.skip_qa
        || cli.followup
    {
        return cmd_spec_op(&ctx, cli).await;
    }

    if let Some(ref task) = cli.task {
        return cmd_new_task(&ctx, task).await;
    }

    eprintln!("nothing to do — pass a task description or a flag (see --help)");
    Ok(EXIT_FAILURE)
}

fn cmd_list(ctx: &AppContext) -> Result<i32> {
    let dirs = list_spec_dirs(&ctx.project_dir)?;
    if dirs.is_empty() {
        println!("no specs yet");
        return Ok(EXIT_OK);
    }
    for dir in dirs {
        let name = dir.file_name().unwrap_or_default().to_string_lossy();
        let has_plan = dir.join("implementation_plan.json").exists();
        let approved = auto_claude::pipeline::check_approval(&dir);
        println!(
            "{name}  plan={}  approval={approved:?}",
            if has_plan { "yes" } else { "no" }
        );
    }
    Ok(EXIT_OK)
}

fn cmd_list_worktrees(ctx: &AppContext) -> Result<i32> {
    let worktrees = ctx.worktrees.list_worktrees()?;
    if worktrees.is_empty() {
        println!("no task worktrees");
        return Ok(EXIT_OK);
    }
    for info in worktrees {
        match ctx.worktrees.stats(&info.slug) {
            Ok(stats) => println!(
                "{}  {}  +{} commits  {} files  idle {}d{}",
                info.branch,
                info.path.display(),
                stats.commits_ahead,
                stats.files_changed,
                stats.days_since_last_activity.unwrap_or(0),
                if stats.is_stale() { "  [stale]" } else { "" }
            ),
            Err(_) => println!("{}  {}", info.branch, info.path.display()),
        }
    }
    Ok(EXIT_OK)
}

fn cmd_cleanup_worktrees(ctx: &AppContext) -> Result<i32> {
    let mut removed = 0;
    for info in ctx.worktrees.list_worktrees()? {
        let stale = ctx
            .worktrees
            .stats(&info.slug)
            .map(|s| s.is_stale())
            .unwrap_or(false);
        if stale {
            info!(slug = %info.slug, "removing stale worktree");
            ctx.worktrees.remove_worktree(&info.slug, true)?;
            removed += 1;
        }
    }
    println!("removed {removed} stale worktree(s)");
    Ok(EXIT_OK)
}

async fn cmd_batch_create(ctx: &AppContext, file: &str) -> Result<i32> {
    let content = std::fs::read_to_string(file)?;
    let issue_numbers: Vec<u64> = serde_json::from_str(&content)
        .map_err(|e| Error::Batch(format!("batch file must be a JSON array of issue numbers: {e}")))?;

    let (owner, name) = ctx.gh.repo_nwo()?;
    let repo = format!("{owner}/{name}");
    let all_issues = ctx.gh.issue_list(None, 200)?;
    let issues: Vec<_> = all_issues
        .into_iter()
        .filter(|i| issue_numbers.contains(&i.number))
        .collect();
    if issues.is_empty() {
        return Err(Error::Batch("no matching open issues".into()));
    }

    let runner = ctx.agent_runner();
    let engine = BatchEngine::new(&runner, &ctx.prompts);
    let mut batches = engine.group_issues(&repo, &issues).await?;

    // Score members against their batch primary so weak attachments are
    // visible at triage time.
    let detector = ctx.duplicate_detector()?;
    for batch in &mut batches {
        let Some(primary) = batch.items.first().cloned() else {
            continue;
        };
        let primary_ref = auto_claude::duplicates::IssueRef {
            number: primary.issue_number,
            title: primary.title.clone(),
            body: Some(primary.body.clone()),
        };
        for item in batch.items.iter_mut().skip(1) {
            let candidate = auto_claude::duplicates::IssueRef {
                number: item.issue_number,
                title: item.title.clone(),
                body: Some(item.body.clone()),
            };
            match detector.compare_issues(&repo, &primary_ref, &candidate) {
                Ok(result) => item.similarity_to_primary = result.overall_similarity,
                Err(e) => warn!(issue = item.issue_number, error = %e, "similarity scoring skipped"),
            }
        }
    }

    let store = BatchStore::new(ctx.github_dir().join("batches"));
    for batch in &batches {
        store.insert(batch)?;
        println!(
            "batch {}  issues {:?}  theme {:?}",
            batch.batch_id,
            batch.issue_numbers(),
            batch.common_themes.first()
        );
    }
    Ok(EXIT_OK)
}

fn cmd_batch_status(ctx: &AppContext) -> Result<i32> {
    let store = BatchStore::new(ctx.github_dir().join("batches"));
    let batches = store.list()?;
    if batches.is_empty() {
        println!("no batches");
        return Ok(EXIT_OK);
    }
    for batch in batches {
        println!(
            "{}  {:?}  issues {:?}",
            batch.batch_id,
            batch.status,
            batch.issue_numbers()
        );
    }
    Ok(EXIT_OK)
}

fn cmd_batch_cleanup(ctx: &AppContext, dry_run: bool) -> Result<i32> {
    let store = BatchStore::new(ctx.github_dir().join("batches"));
    let removed = store.cleanup_terminal(dry_run)?;
    if dry_run {
        println!("would remove {} terminal batch(es): {removed:?}", removed.len());
    } else {
        println!("removed {} terminal batch(es)", removed.len());
    }
    Ok(EXIT_OK)
}

async fn cmd_pr_review(ctx: &AppContext, pr_number: u64) -> Result<i32> {
    let (owner, name) = ctx.gh.repo_nwo()?;
    let repo = format!("{owner}/{name}");

    let detector = BotDetector::new(&ctx.github_dir())
        .with_review_own_prs(ctx.config.review_own_prs)
        .with_cooling_off_minutes(ctx.config.cooling_off_minutes);
    let _ = detector.cleanup_stale(auto_claude::bot_detection::STATE_RETENTION_DAYS);
    let store = PrReviewStateStore::new(PrReviewStateStore::default_dir(&ctx.project_dir));
    let runner = ctx.agent_runner();
    let branch_ops = GitBranchOps {
        working_dir: ctx.project_dir.clone(),
    };
    let semaphore = new_review_semaphore(ctx.config.review_concurrency);

    let mut orch_config = OrchestratorConfig::new(ctx.project_dir.clone());
    orch_config.authorized_users = ctx.config.authorized_users.clone();
    orch_config.expected_bots = ctx.config.expected_bots.clone();

    let orchestrator = PrReviewOrchestrator::new(
        &ctx.gh,
        &runner,
        &ctx.prompts,
        &ctx.audit,
        &detector,
        &store,
        &branch_ops,
        semaphore,
        orch_config,
    );
    let state = orchestrator.run(&repo, pr_number).await?;
    println!(
        "PR #{pr_number}: {:?} after {} iteration(s)",
        state.status, state.current_iteration
    );

    // Record the run's verdict as a prediction; reality (merge, close,
    // override) fills in the outcome later.
    let tracker = auto_claude::learning::LearningTracker::new(ctx.github_dir().join("learning"));
    let prediction_type = match state.status {
        auto_claude::review_state::PrReviewStatus::ReadyToMerge if state.applied_fixes.is_empty() => {
            Some(auto_claude::learning::PredictionType::ReviewApprove)
        }
        auto_claude::review_state::PrReviewStatus::ReadyToMerge => {
            Some(auto_claude::learning::PredictionType::ReviewRequestChanges)
        }
        _ => None,
    };
    if let Some(prediction_type) = prediction_type {
        let record = auto_claude::learning::OutcomeRecord {
            review_id: String::new(),
            repo: repo.clone(),
            pr_number,
            prediction_type,
            findings_count: (state.resolved_findings.len() + state.pending_findings.len()) as u32,
            high_severity_count: 0,
            created_at: chrono::Utc::now(),
            actual_outcome: None,
            time_to_outcome_secs: None,
            author_response: None,
            file_types: state
                .applied_fixes
                .iter()
                .filter_map(|f| f.file_path.rsplit('.').next().map(str::to_string))
                .collect(),
            change_size: None,
            categories: Vec::new(),
        };
        if let Err(e) = tracker.record_prediction(record) {
            warn!(error = %e, "failed to record review prediction");
        }
    }
    Ok(EXIT_OK)
}

async fn cmd_autofix(ctx: &AppContext, cli: &Cli, issue: u64) -> Result<i32> {
    let runner = ctx.agent_runner();
    let summarizer = ctx.summarizer();
    let analyzer = ctx.analyzer();
    let memory = ctx.memory();
    let overrides = auto_claude::override_mgr::OverrideManager::new(&ctx.github_dir().join("overrides"))
        .with_grace_minutes(ctx.config.grace_minutes);
    let sink = sink_from_env();

    let mut autofix_config = AutofixConfig::default();
    autofix_config.trigger_label = ctx.config.trigger_label.clone();
    autofix_config.auto_approve = cli.auto_continue || cli.force;
    autofix_config.pr_draft = cli.pr_draft;

    let pipeline = AutofixPipeline::new(
        &ctx.gh,
        &runner,
        &summarizer,
        analyzer.as_ref(),
        memory.as_ref(),
        &ctx.prompts,
        &ctx.audit,
        &overrides,
        &ctx.worktrees,
        autofix_config,
    );

    match pipeline.process_issue(issue, "cli").await? {
        AutofixOutcome::Cancelled { cancelled_by } => {
            println!(
                "autofix cancelled during grace period{}",
                cancelled_by
                    .map(|u| format!(" by {u}"))
                    .unwrap_or_default()
            );
            Ok(EXIT_OK)
        }
        AutofixOutcome::PrOpened { pr_url, slug, .. } => {
            sink.notify("autofix_pr_opened", &json!({"issue": issue, "url": pr_url}));
            println!("PR opened: {pr_url}");
            // The review loop takes over; it stops short of merging.
            let branch = WorktreeManager::branch_for(&slug);
            if let Some(pr_number) = ctx.gh.pr_number_for_branch(&branch)? {
                return cmd_pr_review(ctx, pr_number).await;
            }
            Ok(EXIT_OK)
        }
    }
}

async fn cmd_spec_op(ctx: &AppContext, cli: &Cli) -> Result<i32> {
    let spec_dir = ctx.spec_dir(cli)?;
    let slug = ctx.slug_for_spec(&spec_dir)?;

    if cli.approve {
        record_approval(&spec_dir, "cli")?;
        println!("plan approved");
        return Ok(EXIT_OK);
    }

    if cli.qa || cli.skip_qa || cli.qa_status {
        return cmd_qa(ctx, cli, &spec_dir);
    }

    if cli.review_status {
        let store = PrReviewStateStore::new(PrReviewStateStore::default_dir(&ctx.project_dir));
        let branch = WorktreeManager::branch_for(&slug);
        let (owner, name) = ctx.gh.repo_nwo()?;
        let repo = format!("{owner}/{name}");
        match ctx.gh.pr_number_for_branch(&branch)? {
            Some(pr_number) => match store.load(&repo, pr_number)? {
                Some(state) => {
                    println!("{}", serde_json::to_string_pretty(&state)?);
                }
                None => println!("no review state for PR #{pr_number}"),
            },
            None => println!("no open PR for {branch}"),
        }
        return Ok(EXIT_OK);
    }

    if cli.merge_preview {
        let preview = ctx.worktrees.merge_preview(&slug)?;
        println!("{}", serde_json::to_string_pretty(&preview)?);
        return Ok(EXIT_OK);
    }

    if cli.merge {
        ensure_approved(&spec_dir, cli.force, &ctx.audit)?;
        let outcome = ctx.worktrees.merge_worktree(&slug, cli.no_commit, false)?;
        println!("merge: {outcome:?}");
        return Ok(EXIT_OK);
    }

    if cli.discard {
        ctx.worktrees.remove_worktree(&slug, true)?;
        ctx.audit.log(
            &auto_claude::audit::AuditEntry::new("-", "worktree_discarded", ActorType::User, AuditResult::Success)
                .with_details(json!({"slug": slug})),
        );
        println!("discarded worktree and branch for {slug}");
        return Ok(EXIT_OK);
    }

    if cli.create_pr {
        ctx.worktrees.push_branch(&slug)?;
        let title = cli
            .pr_title
            .clone()
            .unwrap_or_else(|| format!("auto-claude: {slug}"));
        let body = format!("Automated changes for spec `{slug}`.");
        let url = ctx.worktrees.create_pull_request(
            &ctx.gh,
            &slug,
            cli.pr_target.as_deref(),
            &title,
            &body,
            cli.pr_draft,
        )?;
        println!("PR opened: {url}");
        return Ok(EXIT_OK);
    }

    if cli.review {
        let branch = WorktreeManager::branch_for(&slug);
        let Some(pr_number) = ctx.gh.pr_number_for_branch(&branch)? else {
            return Err(Error::Review(format!("no open PR for {branch}")));
        };
        return cmd_pr_review(ctx, pr_number).await;
    }

    if cli.followup {
        let followup_file = spec_dir.join("FOLLOWUP_REQUEST.md");
        let request = std::fs::read_to_string(&followup_file).map_err(|_| {
            Error::Pipeline(format!("no FOLLOWUP_REQUEST.md in {}", spec_dir.display()))
        })?;
        return cmd_new_task(ctx, request.trim()).await;
    }

    Err(Error::ConfigValidation(
        "no spec operation selected".to_string(),
    ))
}

fn cmd_qa(ctx: &AppContext, cli: &Cli, spec_dir: &Path) -> Result<i32> {
    let qa_file = spec_dir.join("qa_status.json");
    if cli.qa_status {
        match std::fs::read_to_string(&qa_file) {
            Ok(content) => println!("{content}"),
            Err(_) => println!("qa: pending"),
        }
        return Ok(EXIT_OK);
    }

    let status = if cli.skip_qa {
        ctx.audit.log(
            &auto_claude::audit::AuditEntry::new("-", "qa_skipped", ActorType::User, AuditResult::Skipped)
                .with_details(json!({"spec_dir": spec_dir.display().to_string()})),
        );
        "skipped"
    } else {
        // The QA gate re-validates the spec document and plan.
        match auto_claude::pipeline::validate_phase_outputs(spec_dir, "planning")
            .and_then(|()| auto_claude::pipeline::validate_phase_outputs(spec_dir, "spec_writing"))
        {
            Ok(()) => "passed",
            Err(e) => {
                warn!(error = %e, "QA validation failed");
                "failed"
            }
        }
    };

    auto_claude::lock::atomic_write(
        &qa_file,
        serde_json::to_string_pretty(&json!({
            "status": status,
            "at": chrono::Utc::now(),
        }))?
        .as_bytes(),
    )?;
    println!("qa: {status}");
    Ok(if status == "failed" { EXIT_FAILURE } else { EXIT_OK })
}

async fn cmd_new_task(ctx: &AppContext, description: &str) -> Result<i32> {
    let slug = {
        let s = slugify(description);
        if s.is_empty() {
            return Err(Error::Pipeline("task description yields an empty slug".into()));
        }
        s
    };

    let runner = ctx.agent_runner();
    let summarizer = ctx.summarizer();
    let analyzer = ctx.analyzer();
    let memory = ctx.memory();

    let spec_dir = reserve_spec_dir(&ctx.worktrees, &slug, auto_claude::lock::DEFAULT_LOCK_TIMEOUT)?;
    let task = TaskRequest {
        description: description.to_string(),
        workflow_type: WorkflowType::Feature,
        spec_dir: spec_dir.clone(),
        project_dir: ctx.project_dir.clone(),
    };

    let pipeline = SpecPipeline::new(
        &runner,
        &summarizer,
        analyzer.as_ref(),
        memory.as_ref(),
        &ctx.prompts,
        &ctx.audit,
    );
    let outcome = pipeline.run(&task).await?;
    println!(
        "spec ready: {} ({:?}, phases: {})",
        spec_dir.display(),
        outcome.tier,
        outcome.executed_phases.join(" → ")
    );

    if ctx.config.isolated {
        let workspace = Workspace::create(&ctx.worktrees, &slug, Some(ctx.memory()))?;
        println!(
            "workspace ready at {} — approve the plan, then build",
            workspace.worktree.path.display()
        );
    }
    Ok(EXIT_OK)
}
