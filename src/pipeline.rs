use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::artifacts::{
    ContextRecord, CritiqueReport, GraphHints, Requirements, ResearchRecord, WorkflowType,
    spec_document_is_valid,
};
use crate::audit::{ActorType, AuditLogger, AuditResult};
use crate::compaction::{format_phase_summaries, summarize_phase_output};
use crate::complexity::{ComplexityAssessment, Tier, assess_heuristic, parse_ai_assessment};
use crate::error::{Error, Result};
use crate::lock::atomic_write;
use crate::memory::MemoryService;
use crate::plan::{ImplementationPlan, plan_hash};
use crate::prompts::PromptEngine;
use crate::runner::{AgentRunner, AgentTask};

/// Retry budget per phase.
pub const MAX_PHASE_ATTEMPTS: u32 = 3;

/// External project analyzer boundary: produces the opaque project index.
pub trait ProjectAnalyzer: Send + Sync {
    fn analyze(&self, project_dir: &Path) -> Result<serde_json::Value>;
}

/// Analyzer that shells out to a configured command, passing the project
/// directory and reading JSON from stdout.
pub struct CommandAnalyzer {
    pub binary: String,
}

impl ProjectAnalyzer for CommandAnalyzer {
    fn analyze(&self, project_dir: &Path) -> Result<serde_json::Value> {
        let output = std::process::Command::new(&self.binary)
            .arg("--json")
            .arg(project_dir)
            .output()
            .map_err(|e| Error::Pipeline(format!("analyzer '{}' failed to run: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(Error::Pipeline(format!(
                "analyzer '{}' exited with {}",
                self.binary,
                output.status.code().unwrap_or(-1)
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Pipeline(format!("analyzer emitted invalid JSON: {e}")))
    }
}

/// Fallback analyzer: a minimal index built from a directory walk, used
/// when no external analyzer is configured.
pub struct BasicAnalyzer;

impl ProjectAnalyzer for BasicAnalyzer {
    fn analyze(&self, project_dir: &Path) -> Result<serde_json::Value> {
        let mut files = Vec::new();
        collect_files(project_dir, project_dir, &mut files, 0);
        files.sort();
        Ok(json!({
            "root": project_dir.display().to_string(),
            "file_count": files.len(),
            "files": files,
            "generated_by": "basic-walk",
            "created_at": Utc::now().to_rfc3339(),
        }))
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>, depth: u32) {
    if depth > 6 || out.len() > 2_000 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name == "target" || name == "node_modules" {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, out, depth + 1);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().to_string());
        }
    }
}

/// The per-run description of a task entering the pipeline.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub description: String,
    pub workflow_type: WorkflowType,
    pub spec_dir: PathBuf,
    pub project_dir: PathBuf,
}

/// Outcome of a completed pipeline run.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub spec_dir: PathBuf,
    pub tier: Tier,
    pub executed_phases: Vec<String>,
}

/// The spec pipeline: an ordered phase executor whose phase set is chosen
/// by a complexity assessment, with per-phase retry and inter-phase
/// compaction.
pub struct SpecPipeline<'a, R: AgentRunner, S: AgentRunner> {
    runner: &'a R,
    summarizer: &'a S,
    analyzer: &'a dyn ProjectAnalyzer,
    memory: &'a dyn MemoryService,
    engine: &'a PromptEngine,
    audit: &'a AuditLogger,
}

impl<'a, R: AgentRunner, S: AgentRunner> SpecPipeline<'a, R, S> {
    pub fn new(
        runner: &'a R,
        summarizer: &'a S,
        analyzer: &'a dyn ProjectAnalyzer,
        memory: &'a dyn MemoryService,
        engine: &'a PromptEngine,
        audit: &'a AuditLogger,
    ) -> Self {
        Self {
            runner,
            summarizer,
            analyzer,
            memory,
            engine,
            audit,
        }
    }

    /// Run the pipeline to completion for one task.
    ///
    /// The initial phase list comes from a heuristic assessment of the task;
    /// once the `complexity_assessment` phase has produced an AI verdict,
    /// its `phases_to_run` takes over for the remaining phases.
    pub async fn run(&self, task: &TaskRequest) -> Result<PipelineOutcome> {
        let ctx = self.audit.start_operation("spec_pipeline", ActorType::Automation);

        let initial = assess_heuristic(&task.description);
        let mut tier = initial.complexity;
        let mut phases = initial.phases_to_run.clone();
        info!(?tier, ?phases, "pipeline starting");

        let mut executed: Vec<String> = Vec::new();
        let mut summaries: Vec<(String, String)> = Vec::new();
        let mut index = 0;

        while index < phases.len() {
            let phase = phases[index].clone();
            let prior_context = format_phase_summaries(&summaries);

            match self.run_phase(task, &phase, &prior_context).await {
                Ok(()) => {
                    ctx.event(
                        &format!("phase_{phase}"),
                        AuditResult::Success,
                        json!({"phase": phase}),
                    );
                }
                Err(e) => {
                    ctx.event(
                        &format!("phase_{phase}"),
                        AuditResult::Failure,
                        json!({"phase": phase, "error": e.to_string()}),
                    );
                    ctx.finish(AuditResult::Failure, Some(&e.to_string()));
                    return Err(e);
                }
            }

            // Compaction: summary written before the next phase starts.
            let summary =
                summarize_phase_output(self.summarizer, self.engine, &task.spec_dir, &phase).await;
            summaries.push((phase.clone(), summary));
            executed.push(phase.clone());

            // The AI verdict re-plans the remainder of the run.
            if phase == "complexity_assessment"
                && let Some(assessment) = self.read_ai_assessment(&task.spec_dir)
            {
                tier = assessment.complexity;
                if !assessment.phases_to_run.is_empty() {
                    phases = replan_phases(&executed, &assessment.phases_to_run);
                    info!(?tier, ?phases, "phase set re-planned from AI assessment");
                }
            }

            index = executed.len();
        }

        ctx.finish(AuditResult::Success, None);
        Ok(PipelineOutcome {
            spec_dir: task.spec_dir.clone(),
            tier,
            executed_phases: executed,
        })
    }

    fn read_ai_assessment(&self, spec_dir: &Path) -> Option<ComplexityAssessment> {
        let content = std::fs::read_to_string(spec_dir.join("complexity_assessment.json")).ok()?;
        parse_ai_assessment(&content)
    }

    /// Run one phase with its retry budget, then fall back to a minimal
    /// valid stub where the contract allows one.
    async fn run_phase(&self, task: &TaskRequest, phase: &str, prior_context: &str) -> Result<()> {
        match phase {
            "discovery" => return self.run_discovery(task),
            "historical_context" => return self.run_historical_context(task),
            "validation" => return self.run_validation(task),
            _ => {}
        }

        let mut errors: Vec<String> = Vec::new();
        for attempt in 1..=MAX_PHASE_ATTEMPTS {
            let result = self.run_agent_phase(task, phase, prior_context, &errors).await;
            match result {
                Ok(()) => match validate_phase_outputs(&task.spec_dir, phase) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(phase, attempt, error = %e, "phase outputs invalid");
                        errors.push(e.to_string());
                        // A malformed file gets a recovery sub-agent before
                        // the next full attempt burns retry budget.
                        if self.try_recover_output(task, phase, &e.to_string()).await
                            && validate_phase_outputs(&task.spec_dir, phase).is_ok()
                        {
                            return Ok(());
                        }
                    }
                },
                Err(e) => {
                    warn!(phase, attempt, error = %e, "phase agent failed");
                    errors.push(e.to_string());
                }
            }
        }

        // Quick-spec tolerates a missing plan by synthesizing one.
        if phase == "quick_spec"
            && spec_file_valid(&task.spec_dir)
            && !task.spec_dir.join("implementation_plan.json").exists()
        {
            self.write_minimal_plan(task)?;
            return validate_phase_outputs(&task.spec_dir, phase);
        }

        if let Some(stub_written) = self.write_stub(task, phase, &errors)? {
            warn!(phase, stub = %stub_written, "phase degraded to minimal stub");
            self.audit.log(
                &crate::audit::AuditEntry::new(
                    "-",
                    &format!("phase_{phase}_stub"),
                    ActorType::Automation,
                    AuditResult::Skipped,
                )
                .with_details(json!({"errors": errors})),
            );
            return Ok(());
        }

        Err(Error::Pipeline(format!(
            "phase '{phase}' failed after {MAX_PHASE_ATTEMPTS} attempts: {}",
            errors.join(" | ")
        )))
    }

    /// Hand a malformed artifact back to a recovery agent with its schema.
    /// Returns true when the agent ran (the caller re-validates).
    async fn try_recover_output(&self, task: &TaskRequest, phase: &str, error: &str) -> bool {
        let Some((file, example)) = recovery_schema(phase) else {
            return false;
        };
        let path = task.spec_dir.join(file);
        let Ok(malformed) = std::fs::read_to_string(&path) else {
            return false;
        };

        let mut vars = HashMap::new();
        vars.insert("parse_error".to_string(), error.to_string());
        vars.insert("malformed_output".to_string(), malformed);
        vars.insert("schema_example".to_string(), example.to_string());
        let Ok(prompt) = self.engine.render("recover_output", &vars) else {
            return false;
        };

        let run = self
            .runner
            .run(AgentTask::Recovery, &prompt, &task.project_dir)
            .await;
        match run {
            Ok(result) => {
                // The recovery agent answers with the corrected JSON body.
                let corrected =
                    crate::review_schema::strip_markdown_fences(result.stdout.trim());
                if serde_json::from_str::<serde_json::Value>(&corrected).is_ok() {
                    let _ = atomic_write(&path, corrected.as_bytes());
                }
                true
            }
            Err(e) => {
                warn!(phase, error = %e, "recovery agent failed");
                false
            }
        }
    }

    fn run_discovery(&self, task: &TaskRequest) -> Result<()> {
        let index_path = task.spec_dir.join("project_index.json");
        if index_path.exists() {
            return Ok(());
        }
        let index = self.analyzer.analyze(&task.project_dir)?;
        atomic_write(&index_path, &serde_json::to_vec_pretty(&index)?)?;
        info!("project index written");
        Ok(())
    }

    fn run_historical_context(&self, task: &TaskRequest) -> Result<()> {
        let hints = if self.memory.enabled() {
            match self.memory.relevant_hints(&task.description) {
                Ok(hints) => GraphHints {
                    enabled: true,
                    reason: None,
                    hints,
                    created_at: Utc::now(),
                },
                Err(e) => GraphHints::disabled(&format!("memory query failed: {e}")),
            }
        } else {
            GraphHints::disabled("memory service not configured")
        };
        atomic_write(
            &task.spec_dir.join("graph_hints.json"),
            &serde_json::to_vec_pretty(&hints)?,
        )?;
        Ok(())
    }

    /// Schema-validate every artifact the run produced.
    fn run_validation(&self, task: &TaskRequest) -> Result<()> {
        let spec_dir = &task.spec_dir;
        let mut errors = Vec::new();

        if !spec_file_valid(spec_dir) {
            errors.push("spec.md missing or lacks required sections".to_string());
        }

        match std::fs::read_to_string(spec_dir.join("implementation_plan.json")) {
            Ok(content) => match serde_json::from_str::<ImplementationPlan>(&content) {
                Ok(plan) => {
                    if let Err(e) = plan.validate() {
                        errors.push(format!("implementation_plan.json: {e}"));
                    }
                }
                Err(e) => errors.push(format!("implementation_plan.json unparseable: {e}")),
            },
            Err(_) => errors.push("implementation_plan.json missing".to_string()),
        }

        for (file, check) in [
            ("requirements.json", parse_check::<Requirements> as fn(&str) -> Option<String>),
            ("context.json", parse_check::<ContextRecord>),
            ("research.json", parse_check::<ResearchRecord>),
            ("critique_report.json", parse_check::<CritiqueReport>),
            ("graph_hints.json", parse_check::<GraphHints>),
        ] {
            if let Ok(content) = std::fs::read_to_string(spec_dir.join(file))
                && let Some(e) = check(&content)
            {
                errors.push(format!("{file}: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Pipeline(format!(
                "validation failed: {}",
                errors.join("; ")
            )))
        }
    }

    async fn run_agent_phase(
        &self,
        task: &TaskRequest,
        phase: &str,
        prior_context: &str,
        prior_errors: &[String],
    ) -> Result<()> {
        let mut vars = HashMap::new();
        vars.insert("task_description".to_string(), task.description.clone());
        vars.insert(
            "spec_dir".to_string(),
            task.spec_dir.display().to_string(),
        );
        vars.insert(
            "project_dir".to_string(),
            task.project_dir.display().to_string(),
        );
        let mut context_block = prior_context.to_string();
        if let Some(last_error) = prior_errors.last() {
            context_block.push_str(&format!(
                "\n\nYour previous attempt failed validation: {last_error}\nFix that problem this time."
            ));
        }
        vars.insert("prior_context".to_string(), context_block);

        let prompt = self.engine.render(template_for(phase)?, &vars)?;
        self.runner
            .run(AgentTask::Phase(phase.to_string()), &prompt, &task.project_dir)
            .await?;
        Ok(())
    }

    /// Write a minimal valid stub for phases whose contract allows graceful
    /// degradation. Returns the file name written, or `None` when the phase
    /// has no stub (and must therefore fail).
    fn write_stub(
        &self,
        task: &TaskRequest,
        phase: &str,
        errors: &[String],
    ) -> Result<Option<String>> {
        let reason = errors
            .last()
            .cloned()
            .unwrap_or_else(|| "agent produced no output".to_string());
        let spec_dir = &task.spec_dir;

        let written = match phase {
            "requirements" => {
                let stub = Requirements {
                    task: task.description.clone(),
                    workflow_type: task.workflow_type,
                    services: Vec::new(),
                    context: Some(format!("auto-generated stub: {reason}")),
                    created_at: Utc::now(),
                };
                atomic_write(
                    &spec_dir.join("requirements.json"),
                    &serde_json::to_vec_pretty(&stub)?,
                )?;
                Some("requirements.json")
            }
            "complexity_assessment" => {
                let stub = assess_heuristic(&task.description);
                atomic_write(
                    &spec_dir.join("complexity_assessment.json"),
                    &serde_json::to_vec_pretty(&stub)?,
                )?;
                Some("complexity_assessment.json")
            }
            "research" => {
                let stub = ResearchRecord {
                    integrations_researched: Vec::new(),
                    research_skipped: true,
                    reason: Some(reason),
                    created_at: Utc::now(),
                };
                atomic_write(
                    &spec_dir.join("research.json"),
                    &serde_json::to_vec_pretty(&stub)?,
                )?;
                Some("research.json")
            }
            "context" => {
                let stub = ContextRecord {
                    task_description: task.description.clone(),
                    scoped_services: Vec::new(),
                    files_to_modify: Vec::new(),
                    files_to_reference: Vec::new(),
                    created_at: Utc::now(),
                };
                atomic_write(
                    &spec_dir.join("context.json"),
                    &serde_json::to_vec_pretty(&stub)?,
                )?;
                Some("context.json")
            }
            "self_critique" => {
                let stub = CritiqueReport::stub(&reason);
                atomic_write(
                    &spec_dir.join("critique_report.json"),
                    &serde_json::to_vec_pretty(&stub)?,
                )?;
                Some("critique_report.json")
            }
            // spec_writing, planning and quick_spec have no acceptable stub:
            // without a real spec or plan the task cannot proceed.
            _ => None,
        };
        Ok(written.map(str::to_string))
    }

    fn write_minimal_plan(&self, task: &TaskRequest) -> Result<()> {
        let spec_name = task
            .spec_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        let plan =
            ImplementationPlan::minimal(&spec_name, task.workflow_type, &task.description);
        atomic_write(
            &task.spec_dir.join("implementation_plan.json"),
            &serde_json::to_vec_pretty(&plan)?,
        )?;
        info!("synthesized minimal implementation plan");
        Ok(())
    }
}

/// Splice the AI-chosen phase list onto the already-executed prefix.
fn replan_phases(executed: &[String], ai_phases: &[String]) -> Vec<String> {
    let mut phases: Vec<String> = executed.to_vec();
    for phase in ai_phases {
        if !phases.contains(phase) {
            phases.push(phase.clone());
        }
    }
    // Validation always closes the run.
    if !phases.iter().any(|p| p == "validation") {
        phases.push("validation".to_string());
    }
    phases
}

/// Primary JSON artifact and schema example per recoverable phase.
fn recovery_schema(phase: &str) -> Option<(&'static str, &'static str)> {
    match phase {
        "requirements" => Some((
            "requirements.json",
            r#"{"task": "one-line task", "workflow_type": "feature", "services": [], "context": null, "created_at": "2025-01-01T00:00:00Z"}"#,
        )),
        "complexity_assessment" => Some((
            "complexity_assessment.json",
            r#"{"complexity": "standard", "confidence": 0.75, "reasoning": "why", "signals": {}, "estimated_files": 3, "estimated_services": 1, "external_integrations": [], "infrastructure_changes": false, "phases_to_run": [], "needs_research": false, "needs_self_critique": false, "created_at": "2025-01-01T00:00:00Z"}"#,
        )),
        "research" => Some((
            "research.json",
            r#"{"integrations_researched": [], "research_skipped": true, "reason": "none", "created_at": "2025-01-01T00:00:00Z"}"#,
        )),
        "context" => Some((
            "context.json",
            r#"{"task_description": "the task", "scoped_services": [], "files_to_modify": [], "files_to_reference": [], "created_at": "2025-01-01T00:00:00Z"}"#,
        )),
        "self_critique" => Some((
            "critique_report.json",
            r#"{"issues_found": [], "issues_fixed": 0, "no_issues_found": true, "critique_summary": "summary", "created_at": "2025-01-01T00:00:00Z"}"#,
        )),
        "planning" | "quick_spec" => Some((
            "implementation_plan.json",
            r#"{"spec_name": "001-slug", "workflow_type": "feature", "total_phases": 1, "recommended_workers": 1, "phases": [{"id": "1", "name": "implement", "depends_on": [], "subtasks": [{"id": "1.1", "description": "change", "service": "main", "status": "pending", "files_to_create": [], "files_to_modify": [], "patterns_from": [], "verification": {"type": "manual"}}]}], "metadata": {"created_at": "2025-01-01T00:00:00Z"}}"#,
        )),
        _ => None,
    }
}

fn template_for(phase: &str) -> Result<&'static str> {
    Ok(match phase {
        "requirements" => "requirements",
        "complexity_assessment" => "complexity_assessment",
        "research" => "research",
        "context" => "context",
        "spec_writing" => "spec_writing",
        "self_critique" => "self_critique",
        "planning" => "planning",
        "quick_spec" => "quick_spec",
        other => {
            return Err(Error::Pipeline(format!("no template for phase '{other}'")));
        }
    })
}

fn spec_file_valid(spec_dir: &Path) -> bool {
    std::fs::read_to_string(spec_dir.join("spec.md"))
        .map(|content| spec_document_is_valid(&content))
        .unwrap_or(false)
}

fn parse_check<T: serde::de::DeserializeOwned>(content: &str) -> Option<String> {
    serde_json::from_str::<T>(content).err().map(|e| e.to_string())
}

/// Validate a phase's expected outputs exist and parse.
pub fn validate_phase_outputs(spec_dir: &Path, phase: &str) -> Result<()> {
    let missing = |file: &str| Error::Pipeline(format!("phase '{phase}' did not produce {file}"));
    let bad = |file: &str, e: String| Error::Pipeline(format!("{file} invalid: {e}"));

    let read = |file: &str| -> Result<String> {
        std::fs::read_to_string(spec_dir.join(file)).map_err(|_| missing(file))
    };

    match phase {
        "requirements" => {
            let content = read("requirements.json")?;
            serde_json::from_str::<Requirements>(&content)
                .map_err(|e| bad("requirements.json", e.to_string()))?;
        }
        "complexity_assessment" => {
            let content = read("complexity_assessment.json")?;
            parse_ai_assessment(&content)
                .ok_or_else(|| bad("complexity_assessment.json", "schema mismatch".into()))?;
        }
        "research" => {
            let content = read("research.json")?;
            serde_json::from_str::<ResearchRecord>(&content)
                .map_err(|e| bad("research.json", e.to_string()))?;
        }
        "context" => {
            let content = read("context.json")?;
            serde_json::from_str::<ContextRecord>(&content)
                .map_err(|e| bad("context.json", e.to_string()))?;
        }
        "spec_writing" => {
            let content = read("spec.md")?;
            if !spec_document_is_valid(&content) {
                return Err(bad("spec.md", "missing required sections".into()));
            }
        }
        "self_critique" => {
            let content = read("critique_report.json")?;
            serde_json::from_str::<CritiqueReport>(&content)
                .map_err(|e| bad("critique_report.json", e.to_string()))?;
        }
        "planning" | "quick_spec" => {
            if phase == "quick_spec" {
                let spec = read("spec.md")?;
                if !spec_document_is_valid(&spec) {
                    return Err(bad("spec.md", "missing required sections".into()));
                }
            }
            let content = read("implementation_plan.json")?;
            let plan: ImplementationPlan = serde_json::from_str(&content)
                .map_err(|e| bad("implementation_plan.json", e.to_string()))?;
            plan.validate()?;
        }
        _ => {}
    }
    Ok(())
}

// --- Human-review checkpoint -----------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanApproval {
    pub approved_by: String,
    pub plan_hash: String,
    pub approved_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalStatus {
    Valid,
    Missing,
    /// The plan changed after approval.
    Invalidated,
}

fn approval_path(spec_dir: &Path) -> PathBuf {
    spec_dir.join("plan_approval.json")
}

/// Record a human approval bound to the current plan content.
pub fn record_approval(spec_dir: &Path, approved_by: &str) -> Result<()> {
    let plan_bytes = std::fs::read(spec_dir.join("implementation_plan.json"))
        .map_err(|_| Error::Pipeline("cannot approve: implementation_plan.json missing".into()))?;
    let approval = PlanApproval {
        approved_by: approved_by.to_string(),
        plan_hash: plan_hash(&plan_bytes),
        approved_at: Utc::now(),
    };
    atomic_write(
        &approval_path(spec_dir),
        &serde_json::to_vec_pretty(&approval)?,
    )?;
    info!(approved_by, "plan approved");
    Ok(())
}

/// Check whether a recorded approval still matches the plan on disk.
pub fn check_approval(spec_dir: &Path) -> ApprovalStatus {
    let Ok(content) = std::fs::read_to_string(approval_path(spec_dir)) else {
        return ApprovalStatus::Missing;
    };
    let Ok(approval) = serde_json::from_str::<PlanApproval>(&content) else {
        return ApprovalStatus::Missing;
    };
    let Ok(plan_bytes) = std::fs::read(spec_dir.join("implementation_plan.json")) else {
        return ApprovalStatus::Invalidated;
    };
    if plan_hash(&plan_bytes) == approval.plan_hash {
        ApprovalStatus::Valid
    } else {
        ApprovalStatus::Invalidated
    }
}

/// Gate a build on plan approval. `force` bypasses the gate but the bypass
/// is always recorded in the audit log.
pub fn ensure_approved(spec_dir: &Path, force: bool, audit: &AuditLogger) -> Result<()> {
    let status = check_approval(spec_dir);
    if status == ApprovalStatus::Valid {
        return Ok(());
    }
    if force {
        audit.log(
            &crate::audit::AuditEntry::new(
                "-",
                "approval_bypass",
                ActorType::User,
                AuditResult::Granted,
            )
            .with_details(json!({
                "spec_dir": spec_dir.display().to_string(),
                "approval_status": format!("{status:?}"),
            })),
        );
        warn!("plan approval bypassed with --force");
        return Ok(());
    }
    match status {
        ApprovalStatus::Missing => Err(Error::Pipeline(
            "plan is not approved; approve it or pass --force".into(),
        )),
        ApprovalStatus::Invalidated => Err(Error::Pipeline(
            "plan changed after approval; re-approve it or pass --force".into(),
        )),
        ApprovalStatus::Valid => unreachable!(),
    }
}
