use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Feature,
    Bugfix,
    Refactor,
    Docs,
    Test,
}

impl Default for WorkflowType {
    fn default() -> Self {
        Self::Feature
    }
}

/// `requirements.json` — the structured task statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirements {
    pub task: String,
    #[serde(default)]
    pub workflow_type: WorkflowType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// `context.json` — where the task lands in the codebase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRecord {
    pub task_description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scoped_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_to_modify: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_to_reference: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// One researched external dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchedIntegration {
    pub name: String,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub gotchas: Vec<String>,
}

/// `research.json` — validated facts about external dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRecord {
    #[serde(default)]
    pub integrations_researched: Vec<ResearchedIntegration>,
    #[serde(default)]
    pub research_skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// `graph_hints.json` — insights from the optional memory service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphHints {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub hints: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl GraphHints {
    /// The record written when the memory service is unavailable.
    pub fn disabled(reason: &str) -> Self {
        Self {
            enabled: false,
            reason: Some(reason.to_string()),
            hints: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueIssue {
    pub section: String,
    pub issue: String,
    #[serde(default)]
    pub fixed: bool,
}

/// `critique_report.json` — what self-critique found and fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueReport {
    #[serde(default)]
    pub issues_found: Vec<CritiqueIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues_fixed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_issues_found: Option<bool>,
    pub critique_summary: String,
    pub created_at: DateTime<Utc>,
}

impl CritiqueReport {
    /// Minimal valid stub used when the critique agent repeatedly fails.
    pub fn stub(reason: &str) -> Self {
        Self {
            issues_found: Vec::new(),
            issues_fixed: Some(0),
            no_issues_found: Some(true),
            critique_summary: format!("critique unavailable: {reason}"),
            created_at: Utc::now(),
        }
    }
}

/// Required sections of `spec.md`, checked by the validation phase.
pub const REQUIRED_SPEC_SECTIONS: [&str; 3] = ["Overview", "Architecture", "Implementation"];

/// Whether a spec document carries every required section heading.
pub fn spec_document_is_valid(markdown: &str) -> bool {
    REQUIRED_SPEC_SECTIONS.iter().all(|section| {
        markdown
            .lines()
            .any(|line| line.trim_start_matches('#').trim().starts_with(section))
    })
}
