use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// One concrete issue raised by the review agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReviewFinding {
    pub id: String,
    pub file: String,
    pub line: u32,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Structured output of the review agent: a list of findings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReviewOutput {
    pub findings: Vec<ReviewFinding>,
}

pub fn parse_review_output(raw: &str) -> Result<ReviewOutput> {
    let json = strip_markdown_fences(raw);
    serde_json::from_str(&json)
        .map_err(|e| Error::Review(format!("failed to parse review JSON: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    Fixed,
    NotApplicable,
    Error,
}

/// Structured output of the fix agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FixOutput {
    pub status: FixStatus,
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
}

pub fn parse_fix_output(raw: &str) -> Result<FixOutput> {
    let json = strip_markdown_fences(raw);
    serde_json::from_str(&json).map_err(|e| Error::Review(format!("failed to parse fix JSON: {e}")))
}

/// One batch proposed by the grouping agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProposedBatch {
    pub issue_numbers: Vec<u64>,
    pub theme: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchGroupOutput {
    pub batches: Vec<ProposedBatch>,
}

pub fn parse_batch_group_output(raw: &str) -> Result<BatchGroupOutput> {
    let json = strip_markdown_fences(raw);
    serde_json::from_str(&json)
        .map_err(|e| Error::Batch(format!("failed to parse batch group JSON: {e}")))
}

/// Verdict of the batch validation agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchValidationOutput {
    pub is_valid: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub suggested_splits: Vec<Vec<u64>>,
    #[serde(default)]
    pub common_theme: Option<String>,
}

pub fn parse_batch_validation_output(raw: &str) -> Result<BatchValidationOutput> {
    let json = strip_markdown_fences(raw);
    serde_json::from_str(&json)
        .map_err(|e| Error::Batch(format!("failed to parse batch validation JSON: {e}")))
}

/// Schemas the recovery prompt can point an agent back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaName {
    Review,
    Fix,
    BatchGroup,
    BatchValidate,
}

impl SchemaName {
    pub fn example_json(&self) -> &'static str {
        match self {
            SchemaName::Review => {
                r#"{"findings": [{"id": "f1", "file": "src/main.rs", "line": 42, "severity": "critical", "description": "issue description", "category": "correctness"}]}"#
            }
            SchemaName::Fix => {
                r#"{"status": "fixed", "summary": "what was done", "files_changed": ["src/main.rs"], "commit_message": "fix: describe it"}"#
            }
            SchemaName::BatchGroup => {
                r#"{"batches": [{"issue_numbers": [201, 202], "theme": "oauth-login-regression", "reasoning": "shared root cause", "confidence": 0.8}]}"#
            }
            SchemaName::BatchValidate => {
                r#"{"is_valid": true, "confidence": 0.8, "reasoning": "coherent scope", "suggested_splits": [], "common_theme": "oauth-login-regression"}"#
            }
        }
    }
}

/// Render findings as markdown for prompt injection.
pub fn render_findings(findings: &[ReviewFinding]) -> String {
    if findings.is_empty() {
        return "No issues found.".to_string();
    }
    findings
        .iter()
        .map(|f| {
            let cat = f.category.as_deref().unwrap_or("general");
            format!(
                "- **{}** [{}] `{}` L{}: {} ({})",
                f.severity.label().to_uppercase(),
                cat,
                f.file,
                f.line,
                f.description,
                f.id
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove markdown code fences (```json ... ```), returning the inner
/// content; bare JSON passes through untouched.
pub fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();

    if let Some(rest) = trimmed.strip_prefix("```") {
        let after_tag = match rest.find('\n') {
            Some(pos) => &rest[pos + 1..],
            None => return String::new(),
        };
        if let Some(pos) = after_tag.rfind("```") {
            return after_tag[..pos].trim().to_string();
        }
        return after_tag.trim().to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_review_with_findings() {
        let json = r#"{
            "findings": [
                {"id": "f1", "file": "src/main.rs", "line": 42, "severity": "critical",
                 "description": "SQL injection", "category": "security"},
                {"id": "f2", "file": "src/lib.rs", "line": 10, "severity": "info",
                 "description": "nit"}
            ]
        }"#;
        let output = parse_review_output(json).unwrap();
        assert_eq!(output.findings.len(), 2);
        assert_eq!(output.findings[0].severity, Severity::Critical);
        assert_eq!(output.findings[0].category.as_deref(), Some("security"));
        assert!(output.findings[1].category.is_none());
    }

    #[test]
    fn test_parse_review_empty() {
        let output = parse_review_output(r#"{"findings": []}"#).unwrap();
        assert!(output.findings.is_empty());
    }

    #[test]
    fn test_parse_review_fenced() {
        let fenced = "```json\n{\"findings\": [{\"id\": \"a\", \"file\": \"x.rs\", \"line\": 1, \"severity\": \"warning\", \"description\": \"d\"}]}\n```";
        let output = parse_review_output(fenced).unwrap();
        assert_eq!(output.findings.len(), 1);
    }

    #[test]
    fn test_parse_review_rejects_garbage() {
        assert!(parse_review_output("not json").is_err());
        assert!(parse_review_output(r#"{"findings": [{"file": "x"}]}"#).is_err());
    }

    #[test]
    fn test_parse_fix_variants() {
        let fixed = r#"{"status": "fixed", "summary": "done", "files_changed": ["a.rs"], "commit_message": "fix: a"}"#;
        let output = parse_fix_output(fixed).unwrap();
        assert_eq!(output.status, FixStatus::Fixed);
        assert_eq!(output.commit_message.as_deref(), Some("fix: a"));

        let na = r#"{"status": "not_applicable", "summary": "already fixed"}"#;
        let output = parse_fix_output(na).unwrap();
        assert_eq!(output.status, FixStatus::NotApplicable);
        assert!(output.files_changed.is_empty());

        assert!(parse_fix_output(r#"{"status": "perhaps", "summary": "x"}"#).is_err());
    }

    #[test]
    fn test_parse_batch_group() {
        let json = r#"{"batches": [
            {"issue_numbers": [201, 202, 203], "theme": "oauth-login-regression",
             "reasoning": "same trace", "confidence": 0.8}
        ]}"#;
        let output = parse_batch_group_output(json).unwrap();
        assert_eq!(output.batches.len(), 1);
        assert_eq!(output.batches[0].issue_numbers, vec![201, 202, 203]);
        assert_eq!(output.batches[0].theme, "oauth-login-regression");
    }

    #[test]
    fn test_parse_batch_validation() {
        let json = r#"{"is_valid": false, "confidence": 0.9, "reasoning": "unrelated",
                       "suggested_splits": [[201], [202, 203]], "common_theme": null}"#;
        let output = parse_batch_validation_output(json).unwrap();
        assert!(!output.is_valid);
        assert_eq!(output.suggested_splits.len(), 2);
    }

    #[test]
    fn test_schema_examples_parse_against_their_types() {
        assert!(parse_review_output(SchemaName::Review.example_json()).is_ok());
        assert!(parse_fix_output(SchemaName::Fix.example_json()).is_ok());
        assert!(parse_batch_group_output(SchemaName::BatchGroup.example_json()).is_ok());
        assert!(
            parse_batch_validation_output(SchemaName::BatchValidate.example_json()).is_ok()
        );
    }

    #[test]
    fn test_render_findings_markdown() {
        let findings = vec![ReviewFinding {
            id: "f1".into(),
            file: "src/main.rs".into(),
            line: 42,
            severity: Severity::Critical,
            description: "boom".into(),
            category: None,
        }];
        let rendered = render_findings(&findings);
        assert_eq!(
            rendered,
            "- **CRITICAL** [general] `src/main.rs` L42: boom (f1)"
        );
        assert_eq!(render_findings(&[]), "No issues found.");
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(
            strip_markdown_fences("```json\n{\"a\": 1}\n```"),
            r#"{"a": 1}"#
        );
        assert_eq!(strip_markdown_fences("```\n{\"a\": 1}\n```"), r#"{"a": 1}"#);
        assert_eq!(strip_markdown_fences(r#"{"a": 1}"#), r#"{"a": 1}"#);
        assert_eq!(
            strip_markdown_fences("\n  ```json\n{\"a\": 1}\n```  \n"),
            r#"{"a": 1}"#
        );
        assert_eq!(strip_markdown_fences("```"), "");
    }
}
