use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

const DEFAULT_REQUIREMENTS: &str = include_str!("default_prompts/requirements.md");
const DEFAULT_COMPLEXITY: &str = include_str!("default_prompts/complexity-assessment.md");
const DEFAULT_RESEARCH: &str = include_str!("default_prompts/research.md");
const DEFAULT_CONTEXT: &str = include_str!("default_prompts/context.md");
const DEFAULT_SPEC_WRITING: &str = include_str!("default_prompts/spec-writing.md");
const DEFAULT_SELF_CRITIQUE: &str = include_str!("default_prompts/self-critique.md");
const DEFAULT_PLANNING: &str = include_str!("default_prompts/planning.md");
const DEFAULT_QUICK_SPEC: &str = include_str!("default_prompts/quick-spec.md");
const DEFAULT_REVIEW: &str = include_str!("default_prompts/pr-review.md");
const DEFAULT_FIX: &str = include_str!("default_prompts/pr-fix.md");
const DEFAULT_BUILD: &str = include_str!("default_prompts/build.md");
const DEFAULT_BATCH_GROUP: &str = include_str!("default_prompts/batch-group.md");
const DEFAULT_BATCH_VALIDATE: &str = include_str!("default_prompts/batch-validate.md");
const DEFAULT_SUMMARIZE: &str = include_str!("default_prompts/summarize-phase.md");
const DEFAULT_RECOVERY: &str = include_str!("default_prompts/recover-output.md");

fn default_template(name: &str) -> Option<&'static str> {
    match name {
        "requirements" => Some(DEFAULT_REQUIREMENTS),
        "complexity_assessment" => Some(DEFAULT_COMPLEXITY),
        "research" => Some(DEFAULT_RESEARCH),
        "context" => Some(DEFAULT_CONTEXT),
        "spec_writing" => Some(DEFAULT_SPEC_WRITING),
        "self_critique" => Some(DEFAULT_SELF_CRITIQUE),
        "planning" => Some(DEFAULT_PLANNING),
        "quick_spec" => Some(DEFAULT_QUICK_SPEC),
        "pr_review" => Some(DEFAULT_REVIEW),
        "pr_fix" => Some(DEFAULT_FIX),
        "build" => Some(DEFAULT_BUILD),
        "batch_group" => Some(DEFAULT_BATCH_GROUP),
        "batch_validate" => Some(DEFAULT_BATCH_VALIDATE),
        "summarize_phase" => Some(DEFAULT_SUMMARIZE),
        "recover_output" => Some(DEFAULT_RECOVERY),
        _ => None,
    }
}

fn template_filename(name: &str) -> String {
    format!("{}.md", name.replace('_', "-"))
}

/// Prompt template engine with embedded defaults and user overrides.
pub struct PromptEngine {
    override_dir: Option<String>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<String>) -> Self {
        Self { override_dir }
    }

    /// Load a template by name; user overrides take precedence over the
    /// embedded defaults.
    pub fn load_template(&self, name: &str) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(template_filename(name));
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                })?;
                return Ok(content);
            }
        }

        default_template(name)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Prompt(format!("unknown prompt template: {name}")))
    }

    /// Load a template and render it with the given variables.
    pub fn render(&self, name: &str, vars: &HashMap<String, String>) -> Result<String> {
        let template = self.load_template(name)?;
        render_template(&template, vars)
    }
}

/// Render a template string using the `upon` template engine.
/// Supports `{{ var }}`, `{% if %}`, and `{% for %}` syntax.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(template)
        .map_err(|e| Error::Prompt(format!("template compile error: {e}")))?;
    compiled
        .render(
            &engine,
            upon::to_value(vars).map_err(|e| Error::Prompt(e.to_string()))?,
        )
        .to_string()
        .map_err(|e| Error::Prompt(format!("template render error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_all_default_templates_load() {
        let engine = PromptEngine::new(None);
        for name in [
            "requirements",
            "complexity_assessment",
            "research",
            "context",
            "spec_writing",
            "self_critique",
            "planning",
            "quick_spec",
            "pr_review",
            "pr_fix",
            "build",
            "batch_group",
            "batch_validate",
            "summarize_phase",
            "recover_output",
        ] {
            let template = engine.load_template(name).unwrap();
            assert!(!template.is_empty(), "{name} template is empty");
        }
    }

    #[test]
    fn test_unknown_template_errors() {
        let engine = PromptEngine::new(None);
        assert!(engine.load_template("nonexistent").is_err());
    }

    #[test]
    fn test_render_substitutes_vars() {
        let rendered =
            render_template("Task: {{ task }} in {{ dir }}", &vars(&[("task", "fix"), ("dir", "/x")]))
                .unwrap();
        assert_eq!(rendered, "Task: fix in /x");
    }

    #[test]
    fn test_render_missing_var_errors() {
        let result = render_template("{{ missing }}", &vars(&[]));
        assert!(result.is_err());
    }

    #[test]
    fn test_override_takes_precedence() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("pr-review.md"), "custom {{ pr_number }}").unwrap();
        let engine = PromptEngine::new(Some(dir.path().to_string_lossy().to_string()));
        let rendered = engine
            .render("pr_review", &vars(&[("pr_number", "42")]))
            .unwrap();
        assert_eq!(rendered, "custom 42");
    }

    #[test]
    fn test_override_dir_without_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let engine = PromptEngine::new(Some(dir.path().to_string_lossy().to_string()));
        let template = engine.load_template("summarize_phase").unwrap();
        assert!(template.contains("500"));
    }

    #[test]
    fn test_default_templates_render_with_expected_vars() {
        let engine = PromptEngine::new(None);
        let rendered = engine
            .render(
                "summarize_phase",
                &vars(&[("phase_name", "discovery"), ("phase_output", "found stuff")]),
            )
            .unwrap();
        assert!(rendered.contains("discovery"));
        assert!(rendered.contains("found stuff"));
    }
}
