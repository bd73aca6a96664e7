use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::prompts::PromptEngine;
use crate::runner::{AgentRunner, AgentTask};

/// Per-file cap when gathering phase outputs for summarization.
const MAX_FILE_CHARS: usize = 10_000;

/// Input cap for the summarizer call.
const MAX_INPUT_CHARS: usize = 15_000;

/// Raw-excerpt cap when summarization fails.
const FALLBACK_CHARS: usize = 2_000;

/// Hard ceiling on summary length.
pub const MAX_SUMMARY_WORDS: usize = 500;

/// Output files each phase contributes to its compaction summary.
pub fn phase_output_files(phase: &str) -> &'static [&'static str] {
    match phase {
        "discovery" => &["project_index.json"],
        "historical_context" => &["graph_hints.json"],
        "requirements" => &["requirements.json"],
        "complexity_assessment" => &["complexity_assessment.json"],
        "research" => &["research.json"],
        "context" => &["context.json"],
        "quick_spec" => &["spec.md", "implementation_plan.json"],
        "spec_writing" => &["spec.md"],
        "self_critique" => &["spec.md", "critique_report.json"],
        "planning" => &["implementation_plan.json"],
        _ => &[],
    }
}

/// Concatenate a phase's output files, each truncated to the per-file cap.
pub fn gather_phase_outputs(spec_dir: &Path, phase: &str) -> String {
    let mut outputs = Vec::new();
    for filename in phase_output_files(phase) {
        let path = spec_dir.join(filename);
        let Ok(mut content) = std::fs::read_to_string(&path) else {
            continue;
        };
        if content.len() > MAX_FILE_CHARS {
            content = truncate_at_char_boundary(&content, MAX_FILE_CHARS);
            content.push_str("\n\n[... file truncated ...]");
        }
        outputs.push(format!("**{filename}**:\n```\n{content}\n```"));
    }
    outputs.join("\n\n")
}

/// Summarize a completed phase's output through the cheap-model runner.
///
/// Failure never aborts the pipeline: a truncated raw excerpt is returned
/// instead, tagged with the error.
pub async fn summarize_phase_output(
    runner: &impl AgentRunner,
    engine: &PromptEngine,
    spec_dir: &Path,
    phase: &str,
) -> String {
    let output = gather_phase_outputs(spec_dir, phase);
    if output.is_empty() {
        return String::new();
    }

    let truncated = if output.len() > MAX_INPUT_CHARS {
        let mut t = truncate_at_char_boundary(&output, MAX_INPUT_CHARS);
        t.push_str("\n\n[... output truncated for summarization ...]");
        t
    } else {
        output.clone()
    };

    let mut vars = HashMap::new();
    vars.insert("phase_name".to_string(), phase.to_string());
    vars.insert("phase_output".to_string(), truncated);

    let prompt = match engine.render("summarize_phase", &vars) {
        Ok(p) => p,
        Err(e) => {
            warn!(phase, error = %e, "summarize prompt render failed, using raw excerpt");
            return fallback_excerpt(&output, &e.to_string());
        }
    };

    match runner.run(AgentTask::Summarize, &prompt, spec_dir).await {
        Ok(result) => {
            let summary = truncate_to_words(result.stdout.trim(), MAX_SUMMARY_WORDS);
            debug!(phase, words = summary.split_whitespace().count(), "phase summarized");
            summary
        }
        Err(e) => {
            warn!(phase, error = %e, "summarization failed, using raw excerpt");
            fallback_excerpt(&output, &e.to_string())
        }
    }
}

fn fallback_excerpt(output: &str, error: &str) -> String {
    let mut excerpt = truncate_at_char_boundary(output, FALLBACK_CHARS);
    if output.len() > FALLBACK_CHARS {
        excerpt.push_str("\n\n[... truncated ...]");
    }
    format!("[Summarization failed: {error}]\n\n{excerpt}")
}

/// Format accumulated phase summaries for injection into agent context.
/// `summaries` is ordered (phase name, summary text).
pub fn format_phase_summaries(summaries: &[(String, String)]) -> String {
    if summaries.iter().all(|(_, s)| s.is_empty()) {
        return String::new();
    }

    let mut parts = vec!["## Context from Previous Phases\n".to_string()];
    for (phase, summary) in summaries {
        if summary.is_empty() {
            continue;
        }
        parts.push(format!("### {}\n{summary}\n", title_case(phase)));
    }
    parts.join("\n")
}

fn title_case(phase: &str) -> String {
    phase
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate_at_char_boundary(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn truncate_to_words(s: &str, max_words: usize) -> String {
    let words: Vec<&str> = s.split_whitespace().collect();
    if words.len() <= max_words {
        return s.to_string();
    }
    words[..max_words].join(" ")
}
