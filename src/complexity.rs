use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Simple,
    Standard,
    Complex,
}

/// `complexity_assessment.json` — tier verdict plus the signals behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityAssessment {
    pub complexity: Tier,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub signals: Value,
    #[serde(default)]
    pub estimated_files: u32,
    #[serde(default)]
    pub estimated_services: u32,
    #[serde(default)]
    pub external_integrations: Vec<String>,
    #[serde(default)]
    pub infrastructure_changes: bool,
    #[serde(default)]
    pub phases_to_run: Vec<String>,
    #[serde(default)]
    pub needs_research: bool,
    #[serde(default)]
    pub needs_self_critique: bool,
    pub created_at: DateTime<Utc>,
}

const SIMPLE_KEYWORDS: [&str; 22] = [
    "fix", "typo", "update", "change", "rename", "remove", "delete", "adjust", "tweak", "correct",
    "modify", "style", "color", "text", "label", "button", "margin", "padding", "font", "size",
    "hide", "show",
];

const COMPLEX_KEYWORDS: [&str; 29] = [
    "integrate",
    "integration",
    "api",
    "sdk",
    "library",
    "package",
    "database",
    "migrate",
    "migration",
    "docker",
    "kubernetes",
    "deploy",
    "authentication",
    "oauth",
    "graphql",
    "websocket",
    "queue",
    "cache",
    "redis",
    "postgres",
    "mongo",
    "elasticsearch",
    "kafka",
    "rabbitmq",
    "microservice",
    "refactor",
    "architecture",
    "infrastructure",
    "stripe",
];

const MULTI_SERVICE_KEYWORDS: [&str; 11] = [
    "backend", "frontend", "worker", "service", "api", "client", "server", "database", "queue",
    "cache", "proxy",
];

const INTEGRATION_PATTERNS: [&str; 11] = [
    r"\b(graphiti|graphql|apollo)\b",
    r"\b(stripe|paypal|payment)\b",
    r"\b(auth0|okta|oauth|jwt)\b",
    r"\b(aws|gcp|azure|s3|lambda)\b",
    r"\b(redis|memcached)\b",
    r"\b(postgres|mysql|mongodb)\b",
    r"\b(elasticsearch|algolia)\b",
    r"\b(kafka|rabbitmq|sqs)\b",
    r"\b(docker|kubernetes|k8s)\b",
    r"\b(openai|anthropic|llm)\b",
    r"\b(sendgrid|twilio)\b",
];

const INFRA_PATTERNS: [&str; 10] = [
    r"\bdocker\b",
    r"\bkubernetes\b",
    r"\bk8s\b",
    r"\bdeploy\b",
    r"\binfrastructure\b",
    r"\bci/cd\b",
    r"\benvironment\b",
    r"\b\.env\b",
    r"\bdatabase migration\b",
    r"\bschema\b",
];

/// Keyword-and-regex classifier used when the AI verdict is unavailable
/// or malformed.
pub fn assess_heuristic(task_description: &str) -> ComplexityAssessment {
    let task_lower = task_description.to_lowercase();

    let simple_matches = SIMPLE_KEYWORDS
        .iter()
        .filter(|kw| task_lower.contains(**kw))
        .count() as u32;
    let complex_matches = COMPLEX_KEYWORDS
        .iter()
        .filter(|kw| task_lower.contains(**kw))
        .count() as u32;
    let multi_service_matches = MULTI_SERVICE_KEYWORDS
        .iter()
        .filter(|kw| task_lower.contains(**kw))
        .count() as u32;

    let integrations = detect_integrations(&task_lower);
    let infra_changes = detect_infrastructure_changes(&task_lower);
    let estimated_files = estimate_files(&task_lower, simple_matches, complex_matches);
    let estimated_services = multi_service_matches.max(1).min(5);

    let signals = json!({
        "simple_keywords": simple_matches,
        "complex_keywords": complex_matches,
        "multi_service_keywords": multi_service_matches,
        "integrations": integrations.len(),
        "infrastructure_changes": infra_changes,
    });

    let (tier, confidence, reasoning) = classify(
        simple_matches,
        complex_matches,
        estimated_files,
        estimated_services,
        integrations.len() as u32,
        infra_changes,
    );

    let needs_research = !integrations.is_empty() || tier == Tier::Complex;
    let needs_self_critique = tier == Tier::Complex;

    debug!(?tier, confidence, "heuristic complexity assessment");

    ComplexityAssessment {
        complexity: tier,
        confidence,
        reasoning,
        signals,
        estimated_files,
        estimated_services,
        external_integrations: integrations,
        infrastructure_changes: infra_changes,
        phases_to_run: default_phases(tier, needs_research, needs_self_critique),
        needs_research,
        needs_self_critique,
        created_at: Utc::now(),
    }
}

fn classify(
    simple_kw: u32,
    complex_kw: u32,
    files: u32,
    services: u32,
    integrations: u32,
    infra: bool,
) -> (Tier, f64, String) {
    let mut reasons = Vec::new();

    if files <= 2
        && services == 1
        && integrations == 0
        && !infra
        && simple_kw > 0
        && complex_kw == 0
    {
        reasons.push(format!("{simple_kw} simple keyword(s), no complexity signals"));
        reasons.push(format!("~{files} file(s), single service"));
        return (Tier::Simple, 0.9, reasons.join("; "));
    }

    if integrations >= 2 || infra || services >= 3 || files >= 10 || complex_kw >= 3 {
        if integrations >= 2 {
            reasons.push(format!("{integrations} external integrations"));
        }
        if infra {
            reasons.push("infrastructure changes detected".to_string());
        }
        if services >= 3 {
            reasons.push(format!("{services} services involved"));
        }
        if files >= 10 {
            reasons.push(format!("~{files} files estimated"));
        }
        if complex_kw >= 3 {
            reasons.push(format!("{complex_kw} complexity keywords"));
        }
        return (Tier::Complex, 0.85, reasons.join("; "));
    }

    reasons.push("no strong simple or complex signals".to_string());
    (Tier::Standard, 0.75, reasons.join("; "))
}

fn detect_integrations(task_lower: &str) -> Vec<String> {
    let mut found = Vec::new();
    for pattern in INTEGRATION_PATTERNS {
        let re = Regex::new(pattern).expect("static regex");
        for cap in re.captures_iter(task_lower) {
            let name = cap[1].to_string();
            if !found.contains(&name) {
                found.push(name);
            }
        }
    }
    found
}

fn detect_infrastructure_changes(task_lower: &str) -> bool {
    INFRA_PATTERNS.iter().any(|pattern| {
        Regex::new(pattern)
            .expect("static regex")
            .is_match(task_lower)
    })
}

fn estimate_files(task_lower: &str, simple_kw: u32, complex_kw: u32) -> u32 {
    if ["single", "one file", "one component", "this file"]
        .iter()
        .any(|kw| task_lower.contains(kw))
    {
        return 1;
    }

    let file_mentions = Regex::new(r"\.(tsx?|jsx?|py|go|rs|java|rb|php|vue|svelte|md)\b")
        .expect("static regex")
        .find_iter(task_lower)
        .count() as u32;
    if file_mentions > 0 {
        return file_mentions.max(1);
    }

    if complex_kw >= 3 {
        10
    } else if complex_kw > 0 {
        5
    } else if simple_kw > 0 {
        2
    } else {
        3
    }
}

/// Default phase list for a tier; used when the AI verdict carried no
/// explicit `phases_to_run`.
pub fn default_phases(tier: Tier, needs_research: bool, needs_self_critique: bool) -> Vec<String> {
    let phases: Vec<&str> = match tier {
        Tier::Simple => vec!["discovery", "historical_context", "quick_spec", "validation"],
        Tier::Standard => {
            let mut p = vec![
                "discovery",
                "historical_context",
                "requirements",
                "complexity_assessment",
            ];
            if needs_research {
                p.push("research");
            }
            p.extend(["context", "spec_writing", "planning", "validation"]);
            p
        }
        Tier::Complex => {
            let mut p = vec![
                "discovery",
                "historical_context",
                "requirements",
                "complexity_assessment",
                "research",
                "context",
                "spec_writing",
            ];
            if needs_self_critique {
                p.push("self_critique");
            }
            p.extend(["planning", "validation"]);
            p
        }
    };
    phases.into_iter().map(str::to_string).collect()
}

/// Parse the AI verdict; `None` when the content does not match the schema
/// (callers fall back to the heuristic).
pub fn parse_ai_assessment(content: &str) -> Option<ComplexityAssessment> {
    serde_json::from_str::<ComplexityAssessment>(content).ok()
}
