use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

const LINEAR_API_URL: &str = "https://api.linear.app/graphql";
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Optional notification sink. Failures degrade to a warning — automation
/// never blocks on a notification.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &str, details: &Value);
}

/// The unwired fallback.
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, event: &str, details: &Value) {
        debug!(event, ?details, "notification dropped (no sink configured)");
    }
}

/// Linear sink, enabled by `LINEAR_API_KEY`.
pub struct LinearSink {
    api_key: String,
}

impl LinearSink {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }

    /// `Some` only when `LINEAR_API_KEY` is present and non-empty.
    pub fn from_env() -> Option<Self> {
        std::env::var("LINEAR_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(Self::new)
    }

    fn graphql(&self, query: &str, variables: Value) -> Result<Value, String> {
        let body = json!({"query": query, "variables": variables});
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        for attempt in 1..=MAX_ATTEMPTS {
            // Linear expects the raw API key, not "Bearer <key>".
            match ureq::post(LINEAR_API_URL)
                .set("Authorization", &self.api_key)
                .set("Content-Type", "application/json")
                .timeout(Duration::from_secs(15))
                .send_json(&body)
            {
                Ok(response) => {
                    let parsed: Value = response
                        .into_json()
                        .map_err(|e| format!("failed to parse Linear response: {e}"))?;
                    if let Some(errors) = parsed.get("errors") {
                        return Err(format!("Linear API errors: {errors}"));
                    }
                    return Ok(parsed.get("data").cloned().unwrap_or(Value::Null));
                }
                Err(ref e) if attempt < MAX_ATTEMPTS && is_retryable(e) => {
                    warn!(attempt, error = %e, backoff_ms, "retrying Linear call");
                    thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms *= 2;
                }
                Err(e) => return Err(format!("Linear request failed: {e}")),
            }
        }
        unreachable!()
    }
}

fn is_retryable(error: &ureq::Error) -> bool {
    match error {
        ureq::Error::Status(code, _) => *code >= 500 || *code == 429 || *code == 408,
        ureq::Error::Transport(_) => true,
    }
}

impl NotificationSink for LinearSink {
    fn notify(&self, event: &str, details: &Value) {
        let body = format!(
            "**{event}**\n```json\n{}\n```",
            serde_json::to_string_pretty(details).unwrap_or_default()
        );
        let issue_id = details.get("linear_issue_id").and_then(|v| v.as_str());
        let Some(issue_id) = issue_id else {
            debug!(event, "no linear_issue_id in details; notification skipped");
            return;
        };

        let mutation = r#"
            mutation($issueId: String!, $body: String!) {
              commentCreate(input: {issueId: $issueId, body: $body}) { success }
            }
        "#;
        if let Err(e) = self.graphql(mutation, json!({"issueId": issue_id, "body": body})) {
            warn!(event, error = %e, "Linear notification failed; continuing");
        }
    }
}

/// Pick the sink the environment provides.
pub fn sink_from_env() -> Box<dyn NotificationSink> {
    match LinearSink::from_env() {
        Some(sink) => Box::new(sink),
        None => Box::new(NoopSink),
    }
}
