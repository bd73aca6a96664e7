use tracing::{debug, warn};

use crate::error::Result;

/// Capability interface for the optional Graphiti memory service.
///
/// Callers must tolerate the unwired path: the no-op implementation reports
/// `enabled() == false` and returns empty hints.
pub trait MemoryService: Send + Sync {
    fn enabled(&self) -> bool;

    /// Insights from past work relevant to the task. Empty is a valid answer.
    fn relevant_hints(&self, task_description: &str) -> Result<Vec<String>>;

    /// Record an insight for future tasks. Best-effort.
    fn record_insight(&self, insight: &str) -> Result<()>;

    /// Close the connection. Best-effort; called during workspace cleanup.
    fn close(&self) {}
}

/// The unwired fallback.
pub struct NoopMemory;

impl MemoryService for NoopMemory {
    fn enabled(&self) -> bool {
        false
    }

    fn relevant_hints(&self, _task_description: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn record_insight(&self, _insight: &str) -> Result<()> {
        Ok(())
    }
}

/// Graphiti-backed memory, enabled by `GRAPHITI_ENABLED`. The endpoint is
/// local-first; every failure degrades to empty results with a warning.
pub struct GraphitiMemory {
    endpoint: String,
}

impl GraphitiMemory {
    const DEFAULT_ENDPOINT: &'static str = "http://127.0.0.1:8321";

    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint: endpoint.unwrap_or_else(|| Self::DEFAULT_ENDPOINT.to_string()),
        }
    }

    /// Build from the environment: `Some` only when `GRAPHITI_ENABLED` is
    /// set to a truthy value.
    pub fn from_env() -> Option<Self> {
        let enabled = std::env::var("GRAPHITI_ENABLED")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        enabled.then(|| Self::new(std::env::var("GRAPHITI_ENDPOINT").ok()))
    }
}

impl MemoryService for GraphitiMemory {
    fn enabled(&self) -> bool {
        true
    }

    fn relevant_hints(&self, task_description: &str) -> Result<Vec<String>> {
        let url = format!("{}/search", self.endpoint);
        let response = ureq::post(&url)
            .timeout(std::time::Duration::from_secs(10))
            .send_json(serde_json::json!({"query": task_description, "limit": 10}));

        match response {
            Ok(resp) => {
                let json: serde_json::Value = resp.into_json().unwrap_or_default();
                let hints: Vec<String> = json["results"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|r| r["summary"].as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                debug!(count = hints.len(), "fetched memory hints");
                Ok(hints)
            }
            Err(e) => {
                warn!(error = %e, "memory search failed, continuing without hints");
                Ok(Vec::new())
            }
        }
    }

    fn record_insight(&self, insight: &str) -> Result<()> {
        let url = format!("{}/episodes", self.endpoint);
        if let Err(e) = ureq::post(&url)
            .timeout(std::time::Duration::from_secs(10))
            .send_json(serde_json::json!({"content": insight}))
        {
            warn!(error = %e, "failed to record memory insight");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_noop_memory_is_disabled_and_empty() {
        let memory = NoopMemory;
        assert!(!memory.enabled());
        assert!(memory.relevant_hints("anything").unwrap().is_empty());
        assert!(memory.record_insight("x").is_ok());
        memory.close();
    }

    #[test]
    #[serial]
    fn test_from_env_disabled_by_default() {
        unsafe { std::env::remove_var("GRAPHITI_ENABLED") };
        assert!(GraphitiMemory::from_env().is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_enabled() {
        unsafe { std::env::set_var("GRAPHITI_ENABLED", "true") };
        assert!(GraphitiMemory::from_env().is_some());
        unsafe { std::env::set_var("GRAPHITI_ENABLED", "0") };
        assert!(GraphitiMemory::from_env().is_none());
        unsafe { std::env::remove_var("GRAPHITI_ENABLED") };
    }

    #[test]
    fn test_unreachable_backend_degrades_to_empty() {
        // Port 9 (discard) refuses connections; hints must degrade, not error.
        let memory = GraphitiMemory::new(Some("http://127.0.0.1:9".to_string()));
        let hints = memory.relevant_hints("task").unwrap();
        assert!(hints.is_empty());
    }
}
