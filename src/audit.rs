use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lock::{DEFAULT_LOCK_TIMEOUT, FileLock};

/// Default byte budget for a single day file before rotation.
const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Default retention window for the sweep.
const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Bot,
    Automation,
    System,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Started,
    Success,
    Failure,
    Granted,
    Denied,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub action: String,
    pub actor_type: ActorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
    pub result: AuditResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<u64>,
}

impl AuditEntry {
    pub fn new(correlation_id: &str, action: &str, actor: ActorType, result: AuditResult) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: correlation_id.to_string(),
            action: action.to_string(),
            actor_type: actor,
            repo: None,
            pr_number: None,
            issue_number: None,
            result,
            duration_ms: None,
            error: None,
            details: Value::Null,
            token_usage: None,
        }
    }

    pub fn with_repo(mut self, repo: &str) -> Self {
        self.repo = Some(repo.to_string());
        self
    }

    pub fn with_pr(mut self, pr_number: u64) -> Self {
        self.pr_number = Some(pr_number);
        self
    }

    pub fn with_issue(mut self, issue_number: u64) -> Self {
        self.issue_number = Some(issue_number);
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }
}

/// Filter for audit queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub correlation_id: Option<String>,
    pub action: Option<String>,
    pub repo: Option<String>,
    pub pr_number: Option<u64>,
    pub issue_number: Option<u64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(ref cid) = self.correlation_id
            && entry.correlation_id != *cid
        {
            return false;
        }
        if let Some(ref action) = self.action
            && entry.action != *action
        {
            return false;
        }
        if let Some(ref repo) = self.repo
            && entry.repo.as_deref() != Some(repo.as_str())
        {
            return false;
        }
        if let Some(pr) = self.pr_number
            && entry.pr_number != Some(pr)
        {
            return false;
        }
        if let Some(issue) = self.issue_number
            && entry.issue_number != Some(issue)
        {
            return false;
        }
        if let Some(since) = self.since
            && entry.timestamp < since
        {
            return false;
        }
        if let Some(until) = self.until
            && entry.timestamp > until
        {
            return false;
        }
        true
    }
}

/// Append-only structured audit log with daily files and a retention sweep.
///
/// Every actor-visible decision in the system funnels through here; the
/// ledger alone must be enough to reconstruct what happened.
pub struct AuditLogger {
    dir: PathBuf,
    max_file_bytes: u64,
    retention_days: i64,
}

impl AuditLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    /// Directory under a repository root: `.auto-claude/github/audit`.
    pub fn default_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(".auto-claude").join("github").join("audit")
    }

    fn current_file(&self) -> PathBuf {
        let day = Utc::now().format("%Y-%m-%d");
        self.dir.join(format!("audit_{day}.jsonl"))
    }

    /// Append one entry to the current day file, rotating first if the file
    /// has outgrown the byte budget. Lock timeouts are downgraded to a
    /// warning — the audit writer drops and continues.
    pub fn log(&self, entry: &AuditEntry) {
        if let Err(e) = self.try_log(entry) {
            warn!(error = %e, action = %entry.action, "audit write dropped");
        }
    }

    fn try_log(&self, entry: &AuditEntry) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Audit(format!("failed to create audit dir: {e}")))?;

        let path = self.current_file();
        let _lock = FileLock::acquire(&path, DEFAULT_LOCK_TIMEOUT)?;

        if let Ok(meta) = std::fs::metadata(&path)
            && meta.len() >= self.max_file_bytes
        {
            self.rotate(&path)?;
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Audit(format!("failed to open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .map_err(|e| Error::Audit(format!("failed to append audit entry: {e}")))?;
        Ok(())
    }

    fn rotate(&self, path: &Path) -> Result<()> {
        let stamp = Utc::now().format("%Y-%m-%d_%H%M%S");
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "audit".to_string());
        let rotated = self.dir.join(format!("{stem}_{stamp}.jsonl"));
        std::fs::rename(path, &rotated)
            .map_err(|e| Error::Audit(format!("failed to rotate audit file: {e}")))?;
        debug!(to = %rotated.display(), "rotated audit file");
        Ok(())
    }

    /// Delete audit files whose modification time is older than the
    /// retention window. Returns the number of files removed.
    pub fn sweep_retention(&self) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days);
        let mut removed = 0;

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("audit_") || !name.ends_with(".jsonl") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let modified: DateTime<Utc> = modified.into();
            if modified < cutoff {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!(file = %name, error = %e, "failed to remove stale audit file");
                } else {
                    removed += 1;
                }
            }
        }

        debug!(removed, "audit retention sweep complete");
        Ok(removed)
    }

    /// Scan all audit files and return entries matching the query, in file
    /// order. Malformed lines are skipped.
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut files: Vec<PathBuf> = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .map(|n| {
                            let n = n.to_string_lossy();
                            n.starts_with("audit_") && n.ends_with(".jsonl")
                        })
                        .unwrap_or(false)
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        files.sort();

        let mut results = Vec::new();
        for file in files {
            let content = std::fs::read_to_string(&file)?;
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEntry>(line) {
                    Ok(entry) if query.matches(&entry) => results.push(entry),
                    Ok(_) => {}
                    Err(e) => debug!(file = %file.display(), error = %e, "skipping bad audit line"),
                }
            }
        }
        Ok(results)
    }

    /// Open an operation context with a fresh correlation id and a logged
    /// `started` event.
    pub fn start_operation(&self, action: &str, actor: ActorType) -> OperationContext<'_> {
        let correlation_id = new_correlation_id();
        self.log(&AuditEntry::new(
            &correlation_id,
            action,
            actor,
            AuditResult::Started,
        ));
        OperationContext {
            logger: self,
            correlation_id,
            action: action.to_string(),
            actor,
            started: Instant::now(),
        }
    }

    /// Run `f` inside an operation context, logging the terminal event with
    /// elapsed milliseconds even when `f` errors.
    pub fn with_operation<T, F>(&self, action: &str, actor: ActorType, f: F) -> Result<T>
    where
        F: FnOnce(&OperationContext<'_>) -> Result<T>,
    {
        let ctx = self.start_operation(action, actor);
        match f(&ctx) {
            Ok(value) => {
                ctx.finish(AuditResult::Success, None);
                Ok(value)
            }
            Err(e) => {
                ctx.finish(AuditResult::Failure, Some(&e.to_string()));
                Err(e)
            }
        }
    }
}

/// Short unique token tagging every audit event of one logical operation.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// A single logical operation bound to one correlation id.
pub struct OperationContext<'a> {
    logger: &'a AuditLogger,
    correlation_id: String,
    action: String,
    actor: ActorType,
    started: Instant,
}

impl OperationContext<'_> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Emit an intermediate event bound to this operation.
    pub fn event(&self, action: &str, result: AuditResult, details: Value) {
        self.logger.log(
            &AuditEntry::new(&self.correlation_id, action, self.actor, result)
                .with_details(details),
        );
    }

    /// Build an entry bound to this operation for caller-side embellishment.
    pub fn entry(&self, action: &str, result: AuditResult) -> AuditEntry {
        AuditEntry::new(&self.correlation_id, action, self.actor, result)
    }

    /// Log a pre-built entry, stamping the operation's correlation id.
    pub fn log(&self, mut entry: AuditEntry) {
        entry.correlation_id = self.correlation_id.clone();
        self.logger.log(&entry);
    }

    /// Close the operation with a terminal event carrying elapsed time.
    pub fn finish(&self, result: AuditResult, error: Option<&str>) {
        let mut entry = AuditEntry::new(&self.correlation_id, &self.action, self.actor, result)
            .with_duration_ms(self.started.elapsed().as_millis() as u64);
        if let Some(error) = error {
            entry = entry.with_error(error);
        }
        self.logger.log(&entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn logger() -> (TempDir, AuditLogger) {
        let dir = TempDir::new().unwrap();
        let logger = AuditLogger::new(dir.path().join("audit"));
        (dir, logger)
    }

    #[test]
    fn test_log_and_query_roundtrip() {
        let (_dir, logger) = logger();
        let entry = AuditEntry::new("abc123", "pr_review", ActorType::Automation, AuditResult::Success)
            .with_repo("owner/repo")
            .with_pr(42);
        logger.log(&entry);

        let found = logger
            .query(&AuditQuery {
                correlation_id: Some("abc123".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].action, "pr_review");
        assert_eq!(found[0].repo.as_deref(), Some("owner/repo"));
        assert_eq!(found[0].pr_number, Some(42));
    }

    #[test]
    fn test_query_filters_by_action_and_pr() {
        let (_dir, logger) = logger();
        logger.log(
            &AuditEntry::new("a", "review", ActorType::Automation, AuditResult::Success).with_pr(1),
        );
        logger.log(
            &AuditEntry::new("b", "review", ActorType::Automation, AuditResult::Success).with_pr(2),
        );
        logger.log(
            &AuditEntry::new("c", "fix", ActorType::Automation, AuditResult::Success).with_pr(1),
        );

        let reviews_pr1 = logger
            .query(&AuditQuery {
                action: Some("review".into()),
                pr_number: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(reviews_pr1.len(), 1);
        assert_eq!(reviews_pr1[0].correlation_id, "a");
    }

    #[test]
    fn test_with_operation_logs_start_and_success() {
        let (_dir, logger) = logger();
        let value = logger
            .with_operation("merge_check", ActorType::System, |ctx| {
                ctx.event("sub_step", AuditResult::Success, json!({"n": 1}));
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);

        let all = logger.query(&AuditQuery::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].result, AuditResult::Started);
        assert_eq!(all[2].result, AuditResult::Success);
        assert!(all[2].duration_ms.is_some());
        // All three share the correlation id.
        assert_eq!(all[0].correlation_id, all[1].correlation_id);
        assert_eq!(all[1].correlation_id, all[2].correlation_id);
    }

    #[test]
    fn test_with_operation_logs_failure_on_error() {
        let (_dir, logger) = logger();
        let result: Result<()> = logger.with_operation("doomed", ActorType::System, |_| {
            Err(Error::Review("boom".into()))
        });
        assert!(result.is_err());

        let all = logger.query(&AuditQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].result, AuditResult::Failure);
        assert!(all[1].error.as_deref().unwrap().contains("boom"));
    }

    #[test]
    fn test_rotation_when_over_budget() {
        let (_dir, logger) = logger();
        let logger = logger.with_max_file_bytes(200);
        for i in 0..20 {
            logger.log(&AuditEntry::new(
                &format!("cid{i}"),
                "fill",
                ActorType::System,
                AuditResult::Success,
            ));
        }
        let files: Vec<_> = std::fs::read_dir(&logger.dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| !n.ends_with(".lock"))
            .collect();
        assert!(files.len() > 1, "expected rotation, got {files:?}");
        // All entries survive across current + rotated files.
        let all = logger.query(&AuditQuery::default()).unwrap();
        assert_eq!(all.len(), 20);
    }

    #[test]
    fn test_retention_sweep_removes_old_files() {
        let (_dir, logger) = logger();
        std::fs::create_dir_all(&logger.dir).unwrap();
        let old = logger.dir.join("audit_2000-01-01.jsonl");
        std::fs::write(&old, "{}\n").unwrap();
        // Backdate mtime far past the retention window.
        let ancient = std::time::SystemTime::UNIX_EPOCH;
        let file = std::fs::File::options().write(true).open(&old).unwrap();
        file.set_modified(ancient).unwrap();

        let removed = logger.sweep_retention().unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
    }

    #[test]
    fn test_retention_sweep_keeps_fresh_files() {
        let (_dir, logger) = logger();
        logger.log(&AuditEntry::new(
            "x",
            "keep",
            ActorType::System,
            AuditResult::Success,
        ));
        let removed = logger.sweep_retention().unwrap();
        assert_eq!(removed, 0);
        assert_eq!(logger.query(&AuditQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let (_dir, logger) = logger();
        logger.log(&AuditEntry::new(
            "ok",
            "act",
            ActorType::System,
            AuditResult::Success,
        ));
        let path = logger.current_file();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "this is not json").unwrap();

        let all = logger.query(&AuditQuery::default()).unwrap();
        assert_eq!(all.len(), 1);
    }
}
