use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{ActorType, AuditEntry, AuditLogger, AuditResult};
use crate::error::{Error, Result};
use crate::lock::{DEFAULT_LOCK_TIMEOUT, locked_json_read, locked_json_update};

/// Default user-cancellation window after an automation trigger.
pub const DEFAULT_GRACE_PERIOD_MINUTES: i64 = 15;

/// The override history keeps at most this many records, FIFO.
pub const MAX_HISTORY_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideType {
    CancelAutofix,
    NotSpam,
    NotDuplicate,
    NotFeatureCreep,
    UndoLast,
    ForceRetry,
    SkipReview,
    ApproveSpec,
    RejectSpec,
}

/// Slash commands recognized in issue/PR comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    CancelAutofix,
    UndoLast,
    ForceRetry,
    SkipReview,
    Approve,
    Reject,
    NotSpam,
    NotDuplicate,
    Status,
    Help,
}

impl CommandKind {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "/cancel-autofix" => Some(Self::CancelAutofix),
            "/undo-last" => Some(Self::UndoLast),
            "/force-retry" => Some(Self::ForceRetry),
            "/skip-review" => Some(Self::SkipReview),
            "/approve" => Some(Self::Approve),
            "/reject" => Some(Self::Reject),
            "/not-spam" => Some(Self::NotSpam),
            "/not-duplicate" => Some(Self::NotDuplicate),
            "/status" => Some(Self::Status),
            "/help" => Some(Self::Help),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub kind: CommandKind,
    pub actor: String,
    pub args: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub id: String,
    pub override_type: OverrideType,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    pub original_state: Value,
    pub new_state: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    /// Id of the record this one inverts (set by undo-last).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undoes: Option<String>,
}

impl OverrideRecord {
    pub fn new(override_type: OverrideType, actor: &str) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            override_type,
            actor: actor.to_string(),
            issue_number: None,
            pr_number: None,
            original_state: Value::Null,
            new_state: Value::Null,
            timestamp: Utc::now(),
            metadata: Value::Null,
            undoes: None,
        }
    }

    pub fn with_issue(mut self, issue: u64) -> Self {
        self.issue_number = Some(issue);
        self
    }

    pub fn with_pr(mut self, pr: u64) -> Self {
        self.pr_number = Some(pr);
        self
    }

    pub fn with_states(mut self, original: Value, new: Value) -> Self {
        self.original_state = original;
        self.new_state = new;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GracePeriodEntry {
    pub issue_number: u64,
    pub trigger_label: String,
    pub actor: String,
    pub triggered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
}

impl GracePeriodEntry {
    /// Still holding automation back: not cancelled and not yet expired.
    pub fn is_active(&self) -> bool {
        !self.cancelled && Utc::now() < self.expires_at
    }

    /// Whether the window has passed (regardless of cancellation).
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Grace periods and the append-only override ledger.
///
/// Automation reads this state, never the comment stream: a command's effect
/// outlives the comment that carried it.
pub struct OverrideManager {
    grace_file: PathBuf,
    history_file: PathBuf,
    grace_minutes: i64,
}

impl OverrideManager {
    pub fn new(overrides_dir: &Path) -> Self {
        Self {
            grace_file: overrides_dir.join("grace_periods.json"),
            history_file: overrides_dir.join("override_history.json"),
            grace_minutes: DEFAULT_GRACE_PERIOD_MINUTES,
        }
    }

    pub fn with_grace_minutes(mut self, minutes: i64) -> Self {
        self.grace_minutes = minutes;
        self
    }

    // --- Grace periods ---

    /// Start a grace period for `issue`. An existing entry whose window has
    /// not yet passed is returned unchanged — in particular a cancelled one
    /// is never revived by re-triggering inside its window.
    pub fn start_grace_period(
        &self,
        issue: u64,
        trigger_label: &str,
        actor: &str,
    ) -> Result<GracePeriodEntry> {
        let now = Utc::now();
        let fresh = GracePeriodEntry {
            issue_number: issue,
            trigger_label: trigger_label.to_string(),
            actor: actor.to_string(),
            triggered_at: now,
            expires_at: now + ChronoDuration::minutes(self.grace_minutes),
            cancelled: false,
            cancelled_by: None,
        };

        let key = issue.to_string();
        let mut resulting = fresh.clone();
        locked_json_update(&self.grace_file, DEFAULT_LOCK_TIMEOUT, |current| {
            let mut entries: std::collections::HashMap<String, GracePeriodEntry> =
                serde_json::from_value(current).unwrap_or_default();
            match entries.get(&key) {
                Some(existing) if !existing.is_expired() => {
                    resulting = existing.clone();
                }
                _ => {
                    entries.insert(key.clone(), fresh.clone());
                }
            }
            serde_json::to_value(&entries).unwrap_or_default()
        })?;

        info!(
            issue,
            expires_at = %resulting.expires_at,
            cancelled = resulting.cancelled,
            "grace period in effect"
        );
        Ok(resulting)
    }

    pub fn get_grace_period(&self, issue: u64) -> Result<Option<GracePeriodEntry>> {
        let value = locked_json_read(&self.grace_file, DEFAULT_LOCK_TIMEOUT)?;
        let entries: std::collections::HashMap<String, GracePeriodEntry> =
            serde_json::from_value(value).unwrap_or_default();
        Ok(entries.get(&issue.to_string()).cloned())
    }

    /// Cancel the grace period for `issue`. Returns false when there is no
    /// entry or the window already passed (expired periods cannot be
    /// cancelled retroactively).
    pub fn cancel_grace_period(&self, issue: u64, actor: &str) -> Result<bool> {
        let key = issue.to_string();
        let actor = actor.to_string();
        let mut cancelled = false;
        locked_json_update(&self.grace_file, DEFAULT_LOCK_TIMEOUT, |current| {
            let mut entries: std::collections::HashMap<String, GracePeriodEntry> =
                serde_json::from_value(current).unwrap_or_default();
            if let Some(entry) = entries.get_mut(&key)
                && !entry.is_expired()
                && !entry.cancelled
            {
                entry.cancelled = true;
                entry.cancelled_by = Some(actor.clone());
                cancelled = true;
            }
            serde_json::to_value(&entries).unwrap_or_default()
        })?;
        if cancelled {
            info!(issue, actor = %actor, "grace period cancelled");
        }
        Ok(cancelled)
    }

    // --- Comment commands ---

    /// Extract a leading slash command from a comment body.
    pub fn parse_comment(&self, body: &str, actor: &str) -> Option<ParsedCommand> {
        let re = Regex::new(r"^\s*(/[a-z-]+)\b\s*(.*)$").expect("static regex");
        let first_line = body.lines().next()?;
        let captures = re.captures(first_line)?;
        let kind = CommandKind::from_token(&captures[1])?;
        Some(ParsedCommand {
            kind,
            actor: actor.to_string(),
            args: captures[2].trim().to_string(),
        })
    }

    // --- Override ledger ---

    /// Append a record to the capped history and emit the audit event.
    pub fn record_override(&self, record: OverrideRecord, audit: &AuditLogger) -> Result<()> {
        let to_store = record.clone();
        locked_json_update(&self.history_file, DEFAULT_LOCK_TIMEOUT, |current| {
            let mut records: Vec<OverrideRecord> =
                serde_json::from_value(current).unwrap_or_default();
            records.push(to_store);
            // FIFO cap: oldest entries fall off the front.
            if records.len() > MAX_HISTORY_ENTRIES {
                let excess = records.len() - MAX_HISTORY_ENTRIES;
                records.drain(..excess);
            }
            serde_json::to_value(&records).unwrap_or_default()
        })?;

        let mut entry = AuditEntry::new(
            "-",
            "override_recorded",
            ActorType::User,
            AuditResult::Success,
        )
        .with_details(json!({
            "override_id": record.id,
            "override_type": record.override_type,
            "actor": record.actor,
        }));
        if let Some(issue) = record.issue_number {
            entry = entry.with_issue(issue);
        }
        if let Some(pr) = record.pr_number {
            entry = entry.with_pr(pr);
        }
        audit.log(&entry);

        debug!(id = %record.id, "override recorded");
        Ok(())
    }

    pub fn history(&self) -> Result<Vec<OverrideRecord>> {
        let value = locked_json_read(&self.history_file, DEFAULT_LOCK_TIMEOUT)?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    /// Invert the most recent override for the given issue/PR by appending a
    /// new record with original and new state swapped, linked to its target.
    pub fn undo_last(
        &self,
        issue: Option<u64>,
        pr: Option<u64>,
        actor: &str,
        audit: &AuditLogger,
    ) -> Result<OverrideRecord> {
        let history = self.history()?;
        let target = history
            .iter()
            .rev()
            .find(|r| {
                r.override_type != OverrideType::UndoLast
                    && (issue.is_none() || r.issue_number == issue)
                    && (pr.is_none() || r.pr_number == pr)
            })
            .cloned()
            .ok_or_else(|| Error::Override("no override to undo".to_string()))?;

        let mut inverse = OverrideRecord::new(OverrideType::UndoLast, actor)
            .with_states(target.new_state.clone(), target.original_state.clone());
        inverse.issue_number = target.issue_number;
        inverse.pr_number = target.pr_number;
        inverse.undoes = Some(target.id.clone());

        self.record_override(inverse.clone(), audit)?;
        info!(undoes = %target.id, "override undone");
        Ok(inverse)
    }

    /// Text for `/help` replies.
    pub fn help_text() -> &'static str {
        "Available commands:\n\
         /cancel-autofix — cancel a pending auto-fix during its grace period\n\
         /not-spam — override a spam classification\n\
         /not-duplicate — override a duplicate classification\n\
         /undo-last — invert the most recent override on this issue/PR\n\
         /force-retry — re-run the last failed automation step\n\
         /skip-review — skip the automated review for this PR\n\
         /approve — approve the generated plan\n\
         /reject — reject the generated plan\n\
         /status — show automation status\n\
         /help — this message"
    }
}
