use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::gh::{GhCli, PrSnapshot};
use crate::lock::{DEFAULT_LOCK_TIMEOUT, locked_json_read, locked_json_update};

/// Default cooling-off window between reviews of the same PR.
pub const DEFAULT_COOLING_OFF_MINUTES: i64 = 1;

/// Reviewed-SHA entries older than this are pruned.
pub const STATE_RETENTION_DAYS: i64 = 30;

/// Why a PR review was suppressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    OwnPr,
    BotCommit,
    CoolingOff { remaining_secs: i64 },
    AlreadyReviewed { sha: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::OwnPr => write!(f, "PR authored by the automation itself"),
            SkipReason::BotCommit => write!(f, "latest commit is bot-authored"),
            SkipReason::CoolingOff { remaining_secs } => {
                write!(f, "cooling off for another {remaining_secs}s")
            }
            SkipReason::AlreadyReviewed { sha } => {
                write!(f, "head commit {sha} already reviewed")
            }
        }
    }
}

/// Persisted per-PR review bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotDetectionState {
    #[serde(default)]
    pub reviewed_commits: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub last_review_times: HashMap<String, DateTime<Utc>>,
}

/// Keeps the automation from reviewing its own work, and from re-reviewing
/// commits it has already seen.
pub struct BotDetector {
    state_path: PathBuf,
    review_own_prs: bool,
    cooling_off: ChronoDuration,
    identity: OnceLock<Option<String>>,
}

impl BotDetector {
    pub fn new(github_dir: &Path) -> Self {
        Self {
            state_path: github_dir.join("bot_detection_state.json"),
            review_own_prs: false,
            cooling_off: ChronoDuration::minutes(DEFAULT_COOLING_OFF_MINUTES),
            identity: OnceLock::new(),
        }
    }

    pub fn with_review_own_prs(mut self, allow: bool) -> Self {
        self.review_own_prs = allow;
        self
    }

    pub fn with_cooling_off_minutes(mut self, minutes: i64) -> Self {
        self.cooling_off = ChronoDuration::minutes(minutes);
        self
    }

    /// Pre-seed the bot identity (tests, or when the caller already knows it).
    pub fn with_identity(self, login: &str) -> Self {
        let _ = self.identity.set(Some(login.to_string()));
        self
    }

    /// The automation's own login, looked up once through the VCS API.
    pub fn bot_username(&self, gh: &GhCli) -> Option<String> {
        self.identity
            .get_or_init(|| match gh.current_user() {
                Ok(login) => Some(login),
                Err(e) => {
                    warn!(error = %e, "failed to resolve bot identity");
                    None
                }
            })
            .clone()
    }

    fn is_own_login(&self, login: &str, bot: &str) -> bool {
        login == bot || login == format!("{bot}[bot]") || bot == format!("{login}[bot]")
    }

    /// Decide whether to review this PR snapshot; `Some(reason)` means skip.
    ///
    /// Rules, in order: own PR (unless configured otherwise), bot-authored
    /// head commit, cooling-off window, head SHA already reviewed.
    pub fn should_skip_pr_review(
        &self,
        gh: &GhCli,
        pr_number: u64,
        snapshot: &PrSnapshot,
    ) -> Result<Option<SkipReason>> {
        let bot = self.bot_username(gh);

        if let Some(ref bot) = bot {
            if !self.review_own_prs
                && let Some(ref author) = snapshot.author
                && (author.is_bot || self.is_own_login(&author.login, bot))
            {
                return Ok(Some(SkipReason::OwnPr));
            }

            if let Some(commit) = snapshot.commits.last()
                && commit.authors.iter().any(|a| {
                    a.login
                        .as_deref()
                        .map(|l| self.is_own_login(l, bot))
                        .unwrap_or(false)
                })
            {
                return Ok(Some(SkipReason::BotCommit));
            }
        }

        let state = self.load_state()?;
        let key = pr_number.to_string();

        if let Some(last) = state.last_review_times.get(&key) {
            let elapsed = Utc::now() - *last;
            if elapsed < self.cooling_off {
                let remaining = (self.cooling_off - elapsed).num_seconds();
                return Ok(Some(SkipReason::CoolingOff {
                    remaining_secs: remaining.max(1),
                }));
            }
        }

        let head = snapshot.last_commit_sha();
        if state
            .reviewed_commits
            .get(&key)
            .map(|shas| shas.iter().any(|s| s == head))
            .unwrap_or(false)
        {
            return Ok(Some(SkipReason::AlreadyReviewed {
                sha: head.to_string(),
            }));
        }

        Ok(None)
    }

    /// Record a successful review of `sha` on `pr_number`.
    pub fn mark_reviewed(&self, pr_number: u64, sha: &str) -> Result<()> {
        let key = pr_number.to_string();
        let sha = sha.to_string();
        locked_json_update(&self.state_path, DEFAULT_LOCK_TIMEOUT, move |current| {
            let mut state: BotDetectionState =
                serde_json::from_value(current).unwrap_or_default();
            let shas = state.reviewed_commits.entry(key.clone()).or_default();
            if !shas.contains(&sha) {
                shas.push(sha);
            }
            state.last_review_times.insert(key, Utc::now());
            serde_json::to_value(&state).unwrap_or_default()
        })?;
        debug!(pr_number, "marked head commit reviewed");
        Ok(())
    }

    /// Drop per-PR entries older than the retention window. Returns how
    /// many PRs were pruned.
    pub fn cleanup_stale(&self, max_age_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(max_age_days);
        let mut pruned = 0;
        locked_json_update(&self.state_path, DEFAULT_LOCK_TIMEOUT, |current| {
            let mut state: BotDetectionState =
                serde_json::from_value(current).unwrap_or_default();
            let stale: Vec<String> = state
                .last_review_times
                .iter()
                .filter(|(_, t)| **t < cutoff)
                .map(|(pr, _)| pr.clone())
                .collect();
            pruned = stale.len();
            for pr in stale {
                state.last_review_times.remove(&pr);
                state.reviewed_commits.remove(&pr);
            }
            serde_json::to_value(&state).unwrap_or_default()
        })?;
        if pruned > 0 {
            info!(pruned, "pruned stale bot-detection entries");
        }
        Ok(pruned)
    }

    pub fn load_state(&self) -> Result<BotDetectionState> {
        let value = locked_json_read(&self.state_path, DEFAULT_LOCK_TIMEOUT)?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gh::testing::MockGhClient;
    use tempfile::TempDir;

    fn snapshot(author: &str, commit_author: &str) -> PrSnapshot {
        let json = serde_json::json!({
            "statusCheckRollup": [],
            "headRefOid": "headsha",
            "state": "OPEN",
            "author": {"login": author, "is_bot": false},
            "commits": [{"oid": "headsha", "authors": [{"login": commit_author}]}],
            "comments": []
        });
        serde_json::from_value(json).unwrap()
    }

    fn detector(dir: &TempDir) -> BotDetector {
        BotDetector::new(dir.path()).with_identity("auto-claude-bot")
    }

    fn gh() -> GhCli {
        GhCli::with_client(Box::new(MockGhClient::new(vec![])))
    }

    #[test]
    fn test_own_pr_is_skipped() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        let skip = d
            .should_skip_pr_review(&gh(), 1, &snapshot("auto-claude-bot", "human"))
            .unwrap();
        assert_eq!(skip, Some(SkipReason::OwnPr));
    }

    #[test]
    fn test_own_pr_reviewed_when_configured() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir).with_review_own_prs(true);
        let skip = d
            .should_skip_pr_review(&gh(), 1, &snapshot("auto-claude-bot", "human"))
            .unwrap();
        // Own-PR rule disabled; no other rule fires either.
        assert_eq!(skip, None);
    }

    #[test]
    fn test_bot_suffix_login_matches() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        let skip = d
            .should_skip_pr_review(&gh(), 1, &snapshot("auto-claude-bot[bot]", "human"))
            .unwrap();
        assert_eq!(skip, Some(SkipReason::OwnPr));
    }

    #[test]
    fn test_bot_commit_is_skipped() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        let skip = d
            .should_skip_pr_review(&gh(), 1, &snapshot("human", "auto-claude-bot"))
            .unwrap();
        assert_eq!(skip, Some(SkipReason::BotCommit));
    }

    #[test]
    fn test_human_pr_is_reviewed() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        let skip = d
            .should_skip_pr_review(&gh(), 1, &snapshot("human", "human"))
            .unwrap();
        assert_eq!(skip, None);
    }

    #[test]
    fn test_cooling_off_applies() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir).with_cooling_off_minutes(10);
        d.mark_reviewed(1, "oldsha").unwrap();
        let skip = d
            .should_skip_pr_review(&gh(), 1, &snapshot("human", "human"))
            .unwrap();
        assert!(matches!(skip, Some(SkipReason::CoolingOff { .. })));
    }

    #[test]
    fn test_already_reviewed_sha_skipped_after_cooloff() {
        let dir = TempDir::new().unwrap();
        // Zero cooling-off so only the SHA rule can fire.
        let d = detector(&dir).with_cooling_off_minutes(0);
        d.mark_reviewed(1, "headsha").unwrap();
        let skip = d
            .should_skip_pr_review(&gh(), 1, &snapshot("human", "human"))
            .unwrap();
        assert_eq!(
            skip,
            Some(SkipReason::AlreadyReviewed {
                sha: "headsha".to_string()
            })
        );
    }

    #[test]
    fn test_new_sha_reviewed_after_cooloff() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir).with_cooling_off_minutes(0);
        d.mark_reviewed(1, "oldsha").unwrap();
        let skip = d
            .should_skip_pr_review(&gh(), 1, &snapshot("human", "human"))
            .unwrap();
        assert_eq!(skip, None);
    }

    #[test]
    fn test_state_is_per_pr() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir).with_cooling_off_minutes(0);
        d.mark_reviewed(1, "headsha").unwrap();
        // PR 2 shares the head SHA string but has its own entry.
        let skip = d
            .should_skip_pr_review(&gh(), 2, &snapshot("human", "human"))
            .unwrap();
        assert_eq!(skip, None);
    }

    #[test]
    fn test_mark_reviewed_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        d.mark_reviewed(1, "sha1").unwrap();
        d.mark_reviewed(1, "sha1").unwrap();
        let state = d.load_state().unwrap();
        assert_eq!(state.reviewed_commits["1"], vec!["sha1"]);
    }

    #[test]
    fn test_cleanup_stale_prunes_old_entries() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        d.mark_reviewed(1, "sha1").unwrap();

        // Nothing stale yet.
        assert_eq!(d.cleanup_stale(30).unwrap(), 0);
        // Everything is stale with a zero-day window.
        assert_eq!(d.cleanup_stale(0).unwrap(), 1);
        let state = d.load_state().unwrap();
        assert!(state.reviewed_commits.is_empty());
        assert!(state.last_review_times.is_empty());
    }

    #[test]
    fn test_state_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        detector(&dir).mark_reviewed(7, "abc").unwrap();
        let fresh = detector(&dir);
        let state = fresh.load_state().unwrap();
        assert_eq!(state.reviewed_commits["7"], vec!["abc"]);
    }
}
