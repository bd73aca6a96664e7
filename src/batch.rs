use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gh::Issue;
use crate::lock::{
    DEFAULT_LOCK_TIMEOUT, FileLock, atomic_write, locked_json_read, locked_json_update,
};
use crate::prompts::PromptEngine;
use crate::review_schema::{
    BatchValidationOutput, ProposedBatch, parse_batch_group_output, parse_batch_validation_output,
};
use crate::runner::{AgentRunner, AgentTask};

/// Largest batch the grouping agent may propose.
pub const MAX_BATCH_SIZE: usize = 5;
/// Smallest split the validator may suggest.
pub const MIN_BATCH_SIZE: usize = 1;

/// Labels that pre-group issues before any AI call.
const BUCKET_LABELS: [&str; 6] = [
    "bug",
    "enhancement",
    "documentation",
    "security",
    "performance",
    "dependencies",
];

/// Keywords for the second-chance bucket pass.
const BUCKET_KEYWORDS: [&str; 10] = [
    "oauth", "auth", "login", "api", "database", "cache", "test", "build", "deploy", "ui",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Analyzing,
    CreatingSpec,
    Building,
    QaReview,
    PrCreated,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// The status machine is sequential; `Failed` is reachable from any
    /// non-terminal state.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == BatchStatus::Failed {
            return true;
        }
        use BatchStatus::*;
        matches!(
            (self, next),
            (Pending, Analyzing)
                | (Analyzing, CreatingSpec)
                | (CreatingSpec, Building)
                | (Building, QaReview)
                | (QaReview, PrCreated)
                | (PrCreated, Completed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub issue_number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub similarity_to_primary: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchValidationRecord {
    pub is_valid: bool,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub suggested_splits: Vec<Vec<u64>>,
    #[serde(default)]
    pub theme: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueBatch {
    pub batch_id: String,
    pub repo: String,
    pub primary_issue: u64,
    pub items: Vec<BatchItem>,
    #[serde(default)]
    pub common_themes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<BatchValidationRecord>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IssueBatch {
    pub fn new(repo: &str, items: Vec<BatchItem>, theme: Option<String>) -> Self {
        let now = Utc::now();
        let primary = items.first().map(|i| i.issue_number).unwrap_or(0);
        Self {
            batch_id: Uuid::new_v4().simple().to_string(),
            repo: repo.to_string(),
            primary_issue: primary,
            items,
            common_themes: theme.into_iter().collect(),
            validation: None,
            status: BatchStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn issue_numbers(&self) -> Vec<u64> {
        self.items.iter().map(|i| i.issue_number).collect()
    }

    /// Branch-safe slug derived from the batch theme, falling back to the
    /// batch id.
    pub fn slug(&self) -> String {
        self.common_themes
            .first()
            .map(|t| crate::worktree::slugify(t))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("batch-{}", &self.batch_id[..8.min(self.batch_id.len())]))
    }
}

// --- Cheap pre-grouping -----------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub key: String,
    pub issues: Vec<u64>,
}

/// O(n) pre-grouping: label bucket, else keyword bucket, else singleton.
pub fn pre_group(issues: &[Issue]) -> Vec<Bucket> {
    let mut buckets: Vec<Bucket> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    let mut push = |key: String, number: u64, buckets: &mut Vec<Bucket>| {
        if let Some(&i) = index.get(&key) {
            buckets[i].issues.push(number);
        } else {
            index.insert(key.clone(), buckets.len());
            buckets.push(Bucket {
                key,
                issues: vec![number],
            });
        }
    };

    for issue in issues {
        let labels = issue.label_names();
        if let Some(label) = BUCKET_LABELS
            .iter()
            .find(|b| labels.iter().any(|l| l.eq_ignore_ascii_case(b)))
        {
            push(format!("label:{label}"), issue.number, &mut buckets);
            continue;
        }

        let text = format!(
            "{} {}",
            issue.title.to_lowercase(),
            issue.body.as_deref().unwrap_or("").to_lowercase()
        );
        if let Some(keyword) = BUCKET_KEYWORDS.iter().find(|kw| text.contains(**kw)) {
            push(format!("keyword:{keyword}"), issue.number, &mut buckets);
            continue;
        }

        push(format!("single:{}", issue.number), issue.number, &mut buckets);
    }

    buckets
}

// --- Persistence ------------------------------------------------------------

/// Stores batches and the exclusive issue → batch index.
pub struct BatchStore {
    batches_dir: PathBuf,
}

impl BatchStore {
    pub fn new(batches_dir: impl Into<PathBuf>) -> Self {
        Self {
            batches_dir: batches_dir.into(),
        }
    }

    fn batch_file(&self, batch_id: &str) -> PathBuf {
        self.batches_dir.join(format!("batch_{batch_id}.json"))
    }

    fn index_file(&self) -> PathBuf {
        self.batches_dir.join("index.json")
    }

    /// Persist a batch and claim its issues in the index. Fails without
    /// writing the batch when any issue already belongs to another batch.
    pub fn insert(&self, batch: &IssueBatch) -> Result<()> {
        let numbers = batch.issue_numbers();
        let batch_id = batch.batch_id.clone();
        let mut conflict: Option<(u64, String)> = None;

        locked_json_update(&self.index_file(), DEFAULT_LOCK_TIMEOUT, |current| {
            let mut index: BatchIndex = serde_json::from_value(current).unwrap_or_default();
            for number in &numbers {
                if let Some(existing) = index.issue_to_batch.get(&number.to_string())
                    && existing != &batch_id
                {
                    conflict = Some((*number, existing.clone()));
                    return serde_json::to_value(&index).unwrap_or_default();
                }
            }
            for number in &numbers {
                index
                    .issue_to_batch
                    .insert(number.to_string(), batch_id.clone());
            }
            index.updated_at = Some(Utc::now());
            serde_json::to_value(&index).unwrap_or_default()
        })?;

        if let Some((number, existing)) = conflict {
            return Err(Error::Batch(format!(
                "issue #{number} already belongs to batch {existing}"
            )));
        }

        let path = self.batch_file(&batch.batch_id);
        let _lock = FileLock::acquire(&path, DEFAULT_LOCK_TIMEOUT)?;
        atomic_write(&path, &serde_json::to_vec_pretty(batch)?)?;
        debug!(batch_id = %batch.batch_id, issues = ?numbers, "batch stored");
        Ok(())
    }

    pub fn load(&self, batch_id: &str) -> Result<Option<IssueBatch>> {
        let _lock = FileLock::acquire_shared(&self.batch_file(batch_id), DEFAULT_LOCK_TIMEOUT)?;
        self.load_unlocked(batch_id)
    }

    fn load_unlocked(&self, batch_id: &str) -> Result<Option<IssueBatch>> {
        match std::fs::read_to_string(self.batch_file(batch_id)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn batch_for_issue(&self, issue: u64) -> Result<Option<String>> {
        let value = locked_json_read(&self.index_file(), DEFAULT_LOCK_TIMEOUT)?;
        let index: BatchIndex = serde_json::from_value(value).unwrap_or_default();
        Ok(index.issue_to_batch.get(&issue.to_string()).cloned())
    }

    pub fn list(&self) -> Result<Vec<IssueBatch>> {
        let mut batches = Vec::new();
        let entries = match std::fs::read_dir(&self.batches_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(batches),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("batch_") || !name.ends_with(".json") {
                continue;
            }
            match std::fs::read_to_string(entry.path()) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(batch) => batches.push(batch),
                    Err(e) => warn!(file = %name, error = %e, "skipping unreadable batch"),
                },
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable batch"),
            }
        }
        batches.sort_by(|a: &IssueBatch, b: &IssueBatch| a.created_at.cmp(&b.created_at));
        Ok(batches)
    }

    /// Advance a batch's status, enforcing the sequential machine. The
    /// exclusive lock spans the whole read-modify-write so two concurrent
    /// drivers cannot both pass the transition check and lose an update.
    pub fn transition(&self, batch_id: &str, next: BatchStatus) -> Result<IssueBatch> {
        let path = self.batch_file(batch_id);
        let _lock = FileLock::acquire(&path, DEFAULT_LOCK_TIMEOUT)?;

        let mut batch = self
            .load_unlocked(batch_id)?
            .ok_or_else(|| Error::Batch(format!("unknown batch {batch_id}")))?;
        if !batch.status.can_transition_to(next) {
            return Err(Error::Batch(format!(
                "invalid batch transition {:?} -> {next:?}",
                batch.status
            )));
        }
        batch.status = next;
        batch.updated_at = Utc::now();
        atomic_write(&path, &serde_json::to_vec_pretty(&batch)?)?;
        info!(batch_id, ?next, "batch status advanced");
        Ok(batch)
    }

    /// Remove terminal batches and their index entries. Returns removed ids.
    pub fn cleanup_terminal(&self, dry_run: bool) -> Result<Vec<String>> {
        let terminal: Vec<IssueBatch> = self
            .list()?
            .into_iter()
            .filter(|b| b.status.is_terminal())
            .collect();
        if dry_run {
            return Ok(terminal.into_iter().map(|b| b.batch_id).collect());
        }

        let mut removed = Vec::new();
        for batch in terminal {
            let numbers = batch.issue_numbers();
            locked_json_update(&self.index_file(), DEFAULT_LOCK_TIMEOUT, |current| {
                let mut index: BatchIndex = serde_json::from_value(current).unwrap_or_default();
                for number in &numbers {
                    index.issue_to_batch.remove(&number.to_string());
                }
                index.updated_at = Some(Utc::now());
                serde_json::to_value(&index).unwrap_or_default()
            })?;
            let path = self.batch_file(&batch.batch_id);
            {
                // Unlink under the same lock transition holds, so a removal
                // cannot interleave with an in-flight status write.
                let _lock = FileLock::acquire(&path, DEFAULT_LOCK_TIMEOUT)?;
                let _ = std::fs::remove_file(&path);
            }
            removed.push(batch.batch_id);
        }
        Ok(removed)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BatchIndex {
    #[serde(default)]
    issue_to_batch: HashMap<String, String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

// --- AI grouping and validation --------------------------------------------

/// Groups open issues into validated, mutually exclusive batches.
pub struct BatchEngine<'a, R: AgentRunner> {
    runner: &'a R,
    engine: &'a PromptEngine,
    max_batch_size: usize,
    min_batch_size: usize,
}

impl<'a, R: AgentRunner> BatchEngine<'a, R> {
    pub fn new(runner: &'a R, engine: &'a PromptEngine) -> Self {
        Self {
            runner,
            engine,
            max_batch_size: MAX_BATCH_SIZE,
            min_batch_size: MIN_BATCH_SIZE,
        }
    }

    /// Full grouping pass: pre-group, AI-partition each non-singleton
    /// bucket, validate multi-item batches, split invalid ones.
    pub async fn group_issues(&self, repo: &str, issues: &[Issue]) -> Result<Vec<IssueBatch>> {
        let by_number: HashMap<u64, &Issue> = issues.iter().map(|i| (i.number, i)).collect();
        let buckets = pre_group(issues);
        info!(issues = issues.len(), buckets = buckets.len(), "pre-grouped issues");

        let mut batches = Vec::new();
        for bucket in buckets {
            if bucket.issues.len() == 1 {
                let issue = by_number[&bucket.issues[0]];
                batches.push(IssueBatch::new(repo, vec![to_item(issue, 1.0)], None));
                continue;
            }

            let proposed = self.ai_group(&bucket, &by_number).await?;
            for proposal in proposed {
                let members: Vec<BatchItem> = proposal
                    .issue_numbers
                    .iter()
                    .filter_map(|n| by_number.get(n))
                    .map(|i| to_item(i, proposal.confidence))
                    .collect();
                if members.is_empty() {
                    continue;
                }

                let mut batch =
                    IssueBatch::new(repo, members, Some(proposal.theme.clone()));

                if batch.items.len() > 1 {
                    let validation = self.validate_batch(&batch).await?;
                    if validation.is_valid {
                        batch.validation = Some(to_record(&validation));
                        if let Some(theme) = validation.common_theme {
                            if !batch.common_themes.contains(&theme) {
                                batch.common_themes.insert(0, theme);
                            }
                        }
                        batches.push(batch);
                    } else {
                        batches.extend(self.split_batch(repo, &batch, &validation, &by_number));
                    }
                } else {
                    batches.push(batch);
                }
            }
        }
        Ok(batches)
    }

    async fn ai_group(
        &self,
        bucket: &Bucket,
        by_number: &HashMap<u64, &Issue>,
    ) -> Result<Vec<ProposedBatch>> {
        let issues: Vec<serde_json::Value> = bucket
            .issues
            .iter()
            .filter_map(|n| by_number.get(n))
            .map(|i| {
                json!({
                    "number": i.number,
                    "title": i.title,
                    "body": i.body.as_deref().unwrap_or(""),
                    "labels": i.label_names(),
                })
            })
            .collect();

        let mut vars = HashMap::new();
        vars.insert(
            "issues_json".to_string(),
            serde_json::to_string_pretty(&issues)?,
        );
        vars.insert("max_batch_size".to_string(), self.max_batch_size.to_string());
        let prompt = self.engine.render("batch_group", &vars)?;

        let result = self
            .runner
            .run(AgentTask::BatchGroup, &prompt, Path::new("."))
            .await?;
        match parse_batch_group_output(&result.stdout) {
            Ok(output) => Ok(output
                .batches
                .into_iter()
                .map(|mut b| {
                    // Enforce the size cap even if the agent ignored it.
                    b.issue_numbers.truncate(self.max_batch_size);
                    b
                })
                .collect()),
            Err(e) => {
                warn!(bucket = %bucket.key, error = %e, "AI grouping unparseable, falling back to singletons");
                Ok(bucket
                    .issues
                    .iter()
                    .map(|n| ProposedBatch {
                        issue_numbers: vec![*n],
                        theme: bucket.key.clone(),
                        reasoning: "fallback singleton".to_string(),
                        confidence: 0.0,
                    })
                    .collect())
            }
        }
    }

    async fn validate_batch(&self, batch: &IssueBatch) -> Result<BatchValidationOutput> {
        let mut vars = HashMap::new();
        vars.insert(
            "batch_json".to_string(),
            serde_json::to_string_pretty(&batch)?,
        );
        let prompt = self.engine.render("batch_validate", &vars)?;
        let result = self
            .runner
            .run(AgentTask::BatchValidate, &prompt, Path::new("."))
            .await?;
        match parse_batch_validation_output(&result.stdout) {
            Ok(output) => Ok(output),
            Err(e) => {
                // An unverifiable batch is treated as invalid with no
                // suggested splits, which degrades it to singletons.
                warn!(batch_id = %batch.batch_id, error = %e, "validator unparseable");
                Ok(BatchValidationOutput {
                    is_valid: false,
                    confidence: 0.0,
                    reasoning: format!("validator output unparseable: {e}"),
                    suggested_splits: Vec::new(),
                    common_theme: None,
                })
            }
        }
    }

    fn split_batch(
        &self,
        repo: &str,
        batch: &IssueBatch,
        validation: &BatchValidationOutput,
        by_number: &HashMap<u64, &Issue>,
    ) -> Vec<IssueBatch> {
        let member_numbers = batch.issue_numbers();
        let usable_splits: Vec<&Vec<u64>> = validation
            .suggested_splits
            .iter()
            .filter(|split| {
                split.len() >= self.min_batch_size
                    && split.iter().all(|n| member_numbers.contains(n))
            })
            .collect();

        let groups: Vec<Vec<u64>> = if usable_splits.is_empty() {
            member_numbers.iter().map(|n| vec![*n]).collect()
        } else {
            usable_splits.into_iter().cloned().collect()
        };

        groups
            .into_iter()
            .map(|numbers| {
                let items: Vec<BatchItem> = numbers
                    .iter()
                    .filter_map(|n| by_number.get(n))
                    .map(|i| to_item(i, 0.0))
                    .collect();
                IssueBatch::new(repo, items, batch.common_themes.first().cloned())
            })
            .filter(|b| !b.items.is_empty())
            .collect()
    }
}

fn to_item(issue: &Issue, similarity: f64) -> BatchItem {
    BatchItem {
        issue_number: issue.number,
        title: issue.title.clone(),
        body: issue.body.clone().unwrap_or_default(),
        labels: issue.label_names(),
        similarity_to_primary: similarity,
    }
}

fn to_record(output: &BatchValidationOutput) -> BatchValidationRecord {
    BatchValidationRecord {
        is_valid: output.is_valid,
        confidence: output.confidence,
        reasoning: output.reasoning.clone(),
        suggested_splits: output.suggested_splits.clone(),
        theme: output.common_theme.clone(),
    }
}
