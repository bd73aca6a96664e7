use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lock::{DEFAULT_LOCK_TIMEOUT, locked_json_read, locked_json_update};

/// Minimum sample size before a pattern is surfaced.
pub const DEFAULT_MIN_SAMPLE_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    ReviewApprove,
    ReviewRequestChanges,
    TriageBug,
    TriageFeature,
    TriageSpam,
    TriageDuplicate,
    AutofixWillWork,
    LabelApplied,
}

impl PredictionType {
    fn key(&self) -> &'static str {
        match self {
            Self::ReviewApprove => "review_approve",
            Self::ReviewRequestChanges => "review_request_changes",
            Self::TriageBug => "triage_bug",
            Self::TriageFeature => "triage_feature",
            Self::TriageSpam => "triage_spam",
            Self::TriageDuplicate => "triage_duplicate",
            Self::AutofixWillWork => "autofix_will_work",
            Self::LabelApplied => "label_applied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    Merged,
    Closed,
    Modified,
    Overridden,
    Confirmed,
}

/// One prediction and, once reality is observable, its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub review_id: String,
    pub repo: String,
    pub pr_number: u64,
    pub prediction_type: PredictionType,
    #[serde(default)]
    pub findings_count: u32,
    #[serde(default)]
    pub high_severity_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_outcome: Option<OutcomeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_outcome_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_response: Option<String>,
    #[serde(default)]
    pub file_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_size: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl OutcomeRecord {
    /// Correctness derived from prediction vs outcome. `None` while the
    /// outcome is unknown. An override always means the prediction was wrong.
    pub fn was_correct(&self) -> Option<bool> {
        let outcome = self.actual_outcome?;
        if outcome == OutcomeType::Overridden {
            return Some(false);
        }
        let correct = match self.prediction_type {
            PredictionType::ReviewApprove | PredictionType::AutofixWillWork => {
                matches!(outcome, OutcomeType::Merged | OutcomeType::Confirmed)
            }
            PredictionType::ReviewRequestChanges => {
                matches!(outcome, OutcomeType::Modified | OutcomeType::Confirmed)
            }
            PredictionType::TriageSpam | PredictionType::TriageDuplicate => {
                matches!(outcome, OutcomeType::Closed | OutcomeType::Confirmed)
            }
            PredictionType::TriageBug
            | PredictionType::TriageFeature
            | PredictionType::LabelApplied => matches!(outcome, OutcomeType::Confirmed),
        };
        Some(correct)
    }

    pub fn is_pending(&self) -> bool {
        self.actual_outcome.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeStats {
    pub total: u32,
    pub correct: u32,
    pub incorrect: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccuracyStats {
    pub total_predictions: u32,
    pub correct_predictions: u32,
    pub incorrect_predictions: u32,
    pub pending_outcomes: u32,
    pub by_type: HashMap<String, TypeStats>,
    pub avg_time_to_merge_secs: Option<f64>,
}

impl AccuracyStats {
    pub fn accuracy(&self) -> Option<f64> {
        let resolved = self.correct_predictions + self.incorrect_predictions;
        (resolved > 0).then(|| self.correct_predictions as f64 / resolved as f64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningPattern {
    pub dimension: String,
    pub key: String,
    pub sample_size: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AccuracyQuery {
    pub repo: Option<String>,
    pub prediction_type: Option<PredictionType>,
    pub since: Option<DateTime<Utc>>,
}

/// Records predictions and their eventual outcomes, per repository.
pub struct LearningTracker {
    learning_dir: PathBuf,
}

impl LearningTracker {
    pub fn new(learning_dir: impl Into<PathBuf>) -> Self {
        Self {
            learning_dir: learning_dir.into(),
        }
    }

    fn outcomes_file(&self, repo: &str) -> PathBuf {
        let sanitized: String = repo
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.learning_dir.join(format!("{sanitized}_outcomes.json"))
    }

    /// Record a prediction; outcome-side fields stay null until reality is
    /// observable. Returns the generated review id.
    pub fn record_prediction(&self, mut record: OutcomeRecord) -> Result<String> {
        if record.review_id.is_empty() {
            record.review_id = Uuid::new_v4().simple().to_string();
        }
        let review_id = record.review_id.clone();
        let path = self.outcomes_file(&record.repo);
        locked_json_update(&path, DEFAULT_LOCK_TIMEOUT, |current| {
            let mut records: Vec<OutcomeRecord> =
                serde_json::from_value(current).unwrap_or_default();
            records.push(record);
            serde_json::to_value(&records).unwrap_or_default()
        })?;
        debug!(review_id = %review_id, "prediction recorded");
        Ok(review_id)
    }

    /// Fill in the outcome side of a recorded prediction.
    pub fn record_outcome(
        &self,
        repo: &str,
        review_id: &str,
        outcome: OutcomeType,
        author_response: Option<&str>,
    ) -> Result<()> {
        let path = self.outcomes_file(repo);
        let review_id_owned = review_id.to_string();
        let author_response = author_response.map(str::to_string);
        let mut found = false;
        locked_json_update(&path, DEFAULT_LOCK_TIMEOUT, |current| {
            let mut records: Vec<OutcomeRecord> =
                serde_json::from_value(current).unwrap_or_default();
            if let Some(record) = records.iter_mut().find(|r| r.review_id == review_id_owned) {
                record.actual_outcome = Some(outcome);
                record.time_to_outcome_secs =
                    Some((Utc::now() - record.created_at).num_seconds().max(0));
                record.author_response = author_response.clone();
                found = true;
            }
            serde_json::to_value(&records).unwrap_or_default()
        })?;
        if !found {
            return Err(Error::Learning(format!(
                "no prediction with review_id {review_id} in {repo}"
            )));
        }
        info!(review_id, ?outcome, "outcome recorded");
        Ok(())
    }

    fn load_repo(&self, repo: &str) -> Result<Vec<OutcomeRecord>> {
        let value = locked_json_read(&self.outcomes_file(repo), DEFAULT_LOCK_TIMEOUT)?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    fn load_all(&self) -> Result<Vec<OutcomeRecord>> {
        let mut all = Vec::new();
        let entries = match std::fs::read_dir(&self.learning_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(all),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with("_outcomes.json") {
                continue;
            }
            let value = locked_json_read(&entry.path(), DEFAULT_LOCK_TIMEOUT)?;
            let records: Vec<OutcomeRecord> = serde_json::from_value(value).unwrap_or_default();
            all.extend(records);
        }
        Ok(all)
    }

    fn matching(&self, query: &AccuracyQuery) -> Result<Vec<OutcomeRecord>> {
        let records = match &query.repo {
            Some(repo) => self.load_repo(repo)?,
            None => self.load_all()?,
        };
        Ok(records
            .into_iter()
            .filter(|r| {
                query
                    .prediction_type
                    .map(|t| r.prediction_type == t)
                    .unwrap_or(true)
                    && query.since.map(|s| r.created_at >= s).unwrap_or(true)
            })
            .collect())
    }

    /// Accuracy over the matching records.
    pub fn get_accuracy(&self, query: &AccuracyQuery) -> Result<AccuracyStats> {
        let mut stats = AccuracyStats::default();
        let mut merge_times = Vec::new();

        for record in self.matching(query)? {
            stats.total_predictions += 1;
            let type_stats = stats
                .by_type
                .entry(record.prediction_type.key().to_string())
                .or_default();
            type_stats.total += 1;

            match record.was_correct() {
                Some(true) => {
                    stats.correct_predictions += 1;
                    type_stats.correct += 1;
                    if record.actual_outcome == Some(OutcomeType::Merged)
                        && let Some(secs) = record.time_to_outcome_secs
                    {
                        merge_times.push(secs as f64);
                    }
                }
                Some(false) => {
                    stats.incorrect_predictions += 1;
                    type_stats.incorrect += 1;
                }
                None => stats.pending_outcomes += 1,
            }
        }

        if !merge_times.is_empty() {
            stats.avg_time_to_merge_secs =
                Some(merge_times.iter().sum::<f64>() / merge_times.len() as f64);
        }
        Ok(stats)
    }

    /// Records still waiting on an outcome.
    pub fn pending(&self, repo: Option<&str>) -> Result<Vec<OutcomeRecord>> {
        let records = match repo {
            Some(repo) => self.load_repo(repo)?,
            None => self.load_all()?,
        };
        Ok(records.into_iter().filter(|r| r.is_pending()).collect())
    }

    /// Aggregate correctness by file type, category and change size;
    /// a pattern is only emitted at or above the sample-size threshold.
    pub fn detect_patterns(&self, min_sample_size: usize) -> Result<Vec<LearningPattern>> {
        let records = self.load_all()?;
        let mut buckets: HashMap<(String, String), (usize, usize)> = HashMap::new();

        for record in &records {
            let Some(correct) = record.was_correct() else {
                continue;
            };
            let mut keys: Vec<(String, String)> = Vec::new();
            for ft in &record.file_types {
                keys.push(("file_type".to_string(), ft.clone()));
            }
            for cat in &record.categories {
                keys.push(("category".to_string(), cat.clone()));
            }
            if let Some(ref size) = record.change_size {
                keys.push(("change_size".to_string(), size.clone()));
            }
            for key in keys {
                let entry = buckets.entry(key).or_insert((0, 0));
                entry.0 += 1;
                if correct {
                    entry.1 += 1;
                }
            }
        }

        let mut patterns: Vec<LearningPattern> = buckets
            .into_iter()
            .filter(|(_, (total, _))| *total >= min_sample_size)
            .map(|((dimension, key), (total, correct))| LearningPattern {
                dimension,
                key,
                sample_size: total,
                accuracy: correct as f64 / total as f64,
            })
            .collect();
        patterns.sort_by(|a, b| {
            a.dimension
                .cmp(&b.dimension)
                .then(a.key.cmp(&b.key))
        });
        Ok(patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker() -> (TempDir, LearningTracker) {
        let dir = TempDir::new().unwrap();
        let tracker = LearningTracker::new(dir.path().join("learning"));
        (dir, tracker)
    }

    fn prediction(repo: &str, kind: PredictionType) -> OutcomeRecord {
        OutcomeRecord {
            review_id: String::new(),
            repo: repo.to_string(),
            pr_number: 1,
            prediction_type: kind,
            findings_count: 2,
            high_severity_count: 1,
            created_at: Utc::now(),
            actual_outcome: None,
            time_to_outcome_secs: None,
            author_response: None,
            file_types: vec!["rs".to_string()],
            change_size: Some("small".to_string()),
            categories: vec!["correctness".to_string()],
        }
    }

    #[test]
    fn test_prediction_starts_pending() {
        let (_dir, t) = tracker();
        let id = t
            .record_prediction(prediction("o/r", PredictionType::ReviewApprove))
            .unwrap();
        assert!(!id.is_empty());
        let pending = t.pending(Some("o/r")).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].was_correct().is_none());
    }

    #[test]
    fn test_outcome_resolves_prediction() {
        let (_dir, t) = tracker();
        let id = t
            .record_prediction(prediction("o/r", PredictionType::ReviewApprove))
            .unwrap();
        t.record_outcome("o/r", &id, OutcomeType::Merged, Some("accepted"))
            .unwrap();

        let pending = t.pending(Some("o/r")).unwrap();
        assert!(pending.is_empty());

        let stats = t.get_accuracy(&AccuracyQuery::default()).unwrap();
        assert_eq!(stats.correct_predictions, 1);
        assert_eq!(stats.accuracy(), Some(1.0));
        assert!(stats.avg_time_to_merge_secs.is_some());
    }

    #[test]
    fn test_unknown_review_id_errors() {
        let (_dir, t) = tracker();
        t.record_prediction(prediction("o/r", PredictionType::ReviewApprove))
            .unwrap();
        assert!(
            t.record_outcome("o/r", "missing", OutcomeType::Merged, None)
                .is_err()
        );
    }

    #[test]
    fn test_correctness_rules() {
        let mut r = prediction("o/r", PredictionType::ReviewApprove);

        r.actual_outcome = Some(OutcomeType::Merged);
        assert_eq!(r.was_correct(), Some(true));
        r.actual_outcome = Some(OutcomeType::Confirmed);
        assert_eq!(r.was_correct(), Some(true));
        r.actual_outcome = Some(OutcomeType::Closed);
        assert_eq!(r.was_correct(), Some(false));

        r.prediction_type = PredictionType::ReviewRequestChanges;
        r.actual_outcome = Some(OutcomeType::Modified);
        assert_eq!(r.was_correct(), Some(true));
        r.actual_outcome = Some(OutcomeType::Merged);
        assert_eq!(r.was_correct(), Some(false));

        r.prediction_type = PredictionType::TriageSpam;
        r.actual_outcome = Some(OutcomeType::Closed);
        assert_eq!(r.was_correct(), Some(true));

        r.prediction_type = PredictionType::TriageDuplicate;
        r.actual_outcome = Some(OutcomeType::Confirmed);
        assert_eq!(r.was_correct(), Some(true));
    }

    #[test]
    fn test_override_always_wrong() {
        for kind in [
            PredictionType::ReviewApprove,
            PredictionType::ReviewRequestChanges,
            PredictionType::TriageSpam,
            PredictionType::TriageDuplicate,
            PredictionType::AutofixWillWork,
            PredictionType::LabelApplied,
        ] {
            let mut r = prediction("o/r", kind);
            r.actual_outcome = Some(OutcomeType::Overridden);
            assert_eq!(r.was_correct(), Some(false), "{kind:?}");
        }
    }

    #[test]
    fn test_accuracy_filters_by_type_and_repo() {
        let (_dir, t) = tracker();
        let a = t
            .record_prediction(prediction("o/r1", PredictionType::ReviewApprove))
            .unwrap();
        t.record_outcome("o/r1", &a, OutcomeType::Merged, None).unwrap();
        let b = t
            .record_prediction(prediction("o/r2", PredictionType::TriageSpam))
            .unwrap();
        t.record_outcome("o/r2", &b, OutcomeType::Confirmed, None)
            .unwrap();

        let by_repo = t
            .get_accuracy(&AccuracyQuery {
                repo: Some("o/r1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_repo.total_predictions, 1);

        let by_type = t
            .get_accuracy(&AccuracyQuery {
                prediction_type: Some(PredictionType::TriageSpam),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_type.total_predictions, 1);
        assert!(by_type.by_type.contains_key("triage_spam"));
    }

    #[test]
    fn test_per_type_breakdown() {
        let (_dir, t) = tracker();
        let a = t
            .record_prediction(prediction("o/r", PredictionType::ReviewApprove))
            .unwrap();
        t.record_outcome("o/r", &a, OutcomeType::Merged, None).unwrap();
        let b = t
            .record_prediction(prediction("o/r", PredictionType::ReviewApprove))
            .unwrap();
        t.record_outcome("o/r", &b, OutcomeType::Closed, None).unwrap();
        t.record_prediction(prediction("o/r", PredictionType::ReviewApprove))
            .unwrap();

        let stats = t.get_accuracy(&AccuracyQuery::default()).unwrap();
        let ra = &stats.by_type["review_approve"];
        assert_eq!(ra.total, 3);
        assert_eq!(ra.correct, 1);
        assert_eq!(ra.incorrect, 1);
        assert_eq!(stats.pending_outcomes, 1);
    }

    #[test]
    fn test_patterns_require_min_sample() {
        let (_dir, t) = tracker();
        for _ in 0..5 {
            let id = t
                .record_prediction(prediction("o/r", PredictionType::ReviewApprove))
                .unwrap();
            t.record_outcome("o/r", &id, OutcomeType::Merged, None).unwrap();
        }

        // Below the threshold: silent.
        assert!(t.detect_patterns(DEFAULT_MIN_SAMPLE_SIZE).unwrap().is_empty());

        // At a threshold the sample meets: patterns for rs/correctness/small.
        let patterns = t.detect_patterns(5).unwrap();
        assert_eq!(patterns.len(), 3);
        assert!(patterns.iter().all(|p| p.sample_size == 5));
        assert!(patterns.iter().all(|p| (p.accuracy - 1.0).abs() < f64::EPSILON));
        let dims: Vec<&str> = patterns.iter().map(|p| p.dimension.as_str()).collect();
        assert_eq!(dims, vec!["category", "change_size", "file_type"]);
    }

    #[test]
    fn test_repo_name_sanitized_in_path() {
        let (_dir, t) = tracker();
        let path = t.outcomes_file("owner/repo.name");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, "owner_repo_name_outcomes.json");
    }
}
