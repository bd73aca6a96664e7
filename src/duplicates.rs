use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lock::{DEFAULT_LOCK_TIMEOUT, locked_json_update};

/// Cosine similarity at or above which a pair is a duplicate.
pub const DUPLICATE_THRESHOLD: f64 = 0.85;
/// Cosine similarity at or above which a pair is related.
pub const SIMILAR_THRESHOLD: f64 = 0.70;
/// Cached embeddings expire after this long.
pub const CACHE_TTL_HOURS: i64 = 24;

// --- Entity extraction ------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityExtraction {
    pub error_codes: Vec<String>,
    pub file_paths: Vec<String>,
    pub function_names: Vec<String>,
    pub urls: Vec<String>,
    pub versions: Vec<String>,
    pub stack_traces: Vec<String>,
}

impl EntityExtraction {
    /// Jaccard overlap per entity class.
    pub fn overlap_with(&self, other: &EntityExtraction) -> HashMap<String, f64> {
        fn jaccard(a: &[String], b: &[String]) -> f64 {
            if a.is_empty() && b.is_empty() {
                return 0.0;
            }
            let sa: HashSet<&String> = a.iter().collect();
            let sb: HashSet<&String> = b.iter().collect();
            let intersection = sa.intersection(&sb).count();
            let union = sa.union(&sb).count();
            if union == 0 {
                0.0
            } else {
                intersection as f64 / union as f64
            }
        }

        HashMap::from([
            ("error_codes".to_string(), jaccard(&self.error_codes, &other.error_codes)),
            ("file_paths".to_string(), jaccard(&self.file_paths, &other.file_paths)),
            (
                "function_names".to_string(),
                jaccard(&self.function_names, &other.function_names),
            ),
            ("urls".to_string(), jaccard(&self.urls, &other.urls)),
            ("versions".to_string(), jaccard(&self.versions, &other.versions)),
        ])
    }
}

/// Deterministic, bounded extraction of technical entities from issue text.
pub struct EntityExtractor {
    error_code: Regex,
    file_path: Regex,
    function_name: Regex,
    url: Regex,
    version: Regex,
    stack_trace: Regex,
}

impl EntityExtractor {
    pub fn new() -> Self {
        Self {
            error_code: Regex::new(
                r"(?i)\b(?:E|ERR|ERROR|WARN|WARNING|FATAL)[-_]?\d{3,5}\b|\b[A-Z]{2,5}[-_]\d{3,5}\b",
            )
            .expect("static regex"),
            file_path: Regex::new(r"\b([a-zA-Z0-9_./-]+\.[a-zA-Z]{1,5})\b").expect("static regex"),
            function_name: Regex::new(
                r"\b(?:fn|def|function)\s+([a-zA-Z_][a-zA-Z0-9_]*)|\b([a-zA-Z_][a-zA-Z0-9_]{2,})\s*\(",
            )
            .expect("static regex"),
            url: Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("static regex"),
            version: Regex::new(r"\bv?\d+\.\d+(?:\.\d+)?(?:-[a-zA-Z0-9.]+)?\b")
                .expect("static regex"),
            stack_trace: Regex::new(r"(?m)(?:^\s*at\s+[^\n]+$)|(?:File\s+\x22[^\x22]+\x22,\s+line\s+\d+)")
                .expect("static regex"),
        }
    }

    pub fn extract(&self, content: &str) -> EntityExtraction {
        let dedup_cap = |iter: Vec<String>, cap: usize| -> Vec<String> {
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for item in iter {
                if seen.insert(item.clone()) {
                    out.push(item);
                    if out.len() >= cap {
                        break;
                    }
                }
            }
            out
        };

        let error_codes = dedup_cap(
            self.error_code
                .find_iter(content)
                .map(|m| m.as_str().to_string())
                .collect(),
            20,
        );

        let file_paths = dedup_cap(
            self.file_path
                .captures_iter(content)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .filter(|p| p.len() > 3 && p.contains('.'))
                .collect(),
            20,
        );

        let function_names = dedup_cap(
            self.function_name
                .captures_iter(content)
                .filter_map(|c| {
                    c.get(1)
                        .or_else(|| c.get(2))
                        .map(|m| m.as_str().to_string())
                })
                .filter(|f| f.len() > 2)
                .collect(),
            20,
        );

        let urls = dedup_cap(
            self.url
                .find_iter(content)
                .map(|m| m.as_str().to_string())
                .collect(),
            10,
        );

        let versions = dedup_cap(
            self.version
                .find_iter(content)
                .map(|m| m.as_str().to_string())
                .collect(),
            10,
        );

        let stack_traces = dedup_cap(
            self.stack_trace
                .find_iter(content)
                .map(|m| m.as_str().trim().to_string())
                .collect(),
            3,
        );

        EntityExtraction {
            error_codes,
            file_paths,
            function_names,
            urls,
            versions,
            stack_traces,
        }
    }
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

// --- Embedding providers ----------------------------------------------------

/// Contract every embedding backend satisfies.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    OpenAi,
    Voyage,
    Local,
}

/// Build a provider from a config tag; remote providers bind their API key
/// at construction.
pub fn build_provider(
    backend: EmbeddingBackend,
    api_key: Option<String>,
) -> Result<Box<dyn EmbeddingProvider>> {
    match backend {
        EmbeddingBackend::OpenAi => {
            let key = api_key
                .ok_or_else(|| Error::Duplicate("OpenAI embeddings need an API key".into()))?;
            Ok(Box::new(OpenAiEmbeddings {
                api_key: key,
                model: "text-embedding-3-small".to_string(),
            }))
        }
        EmbeddingBackend::Voyage => {
            let key = api_key
                .ok_or_else(|| Error::Duplicate("Voyage embeddings need an API key".into()))?;
            Ok(Box::new(VoyageEmbeddings {
                api_key: key,
                model: "voyage-large-2".to_string(),
            }))
        }
        EmbeddingBackend::Local => Ok(Box::new(LocalEmbeddings::default())),
    }
}

struct OpenAiEmbeddings {
    api_key: String,
    model: String,
}

impl EmbeddingProvider for OpenAiEmbeddings {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        remote_embedding(
            "https://api.openai.com/v1/embeddings",
            &format!("Bearer {}", self.api_key),
            &self.model,
            text,
        )
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

struct VoyageEmbeddings {
    api_key: String,
    model: String,
}

impl EmbeddingProvider for VoyageEmbeddings {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        remote_embedding(
            "https://api.voyageai.com/v1/embeddings",
            &format!("Bearer {}", self.api_key),
            &self.model,
            text,
        )
    }

    fn name(&self) -> &'static str {
        "voyage"
    }
}

fn remote_embedding(url: &str, auth: &str, model: &str, text: &str) -> Result<Vec<f32>> {
    let response = ureq::post(url)
        .set("Authorization", auth)
        .timeout(Duration::from_secs(30))
        .send_json(serde_json::json!({"model": model, "input": text}))
        .map_err(|e| Error::Duplicate(format!("embedding request failed: {e}")))?;

    let json: serde_json::Value = response
        .into_json()
        .map_err(|e| Error::Duplicate(format!("embedding response unreadable: {e}")))?;

    json["data"][0]["embedding"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect()
        })
        .ok_or_else(|| Error::Duplicate("embedding response missing data".into()))
}

/// Offline fallback: a unit-normalised token feature-hash projection.
/// Deterministic across runs, so cached vectors stay comparable.
pub struct LocalEmbeddings {
    dimensions: usize,
}

impl Default for LocalEmbeddings {
    fn default() -> Self {
        Self { dimensions: 256 }
    }
}

impl EmbeddingProvider for LocalEmbeddings {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0f32; self.dimensions];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| t.len() > 1)
        {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();
            let bucket = u16::from_be_bytes([digest[0], digest[1]]) as usize % self.dimensions;
            let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

// --- Cache ------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedEmbedding {
    content_hash: String,
    vector: Vec<f32>,
    expires_at: DateTime<Utc>,
}

impl CachedEmbedding {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

// --- Similarity -------------------------------------------------------------

/// A target or candidate issue, reduced to what scoring needs.
#[derive(Debug, Clone)]
pub struct IssueRef {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarityResult {
    pub target_issue: u64,
    pub candidate_issue: u64,
    pub overall_similarity: f64,
    pub title_similarity: f64,
    pub body_similarity: f64,
    pub entity_overlaps: HashMap<String, f64>,
    pub is_duplicate: bool,
    pub is_similar: bool,
    pub explanation: String,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Scores issue pairs using embeddings plus entity overlap, with a TTL'd
/// per-repo embedding cache.
pub struct DuplicateDetector {
    provider: Box<dyn EmbeddingProvider>,
    extractor: EntityExtractor,
    cache_dir: PathBuf,
    duplicate_threshold: f64,
    similar_threshold: f64,
    ttl: ChronoDuration,
}

impl DuplicateDetector {
    pub fn new(provider: Box<dyn EmbeddingProvider>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            extractor: EntityExtractor::new(),
            cache_dir: cache_dir.into(),
            duplicate_threshold: DUPLICATE_THRESHOLD,
            similar_threshold: SIMILAR_THRESHOLD,
            ttl: ChronoDuration::hours(CACHE_TTL_HOURS),
        }
    }

    pub fn with_thresholds(mut self, duplicate: f64, similar: f64) -> Self {
        self.duplicate_threshold = duplicate;
        self.similar_threshold = similar;
        self
    }

    fn cache_file(&self, repo: &str) -> PathBuf {
        let sanitized: String = repo
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.cache_dir.join(format!("{sanitized}_embeddings.json"))
    }

    fn content_hash(title: &str, body: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(b"\x00");
        hasher.update(body.as_bytes());
        let digest = hasher.finalize();
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Embedding for one issue text, through the cache. A stale or
    /// hash-mismatched entry is regenerated.
    fn get_embedding(&self, repo: &str, cache_key: &str, text: &str) -> Result<Vec<f32>> {
        let path = self.cache_file(repo);
        let hash = Self::content_hash(cache_key, text);

        // Fast path: valid cached entry.
        let cached: Option<CachedEmbedding> = {
            let value = crate::lock::locked_json_read(&path, DEFAULT_LOCK_TIMEOUT)?;
            let map: HashMap<String, CachedEmbedding> =
                serde_json::from_value(value).unwrap_or_default();
            map.get(cache_key).cloned()
        };
        if let Some(entry) = cached
            && !entry.is_expired()
            && entry.content_hash == hash
        {
            debug!(cache_key, "embedding cache hit");
            return Ok(entry.vector);
        }

        let vector = self.provider.embed(text)?;
        let entry = CachedEmbedding {
            content_hash: hash,
            vector: vector.clone(),
            expires_at: Utc::now() + self.ttl,
        };
        let key = cache_key.to_string();
        locked_json_update(&path, DEFAULT_LOCK_TIMEOUT, move |current| {
            let mut map: HashMap<String, CachedEmbedding> =
                serde_json::from_value(current).unwrap_or_default();
            map.insert(key, entry);
            serde_json::to_value(&map).unwrap_or_default()
        })?;
        Ok(vector)
    }

    /// Score one candidate against the target.
    pub fn compare_issues(
        &self,
        repo: &str,
        target: &IssueRef,
        candidate: &IssueRef,
    ) -> Result<SimilarityResult> {
        let combined = |issue: &IssueRef| {
            format!("{}\n{}", issue.title, issue.body.as_deref().unwrap_or(""))
        };

        let target_vec = self.get_embedding(
            repo,
            &format!("issue-{}", target.number),
            &combined(target),
        )?;
        let candidate_vec = self.get_embedding(
            repo,
            &format!("issue-{}", candidate.number),
            &combined(candidate),
        )?;
        let overall = cosine_similarity(&target_vec, &candidate_vec);

        let title_a = self.get_embedding(
            repo,
            &format!("title-{}", target.number),
            &target.title,
        )?;
        let title_b = self.get_embedding(
            repo,
            &format!("title-{}", candidate.number),
            &candidate.title,
        )?;
        let title_similarity = cosine_similarity(&title_a, &title_b);

        let body_similarity = match (target.body.as_deref(), candidate.body.as_deref()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => {
                let va =
                    self.get_embedding(repo, &format!("body-{}", target.number), a)?;
                let vb =
                    self.get_embedding(repo, &format!("body-{}", candidate.number), b)?;
                cosine_similarity(&va, &vb)
            }
            _ => 0.0,
        };

        let target_entities = self.extractor.extract(&combined(target));
        let candidate_entities = self.extractor.extract(&combined(candidate));
        let entity_overlaps = target_entities.overlap_with(&candidate_entities);

        let is_duplicate = overall >= self.duplicate_threshold;
        let is_similar = overall >= self.similar_threshold;

        let explanation = explain(
            overall,
            title_similarity,
            &entity_overlaps,
            is_duplicate,
            is_similar,
        );

        Ok(SimilarityResult {
            target_issue: target.number,
            candidate_issue: candidate.number,
            overall_similarity: overall,
            title_similarity,
            body_similarity,
            entity_overlaps,
            is_duplicate,
            is_similar,
            explanation,
        })
    }

    /// Compare the target against every open issue, keep the similar ones,
    /// best first, capped at `limit`.
    pub fn find_duplicates(
        &self,
        repo: &str,
        target: &IssueRef,
        open_issues: &[IssueRef],
        limit: usize,
    ) -> Result<Vec<SimilarityResult>> {
        let mut results = Vec::new();
        for candidate in open_issues {
            if candidate.number == target.number {
                continue;
            }
            match self.compare_issues(repo, target, candidate) {
                Ok(result) if result.is_similar => results.push(result),
                Ok(_) => {}
                Err(e) => {
                    // Embedding backend unavailable: skip the pair, keep going.
                    warn!(candidate = candidate.number, error = %e, "comparison skipped");
                }
            }
        }
        results.sort_by(|a, b| {
            b.overall_similarity
                .partial_cmp(&a.overall_similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        Ok(results)
    }

    pub fn clear_cache(&self, repo: &str) -> Result<()> {
        let path = self.cache_file(repo);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn explain(
    overall: f64,
    title: f64,
    overlaps: &HashMap<String, f64>,
    is_duplicate: bool,
    is_similar: bool,
) -> String {
    let verdict = if is_duplicate {
        "likely duplicate"
    } else if is_similar {
        "related"
    } else {
        "unrelated"
    };
    let mut strong: Vec<String> = overlaps
        .iter()
        .filter(|(_, v)| **v > 0.5)
        .map(|(k, v)| format!("{k} overlap {v:.0}%", v = v * 100.0))
        .collect();
    strong.sort();
    let entity_note = if strong.is_empty() {
        String::new()
    } else {
        format!("; {}", strong.join(", "))
    };
    format!(
        "{verdict}: overall similarity {overall:.2}, title similarity {title:.2}{entity_note}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn issue(number: u64, title: &str, body: Option<&str>) -> IssueRef {
        IssueRef {
            number,
            title: title.to_string(),
            body: body.map(str::to_string),
        }
    }

    fn detector(dir: &TempDir) -> DuplicateDetector {
        DuplicateDetector::new(
            build_provider(EmbeddingBackend::Local, None).unwrap(),
            dir.path().join("embeddings"),
        )
    }

    #[test]
    fn test_entity_extraction_finds_everything() {
        let content = "\
Error E1234 in src/auth/login.rs when calling validate_token() \
see https://github.com/o/r/issues/1 on v2.3.1
    at login.handler (app.js:10)
";
        let extracted = EntityExtractor::new().extract(content);
        assert!(extracted.error_codes.iter().any(|e| e.contains("1234")));
        assert!(extracted.file_paths.iter().any(|p| p == "src/auth/login.rs"));
        assert!(
            extracted
                .function_names
                .iter()
                .any(|f| f == "validate_token")
        );
        assert_eq!(extracted.urls.len(), 1);
        assert!(extracted.versions.iter().any(|v| v == "v2.3.1"));
        assert!(!extracted.stack_traces.is_empty());
    }

    #[test]
    fn test_entity_extraction_bounded_and_deduped() {
        let repeated = "call foo_bar() then foo_bar() again\n".repeat(50);
        let extracted = EntityExtractor::new().extract(&repeated);
        assert_eq!(
            extracted
                .function_names
                .iter()
                .filter(|f| *f == "foo_bar")
                .count(),
            1
        );
        assert!(extracted.function_names.len() <= 20);
    }

    #[test]
    fn test_entity_overlap_jaccard() {
        let a = EntityExtraction {
            file_paths: vec!["a.rs".into(), "b.rs".into()],
            ..Default::default()
        };
        let b = EntityExtraction {
            file_paths: vec!["b.rs".into(), "c.rs".into()],
            ..Default::default()
        };
        let overlap = a.overlap_with(&b);
        assert!((overlap["file_paths"] - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(overlap["urls"], 0.0);
    }

    #[test]
    fn test_local_embeddings_deterministic_and_normalised() {
        let provider = LocalEmbeddings::default();
        let a = provider.embed("oauth login fails with token error").unwrap();
        let b = provider.embed("oauth login fails with token error").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        let a = vec![1.0f32, 0.0];
        let b = vec![1.0f32, 0.0];
        let c = vec![0.0f32, 1.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&a, &c).abs() < 1e-9);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_identical_issues_are_duplicates() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        let a = issue(1, "oauth login broken after upgrade", Some("stack trace here"));
        let b = issue(2, "oauth login broken after upgrade", Some("stack trace here"));
        let result = d.compare_issues("o/r", &a, &b).unwrap();
        assert!(result.is_duplicate);
        assert!(result.is_similar);
        assert!(result.overall_similarity > 0.99);
        assert!(result.explanation.contains("likely duplicate"));
    }

    #[test]
    fn test_unrelated_issues_score_low() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        let a = issue(1, "oauth login broken", Some("auth token expired error"));
        let b = issue(
            2,
            "dark mode color palette wrong",
            Some("css variables ignored on safari"),
        );
        let result = d.compare_issues("o/r", &a, &b).unwrap();
        assert!(!result.is_duplicate);
        assert!(result.overall_similarity < DUPLICATE_THRESHOLD);
    }

    #[test]
    fn test_missing_body_zeroes_body_similarity() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        let a = issue(1, "login broken", None);
        let b = issue(2, "login broken", Some("details"));
        let result = d.compare_issues("o/r", &a, &b).unwrap();
        assert_eq!(result.body_similarity, 0.0);
        assert!(result.title_similarity > 0.99);
    }

    #[test]
    fn test_cache_roundtrip_and_expiry() {
        let dir = TempDir::new().unwrap();
        let mut d = detector(&dir);
        let a = issue(1, "issue one", Some("body"));
        let b = issue(2, "issue two", Some("body"));
        d.compare_issues("o/r", &a, &b).unwrap();

        let cache_path = d.cache_file("o/r");
        assert!(cache_path.exists());
        let content = std::fs::read_to_string(&cache_path).unwrap();
        let map: HashMap<String, CachedEmbedding> = serde_json::from_str(&content).unwrap();
        assert!(map.contains_key("issue-1"));
        assert!(map.values().all(|e| !e.is_expired()));

        // Force expiry: a second comparison regenerates entries.
        d.ttl = ChronoDuration::hours(-1);
        d.compare_issues("o/r", &a, &b).unwrap();
        let content = std::fs::read_to_string(&cache_path).unwrap();
        let map: HashMap<String, CachedEmbedding> = serde_json::from_str(&content).unwrap();
        assert!(map.values().all(|e| e.is_expired()));
    }

    #[test]
    fn test_cache_invalidated_on_content_change() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        let a1 = issue(1, "original title", Some("body"));
        let b = issue(2, "candidate", Some("body"));
        let first = d.compare_issues("o/r", &a1, &b).unwrap();

        // Same issue number, different content: the hash mismatch forces a
        // fresh embedding rather than serving the stale vector.
        let a2 = issue(1, "candidate", Some("body"));
        let second = d.compare_issues("o/r", &a2, &b).unwrap();
        assert!(second.overall_similarity > first.overall_similarity);
    }

    #[test]
    fn test_find_duplicates_filters_sorts_caps() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        let target = issue(1, "oauth login regression token refresh", Some("fails"));
        let candidates = vec![
            issue(2, "oauth login regression token refresh", Some("fails")),
            issue(3, "oauth token refresh sometimes fails login", Some("fails")),
            issue(4, "completely unrelated dashboard chart bug", Some("charts")),
            issue(1, "the target itself", Some("skipped")),
        ];
        let results = d.find_duplicates("o/r", &target, &candidates, 10).unwrap();
        assert!(results.iter().all(|r| r.is_similar));
        assert!(results.iter().all(|r| r.candidate_issue != 1));
        // Best match first.
        assert_eq!(results[0].candidate_issue, 2);
        for pair in results.windows(2) {
            assert!(pair[0].overall_similarity >= pair[1].overall_similarity);
        }

        let capped = d.find_duplicates("o/r", &target, &candidates, 1).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_build_provider_requires_keys_for_remotes() {
        assert!(build_provider(EmbeddingBackend::OpenAi, None).is_err());
        assert!(build_provider(EmbeddingBackend::Voyage, None).is_err());
        assert!(build_provider(EmbeddingBackend::Local, None).is_ok());
        let provider =
            build_provider(EmbeddingBackend::OpenAi, Some("sk-test".into())).unwrap();
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn test_clear_cache() {
        let dir = TempDir::new().unwrap();
        let d = detector(&dir);
        let a = issue(1, "x", Some("y"));
        let b = issue(2, "x", Some("y"));
        d.compare_issues("o/r", &a, &b).unwrap();
        assert!(d.cache_file("o/r").exists());
        d.clear_cache("o/r").unwrap();
        assert!(!d.cache_file("o/r").exists());
    }
}
