use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::retry::retry_transient;

/// Hard timeout for status/comment queries.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Hard timeout for mutating CLI helper calls (PR create, labels).
pub const MUTATE_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(500);

/// Abstraction over `gh` CLI execution for testability.
pub trait GhClient: Send + Sync {
    fn run(&self, args: &[&str], timeout: Duration) -> Result<String>;
}

/// Real `gh` CLI client with a hard per-call timeout.
pub struct DefaultGhClient;

impl GhClient for DefaultGhClient {
    fn run(&self, args: &[&str], timeout: Duration) -> Result<String> {
        use std::io::Read;

        let mut child = Command::new("gh")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::TaskSource(format!("failed to run gh: {e}")))?;

        // Drain both pipes off-thread so a chatty child can never fill a
        // pipe buffer and deadlock the timeout poll.
        let mut stdout = child.stdout.take().expect("stdout is piped");
        let mut stderr = child.stderr.take().expect("stderr is piped");
        let stdout_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf);
            buf
        });
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::TaskSource(format!(
                        "gh {} timed out after {}s",
                        args.first().unwrap_or(&""),
                        timeout.as_secs()
                    )));
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(25)),
                Err(e) => return Err(Error::TaskSource(format!("gh wait failed: {e}"))),
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if status.success() {
            String::from_utf8(stdout)
                .map_err(|e| Error::TaskSource(format!("invalid utf8 from gh: {e}")))
        } else {
            Err(Error::TaskSource(format!(
                "gh failed: {}",
                String::from_utf8_lossy(&stderr)
            )))
        }
    }
}

// --- Typed response views (restricted to the fields the core consumes) ---

#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    pub name: String,
    pub owner: RepoOwner,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoOwner {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrAuthor {
    pub login: String,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrComment {
    pub author: PrAuthor,
    pub body: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// One element of `statusCheckRollup`. GitHub mixes two APIs here: check
/// runs carry `status`/`conclusion`, commit statuses carry `state`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCheck {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, rename = "detailsUrl")]
    pub details_url: Option<String>,
    #[serde(default, rename = "startedAt")]
    pub started_at: Option<String>,
    #[serde(default, rename = "completedAt")]
    pub completed_at: Option<String>,
}

impl RawCheck {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.context.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrCommitAuthor {
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrCommit {
    pub oid: String,
    #[serde(default)]
    pub authors: Vec<PrCommitAuthor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrSnapshot {
    #[serde(default, rename = "statusCheckRollup")]
    pub status_check_rollup: Vec<RawCheck>,
    #[serde(rename = "headRefOid")]
    pub head_ref_oid: String,
    #[serde(rename = "headRefName", default)]
    pub head_ref_name: Option<String>,
    pub state: String,
    #[serde(default, rename = "mergedAt")]
    pub merged_at: Option<String>,
    #[serde(default)]
    pub author: Option<PrAuthor>,
    #[serde(default)]
    pub commits: Vec<PrCommit>,
    #[serde(default)]
    pub comments: Vec<PrComment>,
}

impl PrSnapshot {
    pub fn is_closed(&self) -> bool {
        self.state.eq_ignore_ascii_case("closed")
    }

    pub fn is_merged(&self) -> bool {
        self.state.eq_ignore_ascii_case("merged") || self.merged_at.is_some()
    }

    /// SHA of the latest commit, falling back to the head ref oid.
    pub fn last_commit_sha(&self) -> &str {
        self.commits
            .last()
            .map(|c| c.oid.as_str())
            .unwrap_or(&self.head_ref_oid)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueLabel {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<IssueLabel>,
    #[serde(default)]
    pub url: Option<String>,
}

impl Issue {
    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }
}

/// Typed wrapper over the `gh` CLI with retry on transient failures.
pub struct GhCli {
    client: Box<dyn GhClient>,
}

impl GhCli {
    pub fn new() -> Self {
        Self {
            client: Box::new(DefaultGhClient),
        }
    }

    pub fn with_client(client: Box<dyn GhClient>) -> Self {
        Self { client }
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<String> {
        retry_transient("gh", MAX_ATTEMPTS, RETRY_BASE, || {
            self.client.run(args, timeout)
        })
    }

    /// Owner and name of the current repository.
    pub fn repo_nwo(&self) -> Result<(String, String)> {
        let json = self.run(&["repo", "view", "--json", "owner,name"], QUERY_TIMEOUT)?;
        let info: RepoInfo = serde_json::from_str(&json)
            .map_err(|e| Error::TaskSource(format!("failed to parse repo info: {e}")))?;
        Ok((info.owner.login, info.name))
    }

    /// Login of the authenticated identity (the automation's own account).
    pub fn current_user(&self) -> Result<String> {
        let json = self.run(&["api", "user", "--jq", ".login"], QUERY_TIMEOUT)?;
        let login = json.trim().to_string();
        if login.is_empty() {
            return Err(Error::TaskSource("gh api user returned no login".into()));
        }
        Ok(login)
    }

    /// Full PR snapshot: checks, head SHA, state, author, commits, comments.
    pub fn pr_snapshot(&self, repo: &str, pr_number: u64) -> Result<PrSnapshot> {
        let pr = pr_number.to_string();
        let json = self.run(
            &[
                "pr",
                "view",
                &pr,
                "--repo",
                repo,
                "--json",
                "statusCheckRollup,headRefOid,headRefName,state,mergedAt,author,commits,comments",
            ],
            QUERY_TIMEOUT,
        )?;
        let snapshot: PrSnapshot = serde_json::from_str(&json)
            .map_err(|e| Error::TaskSource(format!("failed to parse pr view: {e}")))?;
        debug!(
            pr_number,
            checks = snapshot.status_check_rollup.len(),
            state = %snapshot.state,
            "fetched PR snapshot"
        );
        Ok(snapshot)
    }

    /// Comments only (cheaper than the full snapshot).
    pub fn pr_comments(&self, repo: &str, pr_number: u64) -> Result<Vec<PrComment>> {
        let pr = pr_number.to_string();
        let json = self.run(
            &["pr", "view", &pr, "--repo", repo, "--json", "comments"],
            QUERY_TIMEOUT,
        )?;

        #[derive(Deserialize)]
        struct CommentsOnly {
            #[serde(default)]
            comments: Vec<PrComment>,
        }
        let parsed: CommentsOnly = serde_json::from_str(&json)
            .map_err(|e| Error::TaskSource(format!("failed to parse pr comments: {e}")))?;
        Ok(parsed.comments)
    }

    /// Create a pull request and return its URL.
    pub fn pr_create(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<String> {
        let mut args = vec![
            "pr", "create", "--head", head, "--base", base, "--title", title, "--body", body,
        ];
        if draft {
            args.push("--draft");
        }
        let url = self.run(&args, MUTATE_TIMEOUT)?;
        Ok(url.trim().to_string())
    }

    /// Post a comment on a PR or issue.
    pub fn comment(&self, repo: &str, number: u64, body: &str) -> Result<()> {
        let n = number.to_string();
        self.run(
            &["issue", "comment", &n, "--repo", repo, "--body", body],
            MUTATE_TIMEOUT,
        )?;
        Ok(())
    }

    /// Open issues carrying a given label (up to `limit`).
    pub fn issue_list(&self, label: Option<&str>, limit: u32) -> Result<Vec<Issue>> {
        let limit_str = limit.to_string();
        let mut args = vec![
            "issue",
            "list",
            "--state",
            "open",
            "--json",
            "number,title,body,labels,url",
            "--limit",
            &limit_str,
        ];
        if let Some(label) = label {
            args.push("--label");
            args.push(label);
        }
        let json = self.run(&args, QUERY_TIMEOUT)?;
        let issues: Vec<Issue> = serde_json::from_str(&json)
            .map_err(|e| Error::TaskSource(format!("failed to parse issue list: {e}")))?;
        Ok(issues)
    }

    /// Number of the open PR whose head is `branch`, if any.
    pub fn pr_number_for_branch(&self, branch: &str) -> Result<Option<u64>> {
        let json = self.run(
            &[
                "pr", "list", "--head", branch, "--state", "open", "--json", "number",
            ],
            QUERY_TIMEOUT,
        )?;

        #[derive(Deserialize)]
        struct Num {
            number: u64,
        }
        let prs: Vec<Num> = serde_json::from_str(&json)
            .map_err(|e| Error::TaskSource(format!("failed to parse pr list: {e}")))?;
        Ok(prs.first().map(|p| p.number))
    }

    /// Full details for one issue.
    pub fn issue_view(&self, number: u64) -> Result<Issue> {
        let n = number.to_string();
        let json = self.run(
            &["issue", "view", &n, "--json", "number,title,body,labels,url"],
            QUERY_TIMEOUT,
        )?;
        let issue: Issue = serde_json::from_str(&json)
            .map_err(|e| Error::TaskSource(format!("failed to parse issue view: {e}")))?;
        Ok(issue)
    }
}

impl Default for GhCli {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Queue-backed mock: each `run` call pops the next canned response.
    pub struct MockGhClient {
        responses: Mutex<Vec<Result<String>>>,
        pub calls: Mutex<Vec<Vec<String>>>,
    }

    impl MockGhClient {
        pub fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl GhClient for MockGhClient {
        fn run(&self, args: &[&str], _timeout: Duration) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(Error::TaskSource("no more mock responses".to_string()))
            } else {
                responses.remove(0)
            }
        }
    }
}
