use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("timed out acquiring lock on {path} after {timeout_ms}ms")]
    LockTimeout { path: PathBuf, timeout_ms: u64 },

    #[error("audit error: {0}")]
    Audit(String),

    #[error("worktree error: {0}")]
    Worktree(String),

    #[error("spec number error: {0}")]
    SpecNumber(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("bot detection error: {0}")]
    BotDetection(String),

    #[error("override error: {0}")]
    Override(String),

    #[error("duplicate detection error: {0}")]
    Duplicate(String),

    #[error("batch error: {0}")]
    Batch(String),

    #[error("check wait error: {0}")]
    CheckWait(String),

    #[error("review error: {0}")]
    Review(String),

    #[error("learning error: {0}")]
    Learning(String),

    #[error("autofix error: {0}")]
    Autofix(String),

    #[error("task source error: {0}")]
    TaskSource(String),

    #[error("agent runner error: {0}")]
    AgentRunner(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("prompt error: {0}")]
    Prompt(String),
}

impl Error {
    /// Whether the error represents a transient condition worth retrying.
    ///
    /// Auth failures and 4xx responses other than 408/429 are permanent;
    /// network hiccups, timeouts and 5xx are not.
    pub fn is_retryable(&self) -> bool {
        let msg = self.to_string().to_lowercase();
        if msg.contains("auth")
            || msg.contains("401")
            || msg.contains("403")
            || msg.contains("404")
            || msg.contains("422")
        {
            return false;
        }
        msg.contains("timeout")
            || msg.contains("timed out")
            || msg.contains("connection")
            || msg.contains("network")
            || msg.contains("temporarily")
            || msg.contains("rate limit")
            || msg.contains("408")
            || msg.contains("429")
            || msg.contains("500")
            || msg.contains("502")
            || msg.contains("503")
            || msg.contains("504")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
