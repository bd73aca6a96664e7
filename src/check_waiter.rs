use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::gh::{GhCli, PrSnapshot, RawCheck};

/// Waiter defaults.
pub const DEFAULT_CI_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_BOT_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(15);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(120);
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;
pub const CIRCUIT_BREAKER_RESET: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    Pending,
    Running,
    Skipped,
    TimedOut,
    Unknown,
}

impl CheckStatus {
    pub fn is_concluded(&self) -> bool {
        matches!(
            self,
            CheckStatus::Passed | CheckStatus::Failed | CheckStatus::Skipped | CheckStatus::TimedOut
        )
    }
}

/// Classify one rollup entry. GitHub's two check APIs diverge: check runs
/// carry `status`/`conclusion`, commit statuses carry `state`; both are
/// handled explicitly.
pub fn classify_check(raw: &RawCheck) -> CheckStatus {
    if let Some(conclusion) = raw.conclusion.as_deref().filter(|c| !c.is_empty()) {
        return match conclusion.to_uppercase().as_str() {
            "SUCCESS" | "NEUTRAL" => CheckStatus::Passed,
            "FAILURE" | "ERROR" | "CANCELLED" => CheckStatus::Failed,
            "SKIPPED" => CheckStatus::Skipped,
            "TIMED_OUT" => CheckStatus::TimedOut,
            _ => CheckStatus::Unknown,
        };
    }

    if let Some(status) = raw.status.as_deref().filter(|s| !s.is_empty()) {
        return match status.to_uppercase().as_str() {
            "QUEUED" | "IN_PROGRESS" | "WAITING" | "PENDING" | "REQUESTED" => CheckStatus::Running,
            // Completed with no conclusion: count it as passed.
            "COMPLETED" => CheckStatus::Passed,
            _ => CheckStatus::Unknown,
        };
    }

    if let Some(state) = raw.state.as_deref().filter(|s| !s.is_empty()) {
        return match state.to_uppercase().as_str() {
            "PENDING" | "QUEUED" | "IN_PROGRESS" => CheckStatus::Running,
            "SUCCESS" => CheckStatus::Passed,
            "FAILURE" | "ERROR" => CheckStatus::Failed,
            _ => CheckStatus::Unknown,
        };
    }

    CheckStatus::Pending
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckSnapshot {
    pub name: String,
    pub status: CheckStatus,
    pub conclusion: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub login: String,
    pub responded: bool,
    pub responded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStatus {
    Success,
    CiFailed,
    Timeout,
    Cancelled,
    PrClosed,
    PrMerged,
    ForcePush { old_sha: String, new_sha: String },
    CircuitOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitResult {
    pub status: WaitStatus,
    pub checks: Vec<CheckSnapshot>,
    pub bot_statuses: Vec<BotStatus>,
    pub failures: Vec<CheckSnapshot>,
    pub elapsed_secs: f64,
    pub poll_count: u32,
    pub final_head_sha: Option<String>,
    pub pr_state: Option<String>,
    pub error: Option<String>,
    /// Bots are informational-only: their timeout is recorded here and
    /// never fails the wait.
    pub bot_wait_timed_out: bool,
}

// --- Circuit breaker --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-instance failure gate: consecutive fetch failures open the circuit
/// for a cool-down, after which one probe is allowed.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset: Duration) -> Self {
        Self {
            threshold,
            reset,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(opened) if opened.elapsed() >= self.reset => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    pub fn allows_call(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Returns true when this failure tripped the circuit open.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold && self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
            return true;
        }
        false
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

// --- Waiter -----------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WaiterConfig {
    pub ci_timeout: Duration,
    pub bot_timeout: Duration,
    pub poll_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub breaker_threshold: u32,
    pub breaker_reset: Duration,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            ci_timeout: DEFAULT_CI_TIMEOUT,
            bot_timeout: DEFAULT_BOT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            breaker_threshold: CIRCUIT_BREAKER_THRESHOLD,
            breaker_reset: CIRCUIT_BREAKER_RESET,
        }
    }
}

/// Cooperative cancellation shared between the waiter and its owner.
#[derive(Clone, Default)]
pub struct CancellationFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        self.notify.notified().await
    }
}

/// Polls CI checks and expected bot comments until everything concludes,
/// the PR changes state underneath us, or a timeout elapses.
pub struct CheckWaiter<'a> {
    gh: &'a GhCli,
    config: WaiterConfig,
    cancellation: CancellationFlag,
}

impl<'a> CheckWaiter<'a> {
    pub fn new(gh: &'a GhCli) -> Self {
        Self {
            gh,
            config: WaiterConfig::default(),
            cancellation: CancellationFlag::new(),
        }
    }

    pub fn with_config(mut self, config: WaiterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.backoff_cap)
    }

    /// Wait for PR `pr_number` on `repo`. `initial_sha` anchors force-push
    /// detection; `expected_bots` is the login list the waiter also gates on.
    pub async fn wait_for_checks(
        &self,
        repo: &str,
        pr_number: u64,
        initial_sha: &str,
        expected_bots: &[String],
    ) -> Result<WaitResult> {
        let started = Instant::now();
        let wait_start_utc = chrono::Utc::now();
        let mut breaker =
            CircuitBreaker::new(self.config.breaker_threshold, self.config.breaker_reset);
        let mut poll_count: u32 = 0;
        let mut bot_wait_started: Option<Instant> = None;
        let mut bot_wait_timed_out = false;
        let mut last_checks: Vec<CheckSnapshot> = Vec::new();
        let mut last_bots: Vec<BotStatus> = Vec::new();
        let mut last_sha: Option<String> = None;
        let mut last_state: Option<String> = None;

        let result = |status,
                      checks: &[CheckSnapshot],
                      bots: &[BotStatus],
                      sha: &Option<String>,
                      state: &Option<String>,
                      error: Option<String>,
                      bot_timed_out: bool,
                      polls: u32| {
            let failures = checks
                .iter()
                .filter(|c| c.status == CheckStatus::Failed || c.status == CheckStatus::TimedOut)
                .cloned()
                .collect();
            WaitResult {
                status,
                checks: checks.to_vec(),
                bot_statuses: bots.to_vec(),
                failures,
                elapsed_secs: started.elapsed().as_secs_f64(),
                poll_count: polls,
                final_head_sha: sha.clone(),
                pr_state: state.clone(),
                error,
                bot_wait_timed_out: bot_timed_out,
            }
        };

        loop {
            // 1. Cancellation wins over everything.
            if self.cancellation.is_cancelled() {
                return Ok(result(
                    WaitStatus::Cancelled,
                    &last_checks,
                    &last_bots,
                    &last_sha,
                    &last_state,
                    None,
                    bot_wait_timed_out,
                    poll_count,
                ));
            }

            // 2. Timeouts.
            if started.elapsed() >= self.config.ci_timeout {
                return Ok(result(
                    WaitStatus::Timeout,
                    &last_checks,
                    &last_bots,
                    &last_sha,
                    &last_state,
                    Some("CI timeout elapsed".to_string()),
                    bot_wait_timed_out,
                    poll_count,
                ));
            }
            if let Some(bot_start) = bot_wait_started
                && !bot_wait_timed_out
                && bot_start.elapsed() >= self.config.bot_timeout
            {
                warn!(pr_number, "bot wait timed out; proceeding without bots");
                bot_wait_timed_out = true;
            }

            // 3. Fetch through the circuit breaker.
            if !breaker.allows_call() {
                return Ok(result(
                    WaitStatus::CircuitOpen,
                    &last_checks,
                    &last_bots,
                    &last_sha,
                    &last_state,
                    Some(format!(
                        "circuit open after {} consecutive failures",
                        breaker.failure_count()
                    )),
                    bot_wait_timed_out,
                    poll_count,
                ));
            }

            poll_count += 1;
            let snapshot = match self.gh.pr_snapshot(repo, pr_number) {
                Ok(snapshot) => {
                    breaker.record_success();
                    snapshot
                }
                Err(e) => {
                    let tripped = breaker.record_failure();
                    warn!(pr_number, error = %e, tripped, "PR status fetch failed");
                    if tripped {
                        return Ok(result(
                            WaitStatus::CircuitOpen,
                            &last_checks,
                            &last_bots,
                            &last_sha,
                            &last_state,
                            Some(e.to_string()),
                            bot_wait_timed_out,
                            poll_count,
                        ));
                    }
                    self.sleep_backoff(poll_count).await;
                    continue;
                }
            };

            last_sha = Some(snapshot.head_ref_oid.clone());
            last_state = Some(snapshot.state.clone());

            // 4. PR closed or merged mid-wait.
            if snapshot.is_merged() {
                return Ok(result(
                    WaitStatus::PrMerged,
                    &last_checks,
                    &last_bots,
                    &last_sha,
                    &last_state,
                    None,
                    bot_wait_timed_out,
                    poll_count,
                ));
            }
            if snapshot.is_closed() {
                return Ok(result(
                    WaitStatus::PrClosed,
                    &last_checks,
                    &last_bots,
                    &last_sha,
                    &last_state,
                    None,
                    bot_wait_timed_out,
                    poll_count,
                ));
            }

            // 5. Force push.
            if snapshot.head_ref_oid != initial_sha {
                info!(
                    pr_number,
                    old = initial_sha,
                    new = %snapshot.head_ref_oid,
                    "head SHA changed mid-wait"
                );
                return Ok(result(
                    WaitStatus::ForcePush {
                        old_sha: initial_sha.to_string(),
                        new_sha: snapshot.head_ref_oid.clone(),
                    },
                    &last_checks,
                    &last_bots,
                    &last_sha,
                    &last_state,
                    None,
                    bot_wait_timed_out,
                    poll_count,
                ));
            }

            // 6. Classify checks.
            last_checks = snapshot
                .status_check_rollup
                .iter()
                .map(|raw| CheckSnapshot {
                    name: raw.display_name(),
                    status: classify_check(raw),
                    conclusion: raw.conclusion.clone(),
                    url: raw.details_url.clone(),
                })
                .collect();
            let ci_concluded = last_checks.iter().all(|c| c.status.is_concluded());
            let ci_failed = last_checks
                .iter()
                .any(|c| c.status == CheckStatus::Failed || c.status == CheckStatus::TimedOut);

            // 7. Classify expected bots.
            last_bots = classify_bots(&snapshot, expected_bots, &wait_start_utc);
            let bots_done = bot_wait_timed_out || last_bots.iter().all(|b| b.responded);

            debug!(
                pr_number,
                poll = poll_count,
                ci_concluded,
                ci_failed,
                bots_done,
                "poll complete"
            );

            if ci_concluded {
                if bot_wait_started.is_none() {
                    bot_wait_started = Some(Instant::now());
                }
                if ci_failed {
                    return Ok(result(
                        WaitStatus::CiFailed,
                        &last_checks,
                        &last_bots,
                        &last_sha,
                        &last_state,
                        None,
                        bot_wait_timed_out,
                        poll_count,
                    ));
                }
                // 8. All CI green and all bots in (or timed out, recorded).
                if bots_done {
                    return Ok(result(
                        WaitStatus::Success,
                        &last_checks,
                        &last_bots,
                        &last_sha,
                        &last_state,
                        None,
                        bot_wait_timed_out,
                        poll_count,
                    ));
                }
            }

            // 9. Backoff sleep, cancellable.
            self.sleep_backoff(poll_count).await;
        }
    }

    async fn sleep_backoff(&self, attempt: u32) {
        let delay = self.backoff_delay(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancellation.wait() => {}
        }
    }
}

fn classify_bots(
    snapshot: &PrSnapshot,
    expected_bots: &[String],
    since: &chrono::DateTime<chrono::Utc>,
) -> Vec<BotStatus> {
    expected_bots
        .iter()
        .map(|login| {
            let response = snapshot.comments.iter().find(|c| {
                c.author.login == *login
                    && chrono::DateTime::parse_from_rfc3339(&c.created_at)
                        .map(|t| t.with_timezone(&chrono::Utc) >= *since)
                        .unwrap_or(true)
            });
            BotStatus {
                login: login.clone(),
                responded: response.is_some(),
                responded_at: response.map(|c| c.created_at.clone()),
            }
        })
        .collect()
}

/// Parse `GITHUB_EXPECTED_BOTS` (comma-separated logins).
pub fn expected_bots_from_env() -> Vec<String> {
    std::env::var("GITHUB_EXPECTED_BOTS")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
