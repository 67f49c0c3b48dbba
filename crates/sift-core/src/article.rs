use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

/// Classification status of an article.
///
/// Transitions: `pending → in_progress → {completed | failed}`, plus
/// `in_progress → pending` for a retriable failure below the attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Pending => "pending",
            ArticleStatus::InProgress => "in_progress",
            ArticleStatus::Completed => "completed",
            ArticleStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ArticleStatus::Completed | ArticleStatus::Failed)
    }
}

impl fmt::Display for ArticleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ArticleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ArticleStatus::Pending),
            "in_progress" => Ok(ArticleStatus::InProgress),
            "completed" => Ok(ArticleStatus::Completed),
            "failed" => Ok(ArticleStatus::Failed),
            _ => Err(format!("Unknown article status: {}", s)),
        }
    }
}

/// Exponential backoff for retries inside a single classifier call.
///
/// Delay for retry `n` (1-indexed) is `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        std::cmp::min(delay, self.max_delay)
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
}

/// Configuration threaded through the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Only messages from this sender are fetched.
    pub sender_filter: String,
    /// Articles claimed per `claim_pending` round.
    pub batch_size: usize,
    /// Maximum articles classified in one run.
    pub article_limit: usize,
    /// Attempts after which a transiently failing article becomes terminal.
    pub max_attempts: u32,
    /// Upper bound for one `classify` call, retries included.
    pub call_timeout: Duration,
    /// Pause between consecutive classifier calls.
    pub call_delay: Duration,
    /// Earliest re-claim of an article after a transient failure.
    pub retry_delay: TimeDelta,
    /// `in_progress` articles claimed longer ago than this are reset on startup.
    pub stale_after: TimeDelta,
    /// Size of the ranked list in reports.
    pub top_n: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sender_filter: "googlealerts-noreply@google.com".to_string(),
            batch_size: 10,
            article_limit: 50,
            max_attempts: 3,
            call_timeout: Duration::from_secs(180),
            call_delay: Duration::from_millis(500),
            retry_delay: TimeDelta::minutes(10),
            stale_after: TimeDelta::minutes(30),
            top_n: 5,
        }
    }
}

impl PipelineConfig {
    pub fn with_sender_filter(mut self, sender: impl Into<String>) -> Self {
        self.sender_filter = sender.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_article_limit(mut self, limit: usize) -> Self {
        self.article_limit = limit;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn with_retry_delay(mut self, delay: TimeDelta) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_stale_after(mut self, stale_after: TimeDelta) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_top_n(mut self, n: usize) -> Self {
        self.top_n = n;
        self
    }
}
