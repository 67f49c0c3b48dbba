use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::article::ArticleStatus;
use crate::error::AppError;

/// Upper bound for quality and relevance scores.
pub const MAX_SCORE: f64 = 10.0;

/// A message as returned by the mail source, before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    /// Provider message id; the dedup key for digest emails.
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub body_html: String,
    pub body_text: String,
}

/// A stored digest email. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct DigestEmail {
    pub id: Uuid,
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub body_html: String,
    pub body_text: String,
    pub created_at: DateTime<Utc>,
}

/// An article reference found in a digest body, not yet deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleCandidate {
    pub title: String,
    pub url: String,
    pub source: String,
    pub summary: String,
    /// Raw publish-time text found next to the link ("3 hours ago").
    pub publish_hint: Option<String>,
}

/// A stored article and its classification state.
#[derive(Debug, Clone, Serialize)]
pub struct Article {
    pub id: Uuid,
    pub email_id: Uuid,
    pub title: String,
    pub url: String,
    pub source: String,
    pub summary: String,
    pub publish_hint: Option<String>,
    pub alert_subject: String,
    pub alert_date: DateTime<Utc>,
    pub status: ArticleStatus,
    pub quality: Option<f64>,
    pub relevance: Option<f64>,
    pub pass: Option<bool>,
    pub rationale: Option<String>,
    pub category: Option<String>,
    pub key_points: Option<Vec<String>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Not claimable before this instant (set after a transient failure).
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Article {
    /// Ranking key used by reports: quality plus relevance.
    pub fn composite_score(&self) -> f64 {
        self.quality.unwrap_or(0.0) + self.relevance.unwrap_or(0.0)
    }
}

/// A validated classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub quality: f64,
    pub relevance: f64,
    pub pass: bool,
    pub rationale: String,
    pub category: String,
    pub key_points: Vec<String>,
}

impl Verdict {
    /// Check score bounds. Anything outside `[0, 10]` is a malformed answer.
    pub fn validate(&self) -> Result<(), AppError> {
        for (name, score) in [("quality", self.quality), ("relevance", self.relevance)] {
            if !score.is_finite() || !(0.0..=MAX_SCORE).contains(&score) {
                return Err(AppError::MalformedResponse(format!(
                    "{name} score {score} outside [0, {MAX_SCORE}]"
                )));
            }
        }
        Ok(())
    }
}

/// Result of [`store_articles`](crate::traits::ArticleRepository::store_articles).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoredArticles {
    pub inserted: usize,
    /// Candidates whose URL was already present.
    pub skipped: usize,
}

/// Corpus counters for the stats mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_emails: u64,
    pub total_articles: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    /// Completed articles with a passing verdict.
    pub selected: u64,
}

impl StoreStats {
    /// Articles that carry a verdict. Failed articles never got one.
    pub fn classified(&self) -> u64 {
        self.completed
    }

    /// Share of articles that have been classified, `None` if there are none.
    pub fn filter_rate(&self) -> Option<f64> {
        ratio(self.classified(), self.total_articles)
    }

    /// Share of completed articles that passed, `None` if none completed.
    pub fn selection_rate(&self) -> Option<f64> {
        ratio(self.selected, self.completed)
    }
}

fn ratio(num: u64, den: u64) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
