use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AppError, ClassificationError};
use crate::models::{
    Article, ArticleCandidate, DigestEmail, RawMessage, StoreStats, StoredArticles, Verdict,
};

/// Source of digest messages (e.g. a mailbox API).
///
/// Re-fetching the same window must be safe; dedup happens on `RawMessage::id`.
pub trait MailSource: Send + Sync + Clone {
    fn fetch_messages(
        &self,
        sender_filter: &str,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<RawMessage>, AppError>> + Send;
}

/// Turns a digest body into article candidates.
///
/// Implementations are pure: malformed input yields an empty list, never an error.
pub trait ArticleExtractor: Send + Sync + Clone {
    fn extract(&self, message: &RawMessage) -> Vec<ArticleCandidate>;
}

/// Scores one article through an external service.
pub trait Classifier: Send + Sync + Clone {
    fn classify(
        &self,
        article: &Article,
    ) -> impl Future<Output = Result<Verdict, ClassificationError>> + Send;
}

/// What happens to an article whose classification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Back to `pending`, claimable again from `retry_at`, unless the attempt
    /// count reaches `max_attempts`.
    Retriable {
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    },
    /// Straight to terminal `failed`.
    Terminal,
}

/// Durable store for digest emails and articles.
///
/// Implementations must make `claim_pending` exclusive across concurrent
/// callers, using a conditional `pending → in_progress` update (e.g.
/// `SELECT FOR UPDATE SKIP LOCKED`) rather than application locks.
pub trait ArticleRepository: Send + Sync + Clone {
    /// Insert the message if its id is unseen. Returns the stored record and
    /// whether this call created it.
    fn store_email(
        &self,
        message: &RawMessage,
    ) -> impl Future<Output = Result<(DigestEmail, bool), AppError>> + Send;

    /// Insert each candidate with an unseen URL as a `pending` article.
    fn store_articles(
        &self,
        email: &DigestEmail,
        candidates: &[ArticleCandidate],
    ) -> impl Future<Output = Result<StoredArticles, AppError>> + Send;

    /// Atomically move up to `limit` pending articles to `in_progress`.
    ///
    /// Returns fewer than `limit` (possibly none) when work runs out.
    fn claim_pending(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Article>, AppError>> + Send;

    /// Record a verdict. Fails with `NotFound` unless the article is `in_progress`.
    fn complete(
        &self,
        article_id: Uuid,
        verdict: &Verdict,
    ) -> impl Future<Output = Result<Article, AppError>> + Send;

    /// Record a failed attempt. Fails with `NotFound` unless the article is `in_progress`.
    fn fail(
        &self,
        article_id: Uuid,
        reason: &str,
        policy: FailurePolicy,
    ) -> impl Future<Output = Result<Article, AppError>> + Send;

    /// Return claimed articles to `pending` without counting an attempt.
    fn release(&self, article_ids: &[Uuid]) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Reset articles stuck `in_progress` since before `claimed_before`.
    fn recover_stale(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn get_article(
        &self,
        article_id: Uuid,
    ) -> impl Future<Output = Result<Option<Article>, AppError>> + Send;

    /// Counters over emails received and articles created since `since`
    /// (all time when `None`).
    fn query_stats(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<StoreStats, AppError>> + Send;

    /// Completed articles finished since `since`, best first.
    fn query_top(
        &self,
        since: DateTime<Utc>,
        n: usize,
    ) -> impl Future<Output = Result<Vec<Article>, AppError>> + Send;

    /// All completed articles finished since `since`.
    fn query_completed(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Article>, AppError>> + Send;
}
