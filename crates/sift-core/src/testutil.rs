//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::article::ArticleStatus;
use crate::error::{AppError, ClassificationError};
use crate::models::{
    Article, ArticleCandidate, DigestEmail, RawMessage, StoreStats, StoredArticles, Verdict,
};
use crate::pipeline::{PipelineEvent, PipelineReporter};
use crate::report::rank_order;
use crate::traits::{ArticleExtractor, ArticleRepository, Classifier, FailurePolicy, MailSource};

// ---------------------------------------------------------------------------
// MockMailSource
// ---------------------------------------------------------------------------

/// Mock mailbox returning a fixed set of messages.
#[derive(Clone)]
pub struct MockMailSource {
    messages: Arc<Mutex<Vec<RawMessage>>>,
    error: Arc<Mutex<Option<AppError>>>,
    fetches: Arc<Mutex<usize>>,
}

impl MockMailSource {
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages: Arc::new(Mutex::new(messages)),
            error: Arc::new(Mutex::new(None)),
            fetches: Arc::new(Mutex::new(0)),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// The first fetch fails with `error`.
    pub fn with_error(error: AppError) -> Self {
        let source = Self::empty();
        *source.error.lock().unwrap() = Some(error);
        source
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

impl MailSource for MockMailSource {
    async fn fetch_messages(
        &self,
        _sender_filter: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, AppError> {
        *self.fetches.lock().unwrap() += 1;
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .iter()
            .filter(|m| m.received_at >= since)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Mock extractor that turns every `<a href="…">title</a>` into a candidate.
#[derive(Clone, Default)]
pub struct MockExtractor;

impl MockExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl ArticleExtractor for MockExtractor {
    fn extract(&self, message: &RawMessage) -> Vec<ArticleCandidate> {
        message
            .body_html
            .split("<a href=\"")
            .skip(1)
            .filter_map(|chunk| {
                let (url, rest) = chunk.split_once('"')?;
                let title = rest.strip_prefix('>')?.split_once("</a>")?.0;
                Some(ArticleCandidate {
                    title: title.to_string(),
                    url: url.to_string(),
                    source: "Test Source".to_string(),
                    summary: String::new(),
                    publish_hint: None,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MockClassifier
// ---------------------------------------------------------------------------

/// Mock classifier. Each call pops the next queued response; once the queue
/// is empty, the fallback is returned.
#[derive(Clone)]
pub struct MockClassifier {
    responses: Arc<Mutex<VecDeque<Result<Verdict, ClassificationError>>>>,
    fallback: Result<Verdict, ClassificationError>,
    delay: Option<Duration>,
    pub calls: Arc<Mutex<Vec<Uuid>>>,
}

impl MockClassifier {
    /// Every article passes with quality 7 and relevance 7.
    pub fn passing() -> Self {
        Self::always(Ok(make_verdict(7.0, 7.0, true)))
    }

    pub fn always(result: Result<Verdict, ClassificationError>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            fallback: result,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_responses(responses: Vec<Result<Verdict, ClassificationError>>) -> Self {
        let classifier = Self::passing();
        classifier.responses.lock().unwrap().extend(responses);
        classifier
    }

    /// Sleep before answering (for timeout tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Classifier for MockClassifier {
    async fn classify(&self, article: &Article) -> Result<Verdict, ClassificationError> {
        self.calls.lock().unwrap().push(article.id);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

// ---------------------------------------------------------------------------
// MockRepository
// ---------------------------------------------------------------------------

/// In-memory repository with the same state rules as the Postgres one.
#[derive(Clone, Default)]
pub struct MockRepository {
    emails: Arc<Mutex<Vec<DigestEmail>>>,
    articles: Arc<Mutex<Vec<Article>>>,
}

impl MockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending article directly, bypassing ingestion.
    pub fn seed_pending(&self, url: &str) -> Uuid {
        let article = make_test_article(url);
        let id = article.id;
        self.articles.lock().unwrap().push(article);
        id
    }

    pub fn email_count(&self) -> usize {
        self.emails.lock().unwrap().len()
    }

    pub fn article_count(&self) -> usize {
        self.articles.lock().unwrap().len()
    }

    pub fn count_status(&self, status: ArticleStatus) -> usize {
        self.articles
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.status == status)
            .count()
    }

    pub fn all_articles(&self) -> Vec<Article> {
        self.articles.lock().unwrap().clone()
    }

    /// The single stored article; panics if there is not exactly one.
    pub fn only_article(&self) -> Article {
        let articles = self.articles.lock().unwrap();
        assert_eq!(articles.len(), 1, "expected exactly one article");
        articles[0].clone()
    }

    /// Move every claim timestamp back by `by`.
    pub fn backdate_claims(&self, by: TimeDelta) {
        for article in self.articles.lock().unwrap().iter_mut() {
            if let Some(claimed) = article.claimed_at {
                article.claimed_at = Some(claimed - by);
            }
        }
    }

    fn with_claimed<F>(&self, article_id: Uuid, update: F) -> Result<Article, AppError>
    where
        F: FnOnce(&mut Article),
    {
        let mut articles = self.articles.lock().unwrap();
        let article = articles
            .iter_mut()
            .find(|a| a.id == article_id && a.status == ArticleStatus::InProgress)
            .ok_or_else(|| AppError::NotFound(format!("article {article_id} is not in progress")))?;
        update(article);
        article.updated_at = Utc::now();
        Ok(article.clone())
    }
}

impl ArticleRepository for MockRepository {
    async fn store_email(&self, message: &RawMessage) -> Result<(DigestEmail, bool), AppError> {
        let mut emails = self.emails.lock().unwrap();
        if let Some(existing) = emails.iter().find(|e| e.message_id == message.id) {
            return Ok((existing.clone(), false));
        }
        let email = DigestEmail {
            id: Uuid::new_v4(),
            message_id: message.id.clone(),
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            received_at: message.received_at,
            body_html: message.body_html.clone(),
            body_text: message.body_text.clone(),
            created_at: Utc::now(),
        };
        emails.push(email.clone());
        Ok((email, true))
    }

    async fn store_articles(
        &self,
        email: &DigestEmail,
        candidates: &[ArticleCandidate],
    ) -> Result<StoredArticles, AppError> {
        let mut articles = self.articles.lock().unwrap();
        let mut stored = StoredArticles::default();
        for candidate in candidates {
            if articles.iter().any(|a| a.url == candidate.url) {
                stored.skipped += 1;
                continue;
            }
            let mut article = make_test_article(&candidate.url);
            article.email_id = email.id;
            article.title = candidate.title.clone();
            article.source = candidate.source.clone();
            article.summary = candidate.summary.clone();
            article.publish_hint = candidate.publish_hint.clone();
            article.alert_subject = email.subject.clone();
            article.alert_date = email.received_at;
            articles.push(article);
            stored.inserted += 1;
        }
        Ok(stored)
    }

    async fn claim_pending(&self, limit: usize) -> Result<Vec<Article>, AppError> {
        let now = Utc::now();
        let mut articles = self.articles.lock().unwrap();
        let claimed: Vec<Article> = articles
            .iter_mut()
            .filter(|a| {
                a.status == ArticleStatus::Pending && a.next_attempt_at.is_none_or(|t| t <= now)
            })
            .take(limit)
            .map(|a| {
                a.status = ArticleStatus::InProgress;
                a.claimed_at = Some(now);
                a.updated_at = now;
                a.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn complete(&self, article_id: Uuid, verdict: &Verdict) -> Result<Article, AppError> {
        self.with_claimed(article_id, |a| {
            a.status = ArticleStatus::Completed;
            a.quality = Some(verdict.quality);
            a.relevance = Some(verdict.relevance);
            a.pass = Some(verdict.pass);
            a.rationale = Some(verdict.rationale.clone());
            a.category = Some(verdict.category.clone());
            a.key_points = Some(verdict.key_points.clone());
            a.completed_at = Some(Utc::now());
        })
    }

    async fn fail(
        &self,
        article_id: Uuid,
        reason: &str,
        policy: FailurePolicy,
    ) -> Result<Article, AppError> {
        self.with_claimed(article_id, |a| {
            a.attempts += 1;
            a.last_error = Some(reason.to_string());
            a.claimed_at = None;
            match policy {
                FailurePolicy::Retriable {
                    max_attempts,
                    retry_at,
                } if a.attempts < max_attempts => {
                    a.status = ArticleStatus::Pending;
                    a.next_attempt_at = Some(retry_at);
                }
                _ => {
                    a.status = ArticleStatus::Failed;
                    a.next_attempt_at = None;
                    a.completed_at = Some(Utc::now());
                }
            }
        })
    }

    async fn release(&self, article_ids: &[Uuid]) -> Result<u64, AppError> {
        let mut articles = self.articles.lock().unwrap();
        let mut count = 0;
        for article in articles.iter_mut() {
            if article_ids.contains(&article.id) && article.status == ArticleStatus::InProgress {
                article.status = ArticleStatus::Pending;
                article.claimed_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn recover_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, AppError> {
        let mut articles = self.articles.lock().unwrap();
        let mut count = 0;
        for article in articles.iter_mut() {
            if article.status == ArticleStatus::InProgress
                && article.claimed_at.is_some_and(|t| t < claimed_before)
            {
                article.status = ArticleStatus::Pending;
                article.claimed_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_article(&self, article_id: Uuid) -> Result<Option<Article>, AppError> {
        let articles = self.articles.lock().unwrap();
        Ok(articles.iter().find(|a| a.id == article_id).cloned())
    }

    async fn query_stats(&self, since: Option<DateTime<Utc>>) -> Result<StoreStats, AppError> {
        let in_window = |t: DateTime<Utc>| since.is_none_or(|s| t >= s);
        let emails = self.emails.lock().unwrap();
        let articles = self.articles.lock().unwrap();
        let window: Vec<&Article> = articles.iter().filter(|a| in_window(a.created_at)).collect();
        let count = |status: ArticleStatus| window.iter().filter(|a| a.status == status).count() as u64;

        Ok(StoreStats {
            total_emails: emails.iter().filter(|e| in_window(e.received_at)).count() as u64,
            total_articles: window.len() as u64,
            pending: count(ArticleStatus::Pending),
            in_progress: count(ArticleStatus::InProgress),
            completed: count(ArticleStatus::Completed),
            failed: count(ArticleStatus::Failed),
            selected: window
                .iter()
                .filter(|a| a.status == ArticleStatus::Completed && a.pass == Some(true))
                .count() as u64,
        })
    }

    async fn query_top(&self, since: DateTime<Utc>, n: usize) -> Result<Vec<Article>, AppError> {
        let mut completed = self.query_completed(since).await?;
        completed.sort_by(rank_order);
        completed.truncate(n);
        Ok(completed)
    }

    async fn query_completed(&self, since: DateTime<Utc>) -> Result<Vec<Article>, AppError> {
        let articles = self.articles.lock().unwrap();
        Ok(articles
            .iter()
            .filter(|a| {
                a.status == ArticleStatus::Completed && a.completed_at.is_some_and(|t| t >= since)
            })
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock pipeline reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl PipelineReporter for MockReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        let label = match &event {
            PipelineEvent::StageStarted { stage } => format!("Stage:{stage}"),
            PipelineEvent::Recovered { .. } => "Recovered".into(),
            PipelineEvent::MessagesFetched { .. } => "MessagesFetched".into(),
            PipelineEvent::EmailStored { .. } => "EmailStored".into(),
            PipelineEvent::BatchClaimed { .. } => "BatchClaimed".into(),
            PipelineEvent::ArticleCompleted { .. } => "ArticleCompleted".into(),
            PipelineEvent::ArticleFailed { .. } => "ArticleFailed".into(),
            PipelineEvent::StaleClaim { .. } => "StaleClaim".into(),
            PipelineEvent::ClassificationAborted { .. } => "ClassificationAborted".into(),
            PipelineEvent::Cancelled { .. } => "Cancelled".into(),
            PipelineEvent::Finished { .. } => "Finished".into(),
        };
        self.events.lock().unwrap().push(label);
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Create a digest message received just now.
pub fn make_test_message(id: &str, body_html: &str) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        subject: "Google Alert - manufacturing".to_string(),
        sender: "googlealerts-noreply@google.com".to_string(),
        received_at: Utc::now(),
        body_html: body_html.to_string(),
        body_text: String::new(),
    }
}

/// Create a pending article for testing.
pub fn make_test_article(url: &str) -> Article {
    let now = Utc::now();
    Article {
        id: Uuid::new_v4(),
        email_id: Uuid::new_v4(),
        title: "Test article".to_string(),
        url: url.to_string(),
        source: "Test Source".to_string(),
        summary: String::new(),
        publish_hint: None,
        alert_subject: "Google Alert - manufacturing".to_string(),
        alert_date: now,
        status: ArticleStatus::Pending,
        quality: None,
        relevance: None,
        pass: None,
        rationale: None,
        category: None,
        key_points: None,
        attempts: 0,
        last_error: None,
        next_attempt_at: None,
        claimed_at: None,
        completed_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn make_verdict(quality: f64, relevance: f64, pass: bool) -> Verdict {
    Verdict {
        quality,
        relevance,
        pass,
        rationale: "test rationale".to_string(),
        category: "Manufacturing".to_string(),
        key_points: vec!["point".to_string()],
    }
}
