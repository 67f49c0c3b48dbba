use chrono::{DateTime, Utc};
use sift_core::article::ArticleStatus;
use sift_core::error::AppError;
use sift_core::models::{
    Article, ArticleCandidate, DigestEmail, RawMessage, StoreStats, StoredArticles, Verdict,
    compute_hash,
};
use sift_core::traits::{ArticleRepository, FailurePolicy};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// PostgreSQL-backed store for digest emails and articles.
///
/// Claims use `SELECT FOR UPDATE SKIP LOCKED`; every state change after a
/// claim is guarded by `status = 'in_progress'`.
#[derive(Clone)]
pub struct PgArticleRepository {
    pool: Pool<Postgres>,
}

impl PgArticleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct DigestEmailRow {
    id: Uuid,
    message_id: String,
    subject: String,
    sender: String,
    received_at: DateTime<Utc>,
    body_html: String,
    body_text: String,
    created_at: DateTime<Utc>,
}

impl From<DigestEmailRow> for DigestEmail {
    fn from(row: DigestEmailRow) -> Self {
        DigestEmail {
            id: row.id,
            message_id: row.message_id,
            subject: row.subject,
            sender: row.sender,
            received_at: row.received_at,
            body_html: row.body_html,
            body_text: row.body_text,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ArticleRow {
    id: Uuid,
    email_id: Uuid,
    title: String,
    url: String,
    source: String,
    summary: String,
    publish_hint: Option<String>,
    alert_subject: String,
    alert_date: DateTime<Utc>,
    status: String,
    quality: Option<f64>,
    relevance: Option<f64>,
    pass: Option<bool>,
    rationale: Option<String>,
    category: Option<String>,
    key_points: Option<Json<Vec<String>>>,
    attempts: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ArticleRow> for Article {
    type Error = AppError;

    fn try_from(row: ArticleRow) -> Result<Self, Self::Error> {
        let status: ArticleStatus = row.status.parse().map_err(|e: String| {
            AppError::DatabaseError(format!("article {}: {e}", row.id))
        })?;

        Ok(Article {
            id: row.id,
            email_id: row.email_id,
            title: row.title,
            url: row.url,
            source: row.source,
            summary: row.summary,
            publish_hint: row.publish_hint,
            alert_subject: row.alert_subject,
            alert_date: row.alert_date,
            status,
            quality: row.quality,
            relevance: row.relevance,
            pass: row.pass,
            rationale: row.rationale,
            category: row.category,
            key_points: row.key_points.map(|Json(points)| points),
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            claimed_at: row.claimed_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_articles(rows: Vec<ArticleRow>) -> Result<Vec<Article>, AppError> {
    rows.into_iter().map(Article::try_from).collect()
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    total_emails: i64,
    total_articles: i64,
    pending: i64,
    in_progress: i64,
    completed: i64,
    failed: i64,
    selected: i64,
}

impl From<StatsRow> for StoreStats {
    fn from(row: StatsRow) -> Self {
        StoreStats {
            total_emails: row.total_emails as u64,
            total_articles: row.total_articles as u64,
            pending: row.pending as u64,
            in_progress: row.in_progress as u64,
            completed: row.completed as u64,
            failed: row.failed as u64,
            selected: row.selected as u64,
        }
    }
}

fn not_in_progress(article_id: Uuid) -> AppError {
    AppError::NotFound(format!("article {article_id} is not in progress"))
}

impl ArticleRepository for PgArticleRepository {
    async fn store_email(&self, message: &RawMessage) -> Result<(DigestEmail, bool), AppError> {
        let inserted = sqlx::query_as::<_, DigestEmailRow>(
            r#"
            INSERT INTO digest_emails (message_id, subject, sender, received_at, body_html, body_text)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&message.id)
        .bind(&message.subject)
        .bind(&message.sender)
        .bind(message.received_at)
        .bind(&message.body_html)
        .bind(&message.body_text)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing = sqlx::query_as::<_, DigestEmailRow>(
            r#"SELECT * FROM digest_emails WHERE message_id = $1"#,
        )
        .bind(&message.id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok((existing.into(), false))
    }

    async fn store_articles(
        &self,
        email: &DigestEmail,
        candidates: &[ArticleCandidate],
    ) -> Result<StoredArticles, AppError> {
        let mut stored = StoredArticles::default();

        for candidate in candidates {
            let result = sqlx::query(
                r#"
                INSERT INTO articles
                    (email_id, title, url, url_hash, source, summary, publish_hint,
                     alert_subject, alert_date)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (url_hash) DO NOTHING
                "#,
            )
            .bind(email.id)
            .bind(&candidate.title)
            .bind(&candidate.url)
            .bind(compute_hash(&candidate.url))
            .bind(&candidate.source)
            .bind(&candidate.summary)
            .bind(&candidate.publish_hint)
            .bind(&email.subject)
            .bind(email.received_at)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

            if result.rows_affected() == 1 {
                stored.inserted += 1;
            } else {
                stored.skipped += 1;
            }
        }

        Ok(stored)
    }

    async fn claim_pending(&self, limit: usize) -> Result<Vec<Article>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, ArticleRow>(
            r#"
            UPDATE articles
            SET status = 'in_progress', claimed_at = NOW(), updated_at = NOW()
            WHERE id IN (
                SELECT id FROM articles
                WHERE status = 'pending'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            RETURNING *
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let mut articles = into_articles(rows)?;
        articles.sort_by_key(|a| a.created_at);
        tracing::debug!(requested = limit, claimed = articles.len(), "Claimed pending articles");
        Ok(articles)
    }

    async fn complete(&self, article_id: Uuid, verdict: &Verdict) -> Result<Article, AppError> {
        let row = sqlx::query_as::<_, ArticleRow>(
            r#"
            UPDATE articles
            SET status = 'completed',
                quality = $2, relevance = $3, pass = $4,
                rationale = $5, category = $6, key_points = $7,
                last_error = NULL, next_attempt_at = NULL,
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            RETURNING *
            "#,
        )
        .bind(article_id)
        .bind(verdict.quality)
        .bind(verdict.relevance)
        .bind(verdict.pass)
        .bind(&verdict.rationale)
        .bind(&verdict.category)
        .bind(Json(&verdict.key_points))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.ok_or_else(|| not_in_progress(article_id))?.try_into()
    }

    async fn fail(
        &self,
        article_id: Uuid,
        reason: &str,
        policy: FailurePolicy,
    ) -> Result<Article, AppError> {
        let (max_attempts, retry_at) = match policy {
            FailurePolicy::Retriable {
                max_attempts,
                retry_at,
            } => (max_attempts as i32, Some(retry_at)),
            FailurePolicy::Terminal => (0, None),
        };

        // Back to pending only when retriable and below the ceiling.
        let row = sqlx::query_as::<_, ArticleRow>(
            r#"
            UPDATE articles
            SET
                status = CASE WHEN $4::timestamptz IS NOT NULL AND attempts + 1 < $3
                              THEN 'pending' ELSE 'failed' END,
                next_attempt_at = CASE WHEN $4::timestamptz IS NOT NULL AND attempts + 1 < $3
                                       THEN $4 ELSE NULL END,
                completed_at = CASE WHEN $4::timestamptz IS NOT NULL AND attempts + 1 < $3
                                    THEN NULL ELSE NOW() END,
                attempts = attempts + 1,
                last_error = $2,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            RETURNING *
            "#,
        )
        .bind(article_id)
        .bind(reason)
        .bind(max_attempts)
        .bind(retry_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.ok_or_else(|| not_in_progress(article_id))?.try_into()
    }

    async fn release(&self, article_ids: &[Uuid]) -> Result<u64, AppError> {
        if article_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE articles
            SET status = 'pending', claimed_at = NULL, updated_at = NOW()
            WHERE id = ANY($1) AND status = 'in_progress'
            "#,
        )
        .bind(article_ids)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn recover_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE articles
            SET status = 'pending', claimed_at = NULL, updated_at = NOW()
            WHERE status = 'in_progress' AND claimed_at < $1
            "#,
        )
        .bind(claimed_before)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() > 0 {
            tracing::debug!(
                recovered = result.rows_affected(),
                %claimed_before,
                "Reset stale claims"
            );
        }
        Ok(result.rows_affected())
    }

    async fn get_article(&self, article_id: Uuid) -> Result<Option<Article>, AppError> {
        let row = sqlx::query_as::<_, ArticleRow>(r#"SELECT * FROM articles WHERE id = $1"#)
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(Article::try_from).transpose()
    }

    async fn query_stats(&self, since: Option<DateTime<Utc>>) -> Result<StoreStats, AppError> {
        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM digest_emails
                 WHERE $1::timestamptz IS NULL OR received_at >= $1) AS total_emails,
                COUNT(*) AS total_articles,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'in_progress') AS in_progress,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'completed' AND pass) AS selected
            FROM articles
            WHERE $1::timestamptz IS NULL OR created_at >= $1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.into())
    }

    async fn query_top(&self, since: DateTime<Utc>, n: usize) -> Result<Vec<Article>, AppError> {
        let rows = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT * FROM articles
            WHERE status = 'completed' AND completed_at >= $1
            ORDER BY quality + relevance DESC, quality DESC, relevance DESC, completed_at ASC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        into_articles(rows)
    }

    async fn query_completed(&self, since: DateTime<Utc>) -> Result<Vec<Article>, AppError> {
        let rows = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT * FROM articles
            WHERE status = 'completed' AND completed_at >= $1
            ORDER BY completed_at ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        into_articles(rows)
    }
}
