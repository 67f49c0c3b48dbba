use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::article::PipelineConfig;
use crate::error::{AppError, ClassificationError};
use crate::models::{Article, Verdict};
use crate::report::{Report, ReportBuilder};
use crate::traits::{ArticleExtractor, ArticleRepository, Classifier, FailurePolicy, MailSource};

/// Stage of a pipeline run. Each stage commits before the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetching,
    Extracting,
    Persisting,
    Classifying,
    Reporting,
    Done,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStage::Fetching => "fetching",
            RunStage::Extracting => "extracting",
            RunStage::Persisting => "persisting",
            RunStage::Classifying => "classifying",
            RunStage::Reporting => "reporting",
            RunStage::Done => "done",
        };
        f.write_str(s)
    }
}

/// Which stages a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Fetch, extract and persist only.
    FetchOnly,
    /// Classify already stored articles.
    ClassifyOnly,
    /// Build a report from stored results.
    ReportOnly,
    Full,
}

impl RunMode {
    fn ingests(self) -> bool {
        matches!(self, RunMode::FetchOnly | RunMode::Full)
    }

    fn classifies(self) -> bool {
        matches!(self, RunMode::ClassifyOnly | RunMode::Full)
    }

    fn reports(self) -> bool {
        matches!(self, RunMode::ReportOnly | RunMode::Full)
    }
}

/// Events emitted by the pipeline for monitoring/logging.
#[derive(Debug, Clone)]
pub enum PipelineEvent<'a> {
    StageStarted {
        stage: RunStage,
    },
    Recovered {
        articles: u64,
    },
    MessagesFetched {
        count: usize,
    },
    EmailStored {
        message_id: &'a str,
        inserted: bool,
        candidates: usize,
        articles_inserted: usize,
        articles_skipped: usize,
    },
    BatchClaimed {
        size: usize,
    },
    ArticleCompleted {
        article_id: Uuid,
        title: &'a str,
        verdict: &'a Verdict,
    },
    ArticleFailed {
        article_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    StaleClaim {
        article_id: Uuid,
        error: &'a str,
    },
    ClassificationAborted {
        reason: &'a str,
        released: u64,
    },
    Cancelled {
        released: u64,
    },
    Finished {
        summary: &'a RunSummary,
    },
}

/// Trait for receiving pipeline events (decoupled logging).
pub trait PipelineReporter: Send + Sync {
    fn report(&self, event: PipelineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPipelineReporter;

impl PipelineReporter for TracingPipelineReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        match event {
            PipelineEvent::StageStarted { stage } => {
                tracing::debug!(%stage, "Stage started");
            }
            PipelineEvent::Recovered { articles } => {
                tracing::warn!(%articles, "Reset stale in-progress articles to pending");
            }
            PipelineEvent::MessagesFetched { count } => {
                tracing::info!(%count, "Fetched digest messages");
            }
            PipelineEvent::EmailStored {
                message_id,
                inserted,
                candidates,
                articles_inserted,
                articles_skipped,
            } => {
                tracing::info!(
                    %message_id,
                    %inserted,
                    %candidates,
                    %articles_inserted,
                    %articles_skipped,
                    "Digest stored"
                );
            }
            PipelineEvent::BatchClaimed { size } => {
                tracing::debug!(%size, "Claimed batch");
            }
            PipelineEvent::ArticleCompleted {
                article_id,
                title,
                verdict,
            } => {
                tracing::info!(
                    %article_id,
                    %title,
                    pass = verdict.pass,
                    quality = verdict.quality,
                    relevance = verdict.relevance,
                    "Article classified"
                );
            }
            PipelineEvent::ArticleFailed {
                article_id,
                error,
                will_retry,
            } => {
                tracing::warn!(%article_id, %error, %will_retry, "Classification failed");
            }
            PipelineEvent::StaleClaim { article_id, error } => {
                tracing::warn!(%article_id, %error, "Stale claim, skipping");
            }
            PipelineEvent::ClassificationAborted { reason, released } => {
                tracing::error!(%reason, %released, "Classification aborted");
            }
            PipelineEvent::Cancelled { released } => {
                tracing::info!(%released, "Classification cancelled");
            }
            PipelineEvent::Finished { summary } => {
                tracing::info!(
                    stage = %summary.stage,
                    errors = summary.errors.len(),
                    "Run finished"
                );
            }
        }
    }
}

/// Counters for the fetch/extract/persist stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub messages_fetched: usize,
    pub emails_inserted: usize,
    pub emails_seen: usize,
    pub candidates: usize,
    pub articles_inserted: usize,
    pub articles_skipped: usize,
}

/// Counters for the classification stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifySummary {
    pub claimed: usize,
    pub completed: usize,
    pub passed: usize,
    /// Transient failures put back to `pending`.
    pub retried: usize,
    /// Failures that left the article terminally `failed`.
    pub failed: usize,
    /// Completions or failures rejected because the claim was no longer held.
    pub stale: usize,
    /// Claimed articles handed back without an attempt (abort or cancel).
    pub released: u64,
    /// Set when a fatal error stopped the stage.
    pub aborted: Option<String>,
    pub cancelled: bool,
}

/// Outcome of a whole run. Always produced, even when a stage failed.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Last stage reached.
    pub stage: RunStage,
    pub recovered: u64,
    pub ingest: Option<IngestSummary>,
    pub classify: Option<ClassifySummary>,
    pub report: Option<Report>,
    /// Stage errors that did not stop the run.
    pub errors: Vec<String>,
}

/// Coordinates fetch → extract → persist → classify → report.
///
/// Generic over all external collaborators via traits; the classifier
/// provider is chosen by the caller at construction.
pub struct PipelineService<M, X, C, R>
where
    M: MailSource,
    X: ArticleExtractor,
    C: Classifier,
    R: ArticleRepository,
{
    mail: M,
    extractor: X,
    classifier: C,
    repo: R,
    config: PipelineConfig,
}

impl<M, X, C, R> PipelineService<M, X, C, R>
where
    M: MailSource,
    X: ArticleExtractor,
    C: Classifier,
    R: ArticleRepository,
{
    pub fn new(mail: M, extractor: X, classifier: C, repo: R, config: PipelineConfig) -> Self {
        Self {
            mail,
            extractor,
            classifier,
            repo,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the stages selected by `mode` over the window starting at `since`.
    ///
    /// Stage errors are recorded in the summary; later stages still run on
    /// whatever state was committed.
    pub async fn run<PR: PipelineReporter>(
        &self,
        mode: RunMode,
        since: DateTime<Utc>,
        cancel_token: &CancellationToken,
        reporter: &PR,
    ) -> RunSummary {
        let mut summary = RunSummary {
            stage: RunStage::Fetching,
            recovered: 0,
            ingest: None,
            classify: None,
            report: None,
            errors: Vec::new(),
        };

        if mode.classifies() {
            match self.recover(reporter).await {
                Ok(n) => summary.recovered = n,
                Err(e) => summary.errors.push(format!("recovery: {e}")),
            }
        }

        if mode.ingests() {
            match self.ingest(since, reporter).await {
                Ok(ingest) => summary.ingest = Some(ingest),
                Err(e) => {
                    tracing::error!(error = %e, "Ingestion failed");
                    summary.errors.push(format!("ingest: {e}"));
                }
            }
        }

        if mode.classifies() && !cancel_token.is_cancelled() {
            summary.stage = RunStage::Classifying;
            match self.classify_pending(cancel_token, reporter).await {
                Ok(classify) => {
                    if let Some(reason) = &classify.aborted {
                        summary.errors.push(format!("classify: {reason}"));
                    }
                    summary.classify = Some(classify);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Classification stage failed");
                    summary.errors.push(format!("classify: {e}"));
                }
            }
        }

        if mode.reports() {
            summary.stage = RunStage::Reporting;
            reporter.report(PipelineEvent::StageStarted {
                stage: RunStage::Reporting,
            });
            match self.report(since).await {
                Ok(report) => summary.report = Some(report),
                Err(e) => summary.errors.push(format!("report: {e}")),
            }
        }

        summary.stage = RunStage::Done;
        reporter.report(PipelineEvent::Finished { summary: &summary });
        summary
    }

    /// Reset articles left `in_progress` by a crashed run.
    pub async fn recover<PR: PipelineReporter>(&self, reporter: &PR) -> Result<u64, AppError> {
        let cutoff = Utc::now() - self.config.stale_after;
        let recovered = self.repo.recover_stale(cutoff).await?;
        if recovered > 0 {
            reporter.report(PipelineEvent::Recovered {
                articles: recovered,
            });
        }
        Ok(recovered)
    }

    /// Fetch messages since `since`, extract candidates and persist both.
    ///
    /// Safe to repeat over the same window: emails dedup on message id and
    /// articles on URL.
    pub async fn ingest<PR: PipelineReporter>(
        &self,
        since: DateTime<Utc>,
        reporter: &PR,
    ) -> Result<IngestSummary, AppError> {
        let mut summary = IngestSummary::default();

        reporter.report(PipelineEvent::StageStarted {
            stage: RunStage::Fetching,
        });
        let messages = self
            .mail
            .fetch_messages(&self.config.sender_filter, since)
            .await?;
        summary.messages_fetched = messages.len();
        reporter.report(PipelineEvent::MessagesFetched {
            count: messages.len(),
        });

        reporter.report(PipelineEvent::StageStarted {
            stage: RunStage::Extracting,
        });
        let extracted: Vec<_> = messages
            .iter()
            .map(|message| (message, self.extractor.extract(message)))
            .collect();

        reporter.report(PipelineEvent::StageStarted {
            stage: RunStage::Persisting,
        });
        for (message, candidates) in extracted {
            let (email, inserted) = self.repo.store_email(message).await?;
            if inserted {
                summary.emails_inserted += 1;
            } else {
                summary.emails_seen += 1;
            }

            // Articles are stored even for known emails so an interrupted
            // earlier run is completed.
            let stored = self.repo.store_articles(&email, &candidates).await?;
            summary.candidates += candidates.len();
            summary.articles_inserted += stored.inserted;
            summary.articles_skipped += stored.skipped;

            reporter.report(PipelineEvent::EmailStored {
                message_id: &email.message_id,
                inserted,
                candidates: candidates.len(),
                articles_inserted: stored.inserted,
                articles_skipped: stored.skipped,
            });
        }

        Ok(summary)
    }

    /// Claim and classify pending articles until none remain, the per-run
    /// limit is hit, a fatal error occurs, or the token is cancelled.
    pub async fn classify_pending<PR: PipelineReporter>(
        &self,
        cancel_token: &CancellationToken,
        reporter: &PR,
    ) -> Result<ClassifySummary, AppError> {
        reporter.report(PipelineEvent::StageStarted {
            stage: RunStage::Classifying,
        });

        let mut summary = ClassifySummary::default();
        let mut remaining = self.config.article_limit;

        'batches: while remaining > 0 {
            if cancel_token.is_cancelled() {
                summary.cancelled = true;
                reporter.report(PipelineEvent::Cancelled { released: 0 });
                break;
            }

            let batch = self
                .repo
                .claim_pending(self.config.batch_size.min(remaining))
                .await?;
            if batch.is_empty() {
                break;
            }
            remaining -= batch.len();
            summary.claimed += batch.len();
            reporter.report(PipelineEvent::BatchClaimed { size: batch.len() });

            for (i, article) in batch.iter().enumerate() {
                if cancel_token.is_cancelled() {
                    let released = self.release_rest(&batch[i..]).await;
                    summary.released += released;
                    summary.cancelled = true;
                    reporter.report(PipelineEvent::Cancelled { released });
                    break 'batches;
                }

                match self.classify_with_timeout(article).await {
                    Ok(verdict) => self.record_verdict(article, &verdict, &mut summary, reporter).await,
                    Err(e) if e.is_fatal() => {
                        let reason = e.to_string();
                        let released = self.release_rest(&batch[i..]).await;
                        summary.released += released;
                        summary.aborted = Some(reason.clone());
                        reporter.report(PipelineEvent::ClassificationAborted {
                            reason: &reason,
                            released,
                        });
                        break 'batches;
                    }
                    Err(e) => self.record_failure(article, &e, &mut summary, reporter).await,
                }

                if !self.config.call_delay.is_zero() {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.call_delay) => {}
                        () = cancel_token.cancelled() => {}
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Build the report for completed articles finished since `since`.
    pub async fn report(&self, since: DateTime<Utc>) -> Result<Report, AppError> {
        let completed = self.repo.query_completed(since).await?;
        Ok(ReportBuilder::new(self.config.top_n).build(&completed, since))
    }

    async fn classify_with_timeout(&self, article: &Article) -> Result<Verdict, ClassificationError> {
        match tokio::time::timeout(self.config.call_timeout, self.classifier.classify(article)).await {
            Ok(result) => result,
            Err(_) => Err(ClassificationError::Transient(format!(
                "classification timed out after {}s",
                self.config.call_timeout.as_secs()
            ))),
        }
    }

    async fn record_verdict<PR: PipelineReporter>(
        &self,
        article: &Article,
        verdict: &Verdict,
        summary: &mut ClassifySummary,
        reporter: &PR,
    ) {
        match self.repo.complete(article.id, verdict).await {
            Ok(_) => {
                summary.completed += 1;
                if verdict.pass {
                    summary.passed += 1;
                }
                reporter.report(PipelineEvent::ArticleCompleted {
                    article_id: article.id,
                    title: &article.title,
                    verdict,
                });
            }
            Err(AppError::NotFound(msg)) => {
                summary.stale += 1;
                reporter.report(PipelineEvent::StaleClaim {
                    article_id: article.id,
                    error: &msg,
                });
            }
            Err(e) => {
                // Left in_progress; the recovery sweep picks it up.
                tracing::error!(article_id = %article.id, error = %e, "Failed to store verdict");
            }
        }
    }

    async fn record_failure<PR: PipelineReporter>(
        &self,
        article: &Article,
        err: &ClassificationError,
        summary: &mut ClassifySummary,
        reporter: &PR,
    ) {
        let policy = if err.is_retryable() {
            FailurePolicy::Retriable {
                max_attempts: self.config.max_attempts,
                retry_at: Utc::now() + self.config.retry_delay,
            }
        } else {
            FailurePolicy::Terminal
        };
        let error_msg = err.to_string();

        match self.repo.fail(article.id, &error_msg, policy).await {
            Ok(updated) => {
                let will_retry = !updated.status.is_terminal();
                if will_retry {
                    summary.retried += 1;
                } else {
                    summary.failed += 1;
                }
                reporter.report(PipelineEvent::ArticleFailed {
                    article_id: article.id,
                    error: &error_msg,
                    will_retry,
                });
            }
            Err(AppError::NotFound(msg)) => {
                summary.stale += 1;
                reporter.report(PipelineEvent::StaleClaim {
                    article_id: article.id,
                    error: &msg,
                });
            }
            Err(e) => {
                tracing::error!(article_id = %article.id, error = %e, "Failed to record failure");
            }
        }
    }

    async fn release_rest(&self, articles: &[Article]) -> u64 {
        let ids: Vec<Uuid> = articles.iter().map(|a| a.id).collect();
        match self.repo.release(&ids).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, count = ids.len(), "Failed to release claimed articles");
                0
            }
        }
    }
}
