pub mod article;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod traits;

#[cfg(test)]
pub mod testutil;

pub use article::{ArticleStatus, BackoffConfig, PipelineConfig};
pub use error::{AppError, ClassificationError};
pub use models::{
    Article, ArticleCandidate, DigestEmail, RawMessage, StoreStats, StoredArticles, Verdict,
    compute_hash,
};
pub use pipeline::{
    PipelineEvent, PipelineReporter, PipelineService, RunMode, RunStage, RunSummary,
    TracingPipelineReporter,
};
pub use report::{Report, ReportBuilder};
pub use traits::{ArticleExtractor, ArticleRepository, Classifier, FailurePolicy, MailSource};
