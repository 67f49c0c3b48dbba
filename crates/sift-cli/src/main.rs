mod render;

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sift_client::{AlertExtractor, GmailSource, OpenAiClassifier};
use sift_core::BackoffConfig;
use sift_core::traits::{ArticleRepository, Classifier, MailSource};
use sift_core::{
    AppError, Article, ClassificationError, PipelineConfig, PipelineService, RawMessage,
    ReportBuilder, RunMode, RunSummary, TracingPipelineReporter, Verdict,
};
use sift_db::{Database, DatabaseConfig, PgArticleRepository};

const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "sift", version, about = "Rank news alert digests with an LLM")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch digest emails and store their articles
    Fetch {
        #[command(flatten)]
        window: WindowArgs,

        #[command(flatten)]
        mail: MailArgs,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Classify stored pending articles
    Filter {
        #[command(flatten)]
        classifier: ClassifierArgs,

        #[command(flatten)]
        tuning: TuningArgs,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show the ranked report for recently classified articles
    Report {
        #[command(flatten)]
        window: WindowArgs,

        /// Number of articles in the ranked list
        #[arg(short, long, default_value_t = 5)]
        top: usize,

        /// Rank only articles that passed
        #[arg(long, default_value_t = false)]
        passed_only: bool,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Fetch, classify and report in one go
    Run {
        #[command(flatten)]
        window: WindowArgs,

        #[command(flatten)]
        mail: MailArgs,

        #[command(flatten)]
        classifier: ClassifierArgs,

        #[command(flatten)]
        tuning: TuningArgs,

        #[arg(short, long, default_value_t = 5)]
        top: usize,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show store counters and rates
    Stats {
        /// Restrict to emails received / articles stored in the last N days
        #[arg(short, long)]
        days: Option<i64>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Export classified articles as CSV
    Export {
        #[command(flatten)]
        window: WindowArgs,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct WindowArgs {
    /// Look back this many days
    #[arg(short, long, default_value_t = 7)]
    days: i64,
}

impl WindowArgs {
    fn since(&self) -> DateTime<Utc> {
        Utc::now() - TimeDelta::days(self.days.max(0))
    }
}

#[derive(Args)]
struct MailArgs {
    /// Gmail OAuth access token
    #[arg(long, env = "GMAIL_ACCESS_TOKEN", hide_env_values = true)]
    gmail_token: Option<String>,

    /// Only digests from this sender are fetched
    #[arg(long, env = "SIFT_SENDER", default_value = "googlealerts-noreply@google.com")]
    sender: String,
}

#[derive(Args)]
struct ClassifierArgs {
    /// API key for the classification service
    #[arg(long, env = "SIFT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model name
    #[arg(short, long, env = "SIFT_MODEL", default_value = sift_client::classifier::DEFAULT_MODEL)]
    model: String,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "SIFT_BASE_URL", default_value = sift_client::classifier::DEFAULT_BASE_URL)]
    base_url: String,

    /// Replace the built-in system prompt
    #[arg(long, env = "SIFT_SYSTEM_PROMPT")]
    system_prompt: Option<String>,

    /// Read the system prompt from a file (wins over --system-prompt)
    #[arg(long)]
    prompt_file: Option<PathBuf>,
}

#[derive(Args)]
struct TuningArgs {
    /// Maximum articles classified in this run
    #[arg(short, long, default_value_t = 50)]
    limit: usize,

    /// Articles claimed per round
    #[arg(long, default_value_t = 10)]
    batch_size: usize,

    /// Attempts before a transiently failing article is given up
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Upper bound for one classification, retries included (seconds)
    #[arg(long, default_value_t = 180)]
    timeout: u64,

    /// Pause between classifier calls (milliseconds)
    #[arg(long, default_value_t = 500)]
    delay_ms: u64,

    /// Retries inside one classification on transient errors
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

impl TuningArgs {
    fn apply(&self, config: PipelineConfig) -> PipelineConfig {
        config
            .with_article_limit(self.limit)
            .with_batch_size(self.batch_size)
            .with_max_attempts(self.max_attempts)
            .with_call_timeout(Duration::from_secs(self.timeout))
            .with_call_delay(Duration::from_millis(self.delay_ms))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sift=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch { window, mail, json } => {
            let repo = connect_db().await?;
            let config = PipelineConfig::default().with_sender_filter(mail.sender.clone());
            let service =
                PipelineService::new(gmail(&mail)?, AlertExtractor::new(), Unconfigured, repo, config);
            let summary = execute(&service, RunMode::FetchOnly, window.since()).await;
            print_summary(&summary, json)?;
        }
        Commands::Filter {
            classifier,
            tuning,
            json,
        } => {
            let repo = connect_db().await?;
            let config = tuning.apply(PipelineConfig::default());
            let service = PipelineService::new(
                Unconfigured,
                AlertExtractor::new(),
                build_classifier(&classifier, &tuning)?,
                repo,
                config,
            );
            let summary = execute(&service, RunMode::ClassifyOnly, Utc::now()).await;
            print_summary(&summary, json)?;
        }
        Commands::Report {
            window,
            top,
            passed_only,
            json,
        } => {
            let repo = connect_db().await?;
            cmd_report(&repo, window.since(), top, passed_only, json).await?;
        }
        Commands::Run {
            window,
            mail,
            classifier,
            tuning,
            top,
            json,
        } => {
            let repo = connect_db().await?;
            let config = tuning.apply(
                PipelineConfig::default()
                    .with_sender_filter(mail.sender.clone())
                    .with_top_n(top),
            );
            let service = PipelineService::new(
                gmail(&mail)?,
                AlertExtractor::new(),
                build_classifier(&classifier, &tuning)?,
                repo,
                config,
            );
            let summary = execute(&service, RunMode::Full, window.since()).await;
            print_summary(&summary, json)?;
        }
        Commands::Stats { days, json } => {
            let repo = connect_db().await?;
            let since = days.map(|d| Utc::now() - TimeDelta::days(d.max(0)));
            let stats = repo
                .query_stats(since)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{}", render::render_stats(&stats));
            }
        }
        Commands::Export { window, output } => {
            let repo = connect_db().await?;
            cmd_export(&repo, window.since(), output).await?;
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<PgArticleRepository> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db.article_repo())
}

fn gmail(args: &MailArgs) -> Result<GmailSource> {
    let token = args
        .gmail_token
        .as_deref()
        .context("GMAIL_ACCESS_TOKEN not set. Required to fetch digests.")?;
    GmailSource::new(token).map_err(|e| anyhow::anyhow!(e))
}

fn build_classifier(args: &ClassifierArgs, tuning: &TuningArgs) -> Result<OpenAiClassifier> {
    let api_key = args
        .api_key
        .as_deref()
        .context("SIFT_API_KEY not set. Required to classify articles.")?;

    let backoff = BackoffConfig::default().with_max_retries(tuning.retries);
    let per_attempt = attempt_timeout(Duration::from_secs(tuning.timeout), &backoff);
    let mut classifier = OpenAiClassifier::with_base_url(api_key, &args.model, &args.base_url)
        .and_then(|c| c.with_timeout(per_attempt))
        .map_err(|e| anyhow::anyhow!(e))?
        .with_backoff(backoff);

    let prompt = match &args.prompt_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?,
        ),
        None => args.system_prompt.clone(),
    };
    if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
        classifier = classifier.with_system_prompt(prompt);
    }

    tracing::info!(
        model = classifier.model(),
        attempt_timeout_secs = per_attempt.as_secs(),
        "Classifier ready"
    );
    Ok(classifier)
}

/// HTTP timeout for one request such that every in-call retry and its backoff
/// fit inside `call_timeout`.
fn attempt_timeout(call_timeout: Duration, backoff: &BackoffConfig) -> Duration {
    let waits: Duration = (1..=backoff.max_retries)
        .map(|retry| backoff.delay_for_retry(retry))
        .sum();
    let attempts = backoff.max_retries.saturating_add(1);
    (call_timeout.saturating_sub(waits) / attempts).max(MIN_ATTEMPT_TIMEOUT)
}

/// Run the pipeline until it finishes or Ctrl+C cancels it.
async fn execute<M, C>(
    service: &PipelineService<M, AlertExtractor, C, PgArticleRepository>,
    mode: RunMode,
    since: DateTime<Utc>,
) -> RunSummary
where
    M: MailSource,
    C: Classifier,
{
    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, finishing current article");
            signal_token.cancel();
        }
    });

    let summary = service
        .run(mode, since, &cancel_token, &TracingPipelineReporter)
        .await;
    signal.abort();
    summary
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print!("{}", render::render_summary(summary));
    }
    Ok(())
}

async fn cmd_report(
    repo: &PgArticleRepository,
    since: DateTime<Utc>,
    top: usize,
    passed_only: bool,
    json: bool,
) -> Result<()> {
    let completed = repo
        .query_completed(since)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    let report = ReportBuilder::new(top)
        .passed_only(passed_only)
        .build(&completed, since);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render::render_report(&report));
    }
    Ok(())
}

async fn cmd_export(
    repo: &PgArticleRepository,
    since: DateTime<Utc>,
    output: Option<PathBuf>,
) -> Result<()> {
    let completed: Vec<Article> = repo
        .query_completed(since)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let rows = match &output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            render::write_csv(file, &completed)?
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            let rows = render::write_csv(&mut lock, &completed)?;
            lock.flush()?;
            rows
        }
    };

    tracing::info!(rows, "Exported classified articles");
    Ok(())
}

/// Stand-in for a collaborator the chosen subcommand never calls.
#[derive(Clone, Copy)]
struct Unconfigured;

impl MailSource for Unconfigured {
    async fn fetch_messages(
        &self,
        _sender_filter: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, AppError> {
        Err(AppError::ConfigError("no mail source configured".into()))
    }
}

impl Classifier for Unconfigured {
    async fn classify(&self, _article: &Article) -> Result<Verdict, ClassificationError> {
        Err(ClassificationError::Auth("no classifier configured".into()))
    }
}
