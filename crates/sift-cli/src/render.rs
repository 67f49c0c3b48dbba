use std::fmt::Write as _;
use std::io;

use sift_core::Article;
use sift_core::pipeline::{ClassifySummary, IngestSummary};
use sift_core::report::{Bucket, ScoreRange};
use sift_core::{Report, RunSummary, StoreStats};

pub const CSV_HEADER: [&str; 9] = [
    "title",
    "source",
    "url",
    "category",
    "quality",
    "relevance",
    "pass",
    "rationale",
    "key_points",
];

/// Percentage with one decimal, or `n/a` when the denominator was zero.
pub fn rate(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.1}%", v * 100.0),
        None => "n/a".to_string(),
    }
}

fn score(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.1}"),
        None => "n/a".to_string(),
    }
}

fn range(value: Option<ScoreRange>) -> String {
    match value {
        Some(r) => format!("{:.1} - {:.1}", r.min, r.max),
        None => "n/a".to_string(),
    }
}

fn buckets(out: &mut String, heading: &str, items: &[Bucket]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n{heading}:");
    for bucket in items {
        let _ = writeln!(out, "  {:<40} {}", bucket.label, bucket.count);
    }
}

pub fn render_report(report: &Report) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Report since {}",
        report.since.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(
        out,
        "  classified: {}  passed: {}  rejected: {}",
        report.total, report.passed, report.rejected
    );
    let _ = writeln!(
        out,
        "  mean quality: {}  mean relevance: {}",
        score(report.mean_quality),
        score(report.mean_relevance)
    );
    let _ = writeln!(
        out,
        "  quality range: {}  relevance range: {}",
        range(report.quality_range),
        range(report.relevance_range)
    );

    buckets(&mut out, "By source", &report.by_source);
    buckets(&mut out, "By category", &report.by_category);

    if report.top.is_empty() {
        let _ = writeln!(out, "\nNo classified articles in this window.");
        return out;
    }

    let _ = writeln!(out, "\nTop {}:", report.top.len());
    for item in &report.top {
        let mark = if item.pass { "PASS" } else { "----" };
        let _ = writeln!(
            out,
            "  {:>2}. [{}] Q{:.1} R{:.1} {}",
            item.rank, mark, item.quality, item.relevance, item.title
        );
        let _ = writeln!(
            out,
            "      {} | {} | {}",
            item.source,
            item.category.as_deref().unwrap_or("uncategorized"),
            item.url
        );
    }
    out
}

fn render_ingest(out: &mut String, ingest: &IngestSummary) {
    let _ = writeln!(
        out,
        "Fetched {} messages ({} new, {} already stored)",
        ingest.messages_fetched, ingest.emails_inserted, ingest.emails_seen
    );
    let _ = writeln!(
        out,
        "Extracted {} candidates: {} new articles, {} duplicates",
        ingest.candidates, ingest.articles_inserted, ingest.articles_skipped
    );
}

fn render_classify(out: &mut String, classify: &ClassifySummary) {
    let _ = writeln!(
        out,
        "Classified {} of {} claimed: {} passed, {} retrying, {} failed",
        classify.completed, classify.claimed, classify.passed, classify.retried, classify.failed
    );
    if classify.stale > 0 {
        let _ = writeln!(out, "  {} stale claims skipped", classify.stale);
    }
    if let Some(reason) = &classify.aborted {
        let _ = writeln!(
            out,
            "  aborted: {reason} ({} released)",
            classify.released
        );
    }
    if classify.cancelled {
        let _ = writeln!(out, "  cancelled ({} released)", classify.released);
    }
}

pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    if summary.recovered > 0 {
        let _ = writeln!(out, "Recovered {} stale claims", summary.recovered);
    }
    if let Some(ingest) = &summary.ingest {
        render_ingest(&mut out, ingest);
    }
    if let Some(classify) = &summary.classify {
        render_classify(&mut out, classify);
    }
    if let Some(report) = &summary.report {
        out.push('\n');
        out.push_str(&render_report(report));
    }
    if !summary.errors.is_empty() {
        let _ = writeln!(out, "\nErrors (stopped at {}):", summary.stage);
        for err in &summary.errors {
            let _ = writeln!(out, "  - {err}");
        }
    }
    out
}

pub fn render_stats(stats: &StoreStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Emails:       {}", stats.total_emails);
    let _ = writeln!(out, "Articles:     {}", stats.total_articles);
    let _ = writeln!(out, "  pending:     {}", stats.pending);
    let _ = writeln!(out, "  in progress: {}", stats.in_progress);
    let _ = writeln!(out, "  completed:   {}", stats.completed);
    let _ = writeln!(out, "  failed:      {}", stats.failed);
    let _ = writeln!(out, "Classified:   {}", stats.classified());
    let _ = writeln!(out, "Selected:     {}", stats.selected);
    let _ = writeln!(out, "Filter rate:    {}", rate(stats.filter_rate()));
    let _ = writeln!(out, "Selection rate: {}", rate(stats.selection_rate()));
    out
}

/// Write completed articles as CSV. Rows without a verdict are skipped.
pub fn write_csv<W: io::Write>(writer: W, articles: &[Article]) -> csv::Result<usize> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(CSV_HEADER)?;

    let mut rows = 0;
    for article in articles {
        let (Some(quality), Some(relevance), Some(pass)) =
            (article.quality, article.relevance, article.pass)
        else {
            continue;
        };
        let key_points = article
            .key_points
            .as_deref()
            .map(|points| points.join("; "))
            .unwrap_or_default();

        csv.write_record([
            article.title.as_str(),
            article.source.as_str(),
            article.url.as_str(),
            article.category.as_deref().unwrap_or(""),
            &format!("{quality:.1}"),
            &format!("{relevance:.1}"),
            if pass { "true" } else { "false" },
            article.rationale.as_deref().unwrap_or(""),
            &key_points,
        ])?;
        rows += 1;
    }

    csv.flush()?;
    Ok(rows)
}
