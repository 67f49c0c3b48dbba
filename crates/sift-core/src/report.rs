//! Pure aggregation of classified articles into a ranked report.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::article::ArticleStatus;
use crate::models::Article;

/// One bucket of a frequency distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub label: String,
    pub count: usize,
}

/// Min/max of a score over the report window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
}

/// An entry of the top-N list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedArticle {
    pub rank: usize,
    pub id: Uuid,
    pub title: String,
    pub url: String,
    pub source: String,
    pub category: Option<String>,
    pub quality: f64,
    pub relevance: f64,
    pub pass: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Structured report; rendering is up to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub since: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub rejected: usize,
    /// `None` when the window holds no completed articles.
    pub mean_quality: Option<f64>,
    pub mean_relevance: Option<f64>,
    pub quality_range: Option<ScoreRange>,
    pub relevance_range: Option<ScoreRange>,
    pub by_source: Vec<Bucket>,
    pub by_category: Vec<Bucket>,
    pub top: Vec<RankedArticle>,
}

/// Builds [`Report`]s from completed articles.
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    top_n: usize,
    passed_only: bool,
}

impl ReportBuilder {
    pub fn new(top_n: usize) -> Self {
        Self {
            top_n,
            passed_only: false,
        }
    }

    /// Rank only articles with a passing verdict.
    pub fn passed_only(mut self, passed_only: bool) -> Self {
        self.passed_only = passed_only;
        self
    }

    /// Aggregate the completed articles among `articles`; others are ignored.
    pub fn build(&self, articles: &[Article], since: DateTime<Utc>) -> Report {
        let completed: Vec<&Article> = articles
            .iter()
            .filter(|a| a.status == ArticleStatus::Completed)
            .collect();

        let passed = completed.iter().filter(|a| a.pass == Some(true)).count();
        let qualities: Vec<f64> = completed.iter().filter_map(|a| a.quality).collect();
        let relevances: Vec<f64> = completed.iter().filter_map(|a| a.relevance).collect();

        let mut ranked: Vec<&Article> = completed
            .iter()
            .copied()
            .filter(|a| !self.passed_only || a.pass == Some(true))
            .collect();
        ranked.sort_by(|a, b| rank_order(a, b));

        let top = ranked
            .into_iter()
            .take(self.top_n)
            .enumerate()
            .map(|(i, a)| RankedArticle {
                rank: i + 1,
                id: a.id,
                title: a.title.clone(),
                url: a.url.clone(),
                source: a.source.clone(),
                category: a.category.clone(),
                quality: a.quality.unwrap_or(0.0),
                relevance: a.relevance.unwrap_or(0.0),
                pass: a.pass.unwrap_or(false),
                completed_at: a.completed_at,
            })
            .collect();

        Report {
            since,
            total: completed.len(),
            passed,
            rejected: completed.len() - passed,
            mean_quality: mean(&qualities),
            mean_relevance: mean(&relevances),
            quality_range: range(&qualities),
            relevance_range: range(&relevances),
            by_source: distribution(completed.iter().map(|a| a.source.as_str())),
            by_category: distribution(
                completed
                    .iter()
                    .filter_map(|a| a.category.as_deref())
                    .filter(|c| !c.is_empty()),
            ),
            top,
        }
    }
}

/// Composite score desc, then quality desc, relevance desc, earlier completion.
pub fn rank_order(a: &Article, b: &Article) -> Ordering {
    let desc = |x: f64, y: f64| y.partial_cmp(&x).unwrap_or(Ordering::Equal);
    desc(a.composite_score(), b.composite_score())
        .then_with(|| desc(a.quality.unwrap_or(0.0), b.quality.unwrap_or(0.0)))
        .then_with(|| desc(a.relevance.unwrap_or(0.0), b.relevance.unwrap_or(0.0)))
        .then_with(|| match (a.completed_at, b.completed_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn range(values: &[f64]) -> Option<ScoreRange> {
    let first = *values.first()?;
    Some(values.iter().fold(
        ScoreRange {
            min: first,
            max: first,
        },
        |acc, &v| ScoreRange {
            min: acc.min.min(v),
            max: acc.max.max(v),
        },
    ))
}

fn distribution<'a>(labels: impl Iterator<Item = &'a str>) -> Vec<Bucket> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for label in labels {
        *counts.entry(label).or_default() += 1;
    }
    let mut buckets: Vec<Bucket> = counts
        .into_iter()
        .map(|(label, count)| Bucket {
            label: label.to_string(),
            count,
        })
        .collect();
    buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    buckets
}
