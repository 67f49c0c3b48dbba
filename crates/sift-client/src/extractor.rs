use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sift_core::models::{ArticleCandidate, RawMessage};
use sift_core::traits::ArticleExtractor;
use url::Url;

/// Source label used when no news-ish text sits next to a link.
pub const UNKNOWN_SOURCE: &str = "Unknown source";

const SOURCE_MARKERS: [&str; 5] = ["news", "新闻", "times", "post", "daily"];
const MAX_SOURCE_CHARS: usize = 100;
const SUMMARY_CHARS: std::ops::Range<usize> = 51..500;

/// Containers that group one alert item (title, source, snippet).
const ITEM_CONTAINERS: [&str; 7] = ["td", "li", "p", "div", "tr", "article", "section"];

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

static RE_PUBLISH_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|\d+\s*(?:小时|天|分钟|hours?|days?|minutes?)\s*(?:前|ago)",
    )
    .unwrap()
});

static RE_TEXT_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).unwrap());

/// Query parameters that only carry campaign tracking.
const TRACKING_PREFIXES: [&str; 2] = ["utm_", "ved"];

/// Extracts article references from Google Alert digest bodies.
///
/// HTML bodies are scanned for redirect links; plain-text bodies are used
/// only when there is no HTML. Never fails: unparseable input yields no
/// candidates.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertExtractor;

impl AlertExtractor {
    pub fn new() -> Self {
        Self
    }

    fn extract_html(&self, html: &str) -> Vec<ArticleCandidate> {
        let document = Html::parse_document(html);
        let mut candidates = Vec::new();

        for anchor in document.select(&ANCHOR) {
            let Some(href) = anchor.value().attr("href").map(str::trim) else {
                continue;
            };
            if !is_alert_link(href) {
                continue;
            }
            let Some(url) = resolve_target(href) else {
                continue;
            };

            let title = collapse_whitespace(&anchor.text().collect::<String>());
            if title.is_empty() {
                continue;
            }

            let container = item_container(&anchor);
            let own_text: Vec<&str> = anchor.text().map(str::trim).collect();
            let context: Vec<&str> = container
                .map(|c| {
                    c.text()
                        .map(str::trim)
                        .filter(|t| !t.is_empty() && !own_text.contains(t))
                        .collect()
                })
                .unwrap_or_default();

            let full_text = container
                .map(|c| c.text().collect::<Vec<_>>().join(" "))
                .unwrap_or_default();

            candidates.push(ArticleCandidate {
                title,
                url,
                source: find_source(&context),
                summary: find_summary(&context),
                publish_hint: find_publish_hint(&full_text),
            });
        }

        candidates
    }

    fn extract_text(&self, text: &str) -> Vec<ArticleCandidate> {
        let mut candidates = Vec::new();
        let mut previous_line: Option<&str> = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut found_url = false;
            for m in RE_TEXT_URL.find_iter(line) {
                found_url = true;
                let Some(url) = resolve_target(m.as_str()) else {
                    continue;
                };
                if is_google_chrome_link(&url) {
                    continue;
                }

                let before = line[..m.start()].trim().trim_end_matches(['-', ':', '<']).trim();
                let title = if !before.is_empty() {
                    before.to_string()
                } else if let Some(prev) = previous_line {
                    prev.to_string()
                } else {
                    Url::parse(&url)
                        .ok()
                        .and_then(|u| u.host_str().map(str::to_string))
                        .unwrap_or_else(|| url.clone())
                };

                candidates.push(ArticleCandidate {
                    title,
                    url,
                    source: UNKNOWN_SOURCE.to_string(),
                    summary: String::new(),
                    publish_hint: find_publish_hint(line),
                });
            }

            previous_line = if found_url { None } else { Some(line) };
        }

        candidates
    }
}

impl ArticleExtractor for AlertExtractor {
    fn extract(&self, message: &RawMessage) -> Vec<ArticleCandidate> {
        if !message.body_html.trim().is_empty() {
            self.extract_html(&message.body_html)
        } else {
            self.extract_text(&message.body_text)
        }
    }
}

fn is_alert_link(href: &str) -> bool {
    href.contains("google.com/url") || href.contains("news.google.com")
}

/// Google-owned pages linked from the digest itself (settings, feedback).
fn is_google_chrome_link(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .is_some_and(|host| {
            (host == "google.com" || host.ends_with(".google.com")) && host != "news.google.com"
        })
}

/// Follow a Google redirect to its real target and canonicalize it.
///
/// Returns `None` unless the final URL is absolute http(s).
pub fn resolve_target(href: &str) -> Option<String> {
    let parsed = Url::parse(href).ok()?;

    let is_redirect = parsed
        .host_str()
        .is_some_and(|h| h == "google.com" || h.ends_with(".google.com"))
        && parsed.path() == "/url";

    let target = if is_redirect {
        let param = |name: &str| {
            parsed
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        match param("url").or_else(|| param("q")) {
            Some(inner) => Url::parse(&inner).ok()?,
            None => parsed,
        }
    } else {
        parsed
    };

    if target.scheme() != "http" && target.scheme() != "https" {
        return None;
    }
    Some(canonicalize(target))
}

/// Drop the fragment and tracking parameters, sort the remaining query and
/// strip a trailing slash so equivalent links share one dedup key.
pub fn canonicalize(mut url: Url) -> String {
    url.set_fragment(None);

    if url.path().len() > 1 && url.path().ends_with('/') {
        let trimmed = url.path().trim_end_matches('/').to_string();
        url.set_path(&trimmed);
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PREFIXES.iter().any(|p| k.starts_with(p)))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    url.to_string()
}

/// Nearest ancestor that groups the alert item, else the direct parent.
fn item_container<'a>(anchor: &ElementRef<'a>) -> Option<ElementRef<'a>> {
    let mut current = anchor.parent();
    while let Some(node) = current {
        if let Some(el) = ElementRef::wrap(node) {
            if ITEM_CONTAINERS.contains(&el.value().name()) {
                return Some(el);
            }
        }
        current = node.parent();
    }
    anchor.parent().and_then(ElementRef::wrap)
}

fn find_source(context: &[&str]) -> String {
    context
        .iter()
        .find(|text| {
            text.chars().count() < MAX_SOURCE_CHARS && !text.starts_with("http") && {
                let lower = text.to_lowercase();
                SOURCE_MARKERS.iter().any(|m| lower.contains(m))
            }
        })
        .map(|t| t.to_string())
        .unwrap_or_else(|| UNKNOWN_SOURCE.to_string())
}

fn find_summary(context: &[&str]) -> String {
    context
        .iter()
        .find(|text| SUMMARY_CHARS.contains(&text.chars().count()))
        .map(|t| t.to_string())
        .unwrap_or_default()
}

fn find_publish_hint(text: &str) -> Option<String> {
    RE_PUBLISH_HINT.find(text).map(|m| m.as_str().to_string())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
