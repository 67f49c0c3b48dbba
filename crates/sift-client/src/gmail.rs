use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sift_core::error::AppError;
use sift_core::models::RawMessage;
use sift_core::traits::MailSource;
use url::Url;

pub const DEFAULT_GMAIL_URL: &str = "https://gmail.googleapis.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: u32 = 100;

/// Gmail REST mailbox reader.
///
/// Takes an already issued OAuth access token; obtaining and refreshing it
/// is the caller's business.
#[derive(Clone)]
pub struct GmailSource {
    client: Client,
    base_url: String,
    access_token: String,
    max_messages: usize,
}

impl GmailSource {
    pub fn new(access_token: &str) -> Result<Self, AppError> {
        Self::with_base_url(access_token, DEFAULT_GMAIL_URL)
    }

    pub fn with_base_url(access_token: &str, base_url: &str) -> Result<Self, AppError> {
        if access_token.trim().is_empty() {
            return Err(AppError::ConfigError("Gmail access token is empty".into()));
        }
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            max_messages: 500,
        })
    }

    /// Upper bound on message ids listed per fetch.
    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = max.max(1);
        self
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, AppError> {
        let url = Url::parse_with_params(url, query)
            .map_err(|e| AppError::ConfigError(format!("invalid Gmail URL: {e}")))?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(DEFAULT_TIMEOUT.as_secs())
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {}", e))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::AuthError {
                    message: format!("Gmail rejected the access token: {body}"),
                    status_code: status.as_u16(),
                },
                _ => AppError::MailError(format!("HTTP {}: {}", status.as_u16(), body)),
            });
        }

        response
            .json()
            .await
            .map_err(|e| AppError::MailError(format!("Failed to parse Gmail response: {e}")))
    }

    async fn list_ids(&self, query: &str) -> Result<Vec<String>, AppError> {
        let url = format!("{}/gmail/v1/users/me/messages", self.base_url);
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("q", query.to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let page: ListResponse = self.get_json(&url, &params).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(token) if ids.len() < self.max_messages => page_token = Some(token),
                _ => break,
            }
        }

        ids.truncate(self.max_messages);
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, AppError> {
        let url = format!("{}/gmail/v1/users/me/messages/{}", self.base_url, id);
        let message: GmailMessage = self
            .get_json(&url, &[("format", "full".to_string())])
            .await?;
        Ok(message.into_raw())
    }
}

impl MailSource for GmailSource {
    async fn fetch_messages(
        &self,
        sender_filter: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, AppError> {
        let query = search_query(sender_filter, since);
        let ids = self.list_ids(&query).await?;
        tracing::info!(%query, count = ids.len(), "Listed digest messages");

        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.get_message(id).await {
                Ok(message) => messages.push(message),
                // A rejected token fails every later call too.
                Err(e) if e.is_auth_failure() => return Err(e),
                Err(e) => {
                    tracing::warn!(message_id = %id, error = %e, "Skipping message");
                }
            }
        }
        Ok(messages)
    }
}

fn search_query(sender: &str, since: DateTime<Utc>) -> String {
    format!("from:{} after:{}", sender, since.format("%Y/%m/%d"))
}

// ---- Gmail API types ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    internal_date: Option<String>,
    payload: Option<MessagePart>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct PartBody {
    data: Option<String>,
}

#[derive(Default)]
struct Bodies {
    html: String,
    text: String,
}

impl GmailMessage {
    fn into_raw(self) -> RawMessage {
        let payload = self.payload.unwrap_or_default();
        let header = |name: &str| {
            payload
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.clone())
        };

        let received_at = header("Date")
            .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
            .map(|d| d.with_timezone(&Utc))
            .or_else(|| {
                self.internal_date
                    .as_deref()
                    .and_then(|ms| ms.parse::<i64>().ok())
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            })
            .unwrap_or_else(Utc::now);

        let subject = header("Subject").unwrap_or_default();
        let sender = header("From").unwrap_or_default();

        let mut bodies = Bodies::default();
        collect_bodies(&payload, &mut bodies);

        RawMessage {
            id: self.id,
            subject,
            sender,
            received_at,
            body_html: bodies.html,
            body_text: bodies.text,
        }
    }
}

/// Walk the MIME tree; the first `text/html` and `text/plain` parts win.
fn collect_bodies(part: &MessagePart, bodies: &mut Bodies) {
    if part.parts.is_empty() {
        let Some(decoded) = part
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(decode_part)
        else {
            return;
        };
        if part.mime_type.eq_ignore_ascii_case("text/html") {
            if bodies.html.is_empty() {
                bodies.html = decoded;
            }
        } else if bodies.text.is_empty() {
            bodies.text = decoded;
        }
        return;
    }

    for child in &part.parts {
        if !child.parts.is_empty() || child.mime_type.starts_with("text/") {
            collect_bodies(child, bodies);
        }
    }
}

fn decode_part(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
