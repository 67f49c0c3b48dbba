use std::sync::Arc;
use std::time::Duration;

use jsonschema::Validator;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sift_core::article::BackoffConfig;
use sift_core::error::{AppError, ClassificationError};
use sift_core::models::{Article, Verdict};
use sift_core::retry::with_backoff;
use sift_core::traits::Classifier;

pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const DEFAULT_MODEL: &str = "deepseek-chat";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_SYSTEM_PROMPT: &str = "You are a news editor screening articles for a daily digest. \
Rate each article's quality (credibility, depth, information value) and relevance to the alert topic, \
each from 0 to 10, and decide whether it should be included. \
Respond ONLY with a JSON object with the keys: quality (number), relevance (number), pass (boolean), \
rationale (string), category (string), key_points (array of strings).";

/// Older prompts used these names; they are folded into the current keys.
const KEY_ALIASES: [(&str, &str); 4] = [
    ("is_selected", "pass"),
    ("quality_score", "quality"),
    ("relevance_score", "relevance"),
    ("reason", "rationale"),
];

fn verdict_schema() -> Value {
    json!({
        "type": "object",
        "required": ["quality", "relevance", "pass"],
        "properties": {
            "quality": {"type": "number", "minimum": 0, "maximum": 10},
            "relevance": {"type": "number", "minimum": 0, "maximum": 10},
            "pass": {"type": "boolean"},
            "rationale": {"type": "string"},
            "category": {"type": "string"},
            "key_points": {"type": "array", "items": {"type": "string"}}
        }
    })
}

/// OpenAI-compatible chat client that scores articles.
///
/// Works with any OpenAI-compatible API, including:
/// - DeepSeek (`https://api.deepseek.com/v1`)
/// - OpenAI directly (`https://api.openai.com/v1`)
#[derive(Clone)]
pub struct OpenAiClassifier {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    system_prompt: String,
    backoff: BackoffConfig,
    validator: Arc<Validator>,
}

impl OpenAiClassifier {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let rebuilt = Self::build(&self.api_key, &self.model, &self.base_url, timeout)?;
        Ok(Self {
            system_prompt: self.system_prompt,
            backoff: self.backoff,
            ..rebuilt
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        if api_key.trim().is_empty() {
            return Err(AppError::ConfigError("classifier API key is empty".into()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        let validator = jsonschema::validator_for(&verdict_schema())
            .map_err(|e| AppError::ConfigError(format!("verdict schema: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            backoff: BackoffConfig::default(),
            validator: Arc::new(validator),
        })
    }

    /// One chat completion round trip. Returns the assistant message text.
    async fn complete(&self, article: &Article) -> Result<String, AppError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: user_prompt(article),
                },
            ],
            response_format: Some(ResponseFormat {
                format_type: "json_object".to_string(),
            }),
            temperature: 0.1,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {}", e))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();

            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {}: {}", status_code, body));

            return Err(match status_code {
                401 | 403 => AppError::AuthError {
                    message,
                    status_code,
                },
                429 => AppError::RateLimitExceeded,
                _ => AppError::LlmError {
                    message,
                    status_code,
                    retryable: status_code >= 500,
                },
            });
        }

        // A body cut short by the transport is transient; only a complete but
        // unparseable body is malformed.
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else {
                AppError::NetworkError(format!("Failed to read LLM response: {}", e))
            }
        })?;
        let chat_response: ChatResponse = serde_json::from_slice(&body).map_err(|e| {
            AppError::MalformedResponse(format!("Failed to parse LLM response: {}", e))
        })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AppError::MalformedResponse("Empty response from LLM".into()))
    }

    /// Turn the assistant text into a validated verdict.
    pub fn parse_verdict(&self, content: &str) -> Result<Verdict, AppError> {
        let object = outermost_object(content).ok_or_else(|| {
            AppError::MalformedResponse(format!("no JSON object in response: {}", excerpt(content)))
        })?;

        let mut value: Value = serde_json::from_str(object).map_err(|e| {
            AppError::MalformedResponse(format!("invalid JSON: {}. Raw: {}", e, excerpt(object)))
        })?;
        if let Value::Object(map) = &mut value {
            apply_aliases(map);
        }

        if !self.validator.is_valid(&value) {
            let errors: Vec<String> = self
                .validator
                .iter_errors(&value)
                .map(|e| e.to_string())
                .collect();
            return Err(AppError::MalformedResponse(errors.join("; ")));
        }

        let raw: RawVerdict = serde_json::from_value(value)
            .map_err(|e| AppError::MalformedResponse(e.to_string()))?;
        let verdict = Verdict {
            quality: raw.quality,
            relevance: raw.relevance,
            pass: raw.pass,
            rationale: raw.rationale,
            category: raw.category,
            key_points: raw.key_points,
        };
        verdict.validate()?;
        Ok(verdict)
    }
}

impl Classifier for OpenAiClassifier {
    async fn classify(&self, article: &Article) -> Result<Verdict, ClassificationError> {
        let content = with_backoff(&self.backoff, || self.complete(article)).await?;
        let verdict = self.parse_verdict(&content)?;
        tracing::debug!(
            article_id = %article.id,
            model = %self.model,
            quality = verdict.quality,
            relevance = verdict.relevance,
            pass = verdict.pass,
            "Verdict parsed"
        );
        Ok(verdict)
    }
}

fn user_prompt(article: &Article) -> String {
    let mut prompt = format!(
        "Alert topic: {}\nTitle: {}\nSource: {}\nURL: {}\n",
        article.alert_subject, article.title, article.source, article.url
    );
    if let Some(hint) = &article.publish_hint {
        prompt.push_str(&format!("Published: {hint}\n"));
    }
    if !article.summary.is_empty() {
        prompt.push_str(&format!("Summary: {}\n", article.summary));
    }
    prompt
}

/// Slice from the first `{` to the last `}`, tolerating prose and code fences.
fn outermost_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

fn apply_aliases(map: &mut Map<String, Value>) {
    for (legacy, current) in KEY_ALIASES {
        if !map.contains_key(current) {
            if let Some(value) = map.remove(legacy) {
                map.insert(current.to_string(), value);
            }
        }
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(200).collect()
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    temperature: f32,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Deserialize)]
struct RawVerdict {
    quality: f64,
    relevance: f64,
    pass: bool,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    key_points: Vec<String>,
}
