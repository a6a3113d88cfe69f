//! Translation gateway.
//!
//! One external call per message, regardless of how many languages are
//! needed. The gateway never fails its caller: any backend problem
//! (transport, HTTP status, unparsable response) is absorbed into
//! deterministic placeholder text after a bounded retry, so message
//! delivery is never blocked on translation backend health.

use crate::config::Config;
use crate::error::Error;
use crate::language::Language;
use crate::retry::{with_retry_if, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::warn;

/// Chat Completion request sent to the translation backend
#[derive(Debug, Serialize)]
struct TranslationRequest {
    model: String,
    messages: Vec<Message>,
    max_completion_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// Backend failures, private to the gateway. Both variants end in the
/// fallback path; neither is ever surfaced to the pipeline.
#[derive(Debug, ThisError)]
enum BackendError {
    #[error("translation backend error ({status:?}): {detail}")]
    Transient { status: Option<u16>, detail: String },

    #[error("malformed translation response: {0}")]
    Malformed(String),
}

/// Determine if a backend error is worth one more attempt.
///
/// Retry 429, 5xx, transport failures, and garbled responses; other 4xx
/// statuses (bad key, bad request) will not get better on retry.
fn is_retryable_error(error: &BackendError) -> bool {
    match error {
        BackendError::Transient { status: Some(status), .. } => {
            *status == 429 || *status >= 500
        }
        BackendError::Transient { status: None, .. } => true,
        BackendError::Malformed(_) => true,
    }
}

/// Client for the translation backend. Process-wide, read-only after
/// construction, shared across concurrent ingest calls.
pub struct TranslationClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    retry: RetryConfig,
}

impl TranslationClient {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::new(
            &config.translation_api_url,
            &config.translation_api_key,
            &config.translation_model,
            Duration::from_secs(config.translation_timeout_secs),
        )
    }

    pub fn new(
        api_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            retry: RetryConfig::translation(),
        })
    }

    /// Override the retry policy (used by tests to avoid real backoff delays).
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Translate `text` into every requested target language.
    ///
    /// The returned map always contains exactly one entry per requested
    /// target. Languages the backend could not serve get a bracketed
    /// language-tag placeholder in front of the original text.
    pub async fn translate(
        &self,
        text: &str,
        source: Language,
        targets: &BTreeSet<Language>,
    ) -> BTreeMap<Language, String> {
        if targets.is_empty() {
            return BTreeMap::new();
        }

        if targets.len() == 1 {
            let target = *targets.iter().next().expect("len checked above");
            return match self.request_single(text, source, target).await {
                Ok(translated) => BTreeMap::from([(target, translated)]),
                Err(e) => {
                    warn!("Translation to {} failed, using fallback: {}", target, e);
                    BTreeMap::from([(target, target.fallback_text(text))])
                }
            };
        }

        match self.request_batch(text, source, targets).await {
            Ok(parsed) => targets
                .iter()
                .map(|target| {
                    let translated = parsed.get(target).cloned().unwrap_or_else(|| {
                        warn!("Backend omitted {}, backfilling with fallback", target);
                        target.fallback_text(text)
                    });
                    (*target, translated)
                })
                .collect(),
            Err(e) => {
                warn!("Batch translation failed, using fallback for all targets: {}", e);
                targets
                    .iter()
                    .map(|target| (*target, target.fallback_text(text)))
                    .collect()
            }
        }
    }

    /// Single-target request: the backend answers with bare translated text.
    async fn request_single(
        &self,
        text: &str,
        source: Language,
        target: Language,
    ) -> Result<String, BackendError> {
        let system = format!(
            "You are a professional translator. Translate the user's message from {} to {}. \
             Respond with only the translated text: no quotes, no code fences, no explanation.",
            source.name(),
            target.name()
        );
        let raw = self.send_chat(&system, text, &format!("Translation to {}", target)).await?;
        Ok(sanitize_single(&raw))
    }

    /// Batch request: the backend answers with a JSON object keyed by
    /// language code. Parsed strictly; anything outside that shape is
    /// malformed.
    async fn request_batch(
        &self,
        text: &str,
        source: Language,
        targets: &BTreeSet<Language>,
    ) -> Result<BTreeMap<Language, String>, BackendError> {
        let names = targets
            .iter()
            .map(|t| format!("{} (\"{}\")", t.name(), t.code()))
            .collect::<Vec<_>>()
            .join(", ");
        let system = format!(
            "You are a professional translator. Translate the user's message from {} into each \
             of these languages: {}. Respond with a single JSON object mapping each language \
             code to its translation, for example {{\"es\": \"...\"}}. Only return the JSON \
             object, no other text.",
            source.name(),
            names
        );
        let raw = self.send_chat(&system, text, "Batch translation").await?;
        parse_batch(&raw)
    }

    /// Issue one chat-completion call with the bounded retry policy.
    async fn send_chat(
        &self,
        system_prompt: &str,
        user_text: &str,
        operation_name: &str,
    ) -> Result<String, BackendError> {
        let request = TranslationRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user_text.to_string(),
                },
            ],
            max_completion_tokens: 2048,
            temperature: 0.3,
        };

        with_retry_if(
            &self.retry,
            operation_name,
            || async {
                let response = self
                    .http
                    .post(&self.api_url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .header("Content-Type", "application/json")
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| BackendError::Transient {
                        status: None,
                        detail: format!("failed to send request: {e}"),
                    })?;

                let status = response.status();
                if !status.is_success() {
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|e| format!("<failed to read body: {e}>"));
                    return Err(BackendError::Transient {
                        status: Some(status.as_u16()),
                        detail: body,
                    });
                }

                let chat_response: ChatResponse = response
                    .json()
                    .await
                    .map_err(|e| BackendError::Malformed(format!("bad response body: {e}")))?;

                chat_response
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| BackendError::Malformed("response contained no choices".into()))
            },
            is_retryable_error,
        )
        .await
    }
}

/// Narrow sanitizer for the single-target case: the backend is supposed to
/// answer with bare text but often wraps it in code fences or quotes.
fn sanitize_single(raw: &str) -> String {
    let mut text = raw.trim();

    // Fenced block, possibly with a language tag on the opening fence
    if let Some(rest) = text.strip_prefix("```") {
        let rest = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        };
        text = rest.strip_suffix("```").unwrap_or(rest).trim();
    }

    // One pair of surrounding quotes
    for (open, close) in [('"', '"'), ('\u{201c}', '\u{201d}')] {
        if text.len() >= 2 && text.starts_with(open) && text.ends_with(close) {
            text = text[open.len_utf8()..text.len() - close.len_utf8()].trim();
            break;
        }
    }

    text.to_string()
}

/// Strict parser for the batch case. The document must be a JSON object
/// whose values are all strings; anything else is malformed. Keys that are
/// not known language codes are dropped at the boundary.
fn parse_batch(raw: &str) -> Result<BTreeMap<Language, String>, BackendError> {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```") {
        let stripped = stripped.strip_prefix("json").unwrap_or(stripped);
        text = stripped.strip_suffix("```").unwrap_or(stripped).trim();
    }

    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| BackendError::Malformed(format!("not valid JSON: {e}")))?;

    let object = value
        .as_object()
        .ok_or_else(|| BackendError::Malformed("expected a JSON object".to_string()))?;

    let mut parsed = BTreeMap::new();
    for (key, entry) in object {
        let translated = entry.as_str().ok_or_else(|| {
            BackendError::Malformed(format!("value for '{key}' is not a string"))
        })?;
        match Language::from_code(key) {
            Ok(language) => {
                parsed.insert(language, translated.to_string());
            }
            Err(_) => warn!("Backend returned unknown language code '{}', ignoring", key),
        }
    }

    Ok(parsed)
}
