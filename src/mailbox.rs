//! Mailbox client: search query construction, concurrent fetch and MIME
//! parsing into [`NormalizedEmail`].

use crate::classifier::Classifier;
use crate::config::SyncConfig;
use crate::error::{ParseError, ProviderError};
use crate::models::{Category, NormalizedEmail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, future, stream};
use google_gmail1::api::{Message, MessagePart};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static DATE_COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)\s*$").unwrap());

const UNREAD_LABEL: &str = "UNREAD";

/// Remote search and fetch calls. Every call carries its own access token;
/// implementations hold no per-user state.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn list_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<String>, ProviderError>;

    async fn get_message(&self, access_token: &str, id: &str) -> Result<Message, ProviderError>;
}

#[derive(Clone)]
pub struct MailboxClient {
    provider: Arc<dyn MailProvider>,
    classifier: Arc<Classifier>,
    window_days: u32,
    query_keyword_cap: usize,
    fetch_concurrency: usize,
    body_max_chars: usize,
}

impl MailboxClient {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        classifier: Arc<Classifier>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            provider,
            classifier,
            window_days: config.window_days,
            query_keyword_cap: config.query_keyword_cap,
            fetch_concurrency: config.fetch_concurrency.max(1),
            body_max_chars: config.body_max_chars,
        }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// `newer_than:<N>d ("kw1" OR "kw2" ...)`, limited to the configured
    /// number of keywords. Mail that only matches a later keyword is not
    /// found by the search at all.
    pub fn build_search_query(&self) -> String {
        let terms = self
            .classifier
            .query_terms(self.query_keyword_cap)
            .iter()
            .map(|k| format!("\"{}\"", k))
            .collect::<Vec<_>>()
            .join(" OR ");
        format!("newer_than:{}d ({})", self.window_days, terms)
    }

    /// Lists matching messages, fetches and parses each one, and drops the
    /// ones the classifier does not consider relevant. A message that fails
    /// to fetch or parse is logged and skipped.
    pub async fn fetch_emails(
        &self,
        access_token: &str,
        max_results: u32,
    ) -> Result<Vec<NormalizedEmail>, ProviderError> {
        let query = self.build_search_query();
        debug!(query = %query, max_results, "Searching mailbox");

        let ids = self
            .provider
            .list_message_ids(access_token, &query, max_results)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let provider = &self.provider;
        let body_max_chars = self.body_max_chars;
        let parsed: Vec<NormalizedEmail> = stream::iter(ids)
            .map(|id| async move {
                let message = match provider.get_message(access_token, &id).await {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(
                            message_id = %id,
                            error = %e,
                            "Skipping message that failed to fetch"
                        );
                        return None;
                    }
                };
                match parse_message(&message, body_max_chars) {
                    Ok(email) => Some(email),
                    Err(e) => {
                        warn!(message_id = %id, error = %e, "Skipping unparseable message");
                        None
                    }
                }
            })
            .buffered(self.fetch_concurrency)
            .filter_map(future::ready)
            .collect()
            .await;

        let total = parsed.len();
        let relevant: Vec<NormalizedEmail> = parsed
            .into_iter()
            .filter(|email| self.classifier.is_relevant(email))
            .collect();
        debug!(parsed = total, relevant = relevant.len(), "Fetched messages");

        Ok(relevant)
    }
}

fn header<'a>(part: &'a MessagePart, name: &str) -> Option<&'a str> {
    part.headers
        .as_deref()?
        .iter()
        .find(|h| {
            h.name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|h| h.value.as_deref())
}

fn required_header(
    part: Option<&MessagePart>,
    id: &str,
    name: &'static str,
) -> Result<String, ParseError> {
    part.and_then(|p| header(p, name))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ParseError::MissingHeader {
            id: id.to_string(),
            header: name,
        })
}

pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = DATE_COMMENT_RE.replace(value.trim(), "");
    DateTime::parse_from_rfc2822(&trimmed)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Decodes a provider body payload. Bodies arrive base64url-encoded; payloads
/// that are not valid base64 are taken as already-decoded text.
pub fn decode_body(data: &[u8]) -> String {
    use base64::{Engine as _, engine::general_purpose};

    let text = String::from_utf8_lossy(data);
    let trimmed = text.trim().trim_end_matches('=');
    let decoded = general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed));

    match decoded.map(String::from_utf8) {
        Ok(Ok(s)) => s,
        _ => text.into_owned(),
    }
}

/// Best-effort plain text: strips anything that looks like a tag and
/// collapses whitespace. Text without tags is returned unchanged.
pub fn strip_markup(body: &str) -> String {
    if !TAG_RE.is_match(body) {
        return body.to_string();
    }
    let without_tags = TAG_RE.replace_all(body, " ");
    WHITESPACE_RE
        .replace_all(&without_tags, " ")
        .trim()
        .to_string()
}

fn truncate_chars(s: String, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s,
    }
}

fn first_text_part(part: &MessagePart) -> Option<&MessagePart> {
    for child in part.parts.as_deref().unwrap_or_default() {
        if matches!(child.mime_type.as_deref(), Some("text/plain" | "text/html")) {
            return Some(child);
        }
        if let Some(found) = first_text_part(child) {
            return Some(found);
        }
    }
    None
}

fn extract_body(payload: &MessagePart) -> String {
    let inline = payload
        .body
        .as_ref()
        .and_then(|b| b.data.as_deref())
        .filter(|d| !d.is_empty());

    let data = match inline {
        Some(data) => Some(data),
        None => first_text_part(payload)
            .and_then(|p| p.body.as_ref())
            .and_then(|b| b.data.as_deref()),
    };

    data.map(decode_body).unwrap_or_default()
}

pub fn parse_message(
    message: &Message,
    body_max_chars: usize,
) -> Result<NormalizedEmail, ParseError> {
    let id = message
        .id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or(ParseError::MissingId)?;
    let payload = message.payload.as_ref();

    let from = required_header(payload, &id, "From")?;
    let subject = required_header(payload, &id, "Subject")?;
    let to = payload
        .and_then(|p| header(p, "To"))
        .unwrap_or_default()
        .to_string();

    let raw_date = payload.and_then(|p| header(p, "Date")).unwrap_or_default();
    let date = parse_date(raw_date).ok_or_else(|| ParseError::InvalidDate {
        id: id.clone(),
        value: raw_date.to_string(),
    })?;

    let body = payload.map(extract_body).unwrap_or_default();
    let body = truncate_chars(strip_markup(&body), body_max_chars);

    let labels = message.label_ids.clone().unwrap_or_default();
    let is_read = !labels.iter().any(|l| l == UNREAD_LABEL);

    Ok(NormalizedEmail {
        provider_message_id: id,
        thread_id: message.thread_id.clone(),
        from,
        to,
        subject,
        snippet: message.snippet.clone().unwrap_or_default(),
        body,
        date,
        labels,
        is_read,
        category: Category::Other,
        company: None,
        fetched_at: Utc::now(),
    })
}
