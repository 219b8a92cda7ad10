use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Application,
    Interview,
    Offer,
    Rejection,
    Assessment,
    #[default]
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Application,
        Category::Interview,
        Category::Offer,
        Category::Rejection,
        Category::Assessment,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Application => "application",
            Category::Interview => "interview",
            Category::Offer => "offer",
            Category::Rejection => "rejection",
            Category::Assessment => "assessment",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown category '{}'", s))
    }
}

/// Per-user mailbox connection, owned by the account subsystem.
///
/// `connected == true` implies `refresh_token.is_some()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credential {
    pub user_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub connected: bool,
    pub account_email: Option<String>,
}

/// Result of a one-shot authorization-code exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expiry: DateTime<Utc>,
}

/// One provider message after parsing, before it is bound to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEmail {
    pub provider_message_id: String,
    pub thread_id: Option<String>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub snippet: String,
    pub body: String,
    pub date: DateTime<Utc>,
    pub labels: Vec<String>,
    pub is_read: bool,
    pub category: Category,
    pub company: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// A persisted email row. `starred` is user-owned and survives re-ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEmail {
    pub id: i64,
    pub user_id: String,
    pub provider_message_id: String,
    pub thread_id: Option<String>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub snippet: String,
    pub body: String,
    pub date: DateTime<Utc>,
    pub labels: Vec<String>,
    pub is_read: bool,
    pub category: Category,
    pub company: Option<String>,
    pub starred: bool,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct EmailFilter {
    pub category: Option<Category>,
    pub starred_only: bool,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmailStats {
    pub total: i64,
    pub unread: i64,
    pub recent: i64,
    pub by_category: BTreeMap<Category, i64>,
    pub by_company: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub account_email: Option<String>,
}

/// Outcome of one sync run. `ingested` counts only rows actually persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub fetched: usize,
    pub ingested: usize,
    pub skipped: usize,
}

/// A claim on a user's sync slot, held in the credential store so that every
/// process sharing the database sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLease {
    pub user_id: String,
    pub acquired_at: DateTime<Utc>,
}
