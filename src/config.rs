use serde::{Deserialize, Serialize};
use std::path::Path;

const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub oauth: OAuthConfig,
    pub sync: SyncConfig,
    pub classifier: ClassifierOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Google client secret JSON as downloaded from the cloud console.
    pub client_secret_path: String,
    /// Overrides the first redirect URI listed in the secret file.
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_results: u32,
    pub fetch_concurrency: usize,
    pub window_days: u32,
    /// Provider search queries have a length limit, so only the first
    /// `query_keyword_cap` relevance keywords go into the search expression.
    pub query_keyword_cap: usize,
    pub body_max_chars: usize,
    pub refresh_margin_secs: i64,
    /// A sync lease older than this is assumed abandoned by a crashed run.
    pub lease_timeout_secs: i64,
}

/// Replacement lists for the built-in classifier data. `None` keeps the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierOverrides {
    pub keywords: Option<Vec<String>>,
    pub companies: Option<Vec<String>>,
    pub generic_domains: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:placemail.db?mode=rwc".to_string(),
            oauth: OAuthConfig::default(),
            sync: SyncConfig::default(),
            classifier: ClassifierOverrides::default(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_secret_path: "credentials.json".to_string(),
            redirect_uri: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_results: 50,
            fetch_concurrency: 10,
            window_days: 30,
            query_keyword_cap: 20,
            body_max_chars: 5000,
            refresh_margin_secs: 5 * 60,
            lease_timeout_secs: 15 * 60,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(SETTINGS_FILE)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        use std::fs;
        match fs::read_to_string(path.as_ref()) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(
                        "Ignoring invalid {}: {}",
                        path.as_ref().display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
