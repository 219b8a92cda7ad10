use crate::config::OAuthConfig;
use crate::error::{AuthError, SyncError};
use crate::models::{Credential, RefreshedToken, TokenGrant};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;
use yup_oauth2::{ApplicationSecret, read_application_secret};

/// Read-only mailbox access plus the account address.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/userinfo.email",
];

const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Token endpoint operations. Credentials are passed in on every call.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError>;

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<RefreshedToken, AuthError>;

    async fn account_email(&self, access_token: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: Option<String>,
}

pub struct GoogleAuth {
    secret: ApplicationSecret,
    redirect_uri: String,
    http: reqwest::Client,
}

impl GoogleAuth {
    pub async fn load(config: &OAuthConfig) -> Result<Self, AuthError> {
        let secret = read_application_secret(&config.client_secret_path)
            .await
            .map_err(|e| {
                AuthError::Configuration(format!(
                    "failed to read {}: {}",
                    config.client_secret_path, e
                ))
            })?;
        Self::new(secret, config.redirect_uri.clone())
    }

    pub fn new(secret: ApplicationSecret, redirect_uri: Option<String>) -> Result<Self, AuthError> {
        let redirect_uri = redirect_uri
            .or_else(|| secret.redirect_uris.first().cloned())
            .ok_or_else(|| AuthError::Configuration("no redirect URI configured".to_string()))?;

        Ok(Self {
            secret,
            redirect_uri,
            http: reqwest::Client::new(),
        })
    }

    /// Consent URL for `user_id`. The user id travels in `state` so the
    /// callback can be attributed without a session, and `prompt=consent`
    /// makes every connect issue a fresh refresh token.
    pub fn authorization_url(&self, user_id: &str) -> Result<String, AuthError> {
        let scope = SCOPES.join(" ");
        let url = Url::parse_with_params(
            &self.secret.auth_uri,
            &[
                ("client_id", self.secret.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", user_id),
            ],
        )
        .map_err(|e| AuthError::Configuration(format!("invalid auth_uri: {}", e)))?;

        Ok(url.into())
    }

    async fn post_token(&self, params: &[(&str, &str)]) -> Result<TokenResponse, String> {
        let response = self
            .http
            .post(&self.secret.token_uri)
            .form(params)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Token endpoint returned {}: {}", status, text);
            return Err(format!("{}: {}", status, text));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| e.to_string())
    }
}

fn expiry_from(expires_in: Option<i64>) -> DateTime<Utc> {
    Utc::now() + Duration::seconds(expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS))
}

#[async_trait]
impl AuthProvider for GoogleAuth {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError> {
        debug!("Exchanging authorization code");
        let token = self
            .post_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("client_id", self.secret.client_id.as_str()),
                ("client_secret", self.secret.client_secret.as_str()),
            ])
            .await
            .map_err(AuthError::Exchange)?;

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expiry: expiry_from(token.expires_in),
        })
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<RefreshedToken, AuthError> {
        let token = self
            .post_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.secret.client_id.as_str()),
                ("client_secret", self.secret.client_secret.as_str()),
            ])
            .await
            .map_err(AuthError::Refresh)?;

        Ok(RefreshedToken {
            access_token: token.access_token,
            expiry: expiry_from(token.expires_in),
        })
    }

    async fn account_email(&self, access_token: &str) -> Result<String, AuthError> {
        let info: UserInfo = self
            .http
            .get(USERINFO_URL)
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        info.email
            .ok_or_else(|| AuthError::Exchange("userinfo response has no email".to_string()))
    }
}

/// True when the access token is missing or expires within `margin` of `now`.
pub fn needs_refresh(credential: &Credential, now: DateTime<Utc>, margin: Duration) -> bool {
    if credential.access_token.is_none() {
        return true;
    }
    match credential.token_expiry {
        Some(expiry) => expiry - now < margin,
        None => true,
    }
}

/// Refreshes the access token when it is about to expire. Returns `None`
/// without touching the network when the current token is still good.
pub async fn refresh_if_needed(
    auth: &dyn AuthProvider,
    credential: &Credential,
    now: DateTime<Utc>,
    margin: Duration,
) -> Result<Option<RefreshedToken>, SyncError> {
    let refresh_token = credential
        .refresh_token
        .as_deref()
        .ok_or_else(|| SyncError::MissingRefreshToken(credential.user_id.clone()))?;

    if !needs_refresh(credential, now, margin) {
        debug!(user_id = %credential.user_id, "Access token still valid");
        return Ok(None);
    }

    info!(user_id = %credential.user_id, "Refreshing access token");
    auth.refresh_access_token(refresh_token)
        .await
        .map(Some)
        .map_err(SyncError::TokenRefresh)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct FakeAuth {
        pub(crate) refreshes: AtomicUsize,
        pub(crate) reject_code: bool,
        pub(crate) omit_refresh_token: bool,
        pub(crate) refreshed_with: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AuthProvider for FakeAuth {
        async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError> {
            if self.reject_code {
                return Err(AuthError::Exchange("invalid_grant".to_string()));
            }
            Ok(TokenGrant {
                access_token: format!("access-{}", code),
                refresh_token: (!self.omit_refresh_token).then(|| format!("refresh-{}", code)),
                expiry: Utc::now() + Duration::hours(1),
            })
        }

        async fn refresh_access_token(
            &self,
            refresh_token: &str,
        ) -> Result<RefreshedToken, AuthError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            self.refreshed_with
                .lock()
                .unwrap()
                .push(refresh_token.to_string());
            Ok(RefreshedToken {
                access_token: format!("refreshed-{}", n),
                expiry: Utc::now() + Duration::hours(1),
            })
        }

        async fn account_email(&self, _access_token: &str) -> Result<String, AuthError> {
            Ok("student@example.com".to_string())
        }
    }

    fn credential(expires_in: Duration) -> Credential {
        Credential {
            user_id: "u1".to_string(),
            access_token: Some("access".to_string()),
            refresh_token: Some("refresh".to_string()),
            token_expiry: Some(Utc::now() + expires_in),
            connected: true,
            account_email: None,
        }
    }

    #[tokio::test]
    async fn refreshes_inside_safety_margin() {
        let auth = FakeAuth::default();
        let refreshed = refresh_if_needed(
            &auth,
            &credential(Duration::minutes(4)),
            Utc::now(),
            Duration::minutes(5),
        )
        .await
        .unwrap();

        assert_eq!(refreshed.unwrap().access_token, "refreshed-1");
        assert_eq!(*auth.refreshed_with.lock().unwrap(), vec!["refresh".to_string()]);
    }

    #[tokio::test]
    async fn leaves_fresh_token_alone() {
        let auth = FakeAuth::default();
        let refreshed = refresh_if_needed(
            &auth,
            &credential(Duration::minutes(10)),
            Utc::now(),
            Duration::minutes(5),
        )
        .await
        .unwrap();

        assert!(refreshed.is_none());
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_refresh_token_is_fatal() {
        let auth = FakeAuth::default();
        let mut cred = credential(Duration::minutes(10));
        cred.refresh_token = None;

        let err = refresh_if_needed(&auth, &cred, Utc::now(), Duration::minutes(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingRefreshToken(ref u) if u == "u1"));
    }

    #[test]
    fn missing_expiry_or_access_token_needs_refresh() {
        let mut cred = credential(Duration::hours(1));
        cred.token_expiry = None;
        assert!(needs_refresh(&cred, Utc::now(), Duration::minutes(5)));

        let mut cred = credential(Duration::hours(1));
        cred.access_token = None;
        assert!(needs_refresh(&cred, Utc::now(), Duration::minutes(5)));
    }

    fn secret() -> ApplicationSecret {
        serde_json::from_value(serde_json::json!({
            "client_id": "client-123",
            "client_secret": "shh",
            "auth_uri": "https://accounts.google.com/o/oauth2/auth",
            "token_uri": "https://oauth2.googleapis.com/token",
            "redirect_uris": ["http://localhost:5000/api/gmail/callback"]
        }))
        .unwrap()
    }

    #[test]
    fn authorization_url_binds_state_and_forces_consent() {
        let auth = GoogleAuth::new(secret(), None).unwrap();
        let url = Url::parse(&auth.authorization_url("user-42").unwrap()).unwrap();
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("accounts.google.com"));
        assert_eq!(params["state"], "user-42");
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["prompt"], "consent");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "client-123");
        assert_eq!(params["redirect_uri"], "http://localhost:5000/api/gmail/callback");
        assert_eq!(params["scope"], SCOPES.join(" "));
    }

    #[test]
    fn redirect_override_wins() {
        let auth = GoogleAuth::new(secret(), Some("https://app.example/cb".to_string())).unwrap();
        let url = Url::parse(&auth.authorization_url("u").unwrap()).unwrap();
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "redirect_uri" && v == "https://app.example/cb"));
    }
}
