use crate::auth::{self, AuthProvider};
use crate::config::SyncConfig;
use crate::db::{CredentialStore, CredentialUpdate, EmailStore};
use crate::error::{AuthError, SyncError};
use crate::mailbox::MailboxClient;
use crate::models::{ConnectionStatus, Credential, SyncReport};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

pub struct SyncService {
    credentials: Arc<dyn CredentialStore>,
    emails: Arc<dyn EmailStore>,
    auth: Arc<dyn AuthProvider>,
    mailbox: MailboxClient,
    max_results: u32,
    refresh_margin: Duration,
    lease_timeout: Duration,
}

impl SyncService {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        emails: Arc<dyn EmailStore>,
        auth: Arc<dyn AuthProvider>,
        mailbox: MailboxClient,
        config: &SyncConfig,
    ) -> Self {
        Self {
            credentials,
            emails,
            auth,
            mailbox,
            max_results: config.max_results,
            refresh_margin: Duration::seconds(config.refresh_margin_secs),
            lease_timeout: Duration::seconds(config.lease_timeout_secs),
        }
    }

    /// Runs `work` while holding the user's sync lease from the credential
    /// store. Connect, disconnect and sync for one user never overlap, even
    /// across processes. If the caller is cancelled before the release, the
    /// lease lapses after `lease_timeout`.
    async fn leased<T>(
        &self,
        user_id: &str,
        work: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        let lease = self
            .credentials
            .acquire_lease(user_id, Utc::now(), self.lease_timeout)
            .await?
            .ok_or_else(|| SyncError::SyncInProgress(user_id.to_string()))?;

        let result = work.await;
        if let Err(e) = self.credentials.release_lease(&lease).await {
            warn!(user_id, error = %e, "Failed to release sync lease");
        }
        result
    }

    /// Completes an OAuth callback: exchanges `code` and stores the
    /// credential as connected.
    pub async fn connect(&self, user_id: &str, code: &str) -> Result<ConnectionStatus, SyncError> {
        self.leased(user_id, self.store_grant(user_id, code)).await
    }

    async fn store_grant(&self, user_id: &str, code: &str) -> Result<ConnectionStatus, SyncError> {
        let grant = self
            .auth
            .exchange_code(code)
            .await
            .map_err(SyncError::AuthExchange)?;
        if grant.refresh_token.is_none() {
            return Err(SyncError::AuthExchange(AuthError::Exchange(
                "provider did not issue a refresh token".to_string(),
            )));
        }

        let account_email = match self.auth.account_email(&grant.access_token).await {
            Ok(email) => Some(email),
            Err(e) => {
                warn!(user_id, error = %e, "Could not look up mailbox address");
                None
            }
        };

        self.credentials
            .update(
                user_id,
                CredentialUpdate::Connected {
                    grant,
                    account_email: account_email.clone(),
                },
            )
            .await?;
        info!(user_id, account = ?account_email, "Mailbox connected");

        Ok(ConnectionStatus {
            connected: true,
            account_email,
        })
    }

    /// Forgets the tokens and removes every stored email of the user.
    pub async fn disconnect(&self, user_id: &str) -> Result<u64, SyncError> {
        self.leased(user_id, self.forget(user_id)).await
    }

    async fn forget(&self, user_id: &str) -> Result<u64, SyncError> {
        self.credentials
            .update(user_id, CredentialUpdate::Disconnected)
            .await?;
        let removed = self.emails.delete_all(user_id).await?;
        info!(user_id, removed, "Mailbox disconnected");
        Ok(removed)
    }

    pub async fn status(&self, user_id: &str) -> Result<ConnectionStatus, SyncError> {
        let credential = self.credentials.get(user_id).await?;
        Ok(credential
            .map(|c| ConnectionStatus {
                connected: c.connected,
                account_email: c.account_email,
            })
            .unwrap_or_default())
    }

    /// Returns a usable access token, refreshing and persisting it first
    /// when it is close to expiry.
    async fn access_token(&self, credential: &Credential) -> Result<String, SyncError> {
        let refreshed = auth::refresh_if_needed(
            self.auth.as_ref(),
            credential,
            Utc::now(),
            self.refresh_margin,
        )
        .await;

        let refreshed = match refreshed {
            Err(SyncError::MissingRefreshToken(user_id)) => {
                warn!(
                    user_id = %user_id,
                    "Connected credential has no refresh token; disconnecting"
                );
                self.credentials
                    .update(&user_id, CredentialUpdate::Disconnected)
                    .await?;
                return Err(SyncError::MissingRefreshToken(user_id));
            }
            other => other?,
        };

        match refreshed {
            Some(token) => {
                let access_token = token.access_token.clone();
                self.credentials
                    .update(&credential.user_id, CredentialUpdate::Refreshed(token))
                    .await?;
                Ok(access_token)
            }
            None => credential
                .access_token
                .clone()
                .ok_or_else(|| SyncError::NotConnected(credential.user_id.clone())),
        }
    }

    /// One end-to-end run for `user_id`: refresh, fetch, classify, upsert.
    /// Messages that fail to persist are skipped and not counted; rows
    /// written before a later failure stay written.
    pub async fn sync(&self, user_id: &str) -> Result<SyncReport, SyncError> {
        self.leased(user_id, self.run_sync(user_id)).await
    }

    async fn run_sync(&self, user_id: &str) -> Result<SyncReport, SyncError> {
        let credential = self
            .credentials
            .get(user_id)
            .await?
            .filter(|c| c.connected)
            .ok_or_else(|| SyncError::NotConnected(user_id.to_string()))?;

        let access_token = self.access_token(&credential).await?;
        let emails = self
            .mailbox
            .fetch_emails(&access_token, self.max_results)
            .await?;

        let classifier = self.mailbox.classifier();
        let mut report = SyncReport {
            fetched: emails.len(),
            ..Default::default()
        };

        for mut email in emails {
            email.category = classifier.categorize(&email);
            email.company = classifier.extract_company(&email);
            email.fetched_at = Utc::now();

            match self.emails.upsert(user_id, &email).await {
                Ok(_) => report.ingested += 1,
                Err(e) => {
                    warn!(
                        user_id,
                        message_id = %email.provider_message_id,
                        error = %e,
                        "Failed to store email"
                    );
                    report.skipped += 1;
                }
            }
        }

        info!(
            user_id,
            fetched = report.fetched,
            ingested = report.ingested,
            skipped = report.skipped,
            "Sync finished"
        );
        Ok(report)
    }
}
