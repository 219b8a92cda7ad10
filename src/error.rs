use thiserror::Error;

/// Failures talking to the OAuth token and userinfo endpoints.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token exchange failed: {0}")]
    Exchange(String),

    #[error("Token refresh failed: {0}")]
    Refresh(String),

    #[error("OAuth request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("OAuth configuration error: {0}")]
    Configuration(String),
}

/// Failures from the mail provider's list and get endpoints.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to build HTTPS connector: {0}")]
    Connector(String),

    #[error("Failed to list messages: {0}")]
    List(String),

    #[error("Failed to get message {id}: {message}")]
    Get { id: String, message: String },
}

/// A provider message that cannot be turned into a normalized email.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Message has no id")]
    MissingId,

    #[error("Message {id} has no {header} header")]
    MissingHeader { id: String, header: &'static str },

    #[error("Message {id} has an unparseable date '{value}'")]
    InvalidDate { id: String, value: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Email {0} not found")]
    NotFound(i64),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Errors surfaced by connect, disconnect and sync.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Mailbox not connected for user {0}; connect first")]
    NotConnected(String),

    #[error("No refresh token stored for user {0}; reconnect required")]
    MissingRefreshToken(String),

    #[error("Could not connect mailbox, try connecting again: {0}")]
    AuthExchange(#[source] AuthError),

    #[error("Could not refresh access token: {0}")]
    TokenRefresh(#[source] AuthError),

    #[error("A sync is already running for user {0}")]
    SyncInProgress(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
