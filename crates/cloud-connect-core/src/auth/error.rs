use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the authorization, exchange, and renewal routines.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("secure random source unavailable: {0}")]
    RandomSource(#[from] rand::Error),
    #[error("code verifier of {0} bytes falls outside the 43..=128 character range")]
    InvalidVerifierLength(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: StatusCode, body: String },
    #[error("malformed token response: {0}")]
    MalformedTokenResponse(String),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("authorization parameter '{0}' is set by the flow and cannot be overridden")]
    ReservedParameter(String),
    #[error("{operation} is not supported by {provider}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },
    #[error("authorization listener terminated before receiving redirect")]
    ListenerClosed,
    #[error("authorization flow cancelled")]
    Cancelled,
    #[error("authorization superseded by a newer request")]
    Superseded,
    #[error("authorization request denied ({error})")]
    AccessDenied {
        error: String,
        description: Option<String>,
    },
    #[error("authorization response missing code parameter")]
    MissingAuthorizationCode,
    #[error("authorization state mismatch")]
    StateMismatch,
    #[error("no authorization is waiting for a redirect")]
    NoPendingAuthorization,
    #[error("redirect '{0}' does not match the configured callback URL")]
    CallbackMismatch(String),
    #[error("callback URL '{0}' cannot be served by a loopback listener")]
    UnsupportedCallback(String),
    #[error("failed to launch system browser: {0}")]
    BrowserLaunch(String),
    #[error("invalid authorization response: {0}")]
    InvalidAuthorizationResponse(String),
}

/// Coarse classification of [`AuthError`] used by callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RandomSourceFailure,
    UserCancelled,
    AuthorizationDenied,
    StateMismatch,
    NetworkFailure,
    ProviderRejected,
    UnsupportedOperation,
    Configuration,
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::RandomSource(_) | AuthError::InvalidVerifierLength(_) => {
                ErrorKind::RandomSourceFailure
            }
            AuthError::Cancelled | AuthError::Superseded => ErrorKind::UserCancelled,
            AuthError::AccessDenied { .. } => ErrorKind::AuthorizationDenied,
            AuthError::StateMismatch => ErrorKind::StateMismatch,
            AuthError::Http(_) | AuthError::Io(_) | AuthError::ListenerClosed => {
                ErrorKind::NetworkFailure
            }
            AuthError::TokenEndpoint { .. }
            | AuthError::MalformedTokenResponse(_)
            | AuthError::MissingAuthorizationCode
            | AuthError::InvalidAuthorizationResponse(_) => ErrorKind::ProviderRejected,
            AuthError::Unsupported { .. } => ErrorKind::UnsupportedOperation,
            AuthError::Config(_)
            | AuthError::Url(_)
            | AuthError::UnknownProvider(_)
            | AuthError::ReservedParameter(_)
            | AuthError::NoPendingAuthorization
            | AuthError::CallbackMismatch(_)
            | AuthError::UnsupportedCallback(_)
            | AuthError::BrowserLaunch(_) => ErrorKind::Configuration,
        }
    }

    /// True for explicit cancellation, platform-reported cancellation, and superseding.
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::UserCancelled
    }
}
