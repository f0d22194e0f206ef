//! Error taxonomy for the token lifecycle.
//!
//! Every failure a caller may need to branch on has its own variant: a denied
//! authorization prompts the user differently than an expired device code, and
//! a rejected refresh token means "authorize again" rather than "try later".

use thiserror::Error;

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Why a refresh could not produce a new access token.
#[derive(Debug, Error)]
pub enum RefreshFailure {
    /// The credential carries no refresh token; nothing was sent.
    #[error("no refresh token available")]
    MissingRefreshToken,

    /// The server refused the refresh token (401, or a 400 without a ban reason).
    #[error("refresh token invalid or expired ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Every attempt hit a network error or a retryable status (408, 429, 5xx).
    #[error("transient failure after {attempts} attempts: {last_error}")]
    Transient { attempts: u32, last_error: String },
}

/// Errors produced by registration, authorization flows, token exchange,
/// refresh, storage and activation.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Dynamic client registration was rejected.
    #[error("client registration failed ({status}): {message}")]
    Registration { status: u16, message: String },

    /// The user declined, or the server answered `access_denied`.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The device code or authorization code expired before completion.
    #[error("authorization expired: {0}")]
    AuthorizationExpired(String),

    /// The human did not finish the flow within the allotted time.
    #[error("authorization not completed within {seconds}s")]
    AuthorizationTimeout { seconds: u64 },

    /// The callback carried a `state` that does not match the one we issued.
    #[error("OAuth state mismatch (possible CSRF)")]
    StateMismatch,

    /// Converting a grant into tokens failed for any other reason.
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("token refresh failed: {0}")]
    TokenRefresh(#[from] RefreshFailure),

    /// The token endpoint returned a structured ban/denial reason.
    #[error("account banned: {reason}")]
    AccountBanned { reason: String },

    /// A step of the SSO-cookie bootstrap was refused by the portal or OIDC service.
    #[error("SSO bootstrap step '{step}' failed ({status}): {message}")]
    Portal {
        step: &'static str,
        status: u16,
        message: String,
    },

    /// The local callback listener could not be started or served.
    #[error("callback listener error: {0}")]
    Callback(String),

    /// A flow driver was used out of order.
    #[error("flow error: {0}")]
    Flow(String),

    #[error("no stored credential named '{0}'")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LifecycleError {
    /// Returns true if the failure is worth retrying as-is.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::TokenRefresh(RefreshFailure::Transient { .. })
        )
    }

    /// Returns true if the caller has to send the user through a new
    /// authorization flow to recover.
    #[must_use]
    pub fn needs_reauthorization(&self) -> bool {
        matches!(
            self,
            Self::AuthorizationDenied(_)
                | Self::AuthorizationExpired(_)
                | Self::AuthorizationTimeout { .. }
                | Self::TokenRefresh(RefreshFailure::MissingRefreshToken)
                | Self::TokenRefresh(RefreshFailure::Rejected { .. })
        )
    }
}
