//! Token exchange and refresh.
//!
//! [`TokenEngine`] turns grants into credentials and renews credentials with
//! their refresh token. It also owns the device-code polling state machine,
//! which the device and SSO-bootstrap drivers share.
//!
//! Retry policy differs by operation:
//! - grant exchange is never retried; a retried code is a burned code
//! - refresh retries everything but 400/401 a fixed number of times
//! - device polling treats every response as a state transition

use crate::config::{DeviceConfig, RetryConfig, TokenLifecycleConfig};
use crate::credentials::{ClientRegistration, Credential, CredentialMeta};
use crate::error::{LifecycleError, RefreshFailure, Result};
use crate::flows::AuthorizationGrant;
use crate::oidc::{DeviceAuthorization, OidcClient, TokenEndpointResponse, TokenRequest, TokenSet};
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};


/// Interpretation of one device-code poll response.
#[derive(Debug)]
pub enum DevicePoll {
    Pending,
    SlowDown,
    Authorized(TokenSet),
    AccessDenied,
    Expired,
}

impl DevicePoll {
    /// Classify a token endpoint response received while polling.
    ///
    /// Both the RFC 8628 codes and the service's exception names are
    /// accepted.
    pub fn from_response(response: &TokenEndpointResponse) -> Result<Self> {
        if response.is_success() {
            return response
                .tokens()
                .map(DevicePoll::Authorized)
                .map_err(LifecycleError::TokenExchange);
        }
        if let Some(reason) = response.ban_reason() {
            return Err(LifecycleError::AccountBanned { reason });
        }
        match response.error_code().as_deref() {
            Some("authorization_pending") | Some("AuthorizationPendingException") => {
                Ok(DevicePoll::Pending)
            }
            Some("slow_down") | Some("SlowDownException") => Ok(DevicePoll::SlowDown),
            Some("expired_token") | Some("ExpiredTokenException") => Ok(DevicePoll::Expired),
            Some("access_denied") | Some("AccessDeniedException") => Ok(DevicePoll::AccessDenied),
            _ => Err(LifecycleError::TokenExchange(format!(
                "device token poll failed ({}): {}",
                response.status, response.body
            ))),
        }
    }
}

/// Exchange and refresh engine bound to one OIDC service.
#[derive(Clone)]
pub struct TokenEngine {
    oidc: OidcClient,
    retry: RetryConfig,
    device: DeviceConfig,
}

impl TokenEngine {
    pub fn new(oidc: OidcClient, retry: RetryConfig, device: DeviceConfig) -> Self {
        Self {
            oidc,
            retry,
            device,
        }
    }

    pub fn from_config(oidc: OidcClient, config: &TokenLifecycleConfig) -> Self {
        Self::new(oidc, config.retry.clone(), config.device.clone())
    }

    pub fn oidc(&self) -> &OidcClient {
        &self.oidc
    }

    /// Converts a grant into a new [`Credential`].
    ///
    /// Code grants cost exactly one token request, with no retry on any
    /// failure. Device grants already carry their tokens from the final poll.
    pub async fn exchange(
        &self,
        grant: AuthorizationGrant,
        registration: ClientRegistration,
        meta: CredentialMeta,
    ) -> Result<Credential> {
        let tokens = match grant {
            AuthorizationGrant::Code(code) => {
                debug!(client_id = %registration.short_id(), "Exchanging authorization code");
                let request = TokenRequest::authorization_code(
                    &registration,
                    &code.code,
                    &code.redirect_uri,
                    &code.code_verifier,
                );
                let response = self.oidc.post_token(&request).await?;
                if !response.is_success() {
                    return Err(grant_error(&response));
                }
                response.tokens().map_err(LifecycleError::TokenExchange)?
            }
            AuthorizationGrant::Device(device) => device.tokens,
        };

        let credential = Credential::from_tokens(tokens, registration, meta, Utc::now());
        info!(
            account = %credential.account_name,
            auth_method = %credential.auth_method,
            has_refresh_token = credential.can_refresh(),
            "Tokens issued"
        );
        Ok(credential)
    }

    /// Renews `credential` with its refresh token, returning the updated copy.
    ///
    /// # Errors
    /// - `TokenRefresh(MissingRefreshToken)` before any network call
    /// - `TokenRefresh(Rejected)` on 401, or a 400 without a ban reason
    /// - `AccountBanned` on a 400 carrying a `reason`
    /// - `TokenExchange` when a 2xx body cannot be read as a token set
    /// - `TokenRefresh(Transient)` once every attempt hit a network error or
    ///   any other status (408, 429, 5xx)
    pub async fn refresh(&self, credential: &Credential) -> Result<Credential> {
        let refresh_token = match credential.refresh_token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => return Err(RefreshFailure::MissingRefreshToken.into()),
        };

        let registration = &credential.client_registration;
        let request = TokenRequest::refresh(registration, refresh_token);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.oidc.post_token(&request).await {
                Ok(response) if response.is_success() => {
                    let tokens = response.tokens().map_err(LifecycleError::TokenExchange)?;
                    let mut refreshed = credential.clone();
                    refreshed.apply_refresh(tokens, Utc::now());
                    info!(
                        account = %refreshed.account_name,
                        attempt = attempt,
                        "Access token refreshed"
                    );
                    return Ok(refreshed);
                }
                Ok(response) => {
                    if let Some(reason) = response.ban_reason() {
                        return Err(LifecycleError::AccountBanned { reason });
                    }
                    if is_refresh_rejection(response.status) {
                        return Err(RefreshFailure::Rejected {
                            status: response.status,
                            message: response.body,
                        }
                        .into());
                    }
                    last_error = format!("HTTP {}: {}", response.status, response.body);
                }
                Err(LifecycleError::Http(e)) => {
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }

            warn!(
                account = %credential.account_name,
                attempt = attempt,
                max_attempts = max_attempts,
                error = %last_error,
                "Refresh attempt failed"
            );

            if attempt < max_attempts {
                tokio::time::sleep(self.retry.delay()).await;
            }
        }

        Err(RefreshFailure::Transient {
            attempts: max_attempts,
            last_error,
        }
        .into())
    }

    /// Polls the token endpoint until the device authorization resolves.
    ///
    /// Sleeps the current interval before every poll; `slow_down` widens the
    /// interval for all later polls. Gives up with `AuthorizationTimeout`
    /// once the next sleep would pass `timeout`, or the device code's own
    /// `expires_in` when that is shorter.
    pub async fn poll_device(
        &self,
        registration: &ClientRegistration,
        authorization: &DeviceAuthorization,
        timeout: Duration,
    ) -> Result<(TokenSet, u64)> {
        let mut interval = authorization
            .interval
            .unwrap_or(self.device.default_interval_seconds)
            .max(1);
        let increment = self.device.slow_down_increment_seconds.max(1);
        let limit = authorization
            .expires_in
            .and_then(|seconds| u64::try_from(seconds).ok())
            .map_or(timeout, |seconds| timeout.min(Duration::from_secs(seconds)));
        // None: the limit is too far out to represent, so never reached
        let deadline = Instant::now().checked_add(limit);
        let request = TokenRequest::device_code(registration, &authorization.device_code);
        let mut polls: u32 = 0;

        loop {
            let wait = Duration::from_secs(interval);
            let within_deadline = match (Instant::now().checked_add(wait), deadline) {
                (Some(next_poll), Some(deadline)) => next_poll <= deadline,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !within_deadline {
                return Err(LifecycleError::AuthorizationTimeout {
                    seconds: limit.as_secs(),
                });
            }
            tokio::time::sleep(wait).await;

            polls += 1;
            let response = self.oidc.post_token(&request).await?;
            match DevicePoll::from_response(&response)? {
                DevicePoll::Pending => {
                    debug!(polls = polls, interval = interval, "Authorization pending");
                }
                DevicePoll::SlowDown => {
                    interval = interval.saturating_add(increment);
                    debug!(polls = polls, interval = interval, "Server asked to slow down");
                }
                DevicePoll::Authorized(tokens) => {
                    debug!(polls = polls, "Device authorization approved");
                    return Ok((tokens, interval));
                }
                DevicePoll::Expired => {
                    return Err(LifecycleError::AuthorizationExpired(
                        "device code expired".to_string(),
                    ));
                }
                DevicePoll::AccessDenied => {
                    return Err(LifecycleError::AuthorizationDenied(
                        "access_denied".to_string(),
                    ));
                }
            }
        }
    }
}

/// Statuses that mean the refresh token itself was refused. Everything else
/// (rate limiting, timeouts, server errors) is worth another attempt.
fn is_refresh_rejection(status: u16) -> bool {
    matches!(status, 400 | 401)
}

/// Map a failed code exchange to the error taxonomy.
fn grant_error(response: &TokenEndpointResponse) -> LifecycleError {
    if let Some(reason) = response.ban_reason() {
        return LifecycleError::AccountBanned { reason };
    }
    match response.error_code().as_deref() {
        Some("access_denied") | Some("AccessDeniedException") => {
            LifecycleError::AuthorizationDenied(response.body.clone())
        }
        Some("expired_token") | Some("ExpiredTokenException") => {
            LifecycleError::AuthorizationExpired(response.body.clone())
        }
        _ => LifecycleError::TokenExchange(format!(
            "token endpoint returned {}: {}",
            response.status, response.body
        )),
    }
}
