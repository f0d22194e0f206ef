//! Authorization code flow with PKCE (RFC 7636).

use super::callback::CallbackListener;
use super::{AuthorizationFlow, AuthorizationGrant, AuthorizationHandle, CodeGrant};
use crate::config::{CallbackConfig, OidcConfig};
use crate::credentials::{ClientRegistration, Provenance};
use crate::error::{LifecycleError, Result};
use crate::oidc::{OidcClient, RegistrationRequest, GRANT_AUTHORIZATION_CODE, GRANT_REFRESH_TOKEN};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info};

/// 32 bytes encode to a 43-character verifier, the RFC 7636 minimum
const PKCE_VERIFIER_LENGTH: usize = 32;

const STATE_LENGTH: usize = 16;

pub const PKCE_METHOD: &str = "S256";

/// A code verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct Pkce {
    /// Secret, sent only on token exchange
    pub verifier: String,
    /// Sent in the authorize URL
    pub challenge: String,
}

impl Pkce {
    #[must_use]
    pub fn generate() -> Self {
        let random_bytes: [u8; PKCE_VERIFIER_LENGTH] = rand::thread_rng().gen();
        Self::from_verifier(URL_SAFE_NO_PAD.encode(random_bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = Self::compute_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// base64url(SHA-256(verifier)), unpadded.
    #[must_use]
    pub fn compute_challenge(verifier: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
    }

    #[must_use]
    pub fn verify(verifier: &str, challenge: &str) -> bool {
        Self::compute_challenge(verifier) == challenge
    }
}

/// Random CSRF state, base64url.
#[must_use]
pub fn generate_state() -> String {
    let random_bytes: [u8; STATE_LENGTH] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Builds `{oidc_base}/authorize?...`.
///
/// The service takes `scopes` comma-separated rather than the standard
/// space-separated `scope`.
pub fn build_authorize_url(
    oidc_base: &str,
    registration: &ClientRegistration,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
    pkce: &Pkce,
) -> Result<String> {
    let scopes = scopes.join(",");
    let params = [
        ("response_type", "code"),
        ("client_id", registration.client_id.as_str()),
        ("redirect_uri", redirect_uri),
        ("scopes", scopes.as_str()),
        ("state", state),
        ("code_challenge", pkce.challenge.as_str()),
        ("code_challenge_method", PKCE_METHOD),
    ];
    let query = serde_urlencoded::to_string(params)
        .map_err(|e| LifecycleError::Flow(format!("failed to encode authorize URL: {}", e)))?;
    Ok(format!("{}/authorize?{}", oidc_base, query))
}

struct PendingAuthorization {
    pkce: Pkce,
    state: String,
    listener: CallbackListener,
}

/// Browser-based flow: the human approves in a browser and the server
/// redirects back to a local listener.
pub struct PkceFlow {
    oidc: OidcClient,
    oidc_config: OidcConfig,
    callback: CallbackConfig,
    registration: Option<ClientRegistration>,
    pending: Option<PendingAuthorization>,
}

impl PkceFlow {
    pub fn new(oidc: OidcClient, oidc_config: OidcConfig, callback: CallbackConfig) -> Self {
        Self {
            oidc,
            oidc_config,
            callback,
            registration: None,
            pending: None,
        }
    }

    /// Redirect URI of the live listener, if `start` has run.
    pub fn redirect_uri(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.listener.redirect_uri())
    }

    /// True while a local listener is bound.
    pub fn is_listening(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.listener.is_running())
    }
}

#[async_trait]
impl AuthorizationFlow for PkceFlow {
    fn provenance(&self) -> Provenance {
        Provenance::Pkce
    }

    /// 1. Generate the PKCE pair and state
    /// 2. Bind the callback listener (its port is part of the redirect URI)
    /// 3. Register a client for that redirect URI
    /// 4. Build the authorize URL
    async fn start(&mut self, account_name: &str) -> Result<AuthorizationHandle> {
        if self.pending.is_some() {
            return Err(LifecycleError::Flow("PKCE flow already started".to_string()));
        }

        let pkce = Pkce::generate();
        let state = generate_state();
        let mut listener = CallbackListener::bind(&self.callback, state.clone()).await?;
        let redirect_uri = listener.redirect_uri().to_string();

        let request = RegistrationRequest {
            client_name: self.oidc_config.client_name.clone(),
            scopes: self.oidc_config.scopes.clone(),
            grant_types: vec![
                GRANT_AUTHORIZATION_CODE.to_string(),
                GRANT_REFRESH_TOKEN.to_string(),
            ],
            redirect_uris: Some(vec![redirect_uri.clone()]),
            issuer_url: self.oidc_config.start_url.clone(),
        };
        let registration = match self.oidc.register(&request).await {
            Ok(registration) => registration,
            Err(e) => {
                listener.shutdown().await;
                return Err(e);
            }
        };

        let url = match build_authorize_url(
            self.oidc.base_url(),
            &registration,
            &redirect_uri,
            &self.oidc_config.scopes,
            &state,
            &pkce,
        ) {
            Ok(url) => url,
            Err(e) => {
                listener.shutdown().await;
                return Err(e);
            }
        };

        info!(
            account = %account_name,
            client_id = %registration.short_id(),
            redirect_uri = %redirect_uri,
            "PKCE authorization started"
        );

        self.registration = Some(registration);
        self.pending = Some(PendingAuthorization {
            pkce,
            state,
            listener,
        });

        Ok(AuthorizationHandle {
            url,
            user_code: None,
        })
    }

    /// Waits for the redirect, then tears the listener down whatever the
    /// outcome.
    async fn await_grant(&mut self, timeout: Duration) -> Result<AuthorizationGrant> {
        let mut pending = self.pending.take().ok_or_else(|| {
            LifecycleError::Flow("await_grant called before start".to_string())
        })?;

        let outcome = pending.listener.wait(timeout).await;
        pending.listener.shutdown().await;
        let received = outcome?;

        debug!("Authorization code received");

        Ok(AuthorizationGrant::Code(CodeGrant {
            code: received.code,
            code_verifier: pending.pkce.verifier,
            redirect_uri: pending.listener.redirect_uri().to_string(),
            state: pending.state,
        }))
    }

    fn registration(&self) -> Option<&ClientRegistration> {
        self.registration.as_ref()
    }

    async fn close(&mut self) {
        if let Some(mut pending) = self.pending.take() {
            pending.listener.shutdown().await;
        }
    }
}
