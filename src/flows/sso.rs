//! Device flow approved server-side with an existing portal session.
//!
//! The caller supplies the bearer value of an already-authenticated SSO
//! portal session. No browser is involved:
//!
//! 1. register a device-code client and request a user code (`start`)
//! 2. validate the session (`GET /token/whoAmI`)
//! 3. trade it for a device session token (`POST /session/device`)
//! 4. accept the user code on the OIDC service with that token
//! 5. associate the returned device context, if one came back
//! 6. poll the token endpoint like [`DeviceFlow`](super::DeviceFlow)
//!
//! The bearer value is a live session credential and is never logged.

use super::device::{device_grant, register_device_client};
use super::{AuthorizationFlow, AuthorizationGrant, AuthorizationHandle};
use crate::config::OidcConfig;
use crate::credentials::{ClientRegistration, Provenance};
use crate::error::{LifecycleError, Result};
use crate::oidc::DeviceAuthorization;
use crate::tokens::TokenEngine;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Client for the SSO portal session endpoints.
#[derive(Clone)]
pub struct PortalClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct DeviceSessionResponse {
    token: String,
}

impl PortalClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Fails with `Portal { step: "whoAmI" }` unless the session is live.
    pub async fn who_am_i(&self, bearer_token: &str) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/token/whoAmI", self.base_url))
            .bearer_auth(bearer_token)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LifecycleError::Portal {
                step: "whoAmI",
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Exchanges the portal session for a device session token.
    pub async fn device_session(&self, bearer_token: &str) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/session/device", self.base_url))
            .bearer_auth(bearer_token)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LifecycleError::Portal {
                step: "session/device",
                status: status.as_u16(),
                message: text,
            });
        }

        let session: DeviceSessionResponse =
            serde_json::from_str(&text).map_err(|e| LifecycleError::Portal {
                step: "session/device",
                status: status.as_u16(),
                message: format!("unparsable device session: {}", e),
            })?;
        Ok(session.token)
    }
}

/// Non-interactive device flow driven by a portal session.
pub struct SsoBootstrapFlow {
    engine: TokenEngine,
    portal: PortalClient,
    oidc_config: OidcConfig,
    bearer_token: String,
    poll_limit: Duration,
    registration: Option<ClientRegistration>,
    authorization: Option<DeviceAuthorization>,
}

impl SsoBootstrapFlow {
    /// `poll_limit` caps polling regardless of the timeout passed to
    /// `await_grant`; approval is immediate once the context is associated.
    pub fn new(
        engine: TokenEngine,
        portal: PortalClient,
        oidc_config: OidcConfig,
        bearer_token: impl Into<String>,
        poll_limit: Duration,
    ) -> Self {
        Self {
            engine,
            portal,
            oidc_config,
            bearer_token: bearer_token.into(),
            poll_limit,
            registration: None,
            authorization: None,
        }
    }
}

#[async_trait]
impl AuthorizationFlow for SsoBootstrapFlow {
    fn provenance(&self) -> Provenance {
        Provenance::SsoCookie
    }

    async fn start(&mut self, account_name: &str) -> Result<AuthorizationHandle> {
        if self.authorization.is_some() {
            return Err(LifecycleError::Flow("SSO bootstrap already started".to_string()));
        }

        let registration = register_device_client(self.engine.oidc(), &self.oidc_config).await?;
        let authorization = self
            .engine
            .oidc()
            .start_device_authorization(&registration)
            .await?;

        info!(
            account = %account_name,
            client_id = %registration.short_id(),
            "SSO bootstrap started"
        );

        let handle = AuthorizationHandle {
            url: authorization.verification_url(&self.oidc_config.start_url),
            user_code: Some(authorization.user_code.clone()),
        };
        self.registration = Some(registration);
        self.authorization = Some(authorization);
        Ok(handle)
    }

    async fn await_grant(&mut self, timeout: Duration) -> Result<AuthorizationGrant> {
        let authorization = self.authorization.take().ok_or_else(|| {
            LifecycleError::Flow("await_grant called before start".to_string())
        })?;
        let registration = self.registration.as_ref().ok_or_else(|| {
            LifecycleError::Flow("SSO bootstrap has no client registration".to_string())
        })?;
        let oidc = self.engine.oidc();

        self.portal.who_am_i(&self.bearer_token).await?;
        debug!("Portal session is valid");

        let session = self.portal.device_session(&self.bearer_token).await?;
        debug!("Device session obtained");

        let context = oidc
            .accept_user_code(&authorization.user_code, &session)
            .await?;
        debug!(has_context = context.is_some(), "User code accepted");

        if let Some(context) = context {
            if let Some(context_id) = context.device_context_id.as_deref() {
                oidc.associate_token(context_id, &context, registration, &session)
                    .await?;
                debug!("Device context associated");
            }
        }

        let (tokens, interval) = self
            .engine
            .poll_device(registration, &authorization, timeout.min(self.poll_limit))
            .await?;

        Ok(device_grant(
            authorization,
            &self.oidc_config.start_url,
            tokens,
            interval,
        ))
    }

    fn registration(&self) -> Option<&ClientRegistration> {
        self.registration.as_ref()
    }

    async fn close(&mut self) {
        self.authorization = None;
    }
}
