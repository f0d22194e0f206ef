//! Device authorization flow (RFC 8628).

use super::{AuthorizationFlow, AuthorizationGrant, AuthorizationHandle, DeviceGrant};
use crate::config::OidcConfig;
use crate::credentials::{ClientRegistration, Provenance};
use crate::error::{LifecycleError, Result};
use crate::oidc::{
    DeviceAuthorization, OidcClient, RegistrationRequest, TokenSet, GRANT_DEVICE_CODE,
    GRANT_REFRESH_TOKEN,
};
use crate::tokens::TokenEngine;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Registers a client allowed to use the device-code grant.
pub(crate) async fn register_device_client(
    oidc: &OidcClient,
    oidc_config: &OidcConfig,
) -> Result<ClientRegistration> {
    oidc.register(&RegistrationRequest {
        client_name: oidc_config.client_name.clone(),
        scopes: oidc_config.scopes.clone(),
        grant_types: vec![GRANT_DEVICE_CODE.to_string(), GRANT_REFRESH_TOKEN.to_string()],
        redirect_uris: None,
        issuer_url: oidc_config.start_url.clone(),
    })
    .await
}

pub(crate) fn device_grant(
    authorization: DeviceAuthorization,
    start_url: &str,
    tokens: TokenSet,
    interval: u64,
) -> AuthorizationGrant {
    AuthorizationGrant::Device(DeviceGrant {
        verification_uri: authorization.verification_url(start_url),
        device_code: authorization.device_code,
        user_code: authorization.user_code,
        interval,
        tokens,
    })
}

/// The human enters a user code at a verification URL while this side polls.
pub struct DeviceFlow {
    engine: TokenEngine,
    oidc_config: OidcConfig,
    registration: Option<ClientRegistration>,
    authorization: Option<DeviceAuthorization>,
}

impl DeviceFlow {
    pub fn new(engine: TokenEngine, oidc_config: OidcConfig) -> Self {
        Self {
            engine,
            oidc_config,
            registration: None,
            authorization: None,
        }
    }
}

#[async_trait]
impl AuthorizationFlow for DeviceFlow {
    fn provenance(&self) -> Provenance {
        Provenance::DeviceCode
    }

    async fn start(&mut self, account_name: &str) -> Result<AuthorizationHandle> {
        if self.authorization.is_some() {
            return Err(LifecycleError::Flow("device flow already started".to_string()));
        }

        let registration = register_device_client(self.engine.oidc(), &self.oidc_config).await?;
        let authorization = self
            .engine
            .oidc()
            .start_device_authorization(&registration)
            .await?;

        let handle = AuthorizationHandle {
            url: authorization.verification_url(&self.oidc_config.start_url),
            user_code: Some(authorization.user_code.clone()),
        };

        info!(
            account = %account_name,
            client_id = %registration.short_id(),
            user_code = %authorization.user_code,
            "Device authorization started"
        );

        self.registration = Some(registration);
        self.authorization = Some(authorization);
        Ok(handle)
    }

    /// Polls until approval, denial, expiry or `timeout`. Dropping the
    /// returned future stops polling.
    async fn await_grant(&mut self, timeout: Duration) -> Result<AuthorizationGrant> {
        let authorization = self.authorization.take().ok_or_else(|| {
            LifecycleError::Flow("await_grant called before start".to_string())
        })?;
        let registration = self.registration.as_ref().ok_or_else(|| {
            LifecycleError::Flow("device flow has no client registration".to_string())
        })?;

        let (tokens, interval) = self
            .engine
            .poll_device(registration, &authorization, timeout)
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
