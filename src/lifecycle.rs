//! Composition root for the token lifecycle.
//!
//! [`TokenLifecycle`] owns one of each component, built from a single
//! [`TokenLifecycleConfig`], and sequences them:
//!
//! ```text
//! flow.start → (human / portal) → flow.await_grant
//!     → TokenEngine::exchange → CredentialStore::save
//!     → CredentialActivator::activate (optional, refreshing first if needed)
//! ```

use crate::config::TokenLifecycleConfig;
use crate::credentials::{
    ActivationReport, ActiveCredential, CredentialActivator, CredentialMeta, CredentialStore,
    StoredCredential,
};
use crate::error::{LifecycleError, Result};
use crate::flows::{
    AuthorizationFlow, AuthorizationHandle, DeviceFlow, PkceFlow, PortalClient, SsoBootstrapFlow,
};
use crate::oidc::OidcClient;
use crate::tokens::TokenEngine;
use tracing::{error, info};

pub struct TokenLifecycle {
    config: TokenLifecycleConfig,
    engine: TokenEngine,
    store: CredentialStore,
    activator: CredentialActivator,
}

impl TokenLifecycle {
    /// Builds every component from `config`. Creates the tokens directory.
    pub fn new(config: TokenLifecycleConfig) -> Result<Self> {
        let oidc = OidcClient::new(&config)?;
        let engine = TokenEngine::from_config(oidc, &config);
        let store = CredentialStore::new(&config.storage.tokens_dir)?;
        let activator = CredentialActivator::new(&config.storage);

        info!(
            oidc = %engine.oidc().base_url(),
            tokens_dir = %store.dir().display(),
            active_file = %activator.active_file().display(),
            "Token lifecycle initialized"
        );

        Ok(Self {
            config,
            engine,
            store,
            activator,
        })
    }

    pub fn config(&self) -> &TokenLifecycleConfig {
        &self.config
    }

    pub fn engine(&self) -> &TokenEngine {
        &self.engine
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn activator(&self) -> &CredentialActivator {
        &self.activator
    }

    pub fn pkce_flow(&self) -> PkceFlow {
        PkceFlow::new(
            self.engine.oidc().clone(),
            self.config.oidc.clone(),
            self.config.callback.clone(),
        )
    }

    pub fn device_flow(&self) -> DeviceFlow {
        DeviceFlow::new(self.engine.clone(), self.config.oidc.clone())
    }

    /// Bootstrap flow for a pre-authenticated portal session value.
    pub fn sso_flow(&self, bearer_token: impl Into<String>) -> Result<SsoBootstrapFlow> {
        let portal = PortalClient::new(self.config.oidc.portal_base(), self.config.timeouts.request())?;
        Ok(SsoBootstrapFlow::new(
            self.engine.clone(),
            portal,
            self.config.oidc.clone(),
            bearer_token,
            self.config.timeouts.sso_poll(),
        ))
    }

    /// Runs a whole flow: `start`, hand the handle to `present`, then
    /// [`complete`](Self::complete).
    pub async fn authorize<F>(
        &self,
        flow: &mut dyn AuthorizationFlow,
        account_name: &str,
        present: F,
    ) -> Result<StoredCredential>
    where
        F: FnOnce(&AuthorizationHandle) + Send,
    {
        let handle = match flow.start(account_name).await {
            Ok(handle) => handle,
            Err(e) => {
                flow.close().await;
                return Err(e);
            }
        };
        present(&handle);
        self.complete(flow, account_name).await
    }

    /// Waits for the grant of an already started flow, exchanges it and
    /// persists the credential. The flow is closed on every path, and
    /// nothing is returned before the credential is on disk.
    pub async fn complete(
        &self,
        flow: &mut dyn AuthorizationFlow,
        account_name: &str,
    ) -> Result<StoredCredential> {
        let outcome = flow
            .await_grant(self.config.timeouts.authorization())
            .await;
        flow.close().await;

        let grant = outcome.map_err(|e| {
            error!(account = %account_name, error = %e, "Authorization failed");
            e
        })?;

        let registration = flow.registration().cloned().ok_or_else(|| {
            LifecycleError::Flow("flow produced a grant without a registration".to_string())
        })?;
        let meta = CredentialMeta {
            account_name: account_name.to_string(),
            provider: self.config.oidc.provider.clone(),
            region: self.config.oidc.region.clone(),
            provenance: flow.provenance(),
        };

        let kind = grant.kind();
        let credential = self
            .engine
            .exchange(grant, registration, meta)
            .await
            .map_err(|e| {
                error!(account = %account_name, grant = kind, error = %e, "Token exchange failed");
                e
            })?;

        let stored = self.store.save(&credential)?;
        info!(
            account = %account_name,
            file = %stored.file_name(),
            "Credential stored"
        );
        Ok(stored)
    }

    /// Refresh-and-save by account or file name.
    pub async fn refresh(&self, name: &str) -> Result<StoredCredential> {
        let stored = self.store.require(name)?;
        self.refresh_stored(&stored).await
    }

    /// Refreshes a stored credential and rewrites its file. On failure the
    /// file is left exactly as it was.
    pub async fn refresh_stored(&self, stored: &StoredCredential) -> Result<StoredCredential> {
        let credential = self.engine.refresh(&stored.credential).await?;
        let updated = StoredCredential {
            path: stored.path.clone(),
            credential,
        };
        self.store.update(&updated)?;
        Ok(updated)
    }

    /// Promotes a stored credential into the active slot.
    ///
    /// With `require_fresh` set, an expired credential is refreshed (and the
    /// refreshed copy saved) first; `force_refresh` refreshes regardless.
    /// A failed refresh leaves the active slot untouched.
    pub async fn activate(
        &self,
        stored: &StoredCredential,
        force_refresh: bool,
    ) -> Result<ActivationReport> {
        let expired = stored.credential.is_expired();
        let needs_refresh = force_refresh || (self.config.activation.require_fresh && expired);

        let stored = if needs_refresh {
            info!(
                account = %stored.credential.account_name,
                expired = expired,
                forced = force_refresh,
                "Refreshing before activation"
            );
            self.refresh_stored(stored).await.map_err(|e| {
                error!(
                    account = %stored.credential.account_name,
                    error = %e,
                    "Refresh before activation failed, active slot unchanged"
                );
                e
            })?
        } else {
            stored.clone()
        };

        self.activator.activate(&stored.credential)
    }

    pub async fn activate_by_name(
        &self,
        name: &str,
        force_refresh: bool,
    ) -> Result<ActivationReport> {
        let stored = self.store.require(name)?;
        self.activate(&stored, force_refresh).await
    }

    pub fn list(&self) -> Result<Vec<StoredCredential>> {
        self.store.list()
    }

    pub fn get(&self, name: &str) -> Result<Option<StoredCredential>> {
        self.store.get(name)
    }

    pub fn best(&self) -> Result<Option<StoredCredential>> {
        self.store.best()
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        self.store.delete(name)
    }

    pub fn get_active(&self) -> Result<Option<ActiveCredential>> {
        self.activator.get_active()
    }
}
