//! Authorization flow drivers.
//!
//! Three interchangeable strategies produce a one-time [`AuthorizationGrant`]:
//!
//! - [`PkceFlow`]: authorization code + PKCE, redirected to a local listener
//! - [`DeviceFlow`]: device code, polled until the human approves
//! - [`SsoBootstrapFlow`]: device code approved server-side with an existing
//!   portal session, then polled like [`DeviceFlow`]
//!
//! Every driver registers its own ephemeral client during `start`, hands the
//! human a URL (and for device flows a user code), and resolves the grant in
//! `await_grant`. The grant then goes to
//! [`TokenEngine::exchange`](crate::tokens::TokenEngine::exchange).

use crate::credentials::{ClientRegistration, Provenance};
use crate::error::Result;
use crate::oidc::TokenSet;
use async_trait::async_trait;
use std::time::Duration;

pub mod callback;
pub mod device;
pub mod pkce;
pub mod sso;

pub use callback::CallbackListener;
pub use device::DeviceFlow;
pub use pkce::{Pkce, PkceFlow};
pub use sso::{PortalClient, SsoBootstrapFlow};

/// What the human (or a browser driver) has to act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationHandle {
    pub url: String,
    /// Device flows only
    pub user_code: Option<String>,
}

/// Authorization code returned to the PKCE callback.
#[derive(Debug)]
pub struct CodeGrant {
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    pub state: String,
}

/// Approved device authorization.
///
/// The token endpoint answers the successful poll with the tokens
/// themselves, so the grant carries them instead of a reusable device code.
#[derive(Debug)]
pub struct DeviceGrant {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    /// Poll interval in effect when the grant was issued (seconds)
    pub interval: u64,
    pub tokens: TokenSet,
}

/// One-time proof of consent. Consumed by value on exchange.
#[derive(Debug)]
pub enum AuthorizationGrant {
    Code(CodeGrant),
    Device(DeviceGrant),
}

impl AuthorizationGrant {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthorizationGrant::Code(_) => "authorization_code",
            AuthorizationGrant::Device(_) => "device_code",
        }
    }
}

/// Common shape of the three flow drivers.
///
/// # Lifecycle
/// 1. `start` registers a client and returns the [`AuthorizationHandle`]
/// 2. `await_grant` waits (bounded by `timeout`) for the external step
/// 3. `close` releases anything still held; safe to call at any point
///
/// Dropping the future returned by `await_grant` cancels the wait.
#[async_trait]
pub trait AuthorizationFlow: Send {
    fn provenance(&self) -> Provenance;

    async fn start(&mut self, account_name: &str) -> Result<AuthorizationHandle>;

    async fn await_grant(&mut self, timeout: Duration) -> Result<AuthorizationGrant>;

    /// Client registered by `start`, if it has run.
    fn registration(&self) -> Option<&ClientRegistration>;

    async fn close(&mut self);
}
