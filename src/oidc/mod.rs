//! OIDC service client.
//!
//! Implements the calls the token lifecycle makes against the authorization
//! server:
//! 1. `POST /client/register` → ephemeral public client
//! 2. `POST /device_authorization` → device code + user code
//! 3. `POST /token` → raw response, classified by the caller
//! 4. `POST /device_authorization/accept_user_code` and
//!    `/device_authorization/associate_token` (SSO-cookie bootstrap only)
//!
//! Registration is never cached: every flow attempt wants a client identity
//! matching its exact redirect URI and grant types.

mod payload;

pub use payload::{
    normalize_token_payload, TokenEndpointResponse, TokenRequest, TokenSet,
    GRANT_AUTHORIZATION_CODE, GRANT_DEVICE_CODE, GRANT_REFRESH_TOKEN,
};

use crate::config::TokenLifecycleConfig;
use crate::credentials::ClientRegistration;
use crate::error::{LifecycleError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Referer the SSO portal sends on device-context calls
const PORTAL_REFERER: &str = "https://view.awsapps.com/";

/// Parameters of one dynamic client registration.
#[derive(Clone, Debug)]
pub struct RegistrationRequest {
    pub client_name: String,
    pub scopes: Vec<String>,
    pub grant_types: Vec<String>,
    pub redirect_uris: Option<Vec<String>>,
    pub issuer_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody<'a> {
    client_name: &'a str,
    client_type: &'static str,
    scopes: &'a [String],
    grant_types: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_uris: Option<&'a [String]>,
    issuer_url: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    #[serde(alias = "client_id")]
    client_id: String,
    #[serde(default, alias = "client_secret")]
    client_secret: Option<String>,
}

/// A pending device authorization.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthorization {
    #[serde(alias = "device_code")]
    pub device_code: String,
    #[serde(alias = "user_code")]
    pub user_code: String,
    #[serde(default, alias = "verification_uri")]
    pub verification_uri: Option<String>,
    #[serde(default, alias = "verification_uri_complete")]
    pub verification_uri_complete: Option<String>,
    /// Minimum seconds between token polls, as advertised by the server
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default, alias = "expires_in")]
    pub expires_in: Option<i64>,
}

impl DeviceAuthorization {
    /// URL for the human: the complete URI if offered, else the bare one,
    /// else the start URL carrying the user code.
    pub fn verification_url(&self, start_url: &str) -> String {
        self.verification_uri_complete
            .clone()
            .or_else(|| self.verification_uri.clone())
            .unwrap_or_else(|| {
                format!(
                    "{}?user_code={}",
                    start_url,
                    urlencoding::encode(&self.user_code)
                )
            })
    }
}

/// Device context returned when a user code is accepted server-side.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceContext {
    #[serde(default)]
    pub device_context_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_type: Option<String>,
}

/// HTTP client for one OIDC service.
#[derive(Clone)]
pub struct OidcClient {
    http: reqwest::Client,
    base_url: String,
    start_url: String,
}

impl OidcClient {
    pub fn new(config: &TokenLifecycleConfig) -> Result<Self> {
        Self::with_base_url(
            config.oidc.oidc_base(),
            config.oidc.start_url.clone(),
            config.timeouts.request(),
        )
    }

    /// Client against an explicit base URL (tests point this at a stub server).
    pub fn with_base_url(
        base_url: impl Into<String>,
        start_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            start_url: start_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn start_url(&self) -> &str {
        &self.start_url
    }

    /// Registers an ephemeral public client. Any non-2xx is a
    /// [`LifecycleError::Registration`] carrying the server's text; no retries.
    pub async fn register(&self, request: &RegistrationRequest) -> Result<ClientRegistration> {
        let body = RegisterBody {
            client_name: &request.client_name,
            client_type: "public",
            scopes: &request.scopes,
            grant_types: &request.grant_types,
            redirect_uris: request.redirect_uris.as_deref(),
            issuer_url: &request.issuer_url,
        };

        debug!(
            client_name = %request.client_name,
            grant_types = ?request.grant_types,
            "Registering OIDC client"
        );

        let response = self
            .http
            .post(format!("{}/client/register", self.base_url))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LifecycleError::Registration {
                status: status.as_u16(),
                message: text,
            });
        }

        let registered: RegisterResponse =
            serde_json::from_str(&text).map_err(|e| LifecycleError::Registration {
                status: status.as_u16(),
                message: format!("unparsable registration response: {}", e),
            })?;

        let registration = ClientRegistration {
            client_id: registered.client_id,
            client_secret: registered.client_secret.filter(|s| !s.is_empty()),
            scopes: request.scopes.iter().cloned().collect(),
            redirect_uri: request
                .redirect_uris
                .as_ref()
                .and_then(|uris| uris.first().cloned()),
            issuer_url: request.issuer_url.clone(),
        };

        debug!(client_id = %registration.short_id(), "OIDC client registered");
        Ok(registration)
    }

    /// Requests a device code / user code pair.
    pub async fn start_device_authorization(
        &self,
        registration: &ClientRegistration,
    ) -> Result<DeviceAuthorization> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Body<'a> {
            client_id: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            client_secret: Option<&'a str>,
            start_url: &'a str,
        }

        let response = self
            .http
            .post(format!("{}/device_authorization", self.base_url))
            .header("Accept", "application/json")
            .json(&Body {
                client_id: &registration.client_id,
                client_secret: registration.client_secret.as_deref(),
                start_url: &self.start_url,
            })
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LifecycleError::TokenExchange(format!(
                "device authorization failed ({}): {}",
                status.as_u16(),
                text
            )));
        }

        let authorization: DeviceAuthorization = serde_json::from_str(&text).map_err(|e| {
            LifecycleError::TokenExchange(format!("unparsable device authorization: {}", e))
        })?;

        debug!(
            user_code = %authorization.user_code,
            interval = ?authorization.interval,
            "Device authorization started"
        );
        Ok(authorization)
    }

    /// One token endpoint call. Transport failures are errors; every HTTP
    /// status comes back for the caller to classify.
    pub async fn post_token(&self, request: &TokenRequest<'_>) -> Result<TokenEndpointResponse> {
        let response = self
            .http
            .post(format!("{}/token", self.base_url))
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(TokenEndpointResponse { status, body })
    }

    /// Accepts a user code on behalf of an already-authenticated session.
    pub async fn accept_user_code(
        &self,
        user_code: &str,
        user_session_id: &str,
    ) -> Result<Option<DeviceContext>> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Body<'a> {
            user_code: &'a str,
            user_session_id: &'a str,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            #[serde(default)]
            device_context: Option<DeviceContext>,
        }

        let response = self
            .http
            .post(format!(
                "{}/device_authorization/accept_user_code",
                self.base_url
            ))
            .header("Referer", PORTAL_REFERER)
            .json(&Body {
                user_code,
                user_session_id,
            })
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LifecycleError::Portal {
                step: "accept_user_code",
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: Response = serde_json::from_str(&text)?;
        Ok(parsed.device_context)
    }

    /// Approves the device context for the client.
    pub async fn associate_token(
        &self,
        context_id: &str,
        context: &DeviceContext,
        registration: &ClientRegistration,
        user_session_id: &str,
    ) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Context<'a> {
            device_context_id: &'a str,
            client_id: &'a str,
            client_type: &'a str,
        }

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Body<'a> {
            device_context: Context<'a>,
            user_session_id: &'a str,
        }

        let body = Body {
            device_context: Context {
                device_context_id: context_id,
                client_id: context
                    .client_id
                    .as_deref()
                    .unwrap_or(&registration.client_id),
                client_type: context.client_type.as_deref().unwrap_or("public"),
            },
            user_session_id,
        };

        let response = self
            .http
            .post(format!(
                "{}/device_authorization/associate_token",
                self.base_url
            ))
            .header("Referer", PORTAL_REFERER)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LifecycleError::Portal {
                step: "associate_token",
                status: status.as_u16(),
                message: text,
            });
        }
        Ok(())
    }
}
