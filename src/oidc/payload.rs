//! Wire shapes for the OIDC token endpoint.
//!
//! The server is inconsistent about key casing across flows
//! (`accessToken` vs `access_token`). Everything is normalized here into one
//! [`TokenSet`]; nothing past this module sees the raw payload.

use crate::credentials::ClientRegistration;
use serde::Serialize;
use serde_json::Value;

/// Lifetime assumed when the server omits `expiresIn`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Upper bound on an accepted `expiresIn`: ten years.
pub const MAX_EXPIRES_IN: i64 = 10 * 365 * 24 * 3600;

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// Normalized token endpoint response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    /// Seconds from issuance
    pub expires_in: i64,
}

/// Token endpoint request body. Field names are camelCase on the wire.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest<'a> {
    client_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<&'a str>,
    grant_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_uri: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_verifier: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

impl<'a> TokenRequest<'a> {
    fn base(registration: &'a ClientRegistration, grant_type: &'static str) -> Self {
        Self {
            client_id: &registration.client_id,
            client_secret: registration.client_secret.as_deref(),
            grant_type,
            code: None,
            redirect_uri: None,
            code_verifier: None,
            device_code: None,
            refresh_token: None,
        }
    }

    pub fn authorization_code(
        registration: &'a ClientRegistration,
        code: &'a str,
        redirect_uri: &'a str,
        code_verifier: &'a str,
    ) -> Self {
        Self {
            code: Some(code),
            redirect_uri: Some(redirect_uri),
            code_verifier: Some(code_verifier),
            ..Self::base(registration, GRANT_AUTHORIZATION_CODE)
        }
    }

    pub fn device_code(registration: &'a ClientRegistration, device_code: &'a str) -> Self {
        Self {
            device_code: Some(device_code),
            ..Self::base(registration, GRANT_DEVICE_CODE)
        }
    }

    pub fn refresh(registration: &'a ClientRegistration, refresh_token: &'a str) -> Self {
        Self {
            refresh_token: Some(refresh_token),
            ..Self::base(registration, GRANT_REFRESH_TOKEN)
        }
    }
}

/// Raw status and body of a token endpoint call, classified lazily.
#[derive(Clone, Debug)]
pub struct TokenEndpointResponse {
    pub status: u16,
    pub body: String,
}

impl TokenEndpointResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    /// OAuth `error` code from the body, if any.
    pub fn error_code(&self) -> Option<String> {
        self.json()?.get("error")?.as_str().map(String::from)
    }

    /// Structured ban/denial reason: a 400 whose JSON body carries `reason`.
    pub fn ban_reason(&self) -> Option<String> {
        if self.status != 400 {
            return None;
        }
        let json = self.json()?;
        match json.get("reason")? {
            Value::String(reason) => Some(reason.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn tokens(&self) -> Result<TokenSet, String> {
        normalize_token_payload(&self.body)
    }
}

/// Map either key spelling into a [`TokenSet`].
pub fn normalize_token_payload(body: &str) -> Result<TokenSet, String> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| format!("invalid token response JSON: {}", e))?;

    let access_token = pick_str(&value, "accessToken", "access_token")
        .ok_or_else(|| "token response missing access token".to_string())?;

    let expires_in = pick(&value, "expiresIn", "expires_in")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(DEFAULT_EXPIRES_IN);
    if !(0..=MAX_EXPIRES_IN).contains(&expires_in) {
        return Err(format!("token lifetime out of range: expiresIn={}", expires_in));
    }

    Ok(TokenSet {
        access_token,
        refresh_token: pick_str(&value, "refreshToken", "refresh_token")
            .filter(|token| !token.is_empty()),
        token_type: pick_str(&value, "tokenType", "token_type")
            .unwrap_or_else(|| "Bearer".to_string()),
        expires_in,
    })
}

fn pick<'v>(value: &'v Value, camel: &str, snake: &str) -> Option<&'v Value> {
    value
        .get(camel)
        .filter(|v| !v.is_null())
        .or_else(|| value.get(snake).filter(|v| !v.is_null()))
}

fn pick_str(value: &Value, camel: &str, snake: &str) -> Option<String> {
    pick(value, camel, snake)?.as_str().map(String::from)
}
