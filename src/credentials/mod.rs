//! Durable OAuth credentials and the projection the IDE reads.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - one JSON file per Credential          │
//! │  - list / get / save / update / delete   │
//! └─────────────────────────────────────────┘
//!          ↓ (promote one)
//! ┌─────────────────────────────────────────┐
//! │       CredentialActivator                │
//! │  - ActiveCredential projection           │
//! │  - timestamped backup of previous slot   │
//! │  - temp file + atomic rename             │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use idc_lifecycle::credentials::CredentialStore;
//!
//! # fn main() -> idc_lifecycle::error::Result<()> {
//! let store = CredentialStore::new("/tmp/tokens")?;
//! for stored in store.list()? {
//!     println!("{} expired={}", stored.credential.account_name, stored.credential.is_expired());
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

mod activation;
mod storage;

pub use activation::{ActivationReport, CredentialActivator, RegistrationCacheEntry};
pub use storage::{CredentialStore, StoredCredential};

use crate::oidc::TokenSet;

/// An ephemeral public OAuth client registered for one authorization attempt.
///
/// Persisted inside every [`Credential`] it produced so refresh can reuse it
/// without registering again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub client_id: String,

    /// Public clients may be issued no secret at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    pub scopes: BTreeSet<String>,

    /// Only set for the PKCE flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,

    pub issuer_url: String,
}

impl ClientRegistration {
    /// Deterministic key for registration-specific cached artifacts:
    /// lowercase hex SHA-256 of the client id.
    pub fn client_id_hash(&self) -> String {
        hex::encode(Sha256::digest(self.client_id.as_bytes()))
    }

    /// Client id shortened for log output.
    pub fn short_id(&self) -> &str {
        let end = self
            .client_id
            .char_indices()
            .nth(20)
            .map(|(i, _)| i)
            .unwrap_or(self.client_id.len());
        &self.client_id[..end]
    }
}

/// Which authorization flow produced a credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Pkce,
    DeviceCode,
    SsoCookie,
}

impl Provenance {
    /// The `authMethod` label the IDE expects for this flow.
    pub fn auth_method(&self) -> &'static str {
        match self {
            Provenance::Pkce | Provenance::SsoCookie => "IdC",
            Provenance::DeviceCode => "DeviceFlow",
        }
    }
}

/// Descriptive fields attached to a credential when it is minted.
#[derive(Clone, Debug)]
pub struct CredentialMeta {
    pub account_name: String,
    pub provider: String,
    pub region: String,
    pub provenance: Provenance,
}

/// One stored OAuth credential set.
///
/// `expires_at` keeps the timezone-aware form it was written with; equality
/// and expiry checks compare instants. A credential without a refresh token
/// can never be renewed silently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    pub token_type: String,

    pub expires_at: DateTime<FixedOffset>,

    pub account_name: String,
    pub provider: String,
    pub auth_method: String,
    pub region: String,

    pub client_registration: ClientRegistration,

    pub created_at: DateTime<Utc>,

    pub provenance: Provenance,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Mint a credential from a freshly issued token set.
    pub fn from_tokens(
        tokens: TokenSet,
        registration: ClientRegistration,
        meta: CredentialMeta,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_type: tokens.token_type,
            expires_at: expiry_after(now, tokens.expires_in).into(),
            account_name: meta.account_name,
            provider: meta.provider,
            auth_method: meta.provenance.auth_method().to_string(),
            region: meta.region,
            client_registration: registration,
            created_at: now,
            provenance: meta.provenance,
            refreshed_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.with_timezone(&Utc) <= now
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }

    /// Apply a refresh response: new access token and expiry, and the
    /// refresh token only if the server rotated it.
    pub fn apply_refresh(&mut self, tokens: TokenSet, now: DateTime<Utc>) {
        self.access_token = tokens.access_token;
        self.expires_at = expiry_after(now, tokens.expires_in).into();
        if let Some(rotated) = tokens.refresh_token {
            self.refresh_token = Some(rotated);
        }
        self.token_type = tokens.token_type;
        self.refreshed_at = Some(now);
    }

    /// The minimal projection written into the IDE's active slot.
    pub fn active_projection(&self) -> ActiveCredential {
        ActiveCredential {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at,
            client_id_hash: self.client_registration.client_id_hash(),
            auth_method: self.auth_method.clone(),
            provider: self.provider.clone(),
            region: self.region.clone(),
        }
    }
}

/// `now + seconds`, saturating at the largest representable instant.
fn expiry_after(now: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    Duration::try_seconds(seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Contents of the well-known active-credential file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCredential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<FixedOffset>,
    pub client_id_hash: String,
    pub auth_method: String,
    pub provider: String,
    pub region: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_registration() -> ClientRegistration {
        ClientRegistration {
            client_id: "client-abcdefghijklmnopqrstuvwxyz".to_string(),
            client_secret: Some("secret".to_string()),
            scopes: ["codewhisperer:completions".to_string()].into_iter().collect(),
            redirect_uri: None,
            issuer_url: "https://view.awsapps.com/start".to_string(),
        }
    }

    pub(crate) fn sample_credential(account: &str, expires_in: i64) -> Credential {
        Credential::from_tokens(
            TokenSet {
                access_token: format!("at-{}", account),
                refresh_token: Some(format!("rt-{}", account)),
                token_type: "Bearer".to_string(),
                expires_in,
            },
            sample_registration(),
            CredentialMeta {
                account_name: account.to_string(),
                provider: "BuilderId".to_string(),
                region: "us-east-1".to_string(),
                provenance: Provenance::Pkce,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_roundtrip_preserves_expiry_and_classification() {
        let mut credential = sample_credential("alice", 3600);
        // Non-UTC offset must survive and compare by instant
        credential.expires_at = credential
            .expires_at
            .with_timezone(&FixedOffset::east_opt(3 * 3600).unwrap());

        let json = serde_json::to_string(&credential).unwrap();
        let reloaded: Credential = serde_json::from_str(&json).unwrap();

        assert_eq!(reloaded, credential);
        assert_eq!(reloaded.expires_at.offset(), credential.expires_at.offset());
        assert_eq!(reloaded.is_expired(), credential.is_expired());
        assert!(json.contains("\"accessToken\""));
        assert!(json.contains("\"clientRegistration\""));
    }

    #[test]
    fn test_expired_classification() {
        let credential = sample_credential("bob", -10);
        assert!(credential.is_expired());

        let credential = sample_credential("bob", 600);
        assert!(!credential.is_expired());
        assert!(credential.is_expired_at(Utc::now() + Duration::seconds(601)));
    }

    #[test]
    fn test_huge_lifetime_saturates() {
        let credential = sample_credential("zed", i64::MAX);
        assert_eq!(credential.expires_at.with_timezone(&Utc), DateTime::<Utc>::MAX_UTC);
        assert!(!credential.is_expired());

        let mut credential = sample_credential("zed", 60);
        credential.apply_refresh(
            TokenSet {
                access_token: "at".to_string(),
                refresh_token: None,
                token_type: "Bearer".to_string(),
                expires_in: i64::MAX,
            },
            Utc::now(),
        );
        assert_eq!(credential.expires_at.with_timezone(&Utc), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_can_refresh() {
        let mut credential = sample_credential("carol", 60);
        assert!(credential.can_refresh());
        credential.refresh_token = Some(String::new());
        assert!(!credential.can_refresh());
        credential.refresh_token = None;
        assert!(!credential.can_refresh());
    }

    #[test]
    fn test_apply_refresh_keeps_refresh_token_without_rotation() {
        let mut credential = sample_credential("dave", -5);
        let now = Utc::now();
        credential.apply_refresh(
            TokenSet {
                access_token: "new-at".to_string(),
                refresh_token: None,
                token_type: "Bearer".to_string(),
                expires_in: 3600,
            },
            now,
        );
        assert_eq!(credential.access_token, "new-at");
        assert_eq!(credential.refresh_token.as_deref(), Some("rt-dave"));
        assert!(!credential.is_expired());
        assert_eq!(credential.refreshed_at, Some(now));

        credential.apply_refresh(
            TokenSet {
                access_token: "newer-at".to_string(),
                refresh_token: Some("rotated".to_string()),
                token_type: "Bearer".to_string(),
                expires_in: 3600,
            },
            now,
        );
        assert_eq!(credential.refresh_token.as_deref(), Some("rotated"));
    }

    #[test]
    fn test_client_id_hash_is_deterministic() {
        let registration = sample_registration();
        let hash = registration.client_id_hash();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, sample_registration().client_id_hash());
        assert_eq!(registration.short_id().len(), 20);
    }

    #[test]
    fn test_active_projection() {
        let credential = sample_credential("erin", 3600);
        let active = credential.active_projection();
        assert_eq!(active.access_token, "at-erin");
        assert_eq!(active.auth_method, "IdC");
        assert_eq!(
            active.client_id_hash,
            credential.client_registration.client_id_hash()
        );
    }
}
