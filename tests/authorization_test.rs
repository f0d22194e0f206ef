// End-to-end authorization scenarios against a stub OIDC service

use idc_lifecycle::config::TokenLifecycleConfig;
use idc_lifecycle::flows::AuthorizationFlow;
use idc_lifecycle::{LifecycleError, TokenLifecycle};
use mockito::{Matcher, Server};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn create_test_config(server: &Server, dir: &TempDir) -> TokenLifecycleConfig {
    let mut config = TokenLifecycleConfig::default();
    config.oidc.base_url = Some(server.url());
    config.oidc.portal_base_url = Some(format!("{}/portal", server.url()));
    config.timeouts.request_seconds = 5;
    config.timeouts.authorization_seconds = 20;
    config.retry.delay_millis = 10;
    config.device.default_interval_seconds = 1;
    config.device.slow_down_increment_seconds = 1;
    config.storage.tokens_dir = dir.path().join("tokens");
    config.storage.ide_cache_dir = dir.path().join("cache");
    config
}

fn query_params(url: &str) -> HashMap<String, String> {
    let (_, query) = url.split_once('?').expect("URL has no query");
    serde_urlencoded::from_str(query).expect("Invalid query string")
}

/// Registration, browser redirect, exchange, persistence and activation.
#[tokio::test]
async fn test_pkce_flow_end_to_end() {
    let mut server = Server::new_async().await;
    let dir = TempDir::new().unwrap();

    let register = server
        .mock("POST", "/client/register")
        .match_body(Matcher::PartialJson(json!({
            "clientType": "public",
            "grantTypes": ["authorization_code", "refresh_token"]
        })))
        .with_status(200)
        .with_body(r#"{"clientId": "c1", "clientSecret": "s1"}"#)
        .expect(1)
        .create_async()
        .await;
    let token = server
        .mock("POST", "/token")
        .match_body(Matcher::PartialJson(json!({
            "clientId": "c1",
            "clientSecret": "s1",
            "grantType": "authorization_code",
            "code": "abc"
        })))
        .with_status(200)
        .with_body(r#"{"accessToken": "at1", "refreshToken": "rt1", "expiresIn": 3600}"#)
        .expect(1)
        .create_async()
        .await;

    let lifecycle = TokenLifecycle::new(create_test_config(&server, &dir)).unwrap();
    let mut flow = lifecycle.pkce_flow();

    let handle = flow.start("alice").await.unwrap();
    let params = query_params(&handle.url);
    assert!(handle.url.starts_with(&format!("{}/authorize?", server.url())));
    assert_eq!(params["client_id"], "c1");
    assert_eq!(params["code_challenge_method"], "S256");
    assert_eq!(params["code_challenge"].len(), 43);

    // Stand-in for the browser following the redirect
    let callback = format!(
        "{}?code=abc&state={}",
        params["redirect_uri"],
        urlencoding::encode(&params["state"])
    );
    let browser = tokio::spawn(async move { reqwest::get(callback).await.map(|r| r.status()) });

    let stored = lifecycle.complete(&mut flow, "alice").await.unwrap();
    assert_eq!(browser.await.unwrap().unwrap(), 200);

    register.assert_async().await;
    token.assert_async().await;
    assert!(!flow.is_listening());

    let credential = &stored.credential;
    assert_eq!(credential.access_token, "at1");
    assert_eq!(credential.refresh_token.as_deref(), Some("rt1"));
    assert_eq!(credential.auth_method, "IdC");
    assert_eq!(credential.client_registration.client_id, "c1");
    assert_eq!(
        credential.client_registration.redirect_uri.as_deref(),
        Some(params["redirect_uri"].as_str())
    );
    assert!(stored.path.exists());
    assert_eq!(lifecycle.list().unwrap().len(), 1);

    let report = lifecycle.activate(&stored, false).await.unwrap();
    assert!(report.backup_path.is_none());
    let active = lifecycle.get_active().unwrap().unwrap();
    assert_eq!(active.access_token, "at1");
    assert_eq!(active.client_id_hash, credential.client_registration.client_id_hash());
}

/// A forged state is refused at the listener and never reaches the token endpoint.
#[tokio::test]
async fn test_pkce_state_mismatch_is_rejected() {
    let mut server = Server::new_async().await;
    let dir = TempDir::new().unwrap();

    let _register = server
        .mock("POST", "/client/register")
        .with_status(200)
        .with_body(r#"{"clientId": "c1"}"#)
        .create_async()
        .await;
    let token = server.mock("POST", "/token").expect(0).create_async().await;

    let lifecycle = TokenLifecycle::new(create_test_config(&server, &dir)).unwrap();
    let mut flow = lifecycle.pkce_flow();
    let handle = flow.start("mallory").await.unwrap();
    let params = query_params(&handle.url);

    let callback = format!("{}?code=abc&state=forged", params["redirect_uri"]);
    let browser = tokio::spawn(async move { reqwest::get(callback).await.map(|r| r.status()) });

    let err = lifecycle.complete(&mut flow, "mallory").await.unwrap_err();
    assert!(matches!(err, LifecycleError::StateMismatch));
    assert_eq!(browser.await.unwrap().unwrap(), 400);

    token.assert_async().await;
    assert!(!flow.is_listening());
    assert!(lifecycle.list().unwrap().is_empty());
}

/// The human never shows up: the flow times out and releases its port.
#[tokio::test]
async fn test_pkce_timeout_releases_listener() {
    let mut server = Server::new_async().await;
    let dir = TempDir::new().unwrap();
    let _register = server
        .mock("POST", "/client/register")
        .with_status(200)
        .with_body(r#"{"clientId": "c1"}"#)
        .create_async()
        .await;

    let mut config = create_test_config(&server, &dir);
    config.timeouts.authorization_seconds = 1;
    let lifecycle = TokenLifecycle::new(config).unwrap();
    let mut flow = lifecycle.pkce_flow();
    let handle = flow.start("idle").await.unwrap();
    let redirect_uri = query_params(&handle.url)["redirect_uri"].clone();

    let err = lifecycle.complete(&mut flow, "idle").await.unwrap_err();
    assert!(matches!(err, LifecycleError::AuthorizationTimeout { seconds: 1 }));
    assert!(!matches!(err, LifecycleError::AuthorizationDenied(_)));
    assert!(!flow.is_listening());
    assert!(reqwest::get(format!("{}?code=x", redirect_uri)).await.is_err());
}

/// Two pending polls, then the device code expires.
#[tokio::test]
async fn test_device_flow_expiry() {
    let mut server = Server::new_async().await;
    let dir = TempDir::new().unwrap();

    let _register = server
        .mock("POST", "/client/register")
        .with_status(200)
        .with_body(r#"{"clientId": "dev", "clientSecret": "dev-secret"}"#)
        .create_async()
        .await;
    let _device = server
        .mock("POST", "/device_authorization")
        .with_status(200)
        .with_body(
            r#"{"deviceCode": "dc", "userCode": "ABCD-EFGH",
                "verificationUriComplete": "https://device.example/?code=ABCD-EFGH",
                "interval": 1, "expiresIn": 600}"#,
        )
        .create_async()
        .await;
    let pending = server
        .mock("POST", "/token")
        .with_status(400)
        .with_body(r#"{"error": "authorization_pending"}"#)
        .expect(2)
        .create_async()
        .await;
    let expired = server
        .mock("POST", "/token")
        .with_status(400)
        .with_body(r#"{"error": "expired_token"}"#)
        .expect(1)
        .create_async()
        .await;

    let lifecycle = TokenLifecycle::new(create_test_config(&server, &dir)).unwrap();
    let mut flow = lifecycle.device_flow();

    let mut presented = None;
    let started = Instant::now();
    let err = lifecycle
        .authorize(&mut flow, "bob", |handle| presented = Some(handle.clone()))
        .await
        .unwrap_err();

    pending.assert_async().await;
    expired.assert_async().await;
    assert!(matches!(err, LifecycleError::AuthorizationExpired(_)));
    assert!(started.elapsed() >= Duration::from_secs(2));

    let presented = presented.expect("handle was never presented");
    assert_eq!(presented.url, "https://device.example/?code=ABCD-EFGH");
    assert_eq!(presented.user_code.as_deref(), Some("ABCD-EFGH"));
    assert!(lifecycle.list().unwrap().is_empty());
}

/// Device approval after one slow_down stores a DeviceFlow credential.
#[tokio::test]
async fn test_device_flow_success_after_slow_down() {
    let mut server = Server::new_async().await;
    let dir = TempDir::new().unwrap();

    let _register = server
        .mock("POST", "/client/register")
        .with_status(200)
        .with_body(r#"{"clientId": "dev"}"#)
        .create_async()
        .await;
    let _device = server
        .mock("POST", "/device_authorization")
        .with_status(200)
        .with_body(r#"{"deviceCode": "dc", "userCode": "U", "interval": 1}"#)
        .create_async()
        .await;
    let slow_down = server
        .mock("POST", "/token")
        .match_body(Matcher::PartialJson(json!({"clientId": "dev", "deviceCode": "dc"})))
        .with_status(400)
        .with_body(r#"{"error": "slow_down"}"#)
        .expect(1)
        .create_async()
        .await;
    let _approved = server
        .mock("POST", "/token")
        .with_status(200)
        .with_body(r#"{"access_token": "dev-at", "refresh_token": "dev-rt", "expires_in": 1200}"#)
        .create_async()
        .await;

    let lifecycle = TokenLifecycle::new(create_test_config(&server, &dir)).unwrap();
    let mut flow = lifecycle.device_flow();

    let started = Instant::now();
    let stored = lifecycle.authorize(&mut flow, "carol", |_| {}).await.unwrap();

    slow_down.assert_async().await;
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(stored.credential.access_token, "dev-at");
    assert_eq!(stored.credential.auth_method, "DeviceFlow");
    assert!(stored.credential.client_registration.client_secret.is_none());
    assert!(stored.file_name().starts_with("token-BuilderId-DeviceFlow-carol-"));
}

/// The portal session approves the device code without a browser.
#[tokio::test]
async fn test_sso_bootstrap_end_to_end() {
    let mut server = Server::new_async().await;
    let dir = TempDir::new().unwrap();

    let _register = server
        .mock("POST", "/client/register")
        .with_status(200)
        .with_body(r#"{"clientId": "sso", "clientSecret": "sso-secret"}"#)
        .create_async()
        .await;
    let _device = server
        .mock("POST", "/device_authorization")
        .with_status(200)
        .with_body(r#"{"deviceCode": "dc", "userCode": "SSO-1", "interval": 1}"#)
        .create_async()
        .await;
    let _who_am_i = server
        .mock("GET", "/portal/token/whoAmI")
        .match_header("authorization", "Bearer session-cookie")
        .with_status(200)
        .create_async()
        .await;
    let _session = server
        .mock("POST", "/portal/session/device")
        .with_status(200)
        .with_body(r#"{"token": "device-session"}"#)
        .create_async()
        .await;
    let _accept = server
        .mock("POST", "/device_authorization/accept_user_code")
        .with_status(200)
        .with_body(r#"{"deviceContext": {"deviceContextId": "ctx"}}"#)
        .create_async()
        .await;
    let associate = server
        .mock("POST", "/device_authorization/associate_token")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let _token = server
        .mock("POST", "/token")
        .with_status(200)
        .with_body(r#"{"accessToken": "sso-at", "refreshToken": "sso-rt", "expiresIn": 3600}"#)
        .create_async()
        .await;

    let lifecycle = TokenLifecycle::new(create_test_config(&server, &dir)).unwrap();
    let mut flow = lifecycle.sso_flow("session-cookie").unwrap();

    let stored = lifecycle.authorize(&mut flow, "dave", |_| {}).await.unwrap();

    associate.assert_async().await;
    assert_eq!(stored.credential.access_token, "sso-at");
    assert_eq!(stored.credential.auth_method, "IdC");
    assert_eq!(
        flow.provenance(),
        idc_lifecycle::credentials::Provenance::SsoCookie
    );

    let report = lifecycle.activate_by_name("dave", false).await.unwrap();
    let cached = lifecycle
        .activator()
        .get_registration(&report.client_id_hash)
        .unwrap()
        .unwrap();
    assert_eq!(cached.client_id, "sso");
    assert_eq!(cached.client_secret.as_deref(), Some("sso-secret"));
}
