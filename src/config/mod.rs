use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete token lifecycle configuration.
///
/// Built once by whoever assembles the components and handed to each
/// constructor; nothing looks paths or endpoints up on its own.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenLifecycleConfig {
    #[serde(default)]
    pub oidc: OidcConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub activation: ActivationConfig,
}

/// Authorization server endpoints and client identity
#[derive(Debug, Clone, Deserialize)]
pub struct OidcConfig {
    #[serde(default = "default_region")]
    pub region: String,
    /// Overrides `https://oidc.{region}.amazonaws.com`
    #[serde(default)]
    pub base_url: Option<String>,
    /// Overrides `https://portal.sso.{region}.amazonaws.com`
    #[serde(default)]
    pub portal_base_url: Option<String>,
    #[serde(default = "default_start_url")]
    pub start_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_start_url() -> String {
    "https://view.awsapps.com/start".to_string()
}

fn default_scopes() -> Vec<String> {
    [
        "codewhisperer:completions",
        "codewhisperer:analysis",
        "codewhisperer:conversations",
        "codewhisperer:taskassist",
        "codewhisperer:transformations",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_client_name() -> String {
    "Kiro IDE".to_string()
}

fn default_provider() -> String {
    "BuilderId".to_string()
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            base_url: None,
            portal_base_url: None,
            start_url: default_start_url(),
            scopes: default_scopes(),
            client_name: default_client_name(),
            provider: default_provider(),
        }
    }
}

impl OidcConfig {
    /// OIDC service base URL (no trailing slash)
    pub fn oidc_base(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://oidc.{}.amazonaws.com", self.region),
        }
    }

    /// SSO portal base URL used by the cookie bootstrap (no trailing slash)
    pub fn portal_base(&self) -> String {
        match &self.portal_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://portal.sso.{}.amazonaws.com", self.region),
        }
    }
}

/// Timeouts (seconds)
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Per HTTP request
    #[serde(default = "default_request_seconds")]
    pub request_seconds: u64,
    /// How long a human gets to finish a browser or device consent
    #[serde(default = "default_authorization_seconds")]
    pub authorization_seconds: u64,
    /// Polling bound for the SSO-cookie bootstrap, which needs no human
    #[serde(default = "default_sso_poll_seconds")]
    pub sso_poll_seconds: u64,
}

fn default_request_seconds() -> u64 {
    30
}

fn default_authorization_seconds() -> u64 {
    300
}

fn default_sso_poll_seconds() -> u64 {
    120
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_seconds: default_request_seconds(),
            authorization_seconds: default_authorization_seconds(),
            sso_poll_seconds: default_sso_poll_seconds(),
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_seconds)
    }

    pub fn authorization(&self) -> Duration {
        Duration::from_secs(self.authorization_seconds)
    }

    pub fn sso_poll(&self) -> Duration {
        Duration::from_secs(self.sso_poll_seconds)
    }
}

/// Retry policy for refresh (never applied to one-time grant exchange)
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_millis")]
    pub delay_millis: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_millis() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_millis: default_delay_millis(),
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_millis)
    }
}

/// Device-code polling
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Used when the server does not advertise an interval
    #[serde(default = "default_interval_seconds")]
    pub default_interval_seconds: u64,
    /// Added to the interval on every `slow_down`
    #[serde(default = "default_slow_down_increment")]
    pub slow_down_increment_seconds: u64,
}

fn default_interval_seconds() -> u64 {
    5
}

fn default_slow_down_increment() -> u64 {
    5
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            default_interval_seconds: default_interval_seconds(),
            slow_down_increment_seconds: default_slow_down_increment(),
        }
    }
}

/// Local PKCE callback listener
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_callback_host")]
    pub host: String,
    /// 0 lets the OS pick a free port
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_callback_path")]
    pub path: String,
}

fn default_callback_host() -> String {
    "127.0.0.1".to_string()
}

fn default_callback_path() -> String {
    "/oauth/callback".to_string()
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            host: default_callback_host(),
            port: 0,
            path: default_callback_path(),
        }
    }
}

/// On-disk locations
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// One JSON file per stored credential
    #[serde(default = "default_tokens_dir")]
    pub tokens_dir: PathBuf,
    /// Directory the IDE reads its active credential from
    #[serde(default = "default_ide_cache_dir")]
    pub ide_cache_dir: PathBuf,
    #[serde(default = "default_active_file_name")]
    pub active_file_name: String,
    /// Lifetime stamped on the cached client registration
    #[serde(default = "default_registration_ttl_days")]
    pub registration_ttl_days: i64,
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_tokens_dir() -> PathBuf {
    home_dir().join(".kiro-batch-login").join("tokens")
}

fn default_ide_cache_dir() -> PathBuf {
    home_dir().join(".aws").join("sso").join("cache")
}

fn default_active_file_name() -> String {
    "kiro-auth-token.json".to_string()
}

fn default_registration_ttl_days() -> i64 {
    90
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tokens_dir: default_tokens_dir(),
            ide_cache_dir: default_ide_cache_dir(),
            active_file_name: default_active_file_name(),
            registration_ttl_days: default_registration_ttl_days(),
        }
    }
}

impl StorageConfig {
    pub fn active_file(&self) -> PathBuf {
        self.ide_cache_dir.join(&self.active_file_name)
    }
}

/// Activation policy
#[derive(Debug, Clone, Deserialize)]
pub struct ActivationConfig {
    /// Refresh expired credentials before promoting them
    #[serde(default = "default_require_fresh")]
    pub require_fresh: bool,
}

fn default_require_fresh() -> bool {
    true
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            require_fresh: default_require_fresh(),
        }
    }
}

impl TokenLifecycleConfig {
    /// Override selected values from `IDC_LIFECYCLE_*` env vars.
    /// Unparsable values are ignored.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("IDC_LIFECYCLE_REGION") {
            self.oidc.region = v;
        }
        if let Ok(v) = std::env::var("IDC_LIFECYCLE_OIDC_BASE_URL") {
            self.oidc.base_url = Some(v);
        }
        if let Ok(v) = std::env::var("IDC_LIFECYCLE_PORTAL_BASE_URL") {
            self.oidc.portal_base_url = Some(v);
        }
        if let Ok(v) = std::env::var("IDC_LIFECYCLE_TOKENS_DIR") {
            self.storage.tokens_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("IDC_LIFECYCLE_IDE_CACHE_DIR") {
            self.storage.ide_cache_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("IDC_LIFECYCLE_REQUEST_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.timeouts.request_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("IDC_LIFECYCLE_AUTHORIZATION_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.timeouts.authorization_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("IDC_LIFECYCLE_RETRY_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse::<u32>() {
                self.retry.max_attempts = n;
            }
        }
        self
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &Path) -> Result<TokenLifecycleConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: TokenLifecycleConfig =
        toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}
