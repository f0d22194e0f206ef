use anyhow::{Context, Result};
use idc_lifecycle::config::{load_config, TokenLifecycleConfig};
use idc_lifecycle::TokenLifecycle;
use std::path::PathBuf;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "idc_lifecycle=info".into()),
        )
        .init();

    let config = match std::env::var("IDC_LIFECYCLE_CONFIG") {
        Ok(path) => load_config(&PathBuf::from(path))?,
        Err(_) => TokenLifecycleConfig::default(),
    }
    .apply_env();

    let lifecycle = TokenLifecycle::new(config).context("Failed to initialize token lifecycle")?;

    let stored = lifecycle.list().context("Failed to list stored credentials")?;
    info!(count = stored.len(), "Stored credentials");
    for entry in &stored {
        let credential = &entry.credential;
        info!(
            account = %credential.account_name,
            auth_method = %credential.auth_method,
            expires_at = %credential.expires_at,
            expired = credential.is_expired(),
            refreshable = credential.can_refresh(),
            file = %entry.file_name(),
            "Credential"
        );
    }

    match lifecycle.get_active() {
        Ok(Some(active)) => {
            let owner = stored
                .iter()
                .find(|s| s.credential.access_token == active.access_token)
                .map(|s| s.credential.account_name.as_str())
                .unwrap_or("unknown");
            info!(
                account = %owner,
                expires_at = %active.expires_at,
                client_id_hash = %active.client_id_hash,
                "Active credential"
            );
        }
        Ok(None) => info!("No active credential"),
        Err(e) => warn!(error = %e, "Active credential unreadable"),
    }

    let backups = lifecycle.activator().list_backups()?;
    info!(count = backups.len(), "Active credential backups");

    if let Some(best) = lifecycle.best()? {
        info!(account = %best.credential.account_name, "Best candidate for activation");
    }

    Ok(())
}
