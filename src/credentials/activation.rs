//! Promotion of one stored credential into the IDE's active slot.
//!
//! The slot is a single well-known file. Promotion never destroys the previous
//! contents: they are preserved under a timestamped backup name before the new
//! projection is renamed into place.

use super::storage::{write_json_atomic, write_temp_sibling};
use super::{ActiveCredential, Credential};
use crate::config::StorageConfig;
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Cached client registration written next to the active slot, keyed by
/// the registration hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationCacheEntry {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a successful activation.
#[derive(Clone, Debug)]
pub struct ActivationReport {
    pub active_path: PathBuf,
    /// Where the previous slot contents were preserved, if there were any
    pub backup_path: Option<PathBuf>,
    pub client_id_hash: String,
}

/// Owns the active-credential slot.
///
/// # Thread Safety
/// - The backup-then-replace sequence runs under a mutex, so concurrent
///   activations through one activator never interleave.
/// - Temp files are uniquely named and backups are created exclusively, so
///   separate activators or processes sharing a cache dir never truncate or
///   overwrite each other's files.
pub struct CredentialActivator {
    cache_dir: PathBuf,
    active_file: PathBuf,
    registration_ttl: Duration,
    lock: Mutex<()>,
}

impl CredentialActivator {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            cache_dir: config.ide_cache_dir.clone(),
            active_file: config.active_file(),
            registration_ttl: Duration::days(config.registration_ttl_days),
            lock: Mutex::new(()),
        }
    }

    pub fn active_file(&self) -> &Path {
        &self.active_file
    }

    /// Path of the cached registration artifact for a registration hash.
    pub fn registration_file(&self, client_id_hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", client_id_hash))
    }

    /// Makes `credential` the one the IDE reads.
    ///
    /// 1. Write the new projection to a unique temp file and fsync it
    /// 2. Cache the client registration under its hash
    /// 3. Preserve the current slot (if any) under a timestamped backup name
    /// 4. Atomically rename the temp file over the slot
    ///
    /// Any failure before step 4 leaves the slot untouched.
    ///
    /// The caller is responsible for freshness; see
    /// [`TokenLifecycle::activate`](crate::lifecycle::TokenLifecycle::activate).
    pub fn activate(&self, credential: &Credential) -> Result<ActivationReport> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        fs::create_dir_all(&self.cache_dir)?;

        let projection = credential.active_projection();
        let json = serde_json::to_string_pretty(&projection)?;
        let tmp = write_temp_sibling(&self.active_file, json.as_bytes())?;

        let client_id_hash = projection.client_id_hash.clone();
        let registration = &credential.client_registration;
        let entry = RegistrationCacheEntry {
            client_id: registration.client_id.clone(),
            client_secret: registration.client_secret.clone(),
            expires_at: Utc::now() + self.registration_ttl,
        };
        write_json_atomic(&self.registration_file(&client_id_hash), &entry)?;

        let backup_path = if self.active_file.exists() {
            let backup_path = self.backup_active_slot()?;
            debug!(backup = %backup_path.display(), "Previous active credential backed up");
            Some(backup_path)
        } else {
            None
        };

        tmp.persist(&self.active_file).map_err(|e| e.error)?;

        info!(
            account = %credential.account_name,
            client_id = %registration.short_id(),
            backed_up = backup_path.is_some(),
            "Credential activated"
        );

        Ok(ActivationReport {
            active_path: self.active_file.clone(),
            backup_path,
            client_id_hash,
        })
    }

    /// Reads the active slot. A missing slot is `Ok(None)`.
    pub fn get_active(&self) -> Result<Option<ActiveCredential>> {
        if !self.active_file.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.active_file)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Reads a cached registration artifact, if present.
    pub fn get_registration(&self, client_id_hash: &str) -> Result<Option<RegistrationCacheEntry>> {
        let path = self.registration_file(client_id_hash);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Backups of the active slot, oldest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        if !self.cache_dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}.backup.", self.active_stem());
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with(&prefix) && name.ends_with(".json") {
                    backups.push(path);
                }
            }
        }
        backups.sort();
        Ok(backups)
    }

    fn active_stem(&self) -> String {
        self.active_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "active".to_string())
    }

    /// Keeps the current slot reachable under
    /// `{stem}.backup.{YYYYmmdd_HHMMSS_mmm}.json`, suffixed `-n` on collision.
    ///
    /// Hard links where the filesystem allows it and copies otherwise. The
    /// backup name is claimed exclusively, so an existing backup is never
    /// overwritten and the slot is never left absent.
    fn backup_active_slot(&self) -> Result<PathBuf> {
        let stem = self.active_stem();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string();

        let mut attempt: u64 = 0;
        loop {
            let candidate = if attempt == 0 {
                self.cache_dir
                    .join(format!("{}.backup.{}.json", stem, timestamp))
            } else {
                self.cache_dir
                    .join(format!("{}.backup.{}-{}.json", stem, timestamp, attempt))
            };
            attempt += 1;

            let claimed = match fs::hard_link(&self.active_file, &candidate) {
                Err(e) if e.kind() != ErrorKind::AlreadyExists => {
                    warn!(error = %e, "Hard link for backup failed, copying instead");
                    copy_exclusive(&self.active_file, &candidate)
                }
                other => other,
            };
            match claimed {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Copies `from` to `to`, failing with `AlreadyExists` rather than
/// replacing an existing file.
fn copy_exclusive(from: &Path, to: &Path) -> io::Result<()> {
    let mut source = File::open(from)?;
    let mut target = OpenOptions::new().write(true).create_new(true).open(to)?;
    io::copy(&mut source, &mut target)?;
    target.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::storage::tests::leftover_temp_files;
    use crate::credentials::tests::sample_credential;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_storage_config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            tokens_dir: dir.path().join("tokens"),
            ide_cache_dir: dir.path().join("cache"),
            active_file_name: "active-token.json".to_string(),
            registration_ttl_days: 90,
        }
    }

    fn create_test_activator() -> (TempDir, CredentialActivator) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let activator = CredentialActivator::new(&test_storage_config(&dir));
        (dir, activator)
    }

    #[test]
    fn test_first_activation_creates_slot_without_backup() {
        let (dir, activator) = create_test_activator();
        assert!(activator.get_active().unwrap().is_none());

        let credential = sample_credential("alice", 3600);
        let report = activator.activate(&credential).unwrap();

        assert!(report.backup_path.is_none());
        assert!(activator.list_backups().unwrap().is_empty());
        let active = activator.get_active().unwrap().unwrap();
        assert_eq!(active, credential.active_projection());
        assert!(leftover_temp_files(&dir.path().join("cache")).is_empty());
    }

    #[test]
    fn test_second_activation_backs_up_previous_slot() {
        let (_dir, activator) = create_test_activator();
        let a = sample_credential("alice", 3600);
        let b = sample_credential("bob", 3600);

        activator.activate(&a).unwrap();
        let report = activator.activate(&b).unwrap();

        let backups = activator.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(report.backup_path.as_ref(), Some(&backups[0]));

        let backed_up: ActiveCredential =
            serde_json::from_str(&fs::read_to_string(&backups[0]).unwrap()).unwrap();
        assert_eq!(backed_up, a.active_projection());

        let active = activator.get_active().unwrap().unwrap();
        assert_eq!(active, b.active_projection());
    }

    #[test]
    fn test_interrupted_write_leaves_slot_intact() {
        let (_dir, activator) = create_test_activator();
        let a = sample_credential("alice", 3600);
        activator.activate(&a).unwrap();

        // A crash after writing half of a temp file
        let stray = activator
            .active_file()
            .with_file_name(".active-token.json.crashed.tmp");
        fs::write(&stray, "{\"accessToken\": \"half").unwrap();

        let active = activator.get_active().unwrap().unwrap();
        assert_eq!(active, a.active_projection());

        // The next activation is unaffected by the stray file
        let b = sample_credential("bob", 3600);
        activator.activate(&b).unwrap();
        assert_eq!(activator.get_active().unwrap().unwrap(), b.active_projection());
        assert_eq!(leftover_temp_files(stray.parent().unwrap()), vec![stray.clone()]);
    }

    #[test]
    fn test_registration_cache_failure_leaves_slot_untouched() {
        let (_dir, activator) = create_test_activator();
        let a = sample_credential("alice", 3600);
        activator.activate(&a).unwrap();

        let mut b = sample_credential("bob", 3600);
        b.client_registration.client_id = "client-for-bob".to_string();
        // A directory squatting on the cache file makes the cache write fail
        let cache_file = activator.registration_file(&b.client_registration.client_id_hash());
        fs::create_dir_all(cache_file.join("occupied")).unwrap();

        assert!(activator.activate(&b).is_err());
        assert_eq!(activator.get_active().unwrap().unwrap(), a.active_projection());
        assert!(activator.list_backups().unwrap().is_empty());
        assert!(leftover_temp_files(activator.active_file().parent().unwrap()).is_empty());
    }

    #[test]
    fn test_registration_cache_written() {
        let (_dir, activator) = create_test_activator();
        let credential = sample_credential("carol", 3600);

        let report = activator.activate(&credential).unwrap();

        let entry = activator
            .get_registration(&report.client_id_hash)
            .unwrap()
            .expect("registration cache missing");
        assert_eq!(entry.client_id, credential.client_registration.client_id);
        assert_eq!(entry.client_secret, credential.client_registration.client_secret);
        assert!(entry.expires_at > Utc::now() + Duration::days(89));
    }

    #[test]
    fn test_concurrent_activations_serialize() {
        let (_dir, activator) = create_test_activator();
        let activator = std::sync::Arc::new(activator);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let activator = activator.clone();
                std::thread::spawn(move || {
                    activator
                        .activate(&sample_credential(&format!("user{}", i), 3600))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every activation after the first preserved exactly one backup
        assert_eq!(activator.list_backups().unwrap().len(), 7);
        let active = activator.get_active().unwrap().unwrap();
        assert!(active.access_token.starts_with("at-user"));
    }

    #[test]
    fn test_separate_activators_share_cache_dir() {
        let dir = TempDir::new().unwrap();
        let config = test_storage_config(&dir);
        let first = Arc::new(CredentialActivator::new(&config));
        let second = Arc::new(CredentialActivator::new(&config));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let activator = if i % 2 == 0 { first.clone() } else { second.clone() };
                std::thread::spawn(move || {
                    for round in 0..5 {
                        activator
                            .activate(&sample_credential(&format!("user{}-{}", i, round), 3600))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let active = first.get_active().unwrap().unwrap();
        assert!(active.access_token.starts_with("at-user"));
        assert!(leftover_temp_files(&dir.path().join("cache")).is_empty());

        // Every backup is a complete projection, none clobbered mid-write
        let backups = first.list_backups().unwrap();
        assert!(!backups.is_empty());
        for backup in backups {
            let _: ActiveCredential =
                serde_json::from_str(&fs::read_to_string(&backup).unwrap()).unwrap();
        }
    }
}
