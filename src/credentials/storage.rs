//! File-backed credential storage.
//!
//! Each credential lives in its own JSON file under the tokens directory, so
//! concurrent registrations never contend on a shared file. Writes go through
//! a temporary file and an atomic rename.

use super::Credential;
use crate::error::{LifecycleError, Result};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A credential together with the file it was loaded from.
#[derive(Clone, Debug)]
pub struct StoredCredential {
    pub path: PathBuf,
    pub credential: Credential,
}

impl StoredCredential {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Directory of credential records.
///
/// # Layout
/// ```text
/// tokens/
///   token-BuilderId-IdC-alice-1760000000000.json
///   token-BuilderId-DeviceFlow-bob-1760000123456.json
/// ```
///
/// Old records are never pruned automatically.
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Opens (and creates if needed) a credential directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists a new credential record and returns where it was written.
    pub fn save(&self, credential: &Credential) -> Result<StoredCredential> {
        let path = self.dir.join(Self::file_name_for(credential));
        write_json_atomic(&path, credential)?;

        debug!(
            account = %credential.account_name,
            path = %path.display(),
            "Credential saved"
        );

        Ok(StoredCredential {
            path,
            credential: credential.clone(),
        })
    }

    /// Rewrites an existing record in place.
    pub fn update(&self, stored: &StoredCredential) -> Result<()> {
        write_json_atomic(&stored.path, &stored.credential)?;
        debug!(path = %stored.path.display(), "Credential updated");
        Ok(())
    }

    /// Lists every readable credential, oldest file name first.
    ///
    /// Files that fail to parse are skipped with a warning.
    pub fn list(&self) -> Result<Vec<StoredCredential>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with("token-") && name.ends_with(".json") {
                    paths.push(path);
                }
            }
        }
        paths.sort();

        let mut credentials = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::load(&path) {
                Ok(credential) => credentials.push(StoredCredential { path, credential }),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable credential file");
                }
            }
        }

        Ok(credentials)
    }

    /// Finds a credential by account name (case-insensitive) or by file
    /// name, with or without the `.json` extension.
    ///
    /// A newer record supersedes older ones for the same account, so when
    /// several match the one with the latest `created_at` wins.
    pub fn get(&self, name: &str) -> Result<Option<StoredCredential>> {
        let wanted = name.to_lowercase();
        Ok(self
            .list()?
            .into_iter()
            .filter(|stored| {
                let file_name = stored.file_name();
                stored.credential.account_name.to_lowercase() == wanted
                    || file_name == name
                    || file_name.strip_suffix(".json") == Some(name)
            })
            .max_by_key(|stored| stored.credential.created_at))
    }

    /// Like [`get`](Self::get) but a missing record is an error.
    pub fn require(&self, name: &str) -> Result<StoredCredential> {
        self.get(name)?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))
    }

    /// Deletes a credential record.
    ///
    /// # Returns
    /// * `Ok(true)` - Record deleted
    /// * `Ok(false)` - No record found
    pub fn delete(&self, name: &str) -> Result<bool> {
        match self.get(name)? {
            Some(stored) => {
                fs::remove_file(&stored.path)?;
                debug!(path = %stored.path.display(), "Credential deleted");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Picks the most usable credential: first valid one with a refresh
    /// token, else first refreshable one, else any.
    pub fn best(&self) -> Result<Option<StoredCredential>> {
        let credentials = self.list()?;

        if let Some(valid) = credentials
            .iter()
            .find(|s| !s.credential.is_expired() && s.credential.can_refresh())
        {
            return Ok(Some(valid.clone()));
        }
        if let Some(refreshable) = credentials.iter().find(|s| s.credential.can_refresh()) {
            return Ok(Some(refreshable.clone()));
        }
        Ok(credentials.into_iter().next())
    }

    fn load(path: &Path) -> Result<Credential> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Format: token-{provider}-{auth_method}-{safe_account}-{unix_millis}.json
    fn file_name_for(credential: &Credential) -> String {
        format!(
            "token-{}-{}-{}-{}.json",
            sanitize(&credential.provider),
            sanitize(&credential.auth_method),
            sanitize(&credential.account_name),
            Utc::now().timestamp_millis()
        )
    }
}

/// Replaces everything outside `[A-Za-z0-9_-]` with `_`.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Serialize to a uniquely named sibling temp file, fsync, then rename over
/// `path`.
///
/// Readers see either the previous contents or the complete new ones, and
/// concurrent writers never share a temp file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = write_temp_sibling(path, json.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Writes `contents` to a fresh `.{name}.*.tmp` file next to `path` and
/// fsyncs it. The file is removed if dropped without being persisted.
pub(crate) fn write_temp_sibling(path: &Path, contents: &[u8]) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = format!(
        ".{}.",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}
