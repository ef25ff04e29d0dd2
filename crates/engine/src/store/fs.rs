//! Filesystem record store
//!
//! # Directory Structure
//!
//! ```text
//! data_dir/
//! ├── account.key           # ACME account key, PKCS#8 PEM (0600)
//! ├── certificates/
//! │   └── cert_<id>.json    # Certificate record (0600)
//! ├── renewals/
//! │   └── renew_<id>.json   # Renewal record (0600)
//! └── secrets/
//!     └── <handle>.pem      # Sealed private key (0600)
//! ```
//!
//! Records are written to a temporary file and renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use certmill_common::{CertificateId, RenewalId, SubscriptionId};

use crate::error::{EngineError, EngineResult, StorageError};
use crate::issuance::{Certificate, RenewalRecord};
use crate::ports::{CertificateRepository, RenewalRepository, SecretVault};

const CERTIFICATES_DIR: &str = "certificates";
const RENEWALS_DIR: &str = "renewals";
const SECRETS_DIR: &str = "secrets";
const ACCOUNT_KEY_FILE: &str = "account.key";

/// Prefix of the handles [`FileSecretVault`] hands out
const HANDLE_PREFIX: &str = "vault:";

fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Write `content` through a temporary file with 0600 permissions
fn write_private(path: &Path, content: &str) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn create_private_dir(dir: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct FileCertificateStore {
    base_path: PathBuf,
}

impl FileCertificateStore {
    /// Open (and create) the store with 0700 directories
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        for dir in [
            base_path.to_path_buf(),
            base_path.join(CERTIFICATES_DIR),
            base_path.join(RENEWALS_DIR),
        ] {
            create_private_dir(&dir)?;
        }

        info!(storage_path = %base_path.display(), "Initialized certificate store");
        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Load the stored ACME account key
    pub fn load_account_key(&self) -> Result<Option<String>, StorageError> {
        let path = self.base_path.join(ACCOUNT_KEY_FILE);
        if !path.exists() {
            trace!("No stored account key");
            return Ok(None);
        }
        let pem = fs::read_to_string(&path)?;
        debug!(path = %path.display(), "Loaded account key");
        Ok(Some(pem))
    }

    /// Save the ACME account key (0600)
    pub fn save_account_key(&self, pem: &str) -> Result<(), StorageError> {
        let path = self.base_path.join(ACCOUNT_KEY_FILE);
        write_private(&path, pem)?;
        info!(path = %path.display(), "Saved account key");
        Ok(())
    }

    fn record_path(&self, dir: &str, id: &str) -> Result<PathBuf, StorageError> {
        if !is_safe_id(id) {
            return Err(StorageError::Serialization(format!("refusing unsafe record id '{}'", id)));
        }
        Ok(self.base_path.join(dir).join(format!("{}.json", id)))
    }

    fn write_record<T: Serialize>(&self, dir: &str, id: &str, record: &T) -> Result<(), StorageError> {
        let path = self.record_path(dir, id)?;
        let content = serde_json::to_string_pretty(record)?;
        write_private(&path, &content)?;

        trace!(path = %path.display(), "Wrote record");
        Ok(())
    }

    fn read_record<T: DeserializeOwned>(&self, dir: &str, id: &str) -> Result<Option<T>, StorageError> {
        let path = self.record_path(dir, id)?;
        if !path.exists() {
            trace!(path = %path.display(), "No stored record");
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn read_all<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>, StorageError> {
        let dir_path = self.base_path.join(dir);
        if !dir_path.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str(&content) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }

    /// Remove a certificate record
    pub fn delete_certificate(&self, id: &CertificateId) -> Result<(), StorageError> {
        let path = self.record_path(CERTIFICATES_DIR, id.as_str())?;
        if path.exists() {
            fs::remove_file(&path)?;
            info!(certificate_id = %id, "Deleted certificate record");
        } else {
            warn!(certificate_id = %id, "Certificate record to delete not found");
        }
        Ok(())
    }
}

#[async_trait]
impl CertificateRepository for FileCertificateStore {
    async fn save(&self, certificate: &Certificate) -> EngineResult<()> {
        self.write_record(CERTIFICATES_DIR, certificate.id.as_str(), certificate)?;
        debug!(certificate_id = %certificate.id, status = %certificate.status, "Saved certificate record");
        Ok(())
    }

    async fn get(&self, id: &CertificateId) -> EngineResult<Option<Certificate>> {
        Ok(self.read_record(CERTIFICATES_DIR, id.as_str())?)
    }

    async fn list(&self) -> EngineResult<Vec<Certificate>> {
        let mut all: Vec<Certificate> = self.read_all(CERTIFICATES_DIR)?;
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }
}

#[async_trait]
impl RenewalRepository for FileCertificateStore {
    async fn save(&self, record: &RenewalRecord) -> EngineResult<()> {
        self.write_record(RENEWALS_DIR, record.id.as_str(), record)?;
        Ok(())
    }

    async fn get(&self, id: &RenewalId) -> EngineResult<Option<RenewalRecord>> {
        Ok(self.read_record(RENEWALS_DIR, id.as_str())?)
    }

    async fn find_pending(
        &self,
        subscription_id: &SubscriptionId,
        domain: &str,
    ) -> EngineResult<Option<RenewalRecord>> {
        let records: Vec<RenewalRecord> = self.read_all(RENEWALS_DIR)?;
        Ok(records.into_iter().find(|r| {
            r.status.is_open() && &r.subscription_id == subscription_id && r.domain == domain
        }))
    }

    async fn list(&self) -> EngineResult<Vec<RenewalRecord>> {
        let mut all: Vec<RenewalRecord> = self.read_all(RENEWALS_DIR)?;
        all.sort_by_key(|r| r.run_at);
        Ok(all)
    }
}

/// Private keys kept as 0600 files under `data_dir/secrets`.
///
/// Handles are `vault:<uuid>`; a handle survives restarts as long as the
/// data directory does.
#[derive(Debug)]
pub struct FileSecretVault {
    dir: PathBuf,
}

impl FileSecretVault {
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        let dir = base_path.join(SECRETS_DIR);
        create_private_dir(&dir)?;
        Ok(Self { dir })
    }

    fn secret_path(&self, handle: &str) -> EngineResult<PathBuf> {
        match handle.strip_prefix(HANDLE_PREFIX) {
            Some(id) if is_safe_id(id) => Ok(self.dir.join(format!("{}.pem", id))),
            _ => Err(EngineError::Secret(format!("malformed secret handle '{}'", handle))),
        }
    }
}

impl SecretVault for FileSecretVault {
    fn seal(&self, plaintext: &str) -> EngineResult<String> {
        let handle = format!("{}{}", HANDLE_PREFIX, uuid::Uuid::new_v4().simple());
        let path = self.secret_path(&handle)?;
        write_private(&path, plaintext)?;
        trace!(handle = %handle, "Sealed secret");
        Ok(handle)
    }

    fn open(&self, sealed: &str) -> EngineResult<String> {
        let path = self.secret_path(sealed)?;
        if !path.exists() {
            return Err(EngineError::Secret(format!("unknown secret handle '{}'", sealed)));
        }
        Ok(fs::read_to_string(&path).map_err(StorageError::from)?)
    }
}
