//! # Storage Module
//!
//! Persists the node's network and backend configuration.
//!
//! This module handles:
//! - Loading the saved credentials record (absent or corrupt means "unconfigured")
//! - Validating and atomically saving a new record
//! - Clearing the record on operator request
//! - The boot-cycle record used for rapid power-cycle detection ([`boot_record`])
//!
//! Records are small JSON documents written through a temporary file and a
//! rename, so a reader never observes a half-written record.

pub mod boot_record;

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::StorageError;

/// File name of the credentials record inside the state directory.
pub const CREDENTIALS_FILE: &str = "wifi_config.json";

/// Default backend port when a stored record predates the field.
pub const DEFAULT_API_PORT: u16 = 80;

/// Default backend path when a stored record predates the field.
pub const DEFAULT_API_ENDPOINT: &str = "/tank/api/tank_update.php";

fn default_api_port() -> u16 { DEFAULT_API_PORT }
fn default_api_endpoint() -> String { DEFAULT_API_ENDPOINT.to_string() }

/// Network and backend configuration entered through the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    /// Network name to join in client mode.
    #[serde(default)]
    pub ssid: String,

    /// Network secret.
    #[serde(default)]
    pub password: String,

    /// Backend host name or address.
    #[serde(default)]
    pub api_host: String,

    /// Backend path receiving measurement POSTs.
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Key sent with every measurement.
    #[serde(default)]
    pub api_key: String,

    /// Backend TCP port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Set only by a successful save.
    #[serde(default)]
    pub configured: bool,
}

impl NetworkCredentials {
    /// Build an unsaved candidate record.
    #[must_use]
    pub fn new(
        ssid: impl Into<String>,
        password: impl Into<String>,
        api_host: impl Into<String>,
        api_port: u16,
        api_endpoint: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
            api_host: api_host.into(),
            api_endpoint: api_endpoint.into(),
            api_key: api_key.into(),
            api_port,
            configured: false,
        }
    }

    /// True when both network name and secret are present.
    #[must_use]
    pub fn has_network(&self) -> bool {
        !self.ssid.is_empty() && !self.password.is_empty()
    }

    /// Backend base URL, e.g. `http://10.0.0.5:80/tank/api/tank_update.php`.
    #[must_use]
    pub fn backend_url(&self) -> String {
        let path = if self.api_endpoint.starts_with('/') {
            self.api_endpoint.clone()
        } else {
            format!("/{}", self.api_endpoint)
        };
        format!("http://{}:{}{}", self.api_host, self.api_port, path)
    }
}

/// File-backed credential store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store rooted in `state_dir`, using [`CREDENTIALS_FILE`].
    #[must_use]
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::at(state_dir.join(CREDENTIALS_FILE))
    }

    /// Store backed by an explicit file path.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved record.
    ///
    /// Returns `None` when nothing was saved yet, when the record cannot be
    /// read or parsed, or when it is not marked configured. Storage failures
    /// are logged and never propagated.
    #[must_use]
    pub fn load(&self) -> Option<NetworkCredentials> {
        match self.try_load() {
            Ok(Some(record)) if record.configured && record.has_network() => {
                info!(
                    ssid = %record.ssid,
                    api_host = %record.api_host,
                    api_port = record.api_port,
                    "Loaded saved configuration"
                );
                Some(record)
            }
            Ok(Some(_)) => {
                warn!("Saved configuration is incomplete; treating node as unconfigured");
                None
            }
            Ok(None) => {
                info!("No saved configuration found (first boot)");
                None
            }
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "Ignoring unreadable configuration");
                None
            }
        }
    }

    fn try_load(&self) -> Result<Option<NetworkCredentials>, StorageError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    /// Validate and persist `candidate`, marking it configured.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Invalid`] if the network name or secret is empty; the
    ///   existing record is left untouched.
    /// - [`StorageError::Io`] if the record cannot be written.
    pub fn save(&self, candidate: &NetworkCredentials) -> Result<(), StorageError> {
        if candidate.ssid.is_empty() {
            return Err(StorageError::Invalid("network name is empty"));
        }
        if candidate.password.is_empty() {
            return Err(StorageError::Invalid("network secret is empty"));
        }

        let record = NetworkCredentials {
            configured: true,
            ..candidate.clone()
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        write_atomic(&self.path, &json)?;

        info!(ssid = %record.ssid, "Configuration saved");
        Ok(())
    }

    /// Remove any saved record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if an existing record cannot be removed.
    pub fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Configuration cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No configuration to clear");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `bytes` to `path` through a sibling temporary file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}
