//! Saved registry logins.
//!
//! `ocifs login` records one [`Credential`] per registry host in
//! `~/.ocifs/logins.json` (mode 0600). Entries are kept in the shape the
//! [`CredentialSelector`](super::auth::CredentialSelector) consumes, so each
//! one becomes a `CredentialStrategy::Static` without translation.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use ocifs_core::error::{Result, RootfsError};
use serde::{Deserialize, Serialize};

use super::auth::{Credential, CredentialStrategy};
use super::reference::canonical_registry;

const LOGINS_FILE: &str = "logins.json";

/// On-disk form of a credential. Anonymous access is never saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SavedLogin {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl From<SavedLogin> for Credential {
    fn from(login: SavedLogin) -> Self {
        match login {
            SavedLogin::Basic { username, password } => Credential::Basic { username, password },
            SavedLogin::Bearer { token } => Credential::Bearer(token),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LoginFile {
    #[serde(default)]
    logins: BTreeMap<String, SavedLogin>,
}

/// Registry logins persisted between runs.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store under the user's home directory.
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            RootfsError::Other("cannot locate the home directory for saved logins".to_string())
        })?;
        Ok(Self::at(home.join(".ocifs").join(LOGINS_FILE)))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save `credential` for `registry`, replacing any earlier login.
    pub fn save(&self, registry: &str, credential: &Credential) -> Result<()> {
        let login = match credential {
            Credential::Anonymous => {
                return Err(RootfsError::Other(format!(
                    "refusing to save an anonymous login for {}",
                    registry
                )))
            }
            Credential::Basic { username, password } => SavedLogin::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            Credential::Bearer(token) => SavedLogin::Bearer {
                token: token.clone(),
            },
        };
        let mut file = self.read()?;
        file.logins.insert(canonical_registry(registry), login);
        self.write(&file)?;
        tracing::debug!(registry, path = %self.path.display(), "Saved registry login");
        Ok(())
    }

    pub fn credential(&self, registry: &str) -> Result<Option<Credential>> {
        let mut file = self.read()?;
        Ok(file
            .logins
            .remove(&canonical_registry(registry))
            .map(Credential::from))
    }

    /// Drop the login for `registry`. Returns false when there was none.
    pub fn forget(&self, registry: &str) -> Result<bool> {
        let mut file = self.read()?;
        if file.logins.remove(&canonical_registry(registry)).is_none() {
            return Ok(false);
        }
        self.write(&file)?;
        Ok(true)
    }

    /// Every saved login as a selector strategy, keyed by host.
    pub fn strategies(&self) -> Result<Vec<(String, CredentialStrategy)>> {
        Ok(self
            .read()?
            .logins
            .into_iter()
            .map(|(host, login)| (host, CredentialStrategy::Static(login.into())))
            .collect())
    }

    fn read(&self) -> Result<LoginFile> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoginFile::default()),
            Err(e) => return Err(self.error("read", e)),
        };
        serde_json::from_slice(&data).map_err(|e| self.error("parse", e))
    }

    /// Replace the file atomically. The temporary file is created 0600 and
    /// keeps that mode when persisted.
    fn write(&self, file: &LoginFile) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| self.error("create directory for", e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.error("write", e))?;
        serde_json::to_writer_pretty(&mut tmp, file)?;
        tmp.write_all(b"\n").map_err(|e| self.error("write", e))?;
        tmp.persist(&self.path)
            .map_err(|e| self.error("replace", e.error))?;
        Ok(())
    }

    fn error(&self, action: &str, e: impl std::fmt::Display) -> RootfsError {
        RootfsError::Other(format!(
            "failed to {} saved logins {}: {}",
            action,
            self.path.display(),
            e
        ))
    }
}
