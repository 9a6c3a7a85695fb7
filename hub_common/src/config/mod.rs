//! Typed, path-scoped load/store of the JSON records the hub persists
//! across runs (`comports.json`, `scriptlist.json`, `plugincatalog.json`),
//! in a flat directory of named JSON files under the per-user config
//! directory. The directory is created mode `0700` on unix: private to
//! the user, but traversable.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Failures loading or parsing one of the hub's persisted JSON records.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}

/// Resolves file paths within, and owns the lifecycle of, the hub's
/// per-user config directory.
#[derive(Debug, Clone)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    /// `root` is the directory's location; it is not created until
    /// [`ConfigDir::ensure_exists`] is called.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The platform config directory, joined with `dcs-bios-hub`.
    pub fn platform_default() -> anyhow::Result<Self> {
        let base = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("no platform config directory available"))?;
        Ok(Self::new(base.join("dcs-bios-hub")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    /// Create the config directory (and `logs/`, `plugins/`) if missing.
    /// Mode `0700` on unix; no-op on other platforms beyond `create_dir_all`.
    pub fn ensure_exists(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.plugins_dir())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(&self.root, perms)?;
        }

        Ok(())
    }

    fn file_path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// Deserialize `filename` from the config directory.
    pub fn load<T: DeserializeOwned>(&self, filename: &str) -> Result<T, ConfigError> {
        let path = self.file_path(filename);
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Serialize `data` to `filename` in the config directory, pretty-printed.
    pub fn store<T: Serialize>(&self, filename: &str, data: &T) -> anyhow::Result<()> {
        let path = self.file_path(filename);
        let json = serde_json::to_string_pretty(data)?;
        std::fs::write(&path, json)?;
        Ok(())
    }
}
