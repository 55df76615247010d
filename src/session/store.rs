//! Pairing persistence

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::SessionConfig;
use crate::error::Result;

/// Where the pairing result survives restarts
#[cfg_attr(test, mockall::automock)]
pub trait PairingStore {
    /// Load the stored session; `Ok(None)` when nothing has been saved yet
    fn load(&mut self) -> Result<Option<SessionConfig>>;

    /// Persist the session
    fn save(&mut self, config: &SessionConfig) -> Result<()>;
}

/// Stores the session as a small JSON document
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PairingStore for JsonFileStore {
    fn load(&mut self) -> Result<Option<SessionConfig>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No pairing file at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn save(&mut self, config: &SessionConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Write next to the target and rename so a crash never leaves half a file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(config)?)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Saved pairing to {}", self.path.display());
        Ok(())
    }
}
