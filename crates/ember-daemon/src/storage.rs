//! Ephemeral per-instance storage
//!
//! Receipts live in RAM-backed scratch space and disappear with the instance.
//! Only an exported seed is meant to outlive it.

use crate::config::StorageConfig;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

pub const RECEIPTS_FILE: &str = "receipts.jsonl";

#[derive(Debug)]
pub struct EphemeralStore {
    dir: PathBuf,
    keep: bool,
    released: bool,
}

impl EphemeralStore {
    pub fn create(config: &StorageConfig, instance_id: Uuid) -> std::io::Result<Self> {
        let dir = config
            .resolved_ephemeral_root()
            .join(format!("ember-{}", instance_id.simple()));
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        debug!("Ephemeral store at {}", dir.display());
        Ok(Self { dir, keep: config.keep_receipts, released: false })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn receipts_path(&self) -> PathBuf {
        self.dir.join(RECEIPTS_FILE)
    }

    /// Remove the directory unless configured to keep it. Returns the kept path.
    pub fn release(mut self) -> Option<PathBuf> {
        self.released = true;
        if self.keep {
            return Some(self.dir.clone());
        }
        remove(&self.dir);
        None
    }
}

impl Drop for EphemeralStore {
    fn drop(&mut self) {
        if !self.released && !self.keep {
            remove(&self.dir);
        }
    }
}

fn remove(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}
