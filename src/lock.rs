//! Single-run lock on `<state_dir>/provision.lock`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{ProvisionError, Result};

pub const LOCK_FILENAME: &str = "provision.lock";

/// Held for the lifetime of a run. The OS releases it when the file closes.
#[derive(Debug)]
pub struct RunLock {
    _file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock or fail with `StateConflict` if another run holds it.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .map_err(|e| ProvisionError::io(format!("creating {}", state_dir.display()), e))?;
        let path = state_dir.join(LOCK_FILENAME);

        // Never unlink the lock file: a second process could then lock a new inode.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ProvisionError::io(format!("opening lock file {}", path.display()), e))?;

        if let Err(e) = file.try_lock_exclusive() {
            log::debug!("lock attempt on {} failed: {}", path.display(), e);
            return Err(ProvisionError::StateConflict {
                resource: path.display().to_string(),
                reason: "another provisioning run is in progress".to_string(),
            });
        }
        log::debug!("acquired {}", path.display());
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
