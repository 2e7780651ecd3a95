use crate::error::SplitError;
use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE: &str = ".snapsplit.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPayload {
    pub pid: u32,
    pub build_uuid: String,
    pub start_time: String,
}

/// Held for the whole run; dropping it releases the lock and removes the file.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open lock {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let holder = read_payload(path)
                .map(|p| format!("pid {} since {}", p.pid, p.start_time))
                .unwrap_or_else(|| "unknown holder".to_string());
            return Err(SplitError::OutputLocked(format!("{} ({holder})", path.display())).into());
        }

        let payload = LockPayload {
            pid: std::process::id(),
            build_uuid: env!("BUILD_UUID").to_string(),
            start_time: Utc::now().to_rfc3339(),
        };
        file.set_len(0)?;
        file.write_all(serde_json::to_string(&payload)?.as_bytes())?;
        file.flush()?;
        debug!(lock = %path.display(), pid = payload.pid, "acquired run lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn read_payload(path: &Path) -> Option<LockPayload> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join(LOCK_FILE);
        let held = RunLock::acquire(&path).expect("first lock");
        let payload = read_payload(held.path()).expect("payload");
        assert_eq!(payload.pid, std::process::id());

        let err = RunLock::acquire(&path).unwrap_err();
        assert!(matches!(err.downcast_ref::<SplitError>(), Some(SplitError::OutputLocked(_))));

        drop(held);
        assert!(!path.exists());
        RunLock::acquire(&path).expect("lock after release");
    }
}
