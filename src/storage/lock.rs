//! Cross-process run lock backed by a file created with `create_new`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};

/// Contents of the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    pub pid: u32,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

/// A lock file path plus the staleness policy for reclaiming it.
#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
    stale_after: Duration,
    owner: String,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration, owner: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            stale_after,
            owner: owner.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock or fail fast with `LockHeld`. A stale lock is reclaimed.
    pub fn acquire(&self) -> Result<LockGuard> {
        // Second pass only happens after removing a stale lock.
        for _ in 0..2 {
            match self.try_create() {
                Ok(guard) => return Ok(guard),
                Err(AppError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }

            let holder = self.holder();
            let age = self.age_of(holder.as_ref());
            if age < self.stale_after {
                return Err(AppError::LockHeld {
                    path: self.path.display().to_string(),
                    age_secs: age.as_secs(),
                });
            }

            log::warn!(
                "Reclaiming stale lock {} (age {}s > {}s)",
                self.path.display(),
                age.as_secs(),
                self.stale_after.as_secs()
            );
            self.reclaim(holder.as_ref().map(|h| h.token.as_str()))?;
        }

        Err(AppError::LockHeld {
            path: self.path.display().to_string(),
            age_secs: 0,
        })
    }

    /// Inspect the current holder, if any.
    pub fn holder(&self) -> Option<LockInfo> {
        let raw = fs::read(&self.path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn try_create(&self) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;

        let now = Utc::now();
        let info = LockInfo {
            owner: self.owner.clone(),
            pid: std::process::id(),
            token: new_token(&self.owner, now),
            acquired_at: now,
        };
        let written = serde_json::to_vec_pretty(&info)
            .map_err(AppError::from)
            .and_then(|bytes| Ok(file.write_all(&bytes)?));
        if let Err(e) = written {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }

        log::debug!("Acquired lock {}", self.path.display());
        Ok(LockGuard {
            path: self.path.clone(),
            token: info.token,
        })
    }

    /// Move the stale lock aside and delete it, but only if it still carries
    /// `stale_token`. Another run may have reclaimed it first and written its
    /// own lock; that one is put back and the caller sees `LockHeld`.
    fn reclaim(&self, stale_token: Option<&str>) -> Result<()> {
        let aside = self.path.with_extension(format!(
            "stale-{}",
            new_token(&self.owner, Utc::now())
        ));
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let moved = fs::read(&aside)
            .ok()
            .and_then(|raw| serde_json::from_slice::<LockInfo>(&raw).ok());
        if moved.as_ref().map(|info| info.token.as_str()) == stale_token {
            fs::remove_file(&aside)?;
            return Ok(());
        }

        log::warn!(
            "Lock {} was reclaimed by another run first; restoring it",
            self.path.display()
        );
        // hard_link fails if yet another lock appeared meanwhile; that one wins.
        let _ = fs::hard_link(&aside, &self.path);
        let _ = fs::remove_file(&aside);
        Err(AppError::LockHeld {
            path: self.path.display().to_string(),
            age_secs: 0,
        })
    }

    /// Age from the recorded `acquired_at`, falling back to the file mtime.
    fn age_of(&self, holder: Option<&LockInfo>) -> Duration {
        if let Some(info) = holder {
            return (Utc::now() - info.acquired_at).to_std().unwrap_or_default();
        }
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .unwrap_or_default()
    }
}

fn new_token(owner: &str, now: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner.as_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Held lock. Dropping it removes the file if it still carries this guard's token.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
}

impl LockGuard {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let still_ours = fs::read(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<LockInfo>(&raw).ok())
            .is_some_and(|info| info.token == self.token);
        if !still_ours {
            log::warn!(
                "Lock {} was taken over by another run; leaving it in place",
                self.path.display()
            );
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Released lock {}", self.path.display()),
            Err(e) => log::warn!("Failed to release lock {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let lock = RunLock::new(tmp.path().join("store.lock"), Duration::from_secs(60), "test");

        let guard = lock.acquire().unwrap();
        let err = lock.acquire().unwrap_err();
        assert!(err.is_lock_held());

        drop(guard);
        assert!(!lock.path().exists());
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let lock = RunLock::new(
            tmp.path().join("store.lock"),
            Duration::from_millis(50),
            "test",
        );

        let first = lock.acquire().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let second = lock.acquire().unwrap();
        assert_ne!(first.token(), second.token());

        // The first guard no longer owns the file and must leave it alone.
        drop(first);
        assert!(lock.path().exists());
        drop(second);
        assert!(!lock.path().exists());
    }

    #[test]
    fn reclaim_leaves_a_fresh_lock_alone() {
        let tmp = TempDir::new().unwrap();
        let lock = RunLock::new(tmp.path().join("store.lock"), Duration::from_secs(60), "a");

        // Another run already replaced the stale lock we looked at.
        let fresh = lock.acquire().unwrap();
        let err = lock.reclaim(Some("stale-token")).unwrap_err();
        assert!(err.is_lock_held());
        assert_eq!(lock.holder().unwrap().token, fresh.token());

        lock.reclaim(Some(fresh.token())).unwrap();
        assert!(!lock.path().exists());
        let leftovers = std::fs::read_dir(tmp.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn unreadable_lock_uses_mtime() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.lock");
        std::fs::write(&path, "garbage").unwrap();

        let lock = RunLock::new(&path, Duration::from_secs(3600), "test");
        assert!(lock.acquire().unwrap_err().is_lock_held());
    }

    #[test]
    fn released_on_panic() {
        let tmp = TempDir::new().unwrap();
        let lock = RunLock::new(tmp.path().join("store.lock"), Duration::from_secs(60), "test");

        let result = std::panic::catch_unwind(|| {
            let _guard = lock.acquire().unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(!lock.path().exists());
    }
}
