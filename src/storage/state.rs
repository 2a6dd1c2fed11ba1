//! Range scan state: the persisted cursor plus the run lock guarding it.

use std::future::Future;
use std::path::Path;

use chrono::Utc;

use crate::error::Result;
use crate::models::{ScanCursor, StateConfig};
use crate::storage::{LocalStore, RunLock};

/// Cursor persistence and scoped mutual exclusion for one record store.
#[derive(Debug, Clone)]
pub struct ScanState {
    store: LocalStore,
    cursor_key: String,
    lock: RunLock,
}

impl ScanState {
    pub fn new(base_dir: impl AsRef<Path>, config: &StateConfig) -> Self {
        let base_dir = base_dir.as_ref();
        let owner = format!("pilgrim@{}", std::process::id());
        Self {
            store: LocalStore::new(base_dir),
            cursor_key: config.cursor_file.clone(),
            lock: RunLock::new(
                base_dir.join(&config.lock_file),
                config.lock_stale_after(),
                owner,
            ),
        }
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    /// Load the cursor, or a fresh one if none has been saved yet.
    pub async fn load(&self) -> Result<ScanCursor> {
        Ok(self
            .store
            .read_json(&self.cursor_key)
            .await?
            .unwrap_or_default())
    }

    /// Persist the cursor atomically.
    pub async fn save(&self, cursor: &ScanCursor) -> Result<()> {
        let mut cursor = cursor.clone();
        cursor.updated_at = Utc::now();
        self.store.write_json(&self.cursor_key, &cursor).await?;
        log::debug!("Cursor saved at next_id={}", cursor.next_id);
        Ok(())
    }

    /// Run `f` while holding the run lock.
    ///
    /// The guard lives inside this future, so release happens on success,
    /// error, panic and when the future is dropped mid-flight.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.lock.acquire()?;
        f().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_defaults_then_round_trips() {
        let tmp = TempDir::new().unwrap();
        let state = ScanState::new(tmp.path(), &StateConfig::default());

        let mut cursor = state.load().await.unwrap();
        assert_eq!(cursor.next_id, 0);

        cursor.mark_range(100, 109);
        cursor.advance_to(110);
        cursor.attempt = 2;
        state.save(&cursor).await.unwrap();

        let loaded = state.load().await.unwrap();
        assert_eq!(loaded.next_id, 110);
        assert_eq!(loaded.attempt, 2);
        assert_eq!(loaded.covered.intervals(), &[[100, 109]]);
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let tmp = TempDir::new().unwrap();
        let state = ScanState::new(tmp.path(), &StateConfig::default());

        let result: Result<()> = state
            .with_lock(|| async { Err(AppError::validation("boom")) })
            .await;
        assert!(result.is_err());
        assert!(!state.lock().path().exists());

        let value = state.with_lock(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn with_lock_fails_fast_when_held() {
        let tmp = TempDir::new().unwrap();
        let state = ScanState::new(tmp.path(), &StateConfig::default());

        let _held = state.lock().acquire().unwrap();
        let err = state.with_lock(|| async { Ok(()) }).await.unwrap_err();
        assert!(err.is_lock_held());
    }

    #[tokio::test]
    async fn with_lock_releases_on_cancel() {
        let tmp = TempDir::new().unwrap();
        let state = ScanState::new(tmp.path(), &StateConfig::default());

        let slow = state.with_lock(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(20), slow).await;
        assert!(timed_out.is_err());
        assert!(!state.lock().path().exists());
    }
}
