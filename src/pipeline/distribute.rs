// src/pipeline/distribute.rs

//! Mirror distribution: push the record store (or a planned share of it) to
//! each destination repository.
//!
//! Each destination is synced independently. A failure is recorded in the
//! report and the remaining destinations are still attempted.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::TempDir;

use crate::error::{AppError, Result};
use crate::models::{
    DestinationId, DestinationOutcome, DestinationReport, DistributionReport, FolderRangePolicy,
    MirrorMode, MirrorTarget, StoredPolicy, SyncResult,
};
use crate::pipeline::diff::{DiffCalculator, build_manifest};
use crate::pipeline::plan::{covers_all_destinations, default_policy, plan};
use crate::services::MirrorRemote;
use crate::storage::{APIID_FILE, INDEX_FILE, LocalStore, RecordStore};
use crate::utils::log;

/// Where store folders live inside a mirror repository.
pub const MIRROR_DATA_PREFIX: &str = "pic/data";

/// Store files copied to the mirror root alongside the folders.
const ROOT_FILES: [&str; 2] = [INDEX_FILE, APIID_FILE];

/// Pushes store content to mirror destinations.
pub struct Distributor<'a> {
    store: &'a LocalStore,
    remote: &'a dyn MirrorRemote,
}

impl<'a> Distributor<'a> {
    pub fn new(store: &'a LocalStore, remote: &'a dyn MirrorRemote) -> Self {
        Self { store, remote }
    }

    /// Bring one destination in line with the assigned folders.
    ///
    /// The diff is computed before any push; a destination already in sync
    /// is left alone and reported with `pushed = false`.
    pub async fn sync(&self, target: &MirrorTarget, assigned: &BTreeSet<u32>) -> Result<SyncResult> {
        let local = build_manifest(self.local_roots(assigned)).await?;

        let workdir = TempDir::new()?;
        let repo = workdir.path().join("repo");
        self.remote.checkout(target, &repo).await?;
        let remote = build_manifest(mirror_roots(&repo, assigned)).await?;

        let diff = DiffCalculator::new().calculate(&remote, &local);
        if !diff.has_changes() {
            ::log::info!("{}: already in sync ({} files)", target.id, local.len());
            return Ok(SyncResult::default());
        }

        for key in diff.added.iter().chain(&diff.modified) {
            let dest = repo.join(key);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(self.source_path(key), &dest).await?;
        }
        for key in &diff.removed {
            match tokio::fs::remove_file(repo.join(key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let new_folders = diff.new_folders(MIRROR_DATA_PREFIX, &remote);
        let message = commit_message(&new_folders, diff.change_count());
        self.remote
            .publish(target, &repo, &message)
            .await
            .map_err(|e| AppError::push(&target.id, e.to_string()))?;

        log::sub_item(&format!(
            "{}: pushed {} changed files ({} added, {} modified, {} removed)",
            target.id,
            diff.change_count(),
            diff.added.len(),
            diff.modified.len(),
            diff.removed.len()
        ));
        Ok(SyncResult {
            pushed: true,
            changed_folders: diff.changed_folders(MIRROR_DATA_PREFIX),
            changed_files: diff.change_count(),
        })
    }

    /// Sync every target. Full targets go first, then partitioned ones, each
    /// group in configuration order.
    pub async fn distribute(
        &self,
        targets: &[MirrorTarget],
        folders: &BTreeSet<u32>,
        assignment: &BTreeMap<u32, DestinationId>,
    ) -> DistributionReport {
        let ordered = targets
            .iter()
            .filter(|t| t.mode == MirrorMode::Full)
            .chain(targets.iter().filter(|t| t.mode == MirrorMode::Partitioned));

        let mut report = DistributionReport::default();
        for target in ordered {
            let assigned: BTreeSet<u32> = match target.mode {
                MirrorMode::Full => folders.clone(),
                MirrorMode::Partitioned => assignment
                    .iter()
                    .filter(|(_, dest)| **dest == target.id)
                    .map(|(folder, _)| *folder)
                    .collect(),
            };
            log::header(&format!(
                "Mirror {} ({}, {} folders)",
                target.id,
                target.mode,
                assigned.len()
            ));

            let outcome = match self.sync(target, &assigned).await {
                Ok(result) => DestinationOutcome::Synced(result),
                Err(e) => {
                    ::log::error!("{}: sync failed: {e}", target.id);
                    DestinationOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            report.outcomes.push(DestinationReport {
                destination: target.id.clone(),
                mode: target.mode,
                outcome,
            });
        }
        report
    }

    fn local_roots(&self, assigned: &BTreeSet<u32>) -> Vec<(PathBuf, String)> {
        let mut roots: Vec<(PathBuf, String)> = assigned
            .iter()
            .map(|f| (self.store.path(&f.to_string()), mirror_key(*f)))
            .collect();
        roots.extend(ROOT_FILES.iter().map(|f| (self.store.path(f), f.to_string())));
        roots
    }

    /// Local file behind a mirror manifest key.
    fn source_path(&self, key: &str) -> PathBuf {
        match key
            .strip_prefix(MIRROR_DATA_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
        {
            Some(rest) => self.store.path(rest),
            None => self.store.path(key),
        }
    }
}

fn mirror_key(folder: u32) -> String {
    format!("{MIRROR_DATA_PREFIX}/{folder}")
}

fn mirror_roots(repo: &Path, assigned: &BTreeSet<u32>) -> Vec<(PathBuf, String)> {
    let mut roots: Vec<(PathBuf, String)> = assigned
        .iter()
        .map(|f| (repo.join(mirror_key(*f)), mirror_key(*f)))
        .collect();
    roots.extend(ROOT_FILES.iter().map(|f| (repo.join(f), f.to_string())));
    roots
}

fn commit_message(new_folders: &BTreeSet<u32>, changed_files: usize) -> String {
    let mut message = format!("Sync anime data: {}", Utc::now().format("%Y-%m-%d %H:%M UTC"));
    if !new_folders.is_empty() {
        let ids: Vec<u64> = new_folders.iter().map(|&f| u64::from(f)).collect();
        message.push_str(&format!("\n\nNew folders: {}", log::id_list(&ids, 20)));
    }
    message.push_str(&format!("\nUpdated files: {changed_files}"));
    message
}

/// Plan and distribute in one run.
///
/// An explicit policy string wins; otherwise the stored split is reused or a
/// fresh even split is computed and persisted. Planning errors abort before
/// any destination is touched.
pub async fn run_mirror(
    store: &LocalStore,
    remote: &dyn MirrorRemote,
    targets: &[MirrorTarget],
    explicit_policy: Option<&str>,
    policy_file: &str,
) -> Result<DistributionReport> {
    let folders = store.list_folders().await?;
    let partitioned: Vec<DestinationId> = targets
        .iter()
        .filter(|t| t.mode == MirrorMode::Partitioned)
        .map(|t| t.id.clone())
        .collect();

    let mut assignment = BTreeMap::new();
    if !partitioned.is_empty() {
        let (policy, fresh) = match explicit_policy {
            Some(raw) => (FolderRangePolicy::parse(raw, &partitioned)?, false),
            None => {
                let stored: Option<StoredPolicy> = store.read_json(policy_file).await?;
                default_policy(&folders, &partitioned, stored.as_ref())
            }
        };
        assignment = plan(&folders, &policy)?;
        ::log::info!("Folder policy: {}", policy.to_wire(&partitioned));

        if fresh && covers_all_destinations(&policy, &partitioned) {
            let stored = StoredPolicy {
                destinations: partitioned.clone(),
                policy,
                created_at: Utc::now(),
            };
            store.write_json(policy_file, &stored).await?;
            ::log::info!("Saved folder policy to {policy_file}");
        }
    }

    let report = Distributor::new(store, remote)
        .distribute(targets, &folders, &assignment)
        .await;

    log::summary(
        "Mirror",
        &[
            ("status", report.status().to_string()),
            ("destinations", report.outcomes.len().to_string()),
            ("pushed", report.pushed_count().to_string()),
            ("failed", report.failed().count().to_string()),
        ],
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory mirrors: destination id -> (relative path -> contents).
    #[derive(Default)]
    struct FakeRemote {
        repos: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
        failing: BTreeSet<String>,
        pushes: Mutex<Vec<(String, String)>>,
    }

    impl FakeRemote {
        fn files(&self, dest: &str) -> Vec<String> {
            self.repos
                .lock()
                .unwrap()
                .get(dest)
                .map(|r| r.keys().cloned().collect())
                .unwrap_or_default()
        }

        fn push_count(&self) -> usize {
            self.pushes.lock().unwrap().len()
        }
    }

    fn walk(dir: &Path, prefix: &str, out: &mut BTreeMap<String, Vec<u8>>) {
        let Ok(items) = std::fs::read_dir(dir) else {
            return;
        };
        for item in items.flatten() {
            let name = item.file_name().to_string_lossy().into_owned();
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if item.path().is_dir() {
                walk(&item.path(), &key, out);
            } else {
                out.insert(key, std::fs::read(item.path()).unwrap());
            }
        }
    }

    #[async_trait]
    impl MirrorRemote for FakeRemote {
        async fn checkout(&self, target: &MirrorTarget, dir: &Path) -> Result<()> {
            std::fs::create_dir_all(dir)?;
            let repos = self.repos.lock().unwrap();
            for (key, bytes) in repos.get(&target.id).into_iter().flatten() {
                let path = dir.join(key);
                std::fs::create_dir_all(path.parent().unwrap())?;
                std::fs::write(path, bytes)?;
            }
            Ok(())
        }

        async fn publish(&self, target: &MirrorTarget, dir: &Path, message: &str) -> Result<()> {
            if self.failing.contains(&target.id) {
                return Err(AppError::git("push", "Authentication failed"));
            }
            let mut files = BTreeMap::new();
            walk(dir, "", &mut files);
            self.repos.lock().unwrap().insert(target.id.clone(), files);
            self.pushes
                .lock()
                .unwrap()
                .push((target.id.clone(), message.to_string()));
            Ok(())
        }
    }

    fn seed_store(root: &Path, folders: &[u32]) -> LocalStore {
        for f in folders {
            let dir = root.join(f.to_string());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("info.json"), format!("{{\"name\":\"anime {f}\"}}")).unwrap();
            std::fs::write(dir.join("points.json"), "[]").unwrap();
        }
        std::fs::write(root.join("index.json"), "{}").unwrap();
        std::fs::write(root.join("apiid.json"), "{}").unwrap();
        LocalStore::new(root)
    }

    fn target(id: &str, mode: MirrorMode) -> MirrorTarget {
        MirrorTarget::new(id, format!("https://example.invalid/{id}.git"), mode, None)
    }

    #[tokio::test]
    async fn partitioned_targets_get_their_share() {
        let tmp = TempDir::new().unwrap();
        let store = seed_store(tmp.path(), &[1, 2, 3, 4]);
        let remote = FakeRemote::default();
        let targets = vec![
            target("cdn1", MirrorMode::Partitioned),
            target("cdn2", MirrorMode::Partitioned),
        ];

        let report = run_mirror(&store, &remote, &targets, None, "mirror_policy.json")
            .await
            .unwrap();
        assert_eq!(report.pushed_count(), 2);

        let cdn1 = remote.files("cdn1");
        assert!(cdn1.contains(&"pic/data/1/info.json".to_string()));
        assert!(cdn1.contains(&"pic/data/2/points.json".to_string()));
        assert!(cdn1.contains(&"index.json".to_string()));
        assert!(!cdn1.iter().any(|f| f.starts_with("pic/data/3/")));
        assert!(remote.files("cdn2").contains(&"pic/data/4/info.json".to_string()));

        let stored: StoredPolicy = store.read_json("mirror_policy.json").await.unwrap().unwrap();
        assert_eq!(stored.destinations, vec!["cdn1", "cdn2"]);
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let store = seed_store(tmp.path(), &[1, 2, 3]);
        let remote = FakeRemote::default();
        let targets = vec![target("full", MirrorMode::Full)];

        let first = run_mirror(&store, &remote, &targets, None, "mirror_policy.json")
            .await
            .unwrap();
        assert_eq!(first.status(), crate::models::RunStatus::Completed);
        match &first.outcomes[0].outcome {
            DestinationOutcome::Synced(result) => {
                assert!(result.pushed);
                assert_eq!(result.changed_folders, BTreeSet::from([1, 2, 3]));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(remote.pushes.lock().unwrap()[0].1.contains("New folders: 1, 2, 3"));

        let second = run_mirror(&store, &remote, &targets, None, "mirror_policy.json")
            .await
            .unwrap();
        assert_eq!(
            second.outcomes[0].outcome,
            DestinationOutcome::Synced(SyncResult::default())
        );
        assert_eq!(second.status(), crate::models::RunStatus::NothingToDo);
        assert_eq!(remote.push_count(), 1);
    }

    #[tokio::test]
    async fn failed_destination_does_not_stop_others() {
        let tmp = TempDir::new().unwrap();
        let store = seed_store(tmp.path(), &[1, 2]);
        let remote = FakeRemote {
            failing: BTreeSet::from(["cdn1".to_string()]),
            ..Default::default()
        };
        let targets = vec![
            target("cdn1", MirrorMode::Partitioned),
            target("cdn2", MirrorMode::Partitioned),
        ];

        let report = run_mirror(&store, &remote, &targets, None, "mirror_policy.json")
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert!(matches!(
            &report.outcomes[0].outcome,
            DestinationOutcome::Failed { error } if error.contains("cdn1")
        ));
        assert!(matches!(
            &report.outcomes[1].outcome,
            DestinationOutcome::Synced(SyncResult { pushed: true, .. })
        ));
        assert_eq!(report.status(), crate::models::RunStatus::Partial);
    }

    #[tokio::test]
    async fn removed_files_in_assigned_folders_are_deleted() {
        let tmp = TempDir::new().unwrap();
        let store = seed_store(tmp.path(), &[1]);
        let remote = FakeRemote::default();
        remote.repos.lock().unwrap().insert(
            "full".into(),
            BTreeMap::from([
                ("pic/data/1/stale.json".to_string(), b"old".to_vec()),
                ("pic/data/9/info.json".to_string(), b"unassigned".to_vec()),
                ("README.md".to_string(), b"keep".to_vec()),
            ]),
        );
        let distributor = Distributor::new(&store, &remote);

        let result = distributor
            .sync(&target("full", MirrorMode::Full), &BTreeSet::from([1]))
            .await
            .unwrap();
        assert!(result.pushed);

        let files = remote.files("full");
        assert!(!files.contains(&"pic/data/1/stale.json".to_string()));
        assert!(files.contains(&"pic/data/9/info.json".to_string()));
        assert!(files.contains(&"README.md".to_string()));
    }

    #[tokio::test]
    async fn invalid_policy_aborts_before_any_push() {
        let tmp = TempDir::new().unwrap();
        let store = seed_store(tmp.path(), &[1, 2, 3]);
        let remote = FakeRemote::default();
        let targets = vec![
            target("cdn1", MirrorMode::Partitioned),
            target("cdn2", MirrorMode::Partitioned),
        ];

        let err = run_mirror(
            &store,
            &remote,
            &targets,
            Some("[[[1,1]],[[3,null]]]"),
            "mirror_policy.json",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::PolicyGap { folder: 2 }));
        assert_eq!(remote.push_count(), 0);
        assert!(store.read_bytes("mirror_policy.json").await.unwrap().is_none());
    }
}
