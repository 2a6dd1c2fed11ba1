//! Local filesystem record store.
//!
//! Every JSON write is atomic: the payload goes to a sibling temp file which
//! is then renamed over the target, so readers never see a torn file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::{Catalog, CatalogEntry, Point};
use crate::storage::{APIID_FILE, INDEX_FILE, INFO_FILE, POINTS_FILE, RecordStore};
use crate::utils::is_folder_name;

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root_dir: PathBuf,
}

impl LocalStore {
    /// Create a new LocalStore rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a relative key.
    pub fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    pub async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Write JSON data.
    pub async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read bytes, returning None if file doesn't exist.
    pub async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Read JSON data.
    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn entry_key(local_id: u32, file: &str) -> String {
        format!("{local_id}/{file}")
    }

    /// Load one folder. `None` when the folder has no info.json (assets only).
    async fn load_entry(&self, local_id: u32) -> Result<Option<CatalogEntry>> {
        let Some(mut entry) = self
            .read_json::<CatalogEntry>(&Self::entry_key(local_id, INFO_FILE))
            .await?
        else {
            return Ok(None);
        };
        entry.local_id = local_id;

        // points.json is either a bare array or `{ "points": [...] }`
        let raw: Option<Value> = self
            .read_json(&Self::entry_key(local_id, POINTS_FILE))
            .await?;
        entry.points = match raw {
            Some(Value::Object(mut map)) => match map.remove("points") {
                Some(points) => serde_json::from_value::<Vec<Point>>(points)?,
                None => Vec::new(),
            },
            Some(points @ Value::Array(_)) => serde_json::from_value(points)?,
            Some(other) => {
                return Err(AppError::validation(format!(
                    "{local_id}/{POINTS_FILE} has unexpected shape: {}",
                    json_kind(&other)
                )));
            }
            None => Vec::new(),
        };
        Ok(Some(entry))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl RecordStore for LocalStore {
    async fn load_catalog(&self) -> Result<Catalog> {
        let folders = self.list_folders().await?;
        let mut entries = Vec::with_capacity(folders.len());
        for &local_id in &folders {
            match self.load_entry(local_id).await? {
                Some(entry) => entries.push(entry),
                None => log::warn!("Folder {local_id} has no {INFO_FILE}; keeping its id reserved"),
            }
        }

        let mut catalog = Catalog::new(entries);
        if let Some(&max) = folders.last() {
            catalog.reserve_through(max);
        }
        log::info!(
            "Loaded {} entries from {}",
            catalog.len(),
            self.root_dir.display()
        );
        Ok(catalog)
    }

    async fn save_entries(&self, entries: &[CatalogEntry]) -> Result<()> {
        for entry in entries {
            self.write_json(&Self::entry_key(entry.local_id, INFO_FILE), entry)
                .await?;
            self.write_json(&Self::entry_key(entry.local_id, POINTS_FILE), &entry.points)
                .await?;
        }
        if !entries.is_empty() {
            log::debug!("Saved {} entries", entries.len());
        }
        Ok(())
    }

    async fn write_index(&self, catalog: &Catalog) -> Result<()> {
        let index = catalog.index();
        self.write_json(INDEX_FILE, &index).await?;
        self.write_json(APIID_FILE, &catalog.api_ids()).await?;
        log::info!("Index regenerated: {} entries", index.len());
        Ok(())
    }

    async fn list_folders(&self) -> Result<BTreeSet<u32>> {
        let mut folders = BTreeSet::new();
        let mut dir = match tokio::fs::read_dir(&self.root_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(folders),
            Err(e) => return Err(AppError::Io(e)),
        };
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_folder_name(name)
                && let Ok(id) = name.parse::<u32>()
            {
                folders.insert(id);
            }
        }
        Ok(folders)
    }
}
