//! Storage abstractions for the record store and scan state.
//!
//! ## Directory Structure
//!
//! ```text
//! {base_dir}/
//! ├── {local_id}/            # one numeric folder per catalog entry
//! │   ├── info.json
//! │   ├── points.json
//! │   └── images/            # written by enrichment passes
//! ├── index.json             # aggregated index for the website
//! ├── apiid.json             # local_id -> primary api id
//! ├── scan_state.json        # scan cursor
//! ├── mirror_policy.json     # derived folder range policy
//! └── store.lock             # run lock
//! ```

pub mod local;
pub mod lock;
pub mod state;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Catalog, CatalogEntry};

// Re-export for convenience
pub use local::LocalStore;
pub use lock::{LockGuard, RunLock};
pub use state::ScanState;

/// File name of the aggregated index.
pub const INDEX_FILE: &str = "index.json";
/// File name of the local id to api id map.
pub const APIID_FILE: &str = "apiid.json";
pub const INFO_FILE: &str = "info.json";
pub const POINTS_FILE: &str = "points.json";

/// Trait for record store backends.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load every entry in the store.
    async fn load_catalog(&self) -> Result<Catalog>;

    /// Persist the given entries (info + points), one folder each.
    async fn save_entries(&self, entries: &[CatalogEntry]) -> Result<()>;

    /// Regenerate `index.json` and `apiid.json` from the catalog.
    async fn write_index(&self, catalog: &Catalog) -> Result<()>;

    /// Numeric folder names currently present.
    async fn list_folders(&self) -> Result<BTreeSet<u32>>;
}
