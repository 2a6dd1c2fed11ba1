// src/pipeline/prune.rs

//! Origin retention: drop provenance refs that only repeat the entry's
//! primary id once they are older than the grace period.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::RecordStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub entries_touched: usize,
    pub origins_removed: usize,
}

/// Remove redundant origin refs older than `grace` and rewrite what changed.
pub async fn prune_origins(
    store: &dyn RecordStore,
    grace: Duration,
    now: DateTime<Utc>,
) -> Result<PruneReport> {
    let mut catalog = store.load_catalog().await?;
    let cutoff = now - grace;

    let candidates: Vec<u32> = catalog
        .entries()
        .filter(|e| {
            e.origins
                .iter()
                .any(|o| o.api_id == e.api_id && o.first_seen < cutoff)
        })
        .map(|e| e.local_id)
        .collect();

    let mut report = PruneReport::default();
    for local_id in candidates {
        let Some(entry) = catalog.get_mut(local_id) else {
            continue;
        };
        let primary = entry.api_id;
        let before = entry.origins.len();
        entry
            .origins
            .retain(|o| !(o.api_id == primary && o.first_seen < cutoff));
        let removed = before - entry.origins.len();
        log::debug!("Entry {local_id}: pruned {removed} origin refs");
        report.entries_touched += 1;
        report.origins_removed += removed;
    }

    if catalog.has_pending() {
        let entries = catalog.take_dirty();
        store.save_entries(&entries).await?;
        store.write_index(&catalog).await?;
    }
    log::info!(
        "Pruned {} origin refs across {} entries",
        report.origins_removed,
        report.entries_touched
    );
    Ok(report)
}
