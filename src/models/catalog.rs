// src/models/catalog.rs

//! In-memory view of the record store used by the single scan writer.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CatalogEntry, CatalogRecord, MergeOutcome, Point};
use crate::utils::normalize_name;

/// One line of the aggregated `index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub name_cn: String,
    pub cover: String,
    pub theme_color: String,
    pub points: Vec<Point>,
    /// Relative location of the entry's points file
    pub inform: String,
}

/// Why a record was attached to an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    ApiId,
    GroupKey,
    Name,
    PartialName,
}

/// All catalog entries, keyed by local id, plus the set touched since the last flush.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: BTreeMap<u32, CatalogEntry>,
    dirty: BTreeSet<u32>,
    /// Highest folder id taken on disk, entry or not
    reserved: u32,
}

impl Catalog {
    pub fn new(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.local_id, e)).collect(),
            dirty: BTreeSet::new(),
            reserved: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, local_id: u32) -> Option<&CatalogEntry> {
        self.entries.get(&local_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    /// Mutable access that marks the entry dirty.
    pub fn get_mut(&mut self, local_id: u32) -> Option<&mut CatalogEntry> {
        let entry = self.entries.get_mut(&local_id)?;
        self.dirty.insert(local_id);
        Some(entry)
    }

    /// Keep ids up to `folder` out of circulation even if they hold no entry.
    pub fn reserve_through(&mut self, folder: u32) {
        self.reserved = self.reserved.max(folder);
    }

    pub fn next_local_id(&self) -> u32 {
        let max = self.entries.keys().next_back().copied().unwrap_or(0);
        max.max(self.reserved) + 1
    }

    /// Find the entry a record belongs to, trying each rule across the whole catalog in order.
    pub fn resolve(&self, record: &CatalogRecord, aggressive: bool) -> Option<(u32, MatchRule)> {
        if let Some(entry) = self.entries.values().find(|e| e.owns_api_id(record.api_id)) {
            return Some((entry.local_id, MatchRule::ApiId));
        }

        if !record.group_key.is_empty()
            && let Some(entry) = self
                .entries
                .values()
                .find(|e| e.group_key == record.group_key)
        {
            return Some((entry.local_id, MatchRule::GroupKey));
        }

        let title = normalize_name(&record.title);
        let name_cn = normalize_name(&record.name_cn);
        let same = |a: &str, b: &str| !a.is_empty() && a == b;
        if let Some(entry) = self.entries.values().find(|e| {
            same(&title, &normalize_name(&e.title)) || same(&name_cn, &normalize_name(&e.name_cn))
        }) {
            return Some((entry.local_id, MatchRule::Name));
        }

        if aggressive {
            let overlaps =
                |a: &str, b: &str| !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a));
            if let Some(entry) = self.entries.values().find(|e| {
                overlaps(&title, &normalize_name(&e.title))
                    || overlaps(&name_cn, &normalize_name(&e.name_cn))
            }) {
                return Some((entry.local_id, MatchRule::PartialName));
            }
        }

        None
    }

    /// Merge a record into its entry, or create a new entry for it.
    pub fn upsert(
        &mut self,
        record: &CatalogRecord,
        aggressive: bool,
        now: DateTime<Utc>,
    ) -> (u32, MergeOutcome) {
        if let Some((local_id, rule)) = self.resolve(record, aggressive)
            && let Some(entry) = self.entries.get_mut(&local_id)
        {
            log::debug!(
                "id {} matches entry {} by {:?}",
                record.api_id,
                local_id,
                rule
            );
            if entry.merge(record, now) {
                self.dirty.insert(local_id);
                return (local_id, MergeOutcome::Updated);
            }
            return (local_id, MergeOutcome::Unchanged);
        }

        let local_id = self.next_local_id();
        self.entries
            .insert(local_id, CatalogEntry::from_record(local_id, record, now));
        self.dirty.insert(local_id);
        (local_id, MergeOutcome::Created)
    }

    pub fn has_pending(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Entries changed since the last call, cloned for persistence.
    pub fn take_dirty(&mut self) -> Vec<CatalogEntry> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(|id| self.entries.get(&id).cloned())
            .collect()
    }

    /// `local_id -> primary api id` for `apiid.json`.
    pub fn api_ids(&self) -> BTreeMap<String, u64> {
        self.entries
            .values()
            .filter(|e| e.api_id != 0)
            .map(|e| (e.local_id.to_string(), e.api_id))
            .collect()
    }

    /// The aggregated `index.json`, leaving out entries without any name.
    pub fn index(&self) -> BTreeMap<String, IndexEntry> {
        self.entries
            .values()
            .filter(|e| !e.title.is_empty() || !e.name_cn.is_empty())
            .map(|e| {
                (
                    e.local_id.to_string(),
                    IndexEntry {
                        name: e.title.clone(),
                        name_cn: e.name_cn.clone(),
                        cover: e.cover.clone(),
                        theme_color: e.theme_color.clone(),
                        points: e.points.clone(),
                        inform: format!("{}/points.json", e.local_id),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::entry::tests::{point, record};

    fn catalog_with(title: &str, name_cn: &str, api_id: u64) -> Catalog {
        let mut rec = record(api_id, title, vec![point("P", 1.0, 1.0)]);
        rec.name_cn = name_cn.to_string();
        Catalog::new([CatalogEntry::from_record(1, &rec, Utc::now())])
    }

    #[test]
    fn resolves_by_api_id_first() {
        let catalog = catalog_with("Anime", "", 100);
        let found = catalog.resolve(&record(100, "Different", vec![]), false);
        assert_eq!(found, Some((1, MatchRule::ApiId)));
    }

    #[test]
    fn resolves_by_normalised_name() {
        let catalog = catalog_with("Hibike! Euphonium", "吹响吧！上低音号", 100);
        let found = catalog.resolve(&record(200, "hibike euphonium", vec![]), false);
        assert_eq!(found, Some((1, MatchRule::Name)));

        let mut cn_only = record(201, "", vec![]);
        cn_only.name_cn = "吹响吧 上低音号".into();
        assert_eq!(catalog.resolve(&cn_only, false), Some((1, MatchRule::Name)));
    }

    #[test]
    fn partial_names_need_aggressive_mode() {
        let catalog = catalog_with("Hibike! Euphonium", "", 100);
        let sequel = record(300, "Hibike! Euphonium 2", vec![]);

        assert_eq!(catalog.resolve(&sequel, false), None);
        assert_eq!(
            catalog.resolve(&sequel, true),
            Some((1, MatchRule::PartialName))
        );
    }

    #[test]
    fn resolves_by_group_key() {
        let mut rec = record(100, "Season 1", vec![]);
        rec.group_key = "series-9".into();
        let catalog = Catalog::new([CatalogEntry::from_record(4, &rec, Utc::now())]);

        let mut other = record(555, "Completely Else", vec![]);
        other.group_key = "series-9".into();
        assert_eq!(catalog.resolve(&other, false), Some((4, MatchRule::GroupKey)));
    }

    #[test]
    fn upsert_creates_then_merges() {
        let mut catalog = Catalog::default();
        let now = Utc::now();

        let (id, outcome) = catalog.upsert(&record(7, "Anime", vec![point("A", 1.0, 1.0)]), false, now);
        assert_eq!((id, outcome), (1, MergeOutcome::Created));

        let (id, outcome) = catalog.upsert(&record(7, "Anime", vec![point("B", 2.0, 2.0)]), false, now);
        assert_eq!((id, outcome), (1, MergeOutcome::Updated));

        let (_, outcome) = catalog.upsert(&record(7, "Anime", vec![point("B", 2.0, 2.0)]), false, now);
        assert_eq!(outcome, MergeOutcome::Unchanged);

        let (id, outcome) = catalog.upsert(&record(8, "Other", vec![]), false, now);
        assert_eq!((id, outcome), (2, MergeOutcome::Created));

        assert_eq!(catalog.take_dirty().len(), 2);
        assert!(!catalog.has_pending());
    }

    #[test]
    fn index_skips_nameless_entries() {
        let mut catalog = catalog_with("Anime", "", 1);
        if let Some(entry) = catalog.get_mut(1) {
            entry.title.clear();
        }
        assert!(catalog.index().is_empty());
        assert_eq!(catalog.api_ids().get("1"), Some(&1));
    }
}
