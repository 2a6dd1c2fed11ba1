// src/models/entry.rs

//! Catalog entries, pilgrimage points and the merge rules between them.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Theme colour given to entries the catalog did not colour.
pub const DEFAULT_THEME_COLOR: &str = "#7f6a95";

/// Provenance source name for records coming from the catalog API.
pub const CATALOG_SOURCE: &str = "anitabi";

/// A geocoded pilgrimage location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Localized name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cn: Option<String>,

    #[serde(default)]
    pub image: String,

    /// Episode the scene appears in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ep: Option<Value>,

    /// Timestamp within the episode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<Value>,

    /// `[lat, lng]`
    pub geo: [f64; 2],

    /// Fields written by enrichment collaborators, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Point {
    /// Identity used for deduplication: name plus coordinates at 6 decimals.
    pub fn dedup_key(&self) -> (String, i64, i64) {
        let round = |v: f64| (v * 1_000_000.0).round() as i64;
        (self.name.clone(), round(self.geo[0]), round(self.geo[1]))
    }
}

/// Where an entry (or part of it) was discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginRef {
    pub source: String,
    pub api_id: u64,
    #[serde(default)]
    pub url: String,
    pub first_seen: DateTime<Utc>,
}

/// A record returned by the catalog API for one identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogRecord {
    pub api_id: u64,
    pub title: String,
    pub name_cn: String,
    pub cover: String,
    pub theme_color: String,
    /// Logical grouping key (empty when unknown)
    pub group_key: String,
    /// Identifiers the catalog declares as the same logical group
    pub related_ids: Vec<u64>,
    pub points: Vec<Point>,
    pub origin_url: String,
}

impl CatalogRecord {
    pub fn has_name(&self) -> bool {
        !self.title.trim().is_empty() || !self.name_cn.trim().is_empty()
    }

    pub fn display_name(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.name_cn
        } else {
            &self.title
        }
    }
}

/// How a record landed in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    Updated,
    Unchanged,
}

/// One anime in the record store, persisted as `{local_id}/info.json` + `points.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Folder name; derived from the directory, not stored in info.json
    #[serde(skip)]
    pub local_id: u32,

    /// Primary external identifier
    #[serde(alias = "id", default)]
    pub api_id: u64,

    #[serde(rename = "name", alias = "title", default)]
    pub title: String,

    #[serde(alias = "cn", default)]
    pub name_cn: String,

    #[serde(default)]
    pub cover: String,

    #[serde(alias = "color", default)]
    pub theme_color: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_key: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origins: Vec<OriginRef>,

    /// Epoch for folders written before timestamps were tracked
    #[serde(default = "unknown_time")]
    pub discovered_at: DateTime<Utc>,
    #[serde(default = "unknown_time")]
    pub updated_at: DateTime<Utc>,

    /// Stored in points.json
    #[serde(skip)]
    pub points: Vec<Point>,
}

impl CatalogEntry {
    /// Build a fresh entry from the first record seen for it.
    pub fn from_record(local_id: u32, record: &CatalogRecord, now: DateTime<Utc>) -> Self {
        let theme_color = if record.theme_color.is_empty() {
            DEFAULT_THEME_COLOR.to_string()
        } else {
            record.theme_color.clone()
        };

        let mut entry = Self {
            local_id,
            api_id: record.api_id,
            title: record.title.trim().to_string(),
            name_cn: record.name_cn.trim().to_string(),
            cover: record.cover.clone(),
            theme_color,
            group_key: record.group_key.clone(),
            origins: vec![OriginRef {
                source: CATALOG_SOURCE.to_string(),
                api_id: record.api_id,
                url: record.origin_url.clone(),
                first_seen: now,
            }],
            discovered_at: now,
            updated_at: now,
            points: Vec::new(),
        };
        entry.append_points(&record.points);
        entry
    }

    pub fn display_name(&self) -> &str {
        if self.title.is_empty() {
            &self.name_cn
        } else {
            &self.title
        }
    }

    /// Whether an external id already belongs to this entry.
    pub fn owns_api_id(&self, api_id: u64) -> bool {
        self.api_id == api_id || self.origins.iter().any(|o| o.api_id == api_id)
    }

    /// Merge a record into this entry field by field.
    ///
    /// Points are appended in discovery order and deduplicated. Scalar fields
    /// keep the earliest non-empty value. Returns whether anything changed.
    pub fn merge(&mut self, record: &CatalogRecord, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        changed |= fill_if_empty(&mut self.title, record.title.trim());
        changed |= fill_if_empty(&mut self.name_cn, record.name_cn.trim());
        changed |= fill_if_empty(&mut self.cover, &record.cover);
        changed |= fill_if_empty(&mut self.theme_color, &record.theme_color);
        changed |= fill_if_empty(&mut self.group_key, &record.group_key);
        if self.api_id == 0 && record.api_id != 0 {
            self.api_id = record.api_id;
            changed = true;
        }

        changed |= self.append_points(&record.points) > 0;

        // The primary id needs no provenance ref; retention would only prune it again.
        if record.api_id != self.api_id
            && !self
                .origins
                .iter()
                .any(|o| o.source == CATALOG_SOURCE && o.api_id == record.api_id)
        {
            self.origins.push(OriginRef {
                source: CATALOG_SOURCE.to_string(),
                api_id: record.api_id,
                url: record.origin_url.clone(),
                first_seen: now,
            });
            changed = true;
        }

        if changed {
            self.updated_at = now;
        }
        changed
    }

    /// Append points whose dedup key is not present yet. Returns how many were added.
    fn append_points(&mut self, incoming: &[Point]) -> usize {
        let mut seen: HashSet<_> = self.points.iter().map(Point::dedup_key).collect();
        let before = self.points.len();
        for point in incoming {
            if seen.insert(point.dedup_key()) {
                self.points.push(point.clone());
            }
        }
        self.points.len() - before
    }
}

fn unknown_time() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn fill_if_empty(slot: &mut String, value: &str) -> bool {
    if slot.is_empty() && !value.is_empty() {
        *slot = value.to_string();
        true
    } else {
        false
    }
}
