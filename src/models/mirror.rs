// src/models/mirror.rs

//! Mirror destinations and folder range policies.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};

/// Destination identifier as configured.
pub type DestinationId = String;

/// How much of the record store a destination receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorMode {
    /// Entire store
    Full,
    /// Only the folders the planner assigns
    #[default]
    Partitioned,
}

impl fmt::Display for MirrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partitioned => write!(f, "partitioned"),
        }
    }
}

/// A destination repository at run time.
#[derive(Clone)]
pub struct MirrorTarget {
    pub id: DestinationId,
    pub url: String,
    pub mode: MirrorMode,
    /// Destination's own push token; opaque
    pub token: Option<String>,
}

impl MirrorTarget {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        mode: MirrorMode,
        token: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            mode,
            token: token.filter(|t| !t.is_empty()),
        }
    }

    /// Derive a stable id from a remote URL (`owner/repo`, or the last path segments).
    pub fn id_from_url(url: &str) -> String {
        let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
        let mut parts = trimmed.rsplit(['/', ':']).filter(|s| !s.is_empty());
        match (parts.next(), parts.next()) {
            (Some(repo), Some(owner)) => format!("{owner}/{repo}"),
            (Some(repo), None) => repo.to_string(),
            _ => trimmed.to_string(),
        }
    }
}

impl fmt::Debug for MirrorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorTarget")
            .field("id", &self.id)
            .field("url", &crate::utils::url::redact(&self.url))
            .field("mode", &self.mode)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Inclusive folder range; `end = None` is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRange {
    pub start: u32,
    pub end: Option<u32>,
}

impl FolderRange {
    pub fn new(start: u32, end: Option<u32>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, folder: u32) -> bool {
        folder >= self.start && self.end.is_none_or(|end| folder <= end)
    }
}

impl fmt::Display for FolderRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}-", self.start),
        }
    }
}

/// One `range -> destination` assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub range: FolderRange,
    pub destination: DestinationId,
}

/// Ordered folder range assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRangePolicy {
    pub rules: Vec<PolicyRule>,
}

impl FolderRangePolicy {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// Parse the structured string form: one element per destination, in order,
    /// each a list of `[start, end]` pairs where `end` may be `null`.
    ///
    /// `[[[1,700]],[[701,1009]],[[1010,null]]]`
    pub fn parse(raw: &str, destinations: &[DestinationId]) -> Result<Self> {
        let groups: Vec<Vec<Vec<Value>>> = serde_json::from_str(raw)?;
        if groups.len() != destinations.len() {
            return Err(AppError::validation(format!(
                "folder ranges list {} groups but {} partitioned destinations are configured",
                groups.len(),
                destinations.len()
            )));
        }

        let mut rules = Vec::new();
        for (pairs, destination) in groups.into_iter().zip(destinations) {
            for pair in pairs {
                rules.push(PolicyRule {
                    range: parse_pair(&pair)?,
                    destination: destination.clone(),
                });
            }
        }
        Ok(Self { rules })
    }

    /// Render back to the structured string form for the given destination order.
    pub fn to_wire(&self, destinations: &[DestinationId]) -> String {
        let groups: Vec<Vec<Value>> = destinations
            .iter()
            .map(|dest| {
                self.rules
                    .iter()
                    .filter(|r| &r.destination == dest)
                    .map(|r| serde_json::json!([r.range.start, r.range.end]))
                    .collect()
            })
            .collect();
        Value::from(groups.into_iter().map(Value::from).collect::<Vec<_>>()).to_string()
    }

    /// The destination owning `folder`, if any rule covers it.
    pub fn owner(&self, folder: u32) -> Option<&DestinationId> {
        self.rules
            .iter()
            .find(|r| r.range.contains(folder))
            .map(|r| &r.destination)
    }
}

fn parse_pair(pair: &[Value]) -> Result<FolderRange> {
    let bound = |v: &Value| -> Result<u32> {
        v.as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| AppError::validation(format!("folder bound {v} is not a folder id")))
    };
    match pair {
        [start, end] => {
            let start = bound(start)?;
            let end = if end.is_null() { None } else { Some(bound(end)?) };
            if end.is_some_and(|e| e < start) {
                return Err(AppError::validation(format!(
                    "folder range [{start}, {end:?}] is inverted"
                )));
            }
            Ok(FolderRange { start, end })
        }
        _ => Err(AppError::validation(format!(
            "folder range must be a [start, end] pair, got {}",
            Value::from(pair.to_vec())
        ))),
    }
}

/// Derived default policy persisted to `mirror_policy.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPolicy {
    /// Partitioned destinations the split was computed for, in order
    pub destinations: Vec<DestinationId>,
    pub policy: FolderRangePolicy,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dests(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("cdn{i}")).collect()
    }

    #[test]
    fn parses_wire_format() {
        let policy =
            FolderRangePolicy::parse("[[[1,700]],[[701,1009]],[[1010,null]]]", &dests(3)).unwrap();
        assert_eq!(policy.rules.len(), 3);
        assert_eq!(policy.rules[2].range, FolderRange::new(1010, None));
        assert_eq!(policy.owner(700).map(String::as_str), Some("cdn1"));
        assert_eq!(policy.owner(701).map(String::as_str), Some("cdn2"));
        assert_eq!(policy.owner(99_999).map(String::as_str), Some("cdn3"));
        assert_eq!(policy.owner(0), None);
    }

    #[test]
    fn wire_round_trip_keeps_destination_order() {
        let raw = "[[[1,5],[20,30]],[[6,19],[31,null]]]";
        let policy = FolderRangePolicy::parse(raw, &dests(2)).unwrap();
        assert_eq!(policy.to_wire(&dests(2)), raw);
    }

    #[test]
    fn rejects_group_count_mismatch() {
        assert!(FolderRangePolicy::parse("[[[1,2]]]", &dests(2)).is_err());
    }

    #[test]
    fn rejects_malformed_pairs() {
        assert!(FolderRangePolicy::parse("[[[1]]]", &dests(1)).is_err());
        assert!(FolderRangePolicy::parse("[[[5,1]]]", &dests(1)).is_err());
        assert!(FolderRangePolicy::parse("[[[-1,3]]]", &dests(1)).is_err());
        assert!(FolderRangePolicy::parse("not json", &dests(1)).is_err());
    }

    #[test]
    fn id_from_url() {
        assert_eq!(
            MirrorTarget::id_from_url("https://github.com/org/mirror-1.git"),
            "org/mirror-1"
        );
        assert_eq!(MirrorTarget::id_from_url("git@github.com:org/m2.git"), "org/m2");
        assert_eq!(MirrorTarget::id_from_url("/srv/m3"), "srv/m3");
    }

    #[test]
    fn debug_hides_token() {
        let target = MirrorTarget::new(
            "cdn1",
            "https://github.com/org/m.git",
            MirrorMode::Partitioned,
            Some("s3cret".into()),
        );
        assert!(!format!("{target:?}").contains("s3cret"));
    }
}
