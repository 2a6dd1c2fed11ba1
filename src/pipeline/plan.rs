// src/pipeline/plan.rs

//! Mirror partition planning.
//!
//! Everything here is pure: the same folder set and policy always give the
//! same assignment, so re-runs are idempotent.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{AppError, Result};
use crate::models::{DestinationId, FolderRange, FolderRangePolicy, PolicyRule, StoredPolicy};

/// Assign every folder to exactly one destination.
///
/// Fails with `PolicyOverlap` if two rules share a folder and with
/// `PolicyGap` for the first folder no rule covers.
pub fn plan(
    folders: &BTreeSet<u32>,
    policy: &FolderRangePolicy,
) -> Result<BTreeMap<u32, DestinationId>> {
    validate_disjoint(policy)?;

    folders
        .iter()
        .map(|&folder| {
            policy
                .owner(folder)
                .map(|dest| (folder, dest.clone()))
                .ok_or(AppError::PolicyGap { folder })
        })
        .collect()
}

fn validate_disjoint(policy: &FolderRangePolicy) -> Result<()> {
    let mut rules: Vec<&PolicyRule> = policy.rules.iter().collect();
    rules.sort_by_key(|r| r.range.start);

    for pair in rules.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if a.range.contains(b.range.start) {
            return Err(AppError::PolicyOverlap {
                folder: b.range.start,
                first: format!("{} -> {}", a.range, a.destination),
                second: format!("{} -> {}", b.range, b.destination),
            });
        }
    }
    Ok(())
}

/// Split `folders` into contiguous, near-equal groups, one per destination.
///
/// Ranges tile the id space from 0 upward and the last non-empty group is
/// open-ended, so folders appended later extend the last group. With fewer
/// folders than destinations, the trailing destinations own nothing.
pub fn even_split(folders: &BTreeSet<u32>, destinations: &[DestinationId]) -> FolderRangePolicy {
    let Some(first_dest) = destinations.first() else {
        return FolderRangePolicy::default();
    };
    if folders.is_empty() {
        return FolderRangePolicy::new(vec![PolicyRule {
            range: FolderRange::new(0, None),
            destination: first_dest.clone(),
        }]);
    }

    let sorted: Vec<u32> = folders.iter().copied().collect();
    let n = destinations.len();
    let base = sorted.len() / n;
    let extra = sorted.len() % n;

    let mut rules = Vec::with_capacity(n);
    let mut offset = 0;
    let mut next_start = 0;
    for (i, dest) in destinations.iter().enumerate() {
        let size = base + usize::from(i < extra);
        if size == 0 {
            break;
        }
        let last = sorted[offset + size - 1];
        rules.push(PolicyRule {
            range: FolderRange::new(next_start, Some(last)),
            destination: dest.clone(),
        });
        offset += size;
        next_start = last.saturating_add(1);
    }
    if let Some(tail) = rules.last_mut() {
        tail.range.end = None;
    }
    FolderRangePolicy::new(rules)
}

/// Whether a split gave every destination at least one range.
pub fn covers_all_destinations(policy: &FolderRangePolicy, destinations: &[DestinationId]) -> bool {
    destinations
        .iter()
        .all(|d| policy.rules.iter().any(|r| &r.destination == d))
}

/// Pick the default policy: reuse the stored split while the partitioned
/// destination list is unchanged, otherwise compute a fresh even split.
///
/// Returns the policy and whether it is new (and so worth persisting).
pub fn default_policy(
    folders: &BTreeSet<u32>,
    destinations: &[DestinationId],
    stored: Option<&StoredPolicy>,
) -> (FolderRangePolicy, bool) {
    if let Some(stored) = stored
        && stored.destinations == destinations
        && validate_disjoint(&stored.policy).is_ok()
        && folders.iter().all(|&f| stored.policy.owner(f).is_some())
    {
        return (stored.policy.clone(), false);
    }
    (even_split(folders, destinations), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn dests(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("cdn{i}")).collect()
    }

    fn folders(ids: impl IntoIterator<Item = u32>) -> BTreeSet<u32> {
        ids.into_iter().collect()
    }

    #[test]
    fn even_split_is_total_and_disjoint() {
        let sets = [
            folders(1..=1),
            folders(1..=7),
            folders(1..=100),
            folders([3, 9, 10, 250, 251, 4000]),
            folders((1..=60).map(|i| i * 3)),
        ];
        for set in &sets {
            for n in 1..=6 {
                let destinations = dests(n);
                let policy = even_split(set, &destinations);
                let mapping = plan(set, &policy).unwrap();

                assert_eq!(mapping.keys().copied().collect::<BTreeSet<_>>(), *set);
                assert!(mapping.values().all(|d| destinations.contains(d)));
                if n == 1 {
                    assert!(mapping.values().all(|d| d == "cdn1"));
                }
            }
        }
    }

    #[test]
    fn even_split_is_contiguous_and_balanced() {
        let policy = even_split(&folders(1..=10), &dests(3));
        let ranges: Vec<String> = policy.rules.iter().map(|r| r.range.to_string()).collect();
        assert_eq!(ranges, vec!["0-4", "5-7", "8-"]);
    }

    #[test]
    fn fewer_folders_than_destinations() {
        let set = folders([1, 2]);
        let policy = even_split(&set, &dests(4));
        let mapping = plan(&set, &policy).unwrap();
        assert_eq!(mapping[&1], "cdn1");
        assert_eq!(mapping[&2], "cdn2");
        assert!(!covers_all_destinations(&policy, &dests(4)));
    }

    #[test]
    fn empty_store_plans_nothing() {
        let policy = even_split(&BTreeSet::new(), &dests(2));
        assert!(plan(&BTreeSet::new(), &policy).unwrap().is_empty());
        assert_eq!(policy.owner(1).map(String::as_str), Some("cdn1"));
    }

    #[test]
    fn explicit_gap_is_rejected() {
        let policy = FolderRangePolicy::parse("[[[1,5]],[[7,null]]]", &dests(2)).unwrap();
        let err = plan(&folders(1..=8), &policy).unwrap_err();
        assert!(matches!(err, AppError::PolicyGap { folder: 6 }));
    }

    #[test]
    fn explicit_overlap_is_rejected() {
        let policy = FolderRangePolicy::parse("[[[1,5]],[[5,null]]]", &dests(2)).unwrap();
        let err = plan(&folders(1..=3), &policy).unwrap_err();
        assert!(matches!(err, AppError::PolicyOverlap { folder: 5, .. }));

        let open = FolderRangePolicy::parse("[[[1,null]],[[100,200]]]", &dests(2)).unwrap();
        assert!(matches!(
            plan(&folders([1]), &open),
            Err(AppError::PolicyOverlap { folder: 100, .. })
        ));
    }

    #[test]
    fn explicit_policy_maps_folders() {
        let policy =
            FolderRangePolicy::parse("[[[1,700]],[[701,1009]],[[1010,null]]]", &dests(3)).unwrap();
        let mapping = plan(&folders([1, 700, 701, 1009, 1010, 5300]), &policy).unwrap();
        assert_eq!(mapping[&700], "cdn1");
        assert_eq!(mapping[&1009], "cdn2");
        assert_eq!(mapping[&5300], "cdn3");
    }

    #[test]
    fn stored_split_is_stable_when_folders_grow() {
        let destinations = dests(3);
        let initial = folders(1..=10);
        let (policy, fresh) = default_policy(&initial, &destinations, None);
        assert!(fresh);
        let before = plan(&initial, &policy).unwrap();

        let stored = StoredPolicy {
            destinations: destinations.clone(),
            policy,
            created_at: Utc::now(),
        };
        let grown = folders(1..=15);
        let (reused, fresh) = default_policy(&grown, &destinations, Some(&stored));
        assert!(!fresh);

        let after = plan(&grown, &reused).unwrap();
        for (folder, dest) in &before {
            assert_eq!(&after[folder], dest);
        }
        assert!((11..=15).all(|f| after[&f] == "cdn3"));
    }

    #[test]
    fn stored_split_dropped_when_destinations_change() {
        let stored = StoredPolicy {
            destinations: dests(2),
            policy: even_split(&folders(1..=10), &dests(2)),
            created_at: Utc::now(),
        };
        let (policy, fresh) = default_policy(&folders(1..=10), &dests(3), Some(&stored));
        assert!(fresh);
        assert!(covers_all_destinations(&policy, &dests(3)));
    }
}
