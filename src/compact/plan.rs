//! Selection of merge candidates from a bucket listing.
//!
//! Pure functions over [`ObjectInfo`]; no I/O.

use std::collections::BTreeMap;

use crate::layout::{PartitionKey, PARQUET_EXTENSION};
use crate::storage::ObjectInfo;

/// The partition an object was filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionGroup {
    Known(PartitionKey),
    /// Keys without a parseable `dt`/`hr` pair, or not Parquet. Never merged.
    Unknown,
}

impl PartitionGroup {
    pub fn of(object: &ObjectInfo) -> Self {
        if !object.key.ends_with(&format!(".{PARQUET_EXTENSION}")) {
            return Self::Unknown;
        }
        PartitionKey::from_object_key(&object.key).map_or(Self::Unknown, Self::Known)
    }
}

/// A set of small files in one partition that should become one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCandidate {
    pub partition: PartitionKey,
    pub small: Vec<ObjectInfo>,
    /// Size of every object in the partition, small or not.
    pub total_bytes: u64,
}

impl MergeCandidate {
    pub fn small_bytes(&self) -> u64 {
        self.small.iter().map(|o| o.size).sum()
    }

    pub fn keys(&self) -> Vec<String> {
        self.small.iter().map(|o| o.key.clone()).collect()
    }
}

pub fn group_by_partition(objects: Vec<ObjectInfo>) -> BTreeMap<PartitionGroup, Vec<ObjectInfo>> {
    let mut groups: BTreeMap<PartitionGroup, Vec<ObjectInfo>> = BTreeMap::new();
    for object in objects {
        groups.entry(PartitionGroup::of(&object)).or_default().push(object);
    }
    groups
}

/// Whether a size counts as small against `target`.
pub fn is_small(size: u64, target: u64) -> bool {
    size < target / 2
}

/// Applies the merge gate to one partition: at least two small files and a
/// partition total of at least `target` bytes.
pub fn select_group(
    partition: PartitionKey,
    objects: &[ObjectInfo],
    target: u64,
) -> Option<MergeCandidate> {
    let total_bytes: u64 = objects.iter().map(|o| o.size).sum();
    let small: Vec<ObjectInfo> = objects
        .iter()
        .filter(|o| is_small(o.size, target))
        .cloned()
        .collect();
    if small.len() < 2 || total_bytes < target {
        return None;
    }
    Some(MergeCandidate {
        partition,
        small,
        total_bytes,
    })
}

/// Every partition of a tenant's listing that passes the merge gate, in
/// partition order.
pub fn select_candidates(objects: Vec<ObjectInfo>, target: u64) -> Vec<MergeCandidate> {
    group_by_partition(objects)
        .into_iter()
        .filter_map(|(group, members)| match group {
            PartitionGroup::Known(partition) => select_group(partition, &members, target),
            PartitionGroup::Unknown => {
                log::debug!("compact: {} objects with unknown partition left alone", members.len());
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn object(key: &str, size: u64) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size,
            etag: None,
            last_modified: datetime!(2024-01-01 00:00 UTC),
        }
    }

    fn hour9(name: &str, size: u64) -> ObjectInfo {
        object(&format!("tenant_id=t1/dt=2024-01-01/hr=09/{name}.parquet"), size)
    }

    #[test]
    fn groups_by_partition_with_unknown_bucket() {
        let groups = group_by_partition(vec![
            hour9("a", 1),
            object("tenant_id=t1/dt=2024-01-01/hr=10/b.parquet", 1),
            object("tenant_id=t1/stray.parquet", 1),
            object("tenant_id=t1/dt=2024-01-01/hr=09/notes.txt", 1),
            object("tenant_id=t1/dt=2024-13-01/hr=09/c.parquet", 1),
        ]);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[&PartitionGroup::Unknown].len(), 3);
    }

    #[test]
    fn merges_when_both_gates_pass() {
        let objects: Vec<_> = (0..6).map(|i| hour9(&format!("p{i}"), 10)).collect();
        let candidates = select_candidates(objects, 60);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].small.len(), 6);
        assert_eq!(candidates[0].total_bytes, 60);
    }

    #[test]
    fn total_below_target_is_left_alone() {
        let objects: Vec<_> = (0..6).map(|i| hour9(&format!("p{i}"), 10)).collect();
        assert!(select_candidates(objects, 61).is_empty());
    }

    #[test]
    fn single_small_file_is_left_alone() {
        let objects = vec![hour9("big", 200), hour9("small", 10)];
        assert!(select_candidates(objects, 100).is_empty());
    }

    #[test]
    fn large_files_count_toward_total_but_are_not_merged() {
        let objects = vec![hour9("big", 90), hour9("s1", 10), hour9("s2", 10)];
        let candidates = select_candidates(objects, 100);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].small_bytes(), 20);
        assert!(candidates[0].keys().iter().all(|k| !k.contains("big")));
    }

    #[test]
    fn unknown_group_never_merged() {
        let objects: Vec<_> = (0..4)
            .map(|i| object(&format!("tenant_id=t1/loose-{i}.parquet"), 10))
            .collect();
        assert!(select_candidates(objects, 20).is_empty());
    }

    #[test]
    fn small_threshold_is_strict_half() {
        assert!(is_small(49, 100));
        assert!(!is_small(50, 100));
    }
}
