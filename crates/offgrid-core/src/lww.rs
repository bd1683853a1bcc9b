//! Last-Writer-Wins value
//!
//! An `LwwValue` is the latest known state of one field. Merging keeps the
//! value with the highest timestamp; on a tie the lexicographically greater
//! node id wins. That is a total order, so replicas that see the same updates
//! in any order end with the same value.

use crate::clock::LogicalTimestamp;
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A timestamped field value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LwwValue {
    pub value: String,
    pub timestamp: LogicalTimestamp,
    pub node_id: String,
}

impl LwwValue {
    pub fn new(
        value: impl Into<String>,
        timestamp: LogicalTimestamp,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            value: value.into(),
            timestamp,
            node_id: node_id.into(),
        }
    }

    /// Order by (timestamp, node_id).
    pub fn stamp_cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.node_id.cmp(&other.node_id))
    }

    /// Whether `other` would replace `self` in a merge.
    pub fn is_superseded_by(&self, other: &Self) -> bool {
        self.stamp_cmp(other) == Ordering::Less
    }
}

/// Merge `remote` into `local` in place.
///
/// Returns `true` when the remote value won and was applied.
pub fn merge_lww(local: &mut LwwValue, remote: &LwwValue) -> bool {
    if local.is_superseded_by(remote) {
        local.clone_from(remote);
        true
    } else {
        false
    }
}

impl Lattice for LwwValue {
    fn bottom() -> Self {
        Self::default()
    }

    /// Same stamp from the same node means the same write; the value breaks
    /// the remaining tie so join stays commutative.
    fn join(&self, other: &Self) -> Self {
        let self_wins = match self.stamp_cmp(other) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.value >= other.value,
        };

        if self_wins {
            self.clone()
        } else {
            other.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_tie_broken_by_node_id() {
        let mut local = LwwValue::new("old", 100, "a");
        let remote = LwwValue::new("new", 100, "b");

        assert!(merge_lww(&mut local, &remote));
        assert_eq!(local, LwwValue::new("new", 100, "b"));
    }

    #[test]
    fn test_merge_lower_node_id_loses_tie() {
        let mut local = LwwValue::new("mine", 100, "b");
        let remote = LwwValue::new("theirs", 100, "a");

        assert!(!merge_lww(&mut local, &remote));
        assert_eq!(local.value, "mine");
    }

    #[test]
    fn test_merge_higher_timestamp_wins() {
        let mut local = LwwValue::new("old", 100, "z");
        let remote = LwwValue::new("new", 101, "a");

        assert!(merge_lww(&mut local, &remote));
        assert_eq!(local.value, "new");
        assert_eq!(local.node_id, "a");
    }

    #[test]
    fn test_merge_stale_update_rejected() {
        let mut local = LwwValue::new("current", 200, "a");
        let remote = LwwValue::new("stale", 150, "z");

        assert!(!merge_lww(&mut local, &remote));
        assert_eq!(local, LwwValue::new("current", 200, "a"));
    }

    #[test]
    fn test_merge_identical_is_noop() {
        let mut local = LwwValue::new("v", 10, "a");
        let same = local.clone();
        assert!(!merge_lww(&mut local, &same));
    }

    #[test]
    fn test_bottom_is_superseded_by_any_write() {
        let mut local = LwwValue::bottom();
        assert!(merge_lww(&mut local, &LwwValue::new("first", 1, "a")));
    }

    #[test]
    fn test_join_matches_merge_winner() {
        let a = LwwValue::new("x", 5, "n1");
        let b = LwwValue::new("y", 5, "n2");

        let mut merged = a.clone();
        merge_lww(&mut merged, &b);
        assert_eq!(a.join(&b), merged);
        assert_eq!(b.join(&a), merged);

        let mut joined = b.clone();
        joined.join_assign(&a);
        assert_eq!(joined, merged);
        assert!(a.leq(&merged));
    }

    #[test]
    fn test_serialization_uses_camel_case() {
        let value = LwwValue::new("hello", 42, "node-1");
        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("\"nodeId\":\"node-1\""));

        let back: LwwValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
