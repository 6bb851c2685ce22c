//! Version histories: branch identity and ordering primitives.
//!
//! A [`VersionHistory`] is a run-length encoding of which failover version
//! wrote which event range of one branch:
//!
//! ```text
//! items: [(3, v1), (7, v4), (9, v5)]
//!
//! event:    1  2  3 | 4  5  6  7 | 8  9
//! version: v1 v1 v1 |v4 v4 v4 v4 |v5 v5
//! ```
//!
//! Two histories of the same run always agree on some prefix. The lowest
//! common ancestor (LCA) is the last event of that prefix; everything after it
//! was written concurrently in different clusters.
//!
//! This module is pure: no I/O, no locking.

use crate::error::{ReplicationError, Result};
use crate::history::types::BranchToken;
use serde::{Deserialize, Serialize};

/// Checkpoint meaning "events up to and including `last_event_id` were written
/// under `version`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    pub last_event_id: i64,
    pub version: i64,
}

impl VersionHistoryItem {
    pub fn new(last_event_id: i64, version: i64) -> Self {
        Self {
            last_event_id,
            version,
        }
    }
}

/// Result of comparing two version histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOrdering {
    Equal,
    ANewer,
    BNewer,
}

/// The version history of one branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    pub branch_token: BranchToken,
    items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// Build a history, validating item ordering.
    pub fn new(branch_token: BranchToken, items: Vec<VersionHistoryItem>) -> Result<Self> {
        validate_items(&items)?;
        Ok(Self {
            branch_token,
            items,
        })
    }

    /// A history with no events yet.
    pub fn empty(branch_token: BranchToken) -> Self {
        Self {
            branch_token,
            items: Vec::new(),
        }
    }

    pub fn items(&self) -> &[VersionHistoryItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last_item(&self) -> Option<VersionHistoryItem> {
        self.items.last().copied()
    }

    /// Last event ID covered (0 when empty).
    pub fn last_event_id(&self) -> i64 {
        self.items.last().map(|i| i.last_event_id).unwrap_or(0)
    }

    /// Same items, bound to another branch.
    pub fn with_branch_token(&self, branch_token: BranchToken) -> Self {
        Self {
            branch_token,
            items: self.items.clone(),
        }
    }

    /// Version in effect at `event_id`, or `None` outside `1..=last_event_id`.
    pub fn version_at(&self, event_id: i64) -> Option<i64> {
        if event_id < 1 {
            return None;
        }
        self.items
            .iter()
            .find(|item| item.last_event_id >= event_id)
            .map(|item| item.version)
    }

    /// Record that the branch grew to `item.last_event_id` under `item.version`.
    ///
    /// Extends the last item when the version is unchanged, appends a new item
    /// when it increased. Version decreases and non-advancing event IDs are
    /// rejected.
    pub fn add_or_update_item(&mut self, item: VersionHistoryItem) -> Result<()> {
        let Some(last) = self.items.last_mut() else {
            if item.last_event_id < 1 || item.last_event_id > MAX_EVENT_ID {
                return Err(ReplicationError::VersionHistoryUnresolvable(format!(
                    "first item must cover event 1 or later, got {}",
                    item.last_event_id
                )));
            }
            self.items.push(item);
            return Ok(());
        };

        if item.last_event_id > MAX_EVENT_ID {
            return Err(ReplicationError::VersionHistoryUnresolvable(format!(
                "event id {} out of range",
                item.last_event_id
            )));
        }
        if item.last_event_id <= last.last_event_id {
            return Err(ReplicationError::VersionHistoryUnresolvable(format!(
                "event id {} does not advance past {}",
                item.last_event_id, last.last_event_id
            )));
        }
        if item.version < last.version {
            return Err(ReplicationError::VersionHistoryUnresolvable(format!(
                "version {} decreases below {}",
                item.version, last.version
            )));
        }

        if item.version == last.version {
            last.last_event_id = item.last_event_id;
        } else {
            self.items.push(item);
        }
        Ok(())
    }

    /// Prefix of this history ending at `event_id` (0 gives an empty history).
    pub fn truncate_to(&self, event_id: i64) -> Result<VersionHistory> {
        if event_id < 0 || event_id > self.last_event_id() {
            return Err(ReplicationError::VersionHistoryUnresolvable(format!(
                "cannot truncate history ending at {} to {}",
                self.last_event_id(),
                event_id
            )));
        }

        let mut items = Vec::new();
        if event_id > 0 {
            for item in &self.items {
                if item.last_event_id >= event_id {
                    items.push(VersionHistoryItem::new(event_id, item.version));
                    break;
                }
                items.push(*item);
            }
        }

        Ok(VersionHistory {
            branch_token: self.branch_token.clone(),
            items,
        })
    }
}

/// Largest event ID a history may reach, so "next event" never overflows.
pub const MAX_EVENT_ID: i64 = i64::MAX - 1;

/// Check that item event IDs strictly increase and versions never decrease.
pub fn validate_items(items: &[VersionHistoryItem]) -> Result<()> {
    if let Some(first) = items.first() {
        if first.last_event_id < 1 {
            return Err(ReplicationError::VersionHistoryUnresolvable(format!(
                "first item ends at invalid event id {}",
                first.last_event_id
            )));
        }
    }
    if let Some(last) = items.last() {
        if last.last_event_id > MAX_EVENT_ID {
            return Err(ReplicationError::VersionHistoryUnresolvable(format!(
                "last item ends at invalid event id {}",
                last.last_event_id
            )));
        }
    }
    for pair in items.windows(2) {
        if pair[1].last_event_id <= pair[0].last_event_id {
            return Err(ReplicationError::VersionHistoryUnresolvable(format!(
                "item event ids not increasing: {} then {}",
                pair[0].last_event_id, pair[1].last_event_id
            )));
        }
        if pair[1].version < pair[0].version {
            return Err(ReplicationError::VersionHistoryUnresolvable(format!(
                "item versions decreasing: {} then {}",
                pair[0].version, pair[1].version
            )));
        }
    }
    Ok(())
}

/// Ordering key of a history's tail: (version, last event). Empty sorts first.
fn tail_key(history: &VersionHistory) -> (i64, i64) {
    history
        .last_item()
        .map(|item| (item.version, item.last_event_id))
        .unwrap_or((i64::MIN, 0))
}

/// Compare two histories by last-item version, then by last event ID.
pub fn compare(a: &VersionHistory, b: &VersionHistory) -> HistoryOrdering {
    match tail_key(a).cmp(&tail_key(b)) {
        std::cmp::Ordering::Equal => HistoryOrdering::Equal,
        std::cmp::Ordering::Greater => HistoryOrdering::ANewer,
        std::cmp::Ordering::Less => HistoryOrdering::BNewer,
    }
}

/// Find the last event at which both histories agree on the version.
///
/// Walks both item lists from the tail, stepping back on whichever side holds
/// the greater version until the versions meet. Histories with no common
/// prefix are an inconsistency and yield
/// [`ReplicationError::VersionHistoryUnresolvable`].
pub fn find_lowest_common_ancestor(
    a: &VersionHistory,
    b: &VersionHistory,
) -> Result<VersionHistoryItem> {
    let mut i = a.items.len();
    let mut j = b.items.len();

    while i > 0 && j > 0 {
        let left = a.items[i - 1];
        let right = b.items[j - 1];
        if left.version == right.version {
            return Ok(VersionHistoryItem::new(
                left.last_event_id.min(right.last_event_id),
                left.version,
            ));
        }
        if left.version > right.version {
            i -= 1;
        } else {
            j -= 1;
        }
    }

    Err(ReplicationError::VersionHistoryUnresolvable(format!(
        "no common ancestor between histories ending at ({}, v{}) and ({}, v{})",
        a.last_event_id(),
        tail_key(a).0,
        b.last_event_id(),
        tail_key(b).0,
    )))
}

/// True if `short` is wholly implied by `long` up to short's last event.
pub fn is_prefix(short: &VersionHistory, long: &VersionHistory) -> bool {
    let Some(last) = short.last_item() else {
        return true;
    };
    match find_lowest_common_ancestor(short, long) {
        Ok(lca) => lca == last,
        Err(_) => false,
    }
}

/// The competing branches of one run plus the current-branch pointer.
///
/// The current branch is the one with the highest last-item version, then the
/// longest history, then the earliest created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    current_index: usize,
    histories: Vec<VersionHistory>,
}

impl VersionHistories {
    pub fn new(initial: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![initial],
        }
    }

    pub fn histories(&self) -> &[VersionHistory] {
        &self.histories
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current(&self) -> &VersionHistory {
        &self.histories[self.current_index]
    }

    pub fn get(&self, index: usize) -> Result<&VersionHistory> {
        self.histories.get(index).ok_or_else(|| {
            ReplicationError::Internal(format!(
                "branch index {} out of range ({} branches)",
                index,
                self.histories.len()
            ))
        })
    }

    /// Insert a new branch, returning its index. Current selection is recomputed.
    pub fn add(&mut self, history: VersionHistory) -> usize {
        self.histories.push(history);
        self.recompute_current();
        self.histories.len() - 1
    }

    /// Replace the branch at `index`. Current selection is recomputed.
    pub fn update(&mut self, index: usize, history: VersionHistory) -> Result<()> {
        let slot = self.histories.get_mut(index).ok_or_else(|| {
            ReplicationError::Internal(format!("branch index {} out of range", index))
        })?;
        *slot = history;
        self.recompute_current();
        Ok(())
    }

    /// Index of the branch that should be current.
    pub fn select_current(&self) -> usize {
        let mut best = 0;
        for (index, history) in self.histories.iter().enumerate().skip(1) {
            if compare(history, &self.histories[best]) == HistoryOrdering::ANewer {
                best = index;
            }
        }
        best
    }

    /// Re-select the current branch. Returns `true` if it changed.
    pub fn recompute_current(&mut self) -> bool {
        let selected = self.select_current();
        let changed = selected != self.current_index;
        self.current_index = selected;
        changed
    }

    /// Branch that already contains all of `incoming`.
    pub fn find_containing(&self, incoming: &VersionHistory) -> Option<usize> {
        self.histories
            .iter()
            .position(|history| is_prefix(incoming, history))
    }

    /// Longest non-empty branch that is a prefix of `incoming` (lowest index on tie).
    pub fn find_extendable(&self, incoming: &VersionHistory) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, history) in self.histories.iter().enumerate() {
            if history.is_empty() || !is_prefix(history, incoming) {
                continue;
            }
            match best {
                Some(b) if self.histories[b].last_event_id() >= history.last_event_id() => {}
                _ => best = Some(index),
            }
        }
        best
    }

    /// Branch sharing the longest prefix with `incoming` (lowest index on tie).
    pub fn find_best_lca(&self, incoming: &VersionHistory) -> Option<(usize, VersionHistoryItem)> {
        let mut best: Option<(usize, VersionHistoryItem)> = None;
        for (index, history) in self.histories.iter().enumerate() {
            let Ok(lca) = find_lowest_common_ancestor(history, incoming) else {
                continue;
            };
            match best {
                Some((_, b)) if b.last_event_id >= lca.last_event_id => {}
                _ => best = Some((index, lca)),
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vh(items: &[(i64, i64)]) -> VersionHistory {
        VersionHistory::new(
            BranchToken::default(),
            items
                .iter()
                .map(|&(e, v)| VersionHistoryItem::new(e, v))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_unordered_items() {
        let items = vec![VersionHistoryItem::new(5, 1), VersionHistoryItem::new(5, 2)];
        assert!(VersionHistory::new(BranchToken::default(), items).is_err());

        let items = vec![VersionHistoryItem::new(5, 3), VersionHistoryItem::new(8, 2)];
        assert!(VersionHistory::new(BranchToken::default(), items).is_err());
    }

    #[test]
    fn test_version_at() {
        let history = vh(&[(3, 1), (7, 4), (9, 5)]);
        assert_eq!(history.version_at(0), None);
        assert_eq!(history.version_at(1), Some(1));
        assert_eq!(history.version_at(3), Some(1));
        assert_eq!(history.version_at(4), Some(4));
        assert_eq!(history.version_at(9), Some(5));
        assert_eq!(history.version_at(10), None);
    }

    #[test]
    fn test_add_or_update_item_extends_same_version() {
        let mut history = vh(&[(3, 1)]);
        history.add_or_update_item(VersionHistoryItem::new(5, 1)).unwrap();
        assert_eq!(history.items(), &[VersionHistoryItem::new(5, 1)]);

        history.add_or_update_item(VersionHistoryItem::new(6, 2)).unwrap();
        assert_eq!(history.items().len(), 2);
        assert_eq!(history.last_event_id(), 6);
    }

    #[test]
    fn test_add_or_update_item_rejects_regressions() {
        let mut history = vh(&[(3, 2)]);
        assert!(history.add_or_update_item(VersionHistoryItem::new(3, 2)).is_err());
        assert!(history.add_or_update_item(VersionHistoryItem::new(4, 1)).is_err());

        let mut empty = VersionHistory::empty(BranchToken::default());
        assert!(empty.add_or_update_item(VersionHistoryItem::new(0, 1)).is_err());
    }

    #[test]
    fn test_truncate_to() {
        let history = vh(&[(3, 1), (7, 4), (9, 5)]);
        assert_eq!(history.truncate_to(5).unwrap().items(), vh(&[(3, 1), (5, 4)]).items());
        assert_eq!(history.truncate_to(3).unwrap().items(), vh(&[(3, 1)]).items());
        assert!(history.truncate_to(0).unwrap().is_empty());
        assert!(history.truncate_to(10).is_err());
    }

    #[test]
    fn test_compare_by_version_then_length() {
        assert_eq!(compare(&vh(&[(5, 2)]), &vh(&[(9, 1)])), HistoryOrdering::ANewer);
        assert_eq!(compare(&vh(&[(5, 1)]), &vh(&[(9, 1)])), HistoryOrdering::BNewer);
        assert_eq!(compare(&vh(&[(3, 0), (9, 1)]), &vh(&[(9, 1)])), HistoryOrdering::Equal);
    }

    #[test]
    fn test_lca_shared_prefix() {
        let a = vh(&[(5, 1), (10, 3)]);
        let b = vh(&[(5, 1), (8, 2)]);
        assert_eq!(find_lowest_common_ancestor(&a, &b).unwrap(), VersionHistoryItem::new(5, 1));
        assert_eq!(find_lowest_common_ancestor(&b, &a).unwrap(), VersionHistoryItem::new(5, 1));
    }

    #[test]
    fn test_lca_same_version_different_lengths() {
        let a = vh(&[(4, 1)]);
        let b = vh(&[(9, 1)]);
        assert_eq!(find_lowest_common_ancestor(&a, &b).unwrap(), VersionHistoryItem::new(4, 1));
    }

    #[test]
    fn test_lca_no_common_root() {
        let a = vh(&[(4, 1)]);
        let b = vh(&[(4, 2)]);
        let err = find_lowest_common_ancestor(&a, &b).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_is_prefix() {
        let long = vh(&[(3, 1), (7, 4)]);
        assert!(is_prefix(&vh(&[(2, 1)]), &long));
        assert!(is_prefix(&vh(&[(3, 1), (5, 4)]), &long));
        assert!(is_prefix(&long, &long));
        assert!(!is_prefix(&vh(&[(4, 1)]), &long));
        assert!(!is_prefix(&vh(&[(3, 1), (8, 4)]), &long));
        assert!(is_prefix(&VersionHistory::empty(BranchToken::default()), &long));
    }

    #[test]
    fn test_histories_current_selection_tie_breaks() {
        let mut histories = VersionHistories::new(vh(&[(5, 1)]));
        assert_eq!(histories.current_index(), 0);

        // Same tail: earliest created stays current.
        histories.add(vh(&[(5, 1)]));
        assert_eq!(histories.current_index(), 0);

        // Longer history of the same version wins.
        histories.add(vh(&[(6, 1)]));
        assert_eq!(histories.current_index(), 2);

        // Higher version wins even when shorter.
        histories.add(vh(&[(2, 1), (3, 2)]));
        assert_eq!(histories.current_index(), 3);
    }

    #[test]
    fn test_histories_find_helpers() {
        let mut histories = VersionHistories::new(vh(&[(5, 1)]));
        histories.add(vh(&[(3, 1), (6, 2)]));

        assert_eq!(histories.find_containing(&vh(&[(4, 1)])), Some(0));
        assert_eq!(histories.find_containing(&vh(&[(3, 1), (5, 2)])), Some(1));
        assert_eq!(histories.find_containing(&vh(&[(9, 1)])), None);

        assert_eq!(histories.find_extendable(&vh(&[(8, 1)])), Some(0));
        assert_eq!(histories.find_extendable(&vh(&[(3, 1), (8, 2)])), Some(1));

        let (index, lca) = histories.find_best_lca(&vh(&[(4, 1), (7, 3)])).unwrap();
        assert_eq!(index, 0);
        assert_eq!(lca, VersionHistoryItem::new(4, 1));
        assert!(histories.find_best_lca(&vh(&[(4, 0)])).is_none());
    }
}
