//! Version histories
//!
//! A version history compresses a run's event log into `(event_id, version)`
//! endpoints: each item marks the last event id produced under that failover
//! version. Concurrent failovers can leave a run with multiple branches that
//! share a prefix and diverge at a lowest common ancestor; one branch is
//! current at any time.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// One endpoint of a version history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    /// Last event id produced under `version`
    pub event_id: i64,
    /// Failover version
    pub version: i64,
}

impl VersionHistoryItem {
    pub fn new(event_id: i64, version: i64) -> Self {
        Self { event_id, version }
    }
}

/// One branch of a run's version history
///
/// Item versions and event ids are both strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    /// Opaque storage token of the history branch backing this lineage
    #[serde(default)]
    pub branch_token: Vec<u8>,
    items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// Build a branch from items, validating the ordering invariants
    pub fn new(branch_token: Vec<u8>, items: Vec<VersionHistoryItem>) -> EngineResult<Self> {
        let history = Self {
            branch_token,
            items,
        };
        history.validate()?;
        Ok(history)
    }

    /// Branch containing nothing yet; first `update` populates it
    pub fn empty() -> Self {
        Self {
            branch_token: Vec::new(),
            items: Vec::new(),
        }
    }

    /// Empty branch bound to a storage token
    pub fn with_branch_token(branch_token: Vec<u8>) -> Self {
        Self {
            branch_token,
            items: Vec::new(),
        }
    }

    fn validate(&self) -> EngineResult<()> {
        let mut prev: Option<&VersionHistoryItem> = None;
        for item in &self.items {
            if item.event_id < 1 || item.version < 0 {
                return Err(EngineError::InvalidVersionHistory(format!(
                    "non-positive item ({}, {})",
                    item.event_id, item.version
                )));
            }
            if let Some(p) = prev {
                if item.event_id <= p.event_id || item.version <= p.version {
                    return Err(EngineError::InvalidVersionHistory(format!(
                        "items not strictly increasing: ({}, {}) after ({}, {})",
                        item.event_id, item.version, p.event_id, p.version
                    )));
                }
            }
            prev = Some(item);
        }
        Ok(())
    }

    /// All items of the branch, oldest first
    pub fn items(&self) -> &[VersionHistoryItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Newest item of the branch
    pub fn last_item(&self) -> EngineResult<VersionHistoryItem> {
        self.items.last().copied().ok_or_else(|| {
            EngineError::InvalidVersionHistory("version history is empty".into())
        })
    }

    /// Version of the newest item, the branch tip version
    pub fn last_version(&self) -> EngineResult<i64> {
        Ok(self.last_item()?.version)
    }

    /// Record that events up to `item.event_id` now exist under
    /// `item.version`. Extends the tip in place when the version matches,
    /// appends a new endpoint when the version advances.
    pub fn update(&mut self, item: VersionHistoryItem) -> EngineResult<()> {
        if item.event_id < 1 || item.version < 0 {
            return Err(EngineError::InvalidVersionHistory(format!(
                "non-positive item ({}, {})",
                item.event_id, item.version
            )));
        }
        let Some(last) = self.items.last_mut() else {
            self.items.push(item);
            return Ok(());
        };
        if item.version < last.version {
            return Err(EngineError::InvalidVersionHistory(format!(
                "version rollback: {} after {}",
                item.version, last.version
            )));
        }
        if item.version == last.version {
            if item.event_id < last.event_id {
                return Err(EngineError::InvalidVersionHistory(format!(
                    "event id rollback: {} after {}",
                    item.event_id, last.event_id
                )));
            }
            last.event_id = item.event_id;
            return Ok(());
        }
        if item.event_id <= last.event_id {
            return Err(EngineError::InvalidVersionHistory(format!(
                "new version {} must advance event id past {}",
                item.version, last.event_id
            )));
        }
        self.items.push(item);
        Ok(())
    }

    /// Whether the event `(item.event_id, item.version)` lies on this branch
    pub fn contains_item(&self, item: VersionHistoryItem) -> bool {
        let mut prev_event_id = 0;
        for endpoint in &self.items {
            if endpoint.version == item.version {
                return prev_event_id < item.event_id && item.event_id <= endpoint.event_id;
            }
            prev_event_id = endpoint.event_id;
        }
        false
    }

    /// Lowest common ancestor of this branch and `remote`
    ///
    /// Walks both item lists from the newest end; the first version shared
    /// by both sides bounds the LCA at the smaller of the two event ids.
    /// Errors only when the branches share no version at all, which cannot
    /// happen for histories descending from one run.
    pub fn lowest_common_item(
        &self,
        remote: &VersionHistory,
    ) -> EngineResult<VersionHistoryItem> {
        let mut local_idx = self.items.len();
        let mut remote_idx = remote.items.len();
        while local_idx > 0 && remote_idx > 0 {
            let local = &self.items[local_idx - 1];
            let rem = &remote.items[remote_idx - 1];
            if local.version == rem.version {
                return Ok(VersionHistoryItem::new(
                    local.event_id.min(rem.event_id),
                    local.version,
                ));
            }
            if local.version > rem.version {
                local_idx -= 1;
            } else {
                remote_idx -= 1;
            }
        }
        Err(EngineError::InvalidVersionHistory(
            "version histories have no common ancestor".into(),
        ))
    }

    /// Whether `remote` is this branch plus zero or more newer items, i.e.
    /// applying `remote` is a pure append on this branch.
    pub fn is_extension_of(&self, remote: &VersionHistory) -> bool {
        match (self.items.last(), remote.items.last()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(local_tip), Some(_)) => remote.contains_item(*local_tip),
        }
    }

    /// Duplicate the shared prefix up to and including `lca` as a new branch
    pub fn duplicate_until(&self, lca: VersionHistoryItem) -> EngineResult<VersionHistory> {
        if !self.contains_item(lca) {
            return Err(EngineError::InvalidVersionHistory(format!(
                "lca ({}, {}) not on branch",
                lca.event_id, lca.version
            )));
        }
        let mut items = Vec::new();
        for endpoint in &self.items {
            if endpoint.version < lca.version {
                items.push(*endpoint);
            } else {
                items.push(VersionHistoryItem::new(lca.event_id, lca.version));
                break;
            }
        }
        VersionHistory::new(self.branch_token.clone(), items)
    }
}

/// All branches of one run, with the current branch marked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    current_index: usize,
    histories: Vec<VersionHistory>,
}

impl VersionHistories {
    /// Start with a single branch, which becomes current
    pub fn new(history: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![history],
        }
    }

    pub fn branch_count(&self) -> usize {
        self.histories.len()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Branch by index
    pub fn history(&self, index: usize) -> EngineResult<&VersionHistory> {
        self.histories.get(index).ok_or_else(|| {
            EngineError::InvalidVersionHistory(format!("no branch at index {index}"))
        })
    }

    /// Mutable branch by index
    pub fn history_mut(&mut self, index: usize) -> EngineResult<&mut VersionHistory> {
        self.histories.get_mut(index).ok_or_else(|| {
            EngineError::InvalidVersionHistory(format!("no branch at index {index}"))
        })
    }

    /// The branch marked current
    pub fn current(&self) -> &VersionHistory {
        &self.histories[self.current_index]
    }

    /// Mutable view of the current branch
    pub fn current_mut(&mut self) -> &mut VersionHistory {
        &mut self.histories[self.current_index]
    }

    /// Re-mark the current branch
    pub fn set_current_index(&mut self, index: usize) -> EngineResult<()> {
        if index >= self.histories.len() {
            return Err(EngineError::InvalidVersionHistory(format!(
                "no branch at index {index}"
            )));
        }
        self.current_index = index;
        Ok(())
    }

    /// Across all branches, the branch sharing the deepest prefix with
    /// `remote`, returned with that LCA item.
    pub fn find_lca(
        &self,
        remote: &VersionHistory,
    ) -> EngineResult<(usize, VersionHistoryItem)> {
        let mut best: Option<(usize, VersionHistoryItem)> = None;
        for (index, history) in self.histories.iter().enumerate() {
            let lca = history.lowest_common_item(remote)?;
            let deeper = match best {
                None => true,
                Some((_, current_best)) => lca.event_id > current_best.event_id,
            };
            if deeper {
                best = Some((index, lca));
            }
        }
        best.ok_or_else(|| EngineError::InvalidVersionHistory("no branches".into()))
    }

    /// First branch containing `item`, if any
    pub fn find_branch_containing(&self, item: VersionHistoryItem) -> Option<usize> {
        self.histories
            .iter()
            .position(|history| history.contains_item(item))
    }

    /// Fork: add a branch and return its index. The caller decides whether
    /// it becomes current.
    pub fn add_history(&mut self, history: VersionHistory) -> EngineResult<usize> {
        if history.is_empty() {
            return Err(EngineError::InvalidVersionHistory(
                "cannot fork an empty branch".into(),
            ));
        }
        self.histories.push(history);
        Ok(self.histories.len() - 1)
    }

    /// Highest tip version across all branches; used to pick the current
    /// branch after a fork.
    pub fn max_last_version(&self) -> EngineResult<i64> {
        let mut max = i64::MIN;
        for history in &self.histories {
            max = max.max(history.last_version()?);
        }
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn branch(items: &[(i64, i64)]) -> VersionHistory {
        VersionHistory::new(
            Vec::new(),
            items
                .iter()
                .map(|&(e, v)| VersionHistoryItem::new(e, v))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_validate_rejects_unordered_items() {
        assert!(VersionHistory::new(
            Vec::new(),
            vec![
                VersionHistoryItem::new(10, 5),
                VersionHistoryItem::new(9, 6)
            ],
        )
        .is_err());
        assert!(VersionHistory::new(
            Vec::new(),
            vec![
                VersionHistoryItem::new(10, 5),
                VersionHistoryItem::new(11, 5)
            ],
        )
        .is_err());
    }

    #[test]
    fn test_update_extends_tip_in_place() {
        let mut history = branch(&[(3, 1)]);
        history.update(VersionHistoryItem::new(7, 1)).unwrap();
        assert_eq!(history.items(), &[VersionHistoryItem::new(7, 1)]);

        history.update(VersionHistoryItem::new(9, 4)).unwrap();
        assert_eq!(
            history.items(),
            &[
                VersionHistoryItem::new(7, 1),
                VersionHistoryItem::new(9, 4)
            ]
        );
    }

    #[test]
    fn test_update_rejects_rollback() {
        let mut history = branch(&[(7, 4)]);
        assert!(history.update(VersionHistoryItem::new(8, 3)).is_err());
        assert!(history.update(VersionHistoryItem::new(6, 4)).is_err());
        assert!(history.update(VersionHistoryItem::new(7, 5)).is_err());
    }

    #[test_case(1, 0, true; "first event of first segment")]
    #[test_case(3, 0, true; "last event of first segment")]
    #[test_case(4, 0, false; "event beyond its version's segment")]
    #[test_case(4, 4, true; "event inside middle segment")]
    #[test_case(5, 4, true; "endpoint of middle segment")]
    #[test_case(5, 6, false; "version mismatch within range")]
    #[test_case(7, 6, true; "branch tip")]
    #[test_case(8, 6, false; "event past the tip")]
    fn test_contains_item(event_id: i64, version: i64, expected: bool) {
        let history = branch(&[(3, 0), (5, 4), (7, 6)]);
        assert_eq!(
            history.contains_item(VersionHistoryItem::new(event_id, version)),
            expected
        );
    }

    #[test]
    fn test_lowest_common_item_shared_tip_version() {
        let local = branch(&[(130, 100)]);
        let remote = branch(&[(144, 100)]);
        let lca = local.lowest_common_item(&remote).unwrap();
        assert_eq!(lca, VersionHistoryItem::new(130, 100));
    }

    #[test]
    fn test_lowest_common_item_divergent_branches() {
        let local = branch(&[(100, 2)]);
        let remote = branch(&[(50, 2), (144, 100)]);
        let lca = local.lowest_common_item(&remote).unwrap();
        assert_eq!(lca, VersionHistoryItem::new(50, 2));
    }

    #[test]
    fn test_lowest_common_item_no_overlap() {
        let local = branch(&[(10, 1)]);
        let remote = branch(&[(10, 2)]);
        assert!(local.lowest_common_item(&remote).is_err());
    }

    #[test]
    fn test_is_extension_of() {
        let local = branch(&[(1, 1), (130, 100)]);
        let ahead = branch(&[(1, 1), (144, 100)]);
        let behind = branch(&[(1, 1), (100, 100)]);
        assert!(local.is_extension_of(&ahead));
        assert!(!local.is_extension_of(&behind));
        assert!(local.is_extension_of(&local));
    }

    #[test]
    fn test_duplicate_until() {
        let history = branch(&[(3, 0), (5, 4), (9, 6)]);
        let forked = history
            .duplicate_until(VersionHistoryItem::new(4, 4))
            .unwrap();
        assert_eq!(
            forked.items(),
            &[
                VersionHistoryItem::new(3, 0),
                VersionHistoryItem::new(4, 4)
            ]
        );
        assert!(history
            .duplicate_until(VersionHistoryItem::new(4, 5))
            .is_err());
    }

    #[test]
    fn test_find_lca_prefers_deepest_branch() {
        let mut histories = VersionHistories::new(branch(&[(50, 2), (100, 3)]));
        histories.add_history(branch(&[(50, 2), (144, 100)])).unwrap();

        let remote = branch(&[(50, 2), (150, 100)]);
        let (index, lca) = histories.find_lca(&remote).unwrap();
        assert_eq!(index, 1);
        assert_eq!(lca, VersionHistoryItem::new(144, 100));
    }

    #[test]
    fn test_set_current_index_bounds() {
        let mut histories = VersionHistories::new(branch(&[(5, 1)]));
        assert!(histories.set_current_index(1).is_err());
        let index = histories.add_history(branch(&[(3, 1), (9, 2)])).unwrap();
        histories.set_current_index(index).unwrap();
        assert_eq!(histories.current().last_version().unwrap(), 2);
    }

    #[test]
    fn test_max_last_version() {
        let mut histories = VersionHistories::new(branch(&[(5, 1)]));
        histories.add_history(branch(&[(3, 1), (9, 7)])).unwrap();
        assert_eq!(histories.max_last_version().unwrap(), 7);
    }
}
