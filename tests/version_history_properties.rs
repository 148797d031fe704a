//! Property tests for the version-history library
//!
//! Histories compared in production always describe the same run: each is a
//! cut of one underlying timeline, optionally extended under failover
//! versions no other branch uses. The generator below models exactly that
//! space, and the comparisons the replication layer relies on must be total
//! over it: containment one way, containment the other way, or a lowest
//! common ancestor with a positive event id.

use proptest::prelude::*;

use weir::history::{VersionHistory, VersionHistoryItem};

/// A strictly increasing `(event_id, version)` item chain
fn items_from(
    start_event: i64,
    start_version: i64,
    max_len: usize,
) -> impl Strategy<Value = Vec<VersionHistoryItem>> {
    prop::collection::vec((1i64..20, 1i64..10), 1..=max_len).prop_map(
        move |deltas| {
            let mut items = Vec::with_capacity(deltas.len());
            let mut event_id = start_event;
            let mut version = start_version;
            for (event_delta, version_delta) in deltas {
                event_id += event_delta;
                version += version_delta;
                items.push(VersionHistoryItem::new(event_id, version));
            }
            items
        },
    )
}

/// One cluster's view of the run: a cut of the shared timeline at some
/// event, optionally extended under failover versions above
/// `fork_version_base` that no other view uses.
fn view_of(
    timeline: Vec<VersionHistoryItem>,
    fork_version_base: i64,
) -> BoxedStrategy<VersionHistory> {
    let len = timeline.len();
    (0..len, 0i64..1000, any::<bool>())
        .prop_flat_map(move |(segment, pick, fork)| {
            let lo = if segment == 0 {
                1
            } else {
                timeline[segment - 1].event_id + 1
            };
            let hi = timeline[segment].event_id;
            let cut_event = lo + pick % (hi - lo + 1);
            let cut = VersionHistoryItem::new(cut_event, timeline[segment].version);
            let full =
                VersionHistory::new(Vec::new(), timeline.clone()).expect("valid timeline");
            let base = full.duplicate_until(cut).expect("cut lies on the timeline");
            if fork {
                items_from(cut_event, fork_version_base, 3)
                    .prop_map(move |extension| {
                        let mut items = base.items().to_vec();
                        items.extend(extension);
                        VersionHistory::new(Vec::new(), items).expect("valid fork")
                    })
                    .boxed()
            } else {
                Just(base).boxed()
            }
        })
        .boxed()
}

/// Two views of one run whose forked extensions use disjoint version ranges
fn consistent_pair() -> impl Strategy<Value = (VersionHistory, VersionHistory)> {
    items_from(0, 0, 5).prop_flat_map(|timeline| {
        let max_version = timeline.last().expect("non-empty").version;
        (
            view_of(timeline.clone(), max_version),
            view_of(timeline, max_version + 500),
        )
    })
}

proptest! {
    // Totality: comparisons over same-run views never dead-end.
    #[test]
    fn lca_is_total_over_shared_ancestry((a, b) in consistent_pair()) {
        let a_tip = a.last_item().expect("non-empty");
        let b_tip = b.last_item().expect("non-empty");
        let a_contains_b = a.contains_item(b_tip);
        let b_contains_a = b.contains_item(a_tip);
        if !a_contains_b && !b_contains_a {
            let lca = a.lowest_common_item(&b).expect("lca must exist");
            prop_assert!(lca.event_id >= 1);
        }
    }

    // The LCA is symmetric and lies on both branches.
    #[test]
    fn lca_is_symmetric_and_shared((a, b) in consistent_pair()) {
        let forward = a.lowest_common_item(&b).expect("lca must exist");
        let backward = b.lowest_common_item(&a).expect("lca must exist");
        prop_assert_eq!(forward, backward);
        prop_assert!(a.contains_item(forward));
        prop_assert!(b.contains_item(forward));
    }

    // Containment of the other side's tip means full domination: every
    // item of the dominated branch lies on the dominating one.
    #[test]
    fn tip_containment_implies_superset((a, b) in consistent_pair()) {
        let b_tip = b.last_item().expect("non-empty");
        if a.contains_item(b_tip) {
            for item in b.items() {
                prop_assert!(
                    a.contains_item(*item),
                    "missing ({}, {})",
                    item.event_id,
                    item.version
                );
            }
        }
    }

    // Tip updates keep the branch well-formed or are rejected unchanged.
    #[test]
    fn update_preserves_branch_invariants(
        items in items_from(0, 0, 5),
        event_id in 0i64..200,
        version in 0i64..60,
    ) {
        let mut branch =
            VersionHistory::new(Vec::new(), items).expect("valid branch");
        let before = branch.clone();
        match branch.update(VersionHistoryItem::new(event_id, version)) {
            Ok(()) => {
                let revalidated =
                    VersionHistory::new(Vec::new(), branch.items().to_vec());
                prop_assert!(revalidated.is_ok());
                let tip = branch.last_item().expect("non-empty");
                prop_assert_eq!(tip.event_id, event_id);
                prop_assert_eq!(tip.version, version);
            }
            Err(_) => prop_assert_eq!(branch, before),
        }
    }
}
