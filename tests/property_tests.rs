//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use common::HistoryGenerator;
use history_replicator::engine::shard_for;
use history_replicator::history::{
    compare, find_lowest_common_ancestor, is_prefix, BranchToken, HistoryOrdering, VersionHistory,
    VersionHistoryItem, WorkflowIdentity,
};
use history_replicator::source::codec::maybe_decompress;
use history_replicator::{
    HistoryStore, InMemoryHistoryStore, InMemoryTaskSource, NoOpExecutionState, TaskApplier,
};
use proptest::prelude::*;
use std::sync::Arc;

/// Valid version histories: event IDs strictly increase, versions strictly
/// increase between items.
fn history_strategy() -> impl Strategy<Value = VersionHistory> {
    (1i64..4, prop::collection::vec((1i64..20, 1i64..5), 1..6)).prop_map(|(start, steps)| {
        let mut history = VersionHistory::empty(BranchToken::default());
        let mut event_id = 0;
        let mut version = start;
        for (gap, bump) in steps {
            event_id += gap;
            history
                .add_or_update_item(VersionHistoryItem::new(event_id, version))
                .unwrap();
            version += bump;
        }
        history
    })
}

/// A history plus an event ID inside it.
fn history_with_point() -> impl Strategy<Value = (VersionHistory, i64)> {
    history_strategy().prop_flat_map(|h| {
        let last = h.last_event_id();
        (Just(h), 1..=last)
    })
}

// =============================================================================
// Comparison Properties
// =============================================================================

proptest! {
    /// A history compares equal to itself
    #[test]
    fn compare_reflexive(h in history_strategy()) {
        prop_assert_eq!(compare(&h, &h), HistoryOrdering::Equal);
    }

    /// Swapping the arguments swaps the answer
    #[test]
    fn compare_antisymmetric(a in history_strategy(), b in history_strategy()) {
        let expected = match compare(&a, &b) {
            HistoryOrdering::Equal => HistoryOrdering::Equal,
            HistoryOrdering::ANewer => HistoryOrdering::BNewer,
            HistoryOrdering::BNewer => HistoryOrdering::ANewer,
        };
        prop_assert_eq!(compare(&b, &a), expected);
    }

    /// version_at agrees with the item list
    #[test]
    fn version_at_matches_items(h in history_strategy()) {
        let mut previous_end = 0;
        for item in h.items() {
            for event_id in (previous_end + 1)..=item.last_event_id {
                prop_assert_eq!(h.version_at(event_id), Some(item.version));
            }
            previous_end = item.last_event_id;
        }
        prop_assert_eq!(h.version_at(0), None);
        prop_assert_eq!(h.version_at(h.last_event_id() + 1), None);
    }
}

// =============================================================================
// Lowest Common Ancestor Properties
// =============================================================================

proptest! {
    /// LCA does not depend on argument order
    #[test]
    fn lca_symmetric(a in history_strategy(), b in history_strategy()) {
        let ab = find_lowest_common_ancestor(&a, &b).ok();
        let ba = find_lowest_common_ancestor(&b, &a).ok();
        prop_assert_eq!(ab, ba);
    }

    /// Every truncation is a prefix, and the LCA with it is its last item
    #[test]
    fn truncation_is_prefix((h, n) in history_with_point()) {
        let short = h.truncate_to(n).unwrap();
        prop_assert_eq!(short.last_event_id(), n);
        prop_assert!(is_prefix(&short, &h));
        prop_assert_eq!(
            find_lowest_common_ancestor(&short, &h).unwrap(),
            VersionHistoryItem::new(n, h.version_at(n).unwrap())
        );
    }

    /// Forking at n with a newer version: the LCA is n, replaying the tail
    /// after the LCA rebuilds the fork, and the fork wins the comparison
    #[test]
    fn fork_lca_and_tail_replay(
        (h, n) in history_with_point(),
        tail in prop::collection::vec((1i64..10, 1i64..3), 1..4),
    ) {
        let mut fork = h.truncate_to(n).unwrap();
        let mut event_id = n;
        let mut version = h.last_item().unwrap().version;
        for (gap, bump) in &tail {
            event_id += gap;
            version += bump;
            fork.add_or_update_item(VersionHistoryItem::new(event_id, version)).unwrap();
        }

        let lca = find_lowest_common_ancestor(&h, &fork).unwrap();
        prop_assert_eq!(lca, VersionHistoryItem::new(n, h.version_at(n).unwrap()));

        let mut replayed = h.truncate_to(lca.last_event_id).unwrap();
        for item in fork.items().iter().filter(|i| i.last_event_id > lca.last_event_id) {
            replayed.add_or_update_item(*item).unwrap();
        }
        prop_assert_eq!(replayed.items(), fork.items());
        prop_assert_eq!(compare(&fork, &h), HistoryOrdering::ANewer);
        prop_assert_eq!(compare(&h, &fork), HistoryOrdering::BNewer);
    }

    /// The empty history is a prefix of everything
    #[test]
    fn empty_is_prefix(h in history_strategy()) {
        prop_assert!(is_prefix(&VersionHistory::empty(BranchToken::default()), &h));
        prop_assert!(is_prefix(&h, &h));
    }
}

// =============================================================================
// Applier Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// However a history is cut into tasks, applying them in order leaves the
    /// last task's version history current, and replaying any task is a no-op
    #[test]
    fn in_order_application_tracks_trailing_item(
        cuts in prop::collection::vec((1usize..5, prop::bool::weighted(0.3)), 1..8),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let store = Arc::new(InMemoryHistoryStore::new());
            let applier = TaskApplier::new(
                store.clone(),
                Arc::new(NoOpExecutionState),
                Arc::new(InMemoryTaskSource::new()),
            );
            let mut gen = HistoryGenerator::for_run("active", "prop", 1);
            let mut version = 1;
            let mut tasks = Vec::new();
            for (size, failover) in cuts {
                if failover {
                    version += 1;
                    gen.failover(version);
                }
                tasks.push(gen.next_task(size));
            }

            for task in &tasks {
                applier.apply(task).await.unwrap();
            }
            let histories = store
                .load_version_histories(gen.identity())
                .await
                .unwrap()
                .unwrap();
            let last = tasks.last().unwrap();
            assert_eq!(histories.current().items(), last.version_history.as_slice());

            let mutations = store.mutation_count();
            for task in &tasks {
                assert_eq!(applier.apply(task).await.unwrap().classification, "duplicate");
            }
            assert_eq!(store.mutation_count(), mutations);
        });
    }
}

// =============================================================================
// Codec and Routing Properties
// =============================================================================

proptest! {
    /// maybe_decompress never panics on arbitrary input
    #[test]
    fn decompress_never_panics(data in prop::collection::vec(any::<u8>(), 0..1000)) {
        let _ = maybe_decompress(&data);
    }

    /// A run always lands on a valid shard, the same one every time
    #[test]
    fn shard_in_range(
        domain in "[a-z]{1,8}",
        workflow in "[a-z0-9-]{1,16}",
        run in "[a-f0-9]{8}",
        shards in 1usize..64,
    ) {
        let identity = WorkflowIdentity::new(domain, workflow, run);
        let shard = shard_for(&identity, shards);
        prop_assert!(shard < shards);
        prop_assert_eq!(shard, shard_for(&identity.clone(), shards));
    }
}
