//! Fuzz target for version history primitives.
//!
//! Builds two histories from arbitrary items (invalid ones are rejected by
//! `VersionHistory::new`) and checks that comparison, LCA and prefix checks
//! never panic and stay consistent with each other.

#![no_main]

use arbitrary::Arbitrary;
use history_replicator::history::{
    compare, find_lowest_common_ancestor, is_prefix, BranchToken, HistoryOrdering, VersionHistory,
    VersionHistoryItem,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    a: Vec<(i64, i64)>,
    b: Vec<(i64, i64)>,
    truncate_at: i64,
}

fn history(items: &[(i64, i64)]) -> Option<VersionHistory> {
    let items = items
        .iter()
        .map(|&(last_event_id, version)| VersionHistoryItem::new(last_event_id, version))
        .collect();
    VersionHistory::new(BranchToken::default(), items).ok()
}

fuzz_target!(|input: Input| {
    let (Some(a), Some(b)) = (history(&input.a), history(&input.b)) else {
        return;
    };

    let ab = compare(&a, &b);
    let ba = compare(&b, &a);
    match ab {
        HistoryOrdering::Equal => assert_eq!(ba, HistoryOrdering::Equal),
        HistoryOrdering::ANewer => assert_eq!(ba, HistoryOrdering::BNewer),
        HistoryOrdering::BNewer => assert_eq!(ba, HistoryOrdering::ANewer),
    }

    let lca = find_lowest_common_ancestor(&a, &b).ok();
    assert_eq!(lca, find_lowest_common_ancestor(&b, &a).ok());
    if let Some(lca) = lca {
        assert!(lca.last_event_id <= a.last_event_id());
        assert!(lca.last_event_id <= b.last_event_id());
    }

    let _ = is_prefix(&a, &b);
    let _ = a.version_at(input.truncate_at);
    if let Ok(short) = a.truncate_to(input.truncate_at) {
        assert!(is_prefix(&short, &a));
    }
});
