//! Property-based tests for the dedup service.
//!
//! The outcome must not depend on arrival order: for any sequence of records
//! identified by place ID, the set of admitted records equals the set of
//! distinct place IDs, and records lacking a place ID fall back to their
//! secondary identifiers.

use super::{DedupService, Identity};
use proptest::prelude::*;
use std::collections::HashSet;

/// Place IDs drawn from a small pool so collisions actually happen.
fn arb_place_id() -> impl Strategy<Value = String> {
    (0u32..40).prop_map(|n| format!("0x{n:x}"))
}

fn arb_record() -> impl Strategy<Value = (String, String)> {
    (arb_place_id(), "[a-z]{3,12}").prop_map(|(place_id, name)| (place_id, name))
}

proptest! {
    #[test]
    fn admitted_set_equals_distinct_place_ids(records in proptest::collection::vec(arb_record(), 0..120)) {
        let mut dedup = DedupService::new();
        let mut admitted = Vec::new();

        for (place_id, name) in &records {
            let unique = dedup.admit(Identity {
                place_id: Some(place_id),
                name: Some(name),
                address: Some("1 Main St"),
                ..Identity::default()
            });
            if unique {
                admitted.push(place_id.clone());
            }
        }

        let distinct: HashSet<&String> = records.iter().map(|(id, _)| id).collect();
        let admitted_set: HashSet<&String> = admitted.iter().collect();

        prop_assert_eq!(admitted.len(), distinct.len());
        prop_assert_eq!(admitted_set, distinct);
    }

    #[test]
    fn outcome_is_order_independent(mut records in proptest::collection::vec(arb_place_id(), 1..80)) {
        let admit_all = |ids: &[String]| {
            let mut dedup = DedupService::new();
            ids.iter()
                .filter(|id| dedup.admit(Identity { place_id: Some(id), ..Identity::default() }))
                .cloned()
                .collect::<HashSet<String>>()
        };

        let forward = admit_all(&records);
        records.reverse();
        let backward = admit_all(&records);

        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn counters_are_consistent(records in proptest::collection::vec(arb_place_id(), 0..100)) {
        let mut dedup = DedupService::new();
        for place_id in &records {
            dedup.admit(Identity { place_id: Some(place_id), ..Identity::default() });
        }
        let stats = dedup.stats();
        prop_assert_eq!(stats.total_checked, records.len() as u64);
        prop_assert_eq!(stats.unique_kept + stats.duplicates_removed, records.len() as u64);
        prop_assert_eq!(stats.by_place_id, stats.duplicates_removed);
    }

    #[test]
    fn records_without_place_id_dedup_by_cid(cids in proptest::collection::vec((0u64..30).prop_map(|n| n.to_string()), 0..80)) {
        let mut dedup = DedupService::new();
        let mut kept = 0usize;
        for cid in &cids {
            if dedup.admit(Identity { cid: Some(cid), ..Identity::default() }) {
                kept += 1;
            }
        }
        let distinct: HashSet<&String> = cids.iter().collect();
        prop_assert_eq!(kept, distinct.len());
    }
}
