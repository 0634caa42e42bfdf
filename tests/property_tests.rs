//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use mongo_bisync::config::{CollectionScope, WorkerConfig};
use mongo_bisync::coordinator::Direction;
use mongo_bisync::feed::{fingerprint, id_key, OperationType};
use mongo_bisync::origin::{Fingerprint, OriginTracker};
use mongo_bisync::reconcile::ReconcileDirection;
use mongo_bisync::resilience::RetryConfig;
use mongo_bisync::store::Side;
use mongodb::bson::{doc, Bson, Document};
use proptest::prelude::*;
use std::time::Duration;

fn collection_name() -> impl Strategy<Value = String> {
    "[a-z][a-zA-Z0-9_]{0,15}"
}

fn scalar_id() -> impl Strategy<Value = Bson> {
    prop_oneof![
        any::<i32>().prop_map(Bson::Int32),
        any::<i64>().prop_map(Bson::Int64),
        "[a-zA-Z0-9-]{1,24}".prop_map(Bson::String),
        any::<[u8; 12]>().prop_map(|b| Bson::ObjectId(mongodb::bson::oid::ObjectId::from_bytes(b))),
    ]
}

fn flat_document() -> impl Strategy<Value = Document> {
    prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8).prop_map(|fields| {
        let mut d = Document::new();
        for (k, v) in fields {
            d.insert(k, v);
        }
        d
    })
}

// =============================================================================
// Collection Scope Properties
// =============================================================================

proptest! {
    /// Parsing never yields blanks or duplicates
    #[test]
    fn scope_parse_is_clean(raw in "[a-z ,]{0,64}") {
        let parsed = CollectionScope::parse_list(&raw);
        for (i, name) in parsed.iter().enumerate() {
            prop_assert!(!name.is_empty());
            prop_assert_eq!(name.trim(), name.as_str());
            prop_assert!(!parsed[..i].contains(name));
        }
    }

    /// Joining then parsing preserves order of first occurrence
    #[test]
    fn scope_parse_roundtrips_join(names in prop::collection::vec(collection_name(), 0..10)) {
        let mut unique: Vec<String> = Vec::new();
        for n in &names {
            if !unique.contains(n) {
                unique.push(n.clone());
            }
        }
        prop_assert_eq!(CollectionScope::parse_list(&names.join(" , ")), unique);
    }

    /// Excluded collections are never effective or contained
    #[test]
    fn scope_exclusion_wins(
        names in prop::collection::vec(collection_name(), 1..10),
        excluded_idx in prop::collection::vec(any::<prop::sample::Index>(), 0..5),
    ) {
        let excluded: Vec<String> = excluded_idx.iter().map(|i| i.get(&names).clone()).collect();
        let scope = CollectionScope::new(names.clone()).excluding(excluded.clone());

        for name in &excluded {
            prop_assert!(!scope.contains(name));
            prop_assert!(!scope.effective().contains(name));
        }
        for name in scope.effective() {
            prop_assert!(scope.contains(&name));
        }
    }
}

// =============================================================================
// Identity and Fingerprint Properties
// =============================================================================

proptest! {
    /// id_key is deterministic
    #[test]
    fn id_key_stable(id in scalar_id()) {
        prop_assert_eq!(id_key(&id), id_key(&id.clone()));
    }

    /// Different ids never share a key
    #[test]
    fn id_key_injective(a in scalar_id(), b in scalar_id()) {
        if a != b {
            prop_assert_ne!(id_key(&a), id_key(&b));
        }
    }

    /// Numeric types stay distinct, as the server treats them
    #[test]
    fn id_key_distinguishes_numeric_types(n in any::<i32>()) {
        prop_assert_ne!(id_key(&Bson::Int32(n)), id_key(&Bson::Int64(n as i64)));
    }

    /// Fingerprint depends only on content
    #[test]
    fn fingerprint_stable(d in flat_document()) {
        let copy = d.clone();
        prop_assert_eq!(fingerprint(&d), fingerprint(&copy));
        prop_assert_eq!(fingerprint(&d).len(), 64);
    }

    /// Changing a field changes the fingerprint
    #[test]
    fn fingerprint_sensitive(d in flat_document(), v in any::<i64>()) {
        let mut changed = d.clone();
        let previous = changed.insert("zz_marker", v);
        prop_assume!(previous.is_none());
        prop_assert_ne!(fingerprint(&d), fingerprint(&changed));
    }
}

// =============================================================================
// Backoff Properties
// =============================================================================

proptest! {
    /// Delays never exceed the cap
    #[test]
    fn backoff_bounded(
        initial_ms in 1u64..10_000,
        max_ms in 1u64..600_000,
        factor in 1.0f64..10.0,
        attempt in 0usize..10_000,
    ) {
        let policy = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_factor: factor,
            connection_timeout: Duration::from_secs(1),
        };
        let delay = policy.delay_for_attempt(attempt);
        if attempt > 0 {
            prop_assert!(delay <= policy.max_delay);
        }
    }

    /// Delays never shrink as attempts grow
    #[test]
    fn backoff_monotonic(attempt in 1usize..200, factor in 1.0f64..4.0) {
        let policy = RetryConfig {
            backoff_factor: factor,
            ..WorkerConfig::default().restart_policy()
        };
        prop_assert!(policy.delay_for_attempt(attempt) <= policy.delay_for_attempt(attempt + 1));
    }

    /// The attempt budget is exactly max_attempts
    #[test]
    fn backoff_budget(max in 0usize..50) {
        let policy = RetryConfig { max_attempts: max, ..RetryConfig::testing() };
        prop_assert!(policy.allows(max) || max == 0);
        prop_assert!(!policy.allows(max + 1));
    }
}

// =============================================================================
// Origin Tracker Properties
// =============================================================================

proptest! {
    /// Each recorded write suppresses exactly one echo
    #[test]
    fn origin_echo_consumed_once(
        collection in collection_name(),
        id in scalar_id(),
        d in flat_document(),
    ) {
        let tracker = OriginTracker::new(Duration::from_secs(60));
        let key = id_key(&id);
        let fp = Fingerprint::of(&d);

        tracker.record(Side::Remote, &collection, &key, fp.clone());
        prop_assert!(tracker.take_echo(Side::Remote, &collection, &key, &fp));
        prop_assert!(!tracker.take_echo(Side::Remote, &collection, &key, &fp));
        prop_assert!(tracker.is_empty());
    }

    /// Records on one side never match events from the other
    #[test]
    fn origin_sides_isolated(id in scalar_id(), d in flat_document()) {
        let tracker = OriginTracker::new(Duration::from_secs(60));
        let key = id_key(&id);
        let fp = Fingerprint::of(&d);

        tracker.record(Side::Local, "bills", &key, fp.clone());
        prop_assert!(!tracker.take_echo(Side::Remote, "bills", &key, &fp));
        prop_assert!(!tracker.take_echo(Side::Local, "orders", &key, &fp));
        prop_assert_eq!(tracker.len(), 1);
    }

    /// A user edit that differs from the sync write is never treated as an echo
    #[test]
    fn origin_foreign_content_passes(d in flat_document(), v in any::<i64>()) {
        let mut edited = d.clone();
        prop_assume!(edited.insert("zz_edit", v).is_none());

        let tracker = OriginTracker::new(Duration::from_secs(60));
        tracker.record(Side::Local, "bills", "k", Fingerprint::of(&d));
        prop_assert!(!tracker.take_echo(Side::Local, "bills", "k", &Fingerprint::of(&edited)));
        prop_assert!(!tracker.take_echo(Side::Local, "bills", "k", &Fingerprint::Deleted));
    }

    /// Matching an entry drops it and everything older for the key
    #[test]
    fn origin_match_drains_older(n in 1usize..12, pick in any::<prop::sample::Index>()) {
        let tracker = OriginTracker::new(Duration::from_secs(60));
        let fps: Vec<Fingerprint> =
            (0..n).map(|i| Fingerprint::of(&doc! { "v": i as i64 })).collect();
        for fp in &fps {
            tracker.record(Side::Remote, "orders", "k", fp.clone());
        }

        let i = pick.index(n);
        prop_assert!(tracker.take_echo(Side::Remote, "orders", "k", &fps[i]));
        prop_assert_eq!(tracker.len(), n - i - 1);
    }
}

// =============================================================================
// Label Round-Trips
// =============================================================================

proptest! {
    /// Reconcile direction parsing ignores case and separator style
    #[test]
    fn reconcile_direction_parse_normalizes(upper in any::<bool>(), underscore in any::<bool>()) {
        let mut raw = "remote-to-local".to_string();
        if upper {
            raw = raw.to_uppercase();
        }
        if underscore {
            raw = raw.replace('-', "_");
        }
        prop_assert_eq!(raw.parse::<ReconcileDirection>(), Ok(ReconcileDirection::RemoteToLocal));
    }

    /// Unknown direction strings are rejected
    #[test]
    fn reconcile_direction_rejects_garbage(raw in "[0-9]{1,8}") {
        prop_assert!(raw.parse::<ReconcileDirection>().is_err());
    }
}

#[test]
fn direction_labels_roundtrip() {
    for direction in Direction::BOTH {
        assert_eq!(Direction::from_label(direction.label()), Some(direction));
        assert_eq!(direction.reverse().reverse(), direction);
        assert_eq!(direction.source(), direction.target().opposite());
    }
    assert_eq!(Direction::from_label("sideways"), None);
}

#[test]
fn operation_type_labels_roundtrip() {
    for op in OperationType::ALL {
        assert_eq!(OperationType::parse(op.as_str()), Some(op));
    }
    assert_eq!(OperationType::parse("drop"), None);
}
