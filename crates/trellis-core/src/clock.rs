//! Vector clocks for causal ordering.
//!
//! A [`VectorClock`] maps actor identifiers to monotonically increasing
//! counters. An actor with no entry is at counter 0, and zero-valued entries
//! are never stored, so two clocks are structurally equal exactly when they
//! describe the same causal history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Causal relationship between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockOrdering {
    /// Every counter is equal.
    Equal,
    /// Left is ≥ right everywhere and > somewhere.
    Dominates,
    /// Right is ≥ left everywhere and > somewhere.
    DominatedBy,
    /// Each side is ahead of the other on some actor.
    Concurrent,
}

/// A vector clock: actor id → counter.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, u64>", into = "BTreeMap<String, u64>")]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from `(actor, counter)` pairs.
    ///
    /// Zero counters are dropped; duplicate actors keep the highest counter.
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        let mut clock = Self::new();
        for (actor, counter) in entries {
            if counter == 0 {
                continue;
            }
            let slot = clock.entries.entry(actor.into()).or_insert(0);
            *slot = (*slot).max(counter);
        }
        clock
    }

    /// Counter for `actor` (0 when absent).
    pub fn get(&self, actor: &str) -> u64 {
        self.entries.get(actor).copied().unwrap_or(0)
    }

    /// Bump `actor`'s counter by one and return the new value.
    pub fn increment(&mut self, actor: &str) -> u64 {
        let slot = self.entries.entry(actor.to_string()).or_insert(0);
        *slot += 1;
        *slot
    }

    /// Component-wise maximum of `self` and `other`.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        merged.merge_in(other);
        merged
    }

    /// Fold `other` into `self` in place. Returns true if anything changed.
    pub fn merge_in(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (actor, &counter) in &other.entries {
            let slot = self.entries.entry(actor.clone()).or_insert(0);
            if counter > *slot {
                *slot = counter;
                changed = true;
            }
        }
        changed
    }

    /// Compare two clocks component-wise.
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for (actor, &counter) in &self.entries {
            let theirs = other.get(actor);
            if counter > theirs {
                self_ahead = true;
            } else if counter < theirs {
                other_ahead = true;
            }
        }
        for (actor, &counter) in &other.entries {
            if !self.entries.contains_key(actor) && counter > 0 {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Dominates,
            (false, true) => ClockOrdering::DominatedBy,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True if every counter in `self` is ≥ the matching counter in `other`.
    pub fn dominates_or_equals(&self, other: &Self) -> bool {
        other
            .entries
            .iter()
            .all(|(actor, &counter)| self.get(actor) >= counter)
    }

    /// True if `self` is strictly ahead of `other`.
    pub fn dominates(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Dominates
    }

    /// True if neither clock dominates the other and they differ.
    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// True if no actor has ticked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of actors with a non-zero counter.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate `(actor, counter)` in actor order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(actor, &counter)| (actor.as_str(), counter))
    }
}

impl From<BTreeMap<String, u64>> for VectorClock {
    fn from(entries: BTreeMap<String, u64>) -> Self {
        Self::from_entries(entries)
    }
}

impl From<VectorClock> for BTreeMap<String, u64> {
    fn from(clock: VectorClock) -> Self {
        clock.entries
    }
}

impl fmt::Debug for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VectorClock{}", self)
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (actor, counter)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:{}", actor, counter)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vc(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_entries(entries.iter().map(|(a, c)| (*a, *c)))
    }

    #[test]
    fn test_missing_actor_is_zero() {
        let clock = vc(&[("a", 3)]);
        assert_eq!(clock.get("a"), 3);
        assert_eq!(clock.get("b"), 0);
    }

    #[test]
    fn test_zero_entries_are_normalized() {
        assert_eq!(vc(&[("a", 0)]), VectorClock::new());
        assert_eq!(vc(&[("a", 1), ("b", 0)]), vc(&[("a", 1)]));
    }

    #[test]
    fn test_increment() {
        let mut clock = VectorClock::new();
        assert_eq!(clock.increment("a"), 1);
        assert_eq!(clock.increment("a"), 2);
        assert_eq!(clock.increment("b"), 1);
        assert_eq!(clock, vc(&[("a", 2), ("b", 1)]));
    }

    #[test]
    fn test_compare() {
        let a = vc(&[("a", 2), ("b", 1)]);
        let b = vc(&[("a", 1), ("b", 1)]);
        let c = vc(&[("a", 1), ("b", 2)]);

        assert_eq!(a.compare(&a.clone()), ClockOrdering::Equal);
        assert_eq!(a.compare(&b), ClockOrdering::Dominates);
        assert_eq!(b.compare(&a), ClockOrdering::DominatedBy);
        assert_eq!(a.compare(&c), ClockOrdering::Concurrent);
        assert_eq!(VectorClock::new().compare(&b), ClockOrdering::DominatedBy);
    }

    #[test]
    fn test_dominates_or_equals() {
        let a = vc(&[("a", 2), ("b", 1)]);
        let b = vc(&[("a", 1)]);
        assert!(a.dominates_or_equals(&b));
        assert!(a.dominates_or_equals(&a));
        assert!(!b.dominates_or_equals(&a));
        assert!(a.dominates_or_equals(&VectorClock::new()));
    }

    #[test]
    fn test_merge_in_reports_change() {
        let mut a = vc(&[("a", 1)]);
        assert!(a.merge_in(&vc(&[("b", 2)])));
        assert!(!a.merge_in(&vc(&[("a", 1)])));
        assert_eq!(a, vc(&[("a", 1), ("b", 2)]));
    }

    #[test]
    fn test_display() {
        assert_eq!(vc(&[("b", 2), ("a", 1)]).to_string(), "{a:1, b:2}");
        assert_eq!(VectorClock::new().to_string(), "{}");
    }

    #[test]
    fn test_serde_is_plain_map() {
        let json = serde_json::to_string(&vc(&[("a", 1), ("b", 2)])).unwrap();
        assert_eq!(json, r#"{"a":1,"b":2}"#);

        let parsed: VectorClock = serde_json::from_str(r#"{"a":1,"z":0}"#).unwrap();
        assert_eq!(parsed, vc(&[("a", 1)]));
    }

    fn clock_strategy() -> impl Strategy<Value = VectorClock> {
        prop::collection::btree_map("[a-e]", 0u64..10, 0..5).prop_map(VectorClock::from)
    }

    proptest! {
        #[test]
        fn test_merge_dominates_both(a in clock_strategy(), b in clock_strategy()) {
            let merged = a.merge(&b);
            prop_assert!(merged.dominates_or_equals(&a));
            prop_assert!(merged.dominates_or_equals(&b));
        }

        #[test]
        fn test_merge_commutative(a in clock_strategy(), b in clock_strategy()) {
            prop_assert_eq!(a.merge(&b), b.merge(&a));
        }

        #[test]
        fn test_merge_idempotent(a in clock_strategy()) {
            prop_assert_eq!(a.merge(&a), a);
        }

        #[test]
        fn test_compare_antisymmetric(a in clock_strategy(), b in clock_strategy()) {
            let expected = match a.compare(&b) {
                ClockOrdering::Equal => ClockOrdering::Equal,
                ClockOrdering::Dominates => ClockOrdering::DominatedBy,
                ClockOrdering::DominatedBy => ClockOrdering::Dominates,
                ClockOrdering::Concurrent => ClockOrdering::Concurrent,
            };
            prop_assert_eq!(b.compare(&a), expected);
        }

        #[test]
        fn test_cbor_roundtrip(a in clock_strategy()) {
            let mut buf = Vec::new();
            ciborium::into_writer(&a, &mut buf).unwrap();
            let back: VectorClock = ciborium::from_reader(buf.as_slice()).unwrap();
            prop_assert_eq!(back, a);
        }
    }
}
