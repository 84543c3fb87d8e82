//! Index keys, bounds and half-open key ranges.
//!
//! A [`Bound`] is a *cut* in the key space: a position that falls between
//! keys, never on one. This makes every range `[lower, upper)` unambiguous
//! and lets bounds be totally ordered among themselves:
//!
//! - `Minimal` is before every key and `Maximal` after every key.
//! - `Exact(k)` and `Predecessor(p)` are the cut immediately before `k`
//!   (or before the first key starting with `p`).
//! - `Successor(p)` is the cut immediately after the last key starting
//!   with `p`. With a short prefix this skips a whole group of keys.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use synclane_value::Value;

/// An ordered tuple of values identifying a position in an index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexKey(pub Vec<Value>);

impl IndexKey {
    /// Creates a key from its components.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Returns the key components.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the key has no components.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if `prefix` is a prefix of this key.
    pub fn starts_with(&self, prefix: &IndexKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl From<Vec<Value>> for IndexKey {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Lexicographic comparison of two keys.
///
/// Components use the cross-type total order of [`Value`], so keys built
/// from heterogeneous field values never fail to compare.
pub fn compare(a: &IndexKey, b: &IndexKey) -> Ordering {
    a.cmp(b)
}

/// Scan direction over an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ascending key order.
    #[default]
    Asc,
    /// Descending key order.
    Desc,
}

/// A cut position in an index's key space.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum Bound {
    /// Before every key.
    Minimal,
    /// After every key.
    Maximal,
    /// Just after every key that starts with the prefix.
    Successor(IndexKey),
    /// Just before every key that starts with the prefix.
    Predecessor(IndexKey),
    /// Just before the key itself.
    Exact(IndexKey),
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Side {
    Before,
    After,
}

impl Bound {
    fn cut(&self) -> Option<(&IndexKey, Side)> {
        match self {
            Bound::Minimal | Bound::Maximal => None,
            Bound::Successor(p) => Some((p, Side::After)),
            Bound::Predecessor(p) | Bound::Exact(p) => Some((p, Side::Before)),
        }
    }

    /// Position of this cut relative to a key. Never `Equal`: `Less` means
    /// the cut lies before the key.
    pub fn cmp_key(&self, key: &IndexKey) -> Ordering {
        match self {
            Bound::Minimal => Ordering::Less,
            Bound::Maximal => Ordering::Greater,
            _ => {
                let Some((prefix, side)) = self.cut() else {
                    return Ordering::Less;
                };
                for (p, k) in prefix.0.iter().zip(key.0.iter()) {
                    match p.cmp(k) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                if key.len() < prefix.len() {
                    // The key sorts before every extension of the prefix.
                    return Ordering::Greater;
                }
                match side {
                    Side::Before => Ordering::Less,
                    Side::After => Ordering::Greater,
                }
            }
        }
    }

    /// Returns true if `key` lies at or after this cut (the bound contains
    /// the key when used as a lower bound).
    pub fn admits(&self, key: &IndexKey) -> bool {
        self.cmp_key(key) == Ordering::Less
    }

    /// Returns true for the `Minimal` sentinel.
    pub fn is_minimal(&self) -> bool {
        matches!(self, Bound::Minimal)
    }

    /// Returns true for the `Maximal` sentinel.
    pub fn is_maximal(&self) -> bool {
        matches!(self, Bound::Maximal)
    }
}

impl Ord for Bound {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Bound::Minimal, Bound::Minimal) | (Bound::Maximal, Bound::Maximal) => {
                Ordering::Equal
            }
            (Bound::Minimal, _) | (_, Bound::Maximal) => Ordering::Less,
            (_, Bound::Minimal) | (Bound::Maximal, _) => Ordering::Greater,
            _ => {
                let (Some((a, a_side)), Some((b, b_side))) = (self.cut(), other.cut()) else {
                    return Ordering::Equal;
                };
                for (x, y) in a.0.iter().zip(b.0.iter()) {
                    match x.cmp(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                match a.len().cmp(&b.len()) {
                    Ordering::Equal => a_side.cmp(&b_side),
                    // `a` is a proper prefix of `b`.
                    Ordering::Less => match a_side {
                        Side::Before => Ordering::Less,
                        Side::After => Ordering::Greater,
                    },
                    Ordering::Greater => match b_side {
                        Side::Before => Ordering::Greater,
                        Side::After => Ordering::Less,
                    },
                }
            }
        }
    }
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Bound {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Bound {}

/// A half-open range `[lower, upper)` of cut positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower cut.
    pub lower: Bound,
    /// Exclusive upper cut.
    pub upper: Bound,
}

impl KeyRange {
    /// Creates a range between two cuts.
    pub fn new(lower: Bound, upper: Bound) -> Self {
        Self { lower, upper }
    }

    /// The range covering the whole index.
    pub fn all() -> Self {
        Self::new(Bound::Minimal, Bound::Maximal)
    }

    /// The range of every key starting with `prefix`.
    pub fn prefix(prefix: IndexKey) -> Self {
        Self::new(Bound::Predecessor(prefix.clone()), Bound::Successor(prefix))
    }

    /// Returns true if no key can fall inside the range.
    pub fn is_empty(&self) -> bool {
        self.lower >= self.upper
    }

    /// Returns true if the key falls inside the range.
    pub fn contains(&self, key: &IndexKey) -> bool {
        self.lower.admits(key) && self.upper.cmp_key(key) == Ordering::Greater
    }

    /// Returns true if the two ranges share any position.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Returns true if `other` lies entirely within this range.
    pub fn covers(&self, other: &KeyRange) -> bool {
        other.is_empty() || (self.lower <= other.lower && other.upper <= self.upper)
    }

    /// The overlap of two ranges (possibly empty).
    pub fn intersection(&self, other: &KeyRange) -> KeyRange {
        KeyRange::new(
            self.lower.clone().max(other.lower.clone()),
            self.upper.clone().min(other.upper.clone()),
        )
    }

    /// Parts of this range not covered by `other`: the piece below it and
    /// the piece above it. Empty pieces are omitted.
    pub fn difference(&self, other: &KeyRange) -> Vec<KeyRange> {
        if !self.intersects(other) {
            return vec![self.clone()];
        }
        let mut out = Vec::with_capacity(2);
        if self.lower < other.lower {
            out.push(KeyRange::new(self.lower.clone(), other.lower.clone()));
        }
        if other.upper < self.upper {
            out.push(KeyRange::new(other.upper.clone(), self.upper.clone()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[&str]) -> IndexKey {
        IndexKey(parts.iter().map(|s| Value::from(*s)).collect())
    }

    #[test]
    fn sentinels_bracket_everything() {
        let k = key(&["a", "1"]);
        assert!(Bound::Minimal.admits(&k));
        assert!(!Bound::Maximal.admits(&k));
        assert!(Bound::Minimal < Bound::Exact(k.clone()));
        assert!(Bound::Successor(k) < Bound::Maximal);
    }

    #[test]
    fn exact_is_inclusive_lower_exclusive_upper() {
        let k = key(&["b", "1"]);
        let range = KeyRange::new(Bound::Exact(k.clone()), Bound::Maximal);
        assert!(range.contains(&k));

        let range = KeyRange::new(Bound::Minimal, Bound::Exact(k.clone()));
        assert!(!range.contains(&k));
        assert!(range.contains(&key(&["a", "9"])));
    }

    #[test]
    fn successor_prefix_skips_group() {
        let conversation = key(&["c1"]);
        let after = Bound::Successor(conversation.clone());
        assert!(!after.admits(&key(&["c1", "m1"])));
        assert!(!after.admits(&key(&["c1", "zzz"])));
        assert!(after.admits(&key(&["c2", "m0"])));
    }

    #[test]
    fn prefix_range() {
        let range = KeyRange::prefix(key(&["c1"]));
        assert!(range.contains(&key(&["c1", "a"])));
        assert!(!range.contains(&key(&["c0", "z"])));
        assert!(!range.contains(&key(&["c2", "a"])));
    }

    #[test]
    fn predecessor_and_exact_share_position() {
        let p = key(&["m"]);
        assert_eq!(Bound::Predecessor(p.clone()), Bound::Exact(p.clone()));
        assert!(Bound::Exact(p.clone()) < Bound::Successor(p));
    }

    #[test]
    fn shorter_prefix_ordering() {
        let short = key(&["m"]);
        let long = key(&["m", "x"]);
        assert!(Bound::Exact(short.clone()) < Bound::Exact(long.clone()));
        assert!(Bound::Successor(short.clone()) > Bound::Successor(long.clone()));
        assert!(Bound::Successor(short) > Bound::Exact(long));
    }

    #[test]
    fn adjacent_ranges_cover_whole() {
        let mid = Bound::Exact(key(&["mid"]));
        let left = KeyRange::new(Bound::Minimal, mid.clone());
        let right = KeyRange::new(mid, Bound::Maximal);
        assert!(!left.intersects(&right));
        assert_eq!(left.upper, right.lower);
        assert!(KeyRange::all().covers(&left));
        assert!(!left.covers(&KeyRange::all()));
    }

    #[test]
    fn difference_splits() {
        let all = KeyRange::all();
        let middle = KeyRange::new(Bound::Exact(key(&["b"])), Bound::Exact(key(&["d"])));
        let parts = all.difference(&middle);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].upper, middle.lower);
        assert_eq!(parts[1].lower, middle.upper);
        assert!(middle.difference(&all).is_empty());
    }

    #[test]
    fn empty_ranges() {
        let b = Bound::Exact(key(&["x"]));
        assert!(KeyRange::new(b.clone(), b.clone()).is_empty());
        assert!(KeyRange::new(Bound::Maximal, Bound::Minimal).is_empty());
        assert!(!KeyRange::all().is_empty());
        assert!(KeyRange::all().covers(&KeyRange::new(b.clone(), b)));
    }

    #[test]
    fn bound_serializes_with_kind() {
        let json = serde_json::to_value(Bound::Successor(key(&["a"]))).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "successor", "key": ["a"]}));
        let back: Bound = serde_json::from_value(json).unwrap();
        assert_eq!(back, Bound::Successor(key(&["a"])));
    }
}
