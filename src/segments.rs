use std::collections::HashSet;

use itertools::Either;
use itertools::Itertools;

/// A half-open `[begin, end)` address segment that belongs to some
/// generation of a mapped binary.
pub trait SegmentItem {
    fn begin(&self) -> u64;
    fn end(&self) -> u64;
    fn generation(&self) -> i64;
}

/// Removes every item that overlaps a newer (higher generation) one.
///
/// Preconditions:
/// - `items` is sorted by `begin()`.
/// - overlapping items carry distinct generations.
///
/// Returns `(retained, pruned)`, both preserving input order. The retained
/// items are pairwise disjoint.
pub fn prune<T: SegmentItem>(items: Vec<T>) -> (Vec<T>, Vec<T>) {
    // Let C(s) denote the retained set for input s.
    // (1) C(s) is deterministic.
    // (2) if s1 is a subset of s2 and I is in s1 but not C(s1), then I is
    //     not in C(s2) either. The invalidated set only grows.

    // Index of the rightmost item retained so far.
    let mut last: Option<usize> = None;
    let mut invalidated: HashSet<usize> = HashSet::new();

    for i in 0..items.len() {
        // (3) follows from the iteration order: if I and J are retained and
        // I ends before J begins, a later item can only invalidate J.
        let l = match last {
            Some(l) if items[l].end() > items[i].begin() => l,
            _ => {
                last = Some(i);
                continue;
            }
        };

        if items[l].generation() > items[i].generation() {
            invalidated.insert(i);
        } else {
            // Only `last` can lose here, everything retained before it ends
            // at or before items[i].begin() by (3).
            invalidated.insert(l);
            last = Some(i);
        }
    }

    let (retained, pruned) = items.into_iter().enumerate().partition_map(|(i, item)| {
        if invalidated.contains(&i) {
            Either::Right(item)
        } else {
            Either::Left(item)
        }
    });
    (retained, pruned)
}
