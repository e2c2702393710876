//! Bounded landmark ranking for presentation.
//!
//! A map can hold far more landmarks than a renderer should draw each
//! update. [`prioritize`] returns at most `max` of them, best first:
//!
//! 1. usable before unusable,
//! 2. more supporting observations first,
//! 3. smaller [`LandmarkId`](lar_types::LandmarkId) first.
//!
//! Identities are unique, so the order is total and the result does not
//! depend on input order.
//!
//! Up to [`FULL_SORT_LIMIT`] landmarks are fully sorted. Larger inputs use
//! an O(n) selection of the top `max` followed by sorting only those, so a
//! render pass never costs O(n log n) in the size of the map.

use std::cmp::Ordering;

use lar_types::Landmark;

/// Inputs up to this size are fully sorted.
pub const FULL_SORT_LIMIT: usize = 4096;

/// Presentation order: `Less` means `a` ranks ahead of `b`.
pub fn rank(a: &Landmark, b: &Landmark) -> Ordering {
    b.is_usable
        .cmp(&a.is_usable)
        .then_with(|| b.observations.cmp(&a.observations))
        .then_with(|| a.id.cmp(&b.id))
}

/// The `min(max, n)` highest-ranked landmarks, best first.
pub fn prioritize<'a, I>(landmarks: I, max: usize) -> Vec<&'a Landmark>
where
    I: IntoIterator<Item = &'a Landmark>,
{
    if max == 0 {
        return Vec::new();
    }
    let mut ranked: Vec<&Landmark> = landmarks.into_iter().collect();

    if ranked.len() > FULL_SORT_LIMIT && max < ranked.len() {
        ranked.select_nth_unstable_by(max - 1, |a, b| rank(a, b));
        ranked.truncate(max);
    }
    ranked.sort_unstable_by(|a, b| rank(a, b));
    ranked.truncate(max);
    ranked
}
