//! Size-to-class lookup.
//!
//! Classes are kept in an ascending array. A lookup for `key` bytes wants
//! the smallest class whose size is at least `key`; that is answered by
//! [`ceiling_search`], optionally preceded by an exact-size hash table when
//! there are enough classes to make hashing pay off.

use std::collections::HashMap;

/// Immutable view of the registered class sizes, built once at
/// construction.
#[derive(Debug)]
pub struct SizeClassIndex {
    /// Class sizes, strictly ascending. Position `i` is node id `i`.
    sizes: Vec<usize>,
    /// Exact size -> position, only present above the threshold.
    exact: Option<HashMap<usize, usize>>,
}

impl SizeClassIndex {
    /// Builds the index over `sizes`, which must already be strictly
    /// ascending. The exact-match table is built when there are more than
    /// `exact_threshold` classes.
    pub fn new(sizes: Vec<usize>, exact_threshold: usize) -> Self {
        debug_assert!(sizes.windows(2).all(|pair| pair[0] < pair[1]));

        let exact = (sizes.len() > exact_threshold).then(|| {
            sizes
                .iter()
                .enumerate()
                .map(|(position, &size)| (size, position))
                .collect()
        });

        Self { sizes, exact }
    }

    /// Position of the smallest class that can hold `key` bytes, or `None`
    /// if `key` is larger than every class.
    pub fn find(&self, key: usize) -> Option<usize> {
        if let Some(&position) = self.exact.as_ref().and_then(|exact| exact.get(&key)) {
            return Some(position);
        }

        let candidate = ceiling_search(&self.sizes, key)?;
        // The search hands back the last position when nothing fits.
        (self.sizes[candidate] >= key).then_some(candidate)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    #[inline]
    pub fn has_exact_table(&self) -> bool {
        self.exact.is_some()
    }

    #[inline]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}

/// Hybrid interpolation/bisection ceiling search.
///
/// Returns the smallest index `i` with `sizes[i] >= key`, or the last index
/// when `key` exceeds every element (callers must check). `None` only for
/// an empty slice. `sizes` must be strictly ascending.
///
/// Each round probes two midpoints of the `[low, high]` window: an
/// interpolation estimate, which lands close to the answer when sizes are
/// roughly evenly spaced, and the plain bisection midpoint, which keeps the
/// worst case logarithmic on skewed tables. `index` tracks the best
/// candidate seen so far.
pub fn ceiling_search(sizes: &[usize], key: usize) -> Option<usize> {
    let last = sizes.len().checked_sub(1)?;

    let mut low = 0;
    let mut high = last;
    let mut index = last;

    while low <= high {
        if key <= sizes[low] {
            return Some(low);
        }
        if key > sizes[high] {
            return Some(index);
        }

        // Here sizes[low] < key <= sizes[high], so low < high and the
        // interpolation denominator is non-zero.
        let span = (sizes[high] - sizes[low]) as u128;
        let offset = ((high - low) as u128 * (key - sizes[low]) as u128 / span) as usize;
        let mut mid_1 = low + offset;
        let mut mid_2 = low + (high - low) / 2;
        if mid_1 > mid_2 {
            std::mem::swap(&mut mid_1, &mut mid_2);
        }

        if key == sizes[mid_1] {
            return Some(mid_1);
        }
        if key == sizes[mid_2] {
            return Some(mid_2);
        }

        if key < sizes[mid_1] {
            index = mid_1;
            high = mid_1 - 1;
        } else if key > sizes[mid_2] {
            low = mid_2 + 1;
        } else {
            // sizes[mid_1] < key < sizes[mid_2]
            index = mid_2;
            low = mid_1 + 1;
            high = mid_2 - 1;
        }
    }

    Some(index)
}
