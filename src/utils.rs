//! Small arithmetic helpers shared by the pool and region code.

/// Rounds `value` up to the next multiple of `alignment`, or `None` when
/// the rounded value does not fit in a `usize`.
///
/// `alignment` must be a power of two. Used to pad slot strides to the
/// header alignment and region lengths to the page size.
#[inline]
pub(crate) fn checked_align(value: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}
