//! Small helpers shared by more than one container.

/// Smallest power of two `>= n`, clamped below by `floor`.
///
/// `floor` must itself be a power of two.
pub(crate) fn next_pow2_at_least(n: usize, floor: usize) -> usize {
    debug_assert!(floor.is_power_of_two());
    if n <= floor {
        floor
    } else {
        n.next_power_of_two()
    }
}

/// `capacityForSize` from the design: smallest power of two capacity that keeps
/// `size` live entries under `max_load_percent` load, never below `min_capacity`.
pub(crate) fn capacity_for_size(size: usize, max_load_percent: usize, min_capacity: usize) -> usize {
    debug_assert!(max_load_percent > 0 && max_load_percent < 100);
    let needed = size
        .saturating_mul(100)
        .saturating_div(max_load_percent)
        .saturating_add(1);
    next_pow2_at_least(needed, min_capacity)
}

pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(a, b)| a == b).count()
}
