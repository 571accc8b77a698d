//! Static page-to-home partition functions.
//!
//! Every node evaluates the same function over the same sorted member
//! list, so "who is authoritative for page `p`" needs no directory
//! service and no per-page metadata on non-home nodes.

/// Finaliser from SplitMix64.  Spreads consecutive page numbers across
/// the whole `u64` range.
pub const fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Index of the home node for `page` under the hashed strategy.
///
/// # Panics
///
/// Debug builds panic if `num_nodes == 0`.
pub fn hashed_home(page: u64, num_nodes: usize) -> usize {
    debug_assert!(num_nodes > 0, "home function needs at least one node");
    let result = (mix64(page) % num_nodes as u64) as usize;
    debug_assert!(result < num_nodes);
    result
}

/// Index of the home node for `page` under the interleaved strategy:
/// consecutive pages rotate across nodes.
pub fn interleaved_home(page: u64, num_nodes: usize) -> usize {
    debug_assert!(num_nodes > 0, "home function needs at least one node");
    let result = (page % num_nodes as u64) as usize;
    debug_assert!(result < num_nodes);
    result
}
