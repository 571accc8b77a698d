//! Bounded exponential backoff.

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
/// capped at `max`.  Never overflows.
///
/// # Properties
///
/// - `backoff_delay(a, b, m) <= m`
/// - non-decreasing in `attempt`
/// - `backoff_delay(0, b, m) == min(b, m)`
pub fn backoff_delay(attempt: u32, base: u64, max: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let result = base.saturating_mul(factor).min(max);

    debug_assert!(result <= max, "backoff must respect the cap");
    debug_assert!(
        attempt == 0 || result >= base.min(max),
        "backoff must not shrink below the base"
    );
    result
}
