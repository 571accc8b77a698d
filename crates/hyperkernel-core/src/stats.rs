//! Per-node protocol counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        /// Monotonic counters, updated without locks.
        #[derive(Debug, Default)]
        pub struct NodeStats {
            $(pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`NodeStats`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $(pub $name: u64,)*
        }

        impl NodeStats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    faults,
    local_hits,
    fetches,
    write_grants,
    invalidations_sent,
    invalidations_received,
    recalls_sent,
    stale_refaults,
    nacks_sent,
    migrations_out,
    migrations_in,
    migrations_refused,
);

/// Increment a counter by one.
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
