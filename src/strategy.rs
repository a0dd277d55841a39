//! This module contains the upstream selection strategy.
//!
//! Selection is kept apart from the `director` and `cache` modules, which own
//! the per-request flow and the persisted state. The strategy itself is a pure
//! function of the pool and an optional region signal, which makes it easy to
//! test in isolation.

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::{metrics::UPSTREAM_SELECTED, upstream::Target, upstream::UpstreamPool};

/// Chooses a target from the pool.
///
/// - `None` (no resolver configured, or the resolver was unavailable): picks
///   uniformly at random.
/// - `Some(ordinal)`: region ordinals are one-based, so the pool index is
///   `ordinal - 1`. Any ordinal that does not land inside the pool, `0` and
///   negatives included, falls back to the first target.
pub fn select(pool: &UpstreamPool, region: Option<i64>) -> Target {
    match region {
        None => select_random(pool),
        Some(ordinal) => select_by_region(pool, ordinal),
    }
}

fn select_random(pool: &UpstreamPool) -> Target {
    // Pool is never empty after construction.
    let target = pool.targets().choose(&mut rand::thread_rng()).unwrap_or(pool.first()).clone();
    log_selection(&target, "random");
    target
}

fn select_by_region(pool: &UpstreamPool, ordinal: i64) -> Target {
    match region_index(ordinal, pool.len()) {
        Some(index) => {
            let target = pool.get(index).unwrap_or(pool.first()).clone();
            log_selection(&target, "region");
            target
        }
        None => {
            warn!(
                ordinal = ordinal,
                pool_size = pool.len(),
                "Region ordinal outside of pool, using first upstream"
            );
            let target = pool.first().clone();
            log_selection(&target, "fallback");
            target
        }
    }
}

/// Maps a one-based region ordinal onto a pool index, if it is in bounds.
pub fn region_index(ordinal: i64, pool_size: usize) -> Option<usize> {
    let index = ordinal.checked_sub(1)?;
    if index < 0 {
        return None;
    }
    let index = usize::try_from(index).ok()?;
    (index < pool_size).then_some(index)
}

fn log_selection(target: &Target, source: &str) {
    UPSTREAM_SELECTED.with_label_values(&[&target.host, source]).inc();
    debug!(upstream = %target, source = source, "Selected upstream");
}
