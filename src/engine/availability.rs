use std::collections::{BTreeMap, BTreeSet};

use crate::model::*;

// ── Inventory Ledger ──────────────────────────────────────────────

/// Units committed and free for `query`, treated as ONE interval.
///
/// Every reservation touching any night of the query counts in full, even if
/// the reservations it is summed with never share a night among themselves.
/// This rejects some requests a per-night ledger would admit. The admission
/// path relies on this coarse check; `fully_booked_nights` is per-night
/// precise because it drives date-picker exclusion. Keep the two apart.
pub fn availability<'a>(
    total_units: u32,
    reservations: impl IntoIterator<Item = &'a Reservation>,
    query: &Stay,
) -> AvailabilitySnapshot {
    let committed: u64 = reservations
        .into_iter()
        .filter(|r| r.stay.overlaps(query))
        .map(|r| u64::from(r.quantity))
        .sum();
    let committed_quantity = u32::try_from(committed).unwrap_or(u32::MAX);
    AvailabilitySnapshot {
        total_quantity: total_units,
        committed_quantity,
        available_quantity: total_units.saturating_sub(committed_quantity),
    }
}

// ── Blocked-Date Aggregator ───────────────────────────────────────

/// Committed units per night inside `horizon`. Nights with nothing committed are absent.
pub fn committed_per_night<'a>(
    reservations: impl IntoIterator<Item = &'a Reservation>,
    horizon: &Stay,
) -> BTreeMap<Night, u64> {
    let mut per_night: BTreeMap<Night, u64> = BTreeMap::new();
    for r in reservations {
        let Some(clamped) = r.stay.clamp_to(horizon) else {
            continue;
        };
        for night in clamped.nights() {
            *per_night.entry(night).or_default() += u64::from(r.quantity);
        }
    }
    per_night
}

/// Nights in `horizon` whose committed units reach `total_units`.
pub fn fully_booked_nights<'a>(
    total_units: u32,
    reservations: impl IntoIterator<Item = &'a Reservation>,
    horizon: &Stay,
) -> BTreeSet<Night> {
    committed_per_night(reservations, horizon)
        .into_iter()
        .filter(|(_, committed)| *committed >= u64::from(total_units))
        .map(|(night, _)| night)
        .collect()
}
