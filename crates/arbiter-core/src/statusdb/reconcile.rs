//! Winner selection among the status rows of a sync group.
//!
//! The total order, most significant criterion first:
//!
//! 1. validity — a live penalty (`penalty_expiry > now`) or a recent
//!    write beats an expired or stale row
//! 2. higher `occurrences`
//! 3. penalty status beats default
//! 4. later `modified`
//! 5. lexicographically greater `hostname` (deterministic tiebreak)

use std::cmp::Ordering;

use super::StatusRow;

/// Whether a row may participate in reconciliation.
pub fn is_valid(row: &StatusRow, now: i64, stale_after: i64) -> bool {
    row.penalty_expiry.map(|t| t > now).unwrap_or(false) || row.modified > now - stale_after
}

/// Compares two valid rows; `Greater` means `a` wins over `b`.
pub fn cmp_rows(a: &StatusRow, b: &StatusRow, is_penalty: &dyn Fn(&str) -> bool) -> Ordering {
    a.occurrences
        .cmp(&b.occurrences)
        .then_with(|| is_penalty(&a.current).cmp(&is_penalty(&b.current)))
        .then_with(|| a.modified.cmp(&b.modified))
        .then_with(|| a.hostname.cmp(&b.hostname))
}

/// Picks the winning row. Invalid rows never win; `None` (keep local
/// state untouched) when every candidate is expired or stale.
pub fn pick_winner<'a>(
    rows: &[&'a StatusRow],
    now: i64,
    stale_after: i64,
    is_penalty: &dyn Fn(&str) -> bool,
) -> Option<&'a StatusRow> {
    rows.iter()
        .copied()
        .filter(|r| is_valid(r, now, stale_after))
        .max_by(|a, b| cmp_rows(a, b, is_penalty))
}
