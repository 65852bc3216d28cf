// SPDX-License-Identifier: AGPL-3.0-or-later

//! Iterative binary searches over row positions.
//!
//! Probes are closures over a position so the same routines serve the column-name table
//! and every index file. Probes can fail (a cell may not decode), hence `Result`.

use crate::error::Result;
use std::cmp::Ordering;

/// Finds a position in `[low, high)` whose probe reports `Equal`.
///
/// Positions must be sorted so the probe is `Less` before the target and `Greater` after.
pub fn find_exact<F>(low: usize, high: usize, mut probe: F) -> Result<Option<usize>>
where
    F: FnMut(usize) -> Result<Ordering>,
{
    let (mut lo, mut hi) = (low, high);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match probe(mid)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(Some(mid)),
        }
    }
    Ok(None)
}

/// Returns the first position in `[low, high)` that fails `passes`, or `high` when all pass.
///
/// The passing positions must form a prefix of the range.
pub fn prefix_end<F>(low: usize, high: usize, mut passes: F) -> Result<usize>
where
    F: FnMut(usize) -> Result<bool>,
{
    if low >= high || !passes(low)? {
        return Ok(low);
    }
    if passes(high - 1)? {
        return Ok(high);
    }
    // passes(lo) and !passes(hi) hold from here on.
    let (mut lo, mut hi) = (low, high - 1);
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if passes(mid)? {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(hi)
}
