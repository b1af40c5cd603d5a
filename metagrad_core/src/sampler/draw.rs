//! Per-label example draws.
//!
//! Training draws sample with replacement from a seeded RNG. Evaluation draws
//! walk each label's ascending index list with a cursor that wraps to zero.
//! The cursors are an explicit [`CursorMap`] threaded through every call, so
//! two tasks sharing a label visibly share its cursor.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{MetaError, MetaResult};

/// Read position per raw dataset label.
pub type CursorMap = BTreeMap<usize, usize>;

/// Draw `count` indices uniformly with replacement.
pub fn draw_with_replacement<R: Rng + ?Sized>(
    label: usize,
    pool: &[usize],
    count: usize,
    rng: &mut R,
) -> MetaResult<Vec<usize>> {
    if pool.is_empty() {
        return Err(MetaError::config(
            "labels",
            format!("label {label} has no examples to draw from"),
        ));
    }
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        if let Some(&id) = pool.choose(rng) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Draw `count` consecutive indices starting at the label's cursor, wrapping
/// at the end of `pool`, and return the advanced cursor map.
pub fn draw_cyclic(
    label: usize,
    pool: &[usize],
    count: usize,
    mut cursors: CursorMap,
) -> MetaResult<(Vec<usize>, CursorMap)> {
    if pool.is_empty() {
        return Err(MetaError::config(
            "labels",
            format!("label {label} has no examples to draw from"),
        ));
    }

    let cursor = cursors.entry(label).or_insert(0);
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        if *cursor >= pool.len() {
            *cursor = 0;
        }
        ids.push(pool[*cursor]);
        *cursor += 1;
    }
    if *cursor >= pool.len() {
        *cursor = 0;
    }

    Ok((ids, cursors))
}
