#![forbid(unsafe_code)]

use std::{collections::HashMap, mem::size_of};

use bumpalo::{Bump, collections::Vec as BumpVec};
use tg_columnar::{Column, ColumnError};
use tg_types::BucketKey;
use thiserror::Error;

/// Left keys in left order with the right-hand values gathered onto them.
/// Unmatched rows hold the dtype's missing marker.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedGrid {
    pub keys: Vec<BucketKey>,
    pub values: Column,
}

impl JoinedGrid {
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Rows that found a right-hand match.
    #[must_use]
    pub fn matched_rows(&self) -> usize {
        self.values.validity().count_valid()
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("right side has {keys} keys but {values} values")]
    LengthMismatch { keys: usize, values: usize },
    #[error("duplicate right key: bucket {} combination {}", .0.bucket, .0.combination)]
    DuplicateRightKey(BucketKey),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinExecutionTrace {
    used_arena: bool,
    output_rows: usize,
    estimated_bytes: usize,
}

/// Left join: every left key is kept, in order, with the value of its
/// matching right key.
pub fn left_join_grid<I>(
    left: I,
    right_keys: &[BucketKey],
    right_values: &Column,
    options: JoinExecutionOptions,
) -> Result<JoinedGrid, JoinError>
where
    I: IntoIterator<Item = BucketKey>,
{
    let (joined, _) = left_join_grid_with_trace(left, right_keys, right_values, options)?;
    Ok(joined)
}

fn left_join_grid_with_trace<I>(
    left: I,
    right_keys: &[BucketKey],
    right_values: &Column,
    options: JoinExecutionOptions,
) -> Result<(JoinedGrid, JoinExecutionTrace), JoinError>
where
    I: IntoIterator<Item = BucketKey>,
{
    if right_keys.len() != right_values.len() {
        return Err(JoinError::LengthMismatch {
            keys: right_keys.len(),
            values: right_values.len(),
        });
    }

    let mut right_map = HashMap::<BucketKey, usize>::with_capacity(right_keys.len());
    for (pos, key) in right_keys.iter().enumerate() {
        if right_map.insert(*key, pos).is_some() {
            return Err(JoinError::DuplicateRightKey(*key));
        }
    }

    let left = left.into_iter();
    let output_rows = estimate_output_rows(&left);
    let estimated_bytes = estimate_intermediate_bytes(output_rows);
    let use_arena = options.use_arena && estimated_bytes <= options.arena_budget_bytes;

    let joined = if use_arena {
        let arena = Bump::new();
        let mut right_positions = BumpVec::<Option<usize>>::with_capacity_in(output_rows, &arena);
        let keys = gather_right_positions(left, &right_map, output_rows, |pos| {
            right_positions.push(pos);
        });
        let values = right_values.reindex_by_positions(right_positions.as_slice())?;
        JoinedGrid { keys, values }
    } else {
        let mut right_positions = Vec::<Option<usize>>::with_capacity(output_rows);
        let keys = gather_right_positions(left, &right_map, output_rows, |pos| {
            right_positions.push(pos);
        });
        let values = right_values.reindex_by_positions(&right_positions)?;
        JoinedGrid { keys, values }
    };

    let output_rows = joined.len();
    Ok((
        joined,
        JoinExecutionTrace {
            used_arena: use_arena,
            output_rows,
            estimated_bytes,
        },
    ))
}

/// One output row per left key.
fn estimate_output_rows<I: Iterator>(left: &I) -> usize {
    let (lower, upper) = left.size_hint();
    upper.unwrap_or(lower)
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<Option<usize>>().saturating_add(size_of::<BucketKey>()))
}

fn gather_right_positions(
    left: impl Iterator<Item = BucketKey>,
    right_map: &HashMap<BucketKey, usize>,
    capacity: usize,
    mut push_right: impl FnMut(Option<usize>),
) -> Vec<BucketKey> {
    let mut keys = Vec::with_capacity(capacity);
    for key in left {
        keys.push(key);
        push_right(right_map.get(&key).copied());
    }
    keys
}
