#![forbid(unsafe_code)]

use std::{collections::HashMap, mem::size_of};

use bumpalo::{Bump, collections::Vec as BumpVec};
use chrono::NaiveDateTime;
use tg_columnar::{Column, ColumnError};
use tg_types::{BucketKey, DType, NullKind, Scalar};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupByOptions {
    /// Keep rows whose category values include a missing entry out of the
    /// sums. Their combination is still part of the combination set.
    pub dropna: bool,
}

impl Default for GroupByOptions {
    fn default() -> Self {
        Self { dropna: true }
    }
}

#[derive(Debug, Error)]
pub enum GroupByError {
    #[error("groupby input length mismatch: expected {expected} rows, found {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("row {row}: value {value:?} is not numeric")]
    NonNumeric { row: usize, value: String },
    #[error("row {row}: integer sum overflows i64")]
    Overflow { row: usize },
    #[error(transparent)]
    Column(#[from] ColumnError),
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupByExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for GroupByExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupByExecutionTrace {
    used_arena: bool,
    input_rows: usize,
    estimated_bytes: usize,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum GroupKeyRef<'a> {
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(&'a str),
    Timestamp(NaiveDateTime),
    Null(NullKind),
}

impl<'a> GroupKeyRef<'a> {
    fn from_scalar(key: &'a Scalar) -> Self {
        match key {
            Scalar::Bool(v) => Self::Bool(*v),
            Scalar::Int64(v) => Self::Int64(*v),
            Scalar::Float64(v) if v.is_nan() => Self::Null(NullKind::NaN),
            Scalar::Float64(v) => Self::FloatBits(v.to_bits()),
            Scalar::Utf8(v) => Self::Utf8(v.as_str()),
            Scalar::Timestamp(v) => Self::Timestamp(*v),
            Scalar::Null(kind) => Self::Null(*kind),
        }
    }
}

/// Per-row ordinals of distinct category combinations, numbered in
/// first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinationCodes {
    codes: Vec<Option<usize>>,
    first_rows: Vec<usize>,
}

impl CombinationCodes {
    /// Combination ordinal of each row that contributes to sums; `None` for
    /// rows excluded by `dropna`.
    #[must_use]
    pub fn codes(&self) -> &[Option<usize>] {
        &self.codes
    }

    /// First source row of each combination, indexed by ordinal.
    #[must_use]
    pub fn first_rows(&self) -> &[usize] {
        &self.first_rows
    }

    /// Number of distinct combinations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.first_rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_rows.is_empty()
    }
}

/// Intern the category combination of every row.
///
/// This is `drop_duplicates` over the categorical sub-table, so combinations
/// holding a missing value are interned regardless of `dropna`; `dropna`
/// only withholds those rows' codes from aggregation. With no categorical
/// columns every row shares the single empty combination.
pub fn encode_combinations(
    row_count: usize,
    categories: &[&Column],
    options: GroupByOptions,
) -> Result<CombinationCodes, GroupByError> {
    for column in categories {
        if column.len() != row_count {
            return Err(GroupByError::LengthMismatch {
                expected: row_count,
                actual: column.len(),
            });
        }
    }

    let mut codes = Vec::with_capacity(row_count);
    let mut first_rows = Vec::new();
    let mut slot = HashMap::<Vec<GroupKeyRef<'_>>, usize>::new();
    let mut scratch = Vec::with_capacity(categories.len());

    for row in 0..row_count {
        scratch.clear();
        scratch.extend(
            categories
                .iter()
                .map(|column| GroupKeyRef::from_scalar(&column.values()[row])),
        );

        let code = match slot.get(scratch.as_slice()) {
            Some(&code) => code,
            None => {
                let code = first_rows.len();
                first_rows.push(row);
                slot.insert(scratch.clone(), code);
                code
            }
        };
        let excluded = options.dropna
            && scratch
                .iter()
                .any(|key| matches!(key, GroupKeyRef::Null(_)));
        codes.push((!excluded).then_some(code));
    }

    Ok(CombinationCodes { codes, first_rows })
}

/// Running sum of one group. Integer and boolean values sum exactly in
/// `i64`; everything else sums in `f64`.
#[derive(Debug, Clone, Copy, PartialEq)]
enum GroupSum {
    Int(i64),
    Float(f64),
}

impl GroupSum {
    fn zero_for(dtype: DType) -> Self {
        match dtype {
            DType::Int64 | DType::Bool => Self::Int(0),
            DType::Null | DType::Float64 | DType::Utf8 | DType::Timestamp => Self::Float(0.0),
        }
    }

    fn output_dtype(self) -> DType {
        match self {
            Self::Int(_) => DType::Int64,
            Self::Float(_) => DType::Float64,
        }
    }

    fn add(&mut self, row: usize, value: &Scalar) -> Result<(), GroupByError> {
        let non_numeric = || GroupByError::NonNumeric {
            row,
            value: value.to_string(),
        };
        match self {
            Self::Int(acc) => {
                let addend = match value {
                    Scalar::Int64(v) => *v,
                    Scalar::Bool(v) => i64::from(*v),
                    _ => return Err(non_numeric()),
                };
                *acc = acc
                    .checked_add(addend)
                    .ok_or(GroupByError::Overflow { row })?;
            }
            Self::Float(acc) => *acc += value.to_f64().map_err(|_| non_numeric())?,
        }
        Ok(())
    }

    fn into_scalar(self) -> Scalar {
        match self {
            Self::Int(v) => Scalar::Int64(v),
            Self::Float(v) => Scalar::Float64(v),
        }
    }
}

/// Sums per (bucket, combination), in first-seen key order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeSums {
    keys: Vec<BucketKey>,
    sums: Column,
}

impl CompositeSums {
    #[must_use]
    pub fn keys(&self) -> &[BucketKey] {
        &self.keys
    }

    /// `Int64` for integer or boolean input, `Float64` otherwise.
    #[must_use]
    pub fn sums(&self) -> &Column {
        &self.sums
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Earliest and latest bucket among the groups.
    #[must_use]
    pub fn bucket_bounds(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let first = self.keys.first()?.bucket;
        Some(self.keys.iter().fold((first, first), |(lo, hi), key| {
            (lo.min(key.bucket), hi.max(key.bucket))
        }))
    }
}

/// Sum `values` per (bucket, combination).
///
/// Rows without a bucket or without a combination code are skipped. A group
/// whose values are all missing still exists and sums to zero. Integer sums
/// are exact and fail with [`GroupByError::Overflow`] past `i64`.
pub fn groupby_sum_composite(
    buckets: &[Option<NaiveDateTime>],
    codes: &CombinationCodes,
    values: &Column,
    exec_options: GroupByExecutionOptions,
) -> Result<CompositeSums, GroupByError> {
    let (result, _trace) = groupby_sum_composite_with_trace(buckets, codes, values, exec_options)?;
    Ok(result)
}

fn groupby_sum_composite_with_trace(
    buckets: &[Option<NaiveDateTime>],
    codes: &CombinationCodes,
    values: &Column,
    exec_options: GroupByExecutionOptions,
) -> Result<(CompositeSums, GroupByExecutionTrace), GroupByError> {
    let input_rows = buckets.len();
    for actual in [codes.codes().len(), values.len()] {
        if actual != input_rows {
            return Err(GroupByError::LengthMismatch {
                expected: input_rows,
                actual,
            });
        }
    }

    let estimated_bytes = estimate_groupby_intermediate_bytes(input_rows);
    let use_arena = exec_options.use_arena && estimated_bytes <= exec_options.arena_budget_bytes;

    let rows = buckets
        .iter()
        .zip(codes.codes())
        .zip(values.values())
        .enumerate()
        .filter_map(|(row, ((bucket, code), value))| {
            Some((row, BucketKey::new((*bucket)?, (*code)?), value))
        });

    let zero = GroupSum::zero_for(values.dtype());
    let result = if use_arena {
        let arena = Bump::new();
        let mut ordering = BumpVec::<BucketKey>::new_in(&arena);
        let mut slot = HashMap::<BucketKey, GroupSum>::new();
        accumulate(rows, zero, |key| ordering.push(key), &mut slot)?;
        emit_groupby_result(ordering.as_slice(), &slot, zero.output_dtype())?
    } else {
        let mut ordering = Vec::<BucketKey>::new();
        let mut slot = HashMap::<BucketKey, GroupSum>::new();
        accumulate(rows, zero, |key| ordering.push(key), &mut slot)?;
        emit_groupby_result(&ordering, &slot, zero.output_dtype())?
    };

    Ok((
        result,
        GroupByExecutionTrace {
            used_arena: use_arena,
            input_rows,
            estimated_bytes,
        },
    ))
}

/// Estimate intermediate memory: one ordering entry plus a hash slot per row
/// in the worst case of all-distinct keys.
fn estimate_groupby_intermediate_bytes(input_rows: usize) -> usize {
    input_rows.saturating_mul(
        size_of::<BucketKey>()
            .saturating_mul(2)
            .saturating_add(size_of::<GroupSum>())
            .saturating_add(64), // HashMap entry overhead estimate
    )
}

fn accumulate<'v>(
    rows: impl Iterator<Item = (usize, BucketKey, &'v Scalar)>,
    zero: GroupSum,
    mut on_new_key: impl FnMut(BucketKey),
    slot: &mut HashMap<BucketKey, GroupSum>,
) -> Result<(), GroupByError> {
    for (row, key, value) in rows {
        let entry = slot.entry(key).or_insert_with(|| {
            on_new_key(key);
            zero
        });

        if value.is_missing() {
            continue;
        }
        entry.add(row, value)?;
    }
    Ok(())
}

fn emit_groupby_result(
    ordering: &[BucketKey],
    slot: &HashMap<BucketKey, GroupSum>,
    dtype: DType,
) -> Result<CompositeSums, GroupByError> {
    let mut keys = Vec::with_capacity(ordering.len());
    let mut sums = Vec::with_capacity(ordering.len());
    for key in ordering {
        if let Some(sum) = slot.get(key) {
            keys.push(*key);
            sums.push(sum.into_scalar());
        }
    }
    Ok(CompositeSums {
        keys,
        sums: Column::new(dtype, sums)?,
    })
}
