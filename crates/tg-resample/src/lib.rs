#![forbid(unsafe_code)]

//! Resample an irregular time-stamped table onto a dense calendar grid.
//!
//! Rows are bucketed by a calendar [`Frequency`], summed per bucket and per
//! combination of categorical values, then left-joined onto the full
//! Cartesian grid of buckets × observed combinations so that every cell is
//! present. Cells with no contributing rows take the caller's fill value.

use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use tg_calendar::{CalendarError, DateRange, parse_timestamp};
use tg_columnar::{Column, ColumnError};
use tg_frame::FrameError;
use tg_groupby::{
    GroupByError, GroupByExecutionOptions, GroupByOptions, encode_combinations,
    groupby_sum_composite,
};
use tg_join::{JoinError, JoinExecutionOptions, left_join_grid};
use tg_runtime::DecisionAction;
use tg_types::{BucketKey, DType, Scalar};
use thiserror::Error;
use tracing::{debug, warn};

pub use tg_calendar::{Anchor, Frequency, FrequencyUnit};
pub use tg_frame::{DataFrame, Record};
pub use tg_runtime::{EvidenceLedger, ResamplePolicy, RuntimeMode};

/// Which columns act as grouping dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CategoricalSelection {
    /// Every `Utf8` column of the frame's schema other than the date and
    /// value columns, in column order.
    #[default]
    FromSchema,
    /// Exactly these columns, in this order.
    Columns(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResampleOptions {
    pub date_column: String,
    pub value_column: String,
    /// Frequency specifier, see [`Frequency::parse`].
    pub frequency: String,
    pub fill_value: f64,
    pub categorical: CategoricalSelection,
    /// Leave rows with a missing categorical value out of the sums. Their
    /// combination still gets a full row of grid cells.
    pub dropna: bool,
    pub groupby: GroupByExecutionOptions,
    pub join: JoinExecutionOptions,
}

impl ResampleOptions {
    #[must_use]
    pub fn new(date_column: impl Into<String>, value_column: impl Into<String>) -> Self {
        Self {
            date_column: date_column.into(),
            value_column: value_column.into(),
            frequency: "D".to_owned(),
            fill_value: 0.0,
            categorical: CategoricalSelection::default(),
            dropna: true,
            groupby: GroupByExecutionOptions::default(),
            join: JoinExecutionOptions::default(),
        }
    }

    #[must_use]
    pub fn with_frequency(mut self, frequency: impl Into<String>) -> Self {
        self.frequency = frequency.into();
        self
    }

    #[must_use]
    pub fn with_fill_value(mut self, fill_value: f64) -> Self {
        self.fill_value = fill_value;
        self
    }

    #[must_use]
    pub fn with_categorical_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categorical =
            CategoricalSelection::Columns(columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_dropna(mut self, dropna: bool) -> Self {
        self.dropna = dropna;
        self
    }
}

/// Coarse classification of a [`ResampleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Schema,
    Parse,
    EmptyInput,
    UnsupportedFrequency,
    Overflow,
    Policy,
    Internal,
}

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("column '{column}' is missing{}", row_suffix(.row))]
    Schema { column: String, row: Option<usize> },
    #[error("row {row}: cannot interpret {value:?} in column '{column}' as a timestamp")]
    Parse {
        column: String,
        row: usize,
        value: String,
    },
    #[error("row {row}: value {value:?} in column '{column}' is not numeric")]
    NonNumericValue {
        column: String,
        row: usize,
        value: String,
    },
    #[error("row {row}: sum of column '{column}' overflows i64")]
    SumOverflow { column: String, row: usize },
    #[error("input has no rows to resample")]
    EmptyInput,
    #[error("unsupported frequency specifier: {0:?}")]
    UnsupportedFrequency(String),
    #[error("grid of {rows} rows exceeds the policy cap of {cap}")]
    GridTooLarge { rows: usize, cap: usize },
    #[error("resample rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    GroupBy(GroupByError),
    #[error(transparent)]
    Join(#[from] JoinError),
}

fn row_suffix(row: &Option<usize>) -> String {
    row.map(|row| format!(" from row {row}")).unwrap_or_default()
}

impl ResampleError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Schema { .. } => ErrorKind::Schema,
            Self::Parse { .. }
            | Self::NonNumericValue { .. }
            | Self::Calendar(CalendarError::InvalidTimestamp { .. }) => ErrorKind::Parse,
            Self::EmptyInput => ErrorKind::EmptyInput,
            Self::SumOverflow { .. } => ErrorKind::Overflow,
            Self::UnsupportedFrequency(_)
            | Self::Calendar(CalendarError::UnsupportedFrequency(_)) => {
                ErrorKind::UnsupportedFrequency
            }
            Self::GridTooLarge { .. } | Self::Rejected(_) => ErrorKind::Policy,
            Self::Calendar(_)
            | Self::Frame(_)
            | Self::Column(_)
            | Self::GroupBy(_)
            | Self::Join(_) => ErrorKind::Internal,
        }
    }
}

// ── Grid ───────────────────────────────────────────────────────────────

/// Lazily enumerates the complete grid: buckets outer, combinations inner.
#[derive(Debug, Clone)]
pub struct GridCells<'a> {
    buckets: &'a [NaiveDateTime],
    combinations: usize,
    next: usize,
    total: usize,
}

impl<'a> GridCells<'a> {
    /// `None` if the grid size overflows `usize`.
    #[must_use]
    pub fn new(buckets: &'a [NaiveDateTime], combinations: usize) -> Option<Self> {
        let total = buckets.len().checked_mul(combinations)?;
        Some(Self {
            buckets,
            combinations,
            next: 0,
            total,
        })
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for GridCells<'_> {
    type Item = BucketKey;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let cell = self.next;
        self.next += 1;
        Some(BucketKey::new(
            self.buckets[cell / self.combinations],
            cell % self.combinations,
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for GridCells<'_> {}

// ── Entry points ───────────────────────────────────────────────────────

/// Resample `frame` with default options for everything but the arguments.
///
/// Categorical columns are the frame's text columns; the call runs under the
/// strict policy. Only the value column is summed: numeric columns that are
/// neither the value column nor categorical are not carried into the output.
pub fn resample(
    frame: &DataFrame,
    date_column: &str,
    value_column: &str,
    frequency: &str,
    fill_value: f64,
) -> Result<DataFrame, ResampleError> {
    let options = ResampleOptions::new(date_column, value_column)
        .with_frequency(frequency)
        .with_fill_value(fill_value);
    resample_with_options(frame, &options)
}

pub fn resample_with_options(
    frame: &DataFrame,
    options: &ResampleOptions,
) -> Result<DataFrame, ResampleError> {
    let mut ledger = EvidenceLedger::new();
    resample_with_policy(frame, options, &ResamplePolicy::default(), &mut ledger)
}

/// Resample row records. Every record must carry the date and value keys;
/// other keys absent from a record are treated as missing.
pub fn resample_records(
    records: &[Record],
    options: &ResampleOptions,
) -> Result<DataFrame, ResampleError> {
    if records.is_empty() {
        return Err(ResampleError::EmptyInput);
    }
    for (row, record) in records.iter().enumerate() {
        for column in [&options.date_column, &options.value_column] {
            if !record.contains_key(column) {
                return Err(ResampleError::Schema {
                    column: column.clone(),
                    row: Some(row),
                });
            }
        }
    }

    let frame = DataFrame::from_records(records, None)?;
    resample_with_options(&frame, options)
}

pub fn resample_with_policy(
    frame: &DataFrame,
    options: &ResampleOptions,
    policy: &ResamplePolicy,
    ledger: &mut EvidenceLedger,
) -> Result<DataFrame, ResampleError> {
    let frequency = Frequency::parse(&options.frequency)
        .map_err(|_| ResampleError::UnsupportedFrequency(options.frequency.clone()))?;

    if frame.is_empty() {
        return Err(ResampleError::EmptyInput);
    }

    let dates = require_column(frame, &options.date_column)?;
    let values = require_column(frame, &options.value_column)?;
    let categorical_names = resolve_categorical_columns(frame, options)?;
    let categories = categorical_names
        .iter()
        .map(|name| require_column(frame, name))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(
        rows = frame.len(),
        ?categorical_names,
        %frequency,
        "resolved resample inputs"
    );

    let timestamps = parse_date_column(dates, &options.date_column)?;
    if let Some(first_missing) = timestamps.iter().position(Option::is_none) {
        let missing = timestamps[first_missing..]
            .iter()
            .filter(|ts| ts.is_none())
            .count();
        match policy.decide_missing_timestamps(&options.date_column, missing, ledger) {
            DecisionAction::Reject => {
                return Err(ResampleError::Parse {
                    column: options.date_column.clone(),
                    row: first_missing,
                    value: dates
                        .value(first_missing)
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                });
            }
            DecisionAction::Allow | DecisionAction::Repair => {
                warn!(
                    column = %options.date_column,
                    missing,
                    "dropping rows with missing timestamps"
                );
            }
        }
    }
    ensure_numeric(values, &options.value_column)?;

    let buckets = timestamps
        .iter()
        .map(|ts| ts.map(|ts| frequency.truncate(ts)).transpose())
        .collect::<Result<Vec<_>, _>>()?;

    let codes = encode_combinations(
        frame.len(),
        &categories,
        GroupByOptions {
            dropna: options.dropna,
        },
    )
    .map_err(|err| groupby_error(err, &options.value_column))?;
    let sums = groupby_sum_composite(&buckets, &codes, values, options.groupby)
        .map_err(|err| groupby_error(err, &options.value_column))?;
    debug!(
        groups = sums.len(),
        combinations = codes.len(),
        "aggregated rows by bucket"
    );

    let (min_bucket, max_bucket) = sums.bucket_bounds().ok_or(ResampleError::EmptyInput)?;
    let bucket_count = frequency.bucket_count(min_bucket, max_bucket)?;
    debug!(
        buckets = bucket_count,
        %min_bucket,
        %max_bucket,
        "sized bucket range"
    );

    // Admission runs on the counted size; nothing grid-sized exists yet.
    let cap = policy.max_grid_rows.unwrap_or(usize::MAX);
    let Some(grid_rows) = bucket_count.checked_mul(codes.len()) else {
        return Err(ResampleError::GridTooLarge {
            rows: usize::MAX,
            cap,
        });
    };
    if policy.decide_grid_admission(grid_rows, ledger) == DecisionAction::Reject {
        return Err(ResampleError::GridTooLarge {
            rows: grid_rows,
            cap,
        });
    }

    let bucket_sequence = DateRange::new(min_bucket, max_bucket, frequency)?.collect::<Vec<_>>();
    let grid = GridCells::new(&bucket_sequence, codes.len()).ok_or(
        ResampleError::GridTooLarge {
            rows: grid_rows,
            cap,
        },
    )?;
    let joined = left_join_grid(grid, sums.keys(), sums.sums(), options.join)?;
    debug!(
        grid_rows,
        matched = joined.matched_rows(),
        "densified grid"
    );
    let filled = fill_gaps(&joined.values, options.fill_value)?;

    let labels = joined
        .keys
        .iter()
        .map(|key| frequency.label(key.bucket).map(Scalar::Timestamp))
        .collect::<Result<Vec<_>, _>>()?;
    let combination_rows = joined
        .keys
        .iter()
        .map(|key| codes.first_rows()[key.combination])
        .collect::<Vec<_>>();

    let mut columns = Vec::with_capacity(categories.len() + 2);
    columns.push((
        options.date_column.clone(),
        Column::new(DType::Timestamp, labels)?,
    ));
    for (name, column) in categorical_names.iter().zip(&categories) {
        columns.push((name.clone(), column.take(&combination_rows)?));
    }
    columns.push((options.value_column.clone(), filled));

    Ok(DataFrame::from_columns(columns)?)
}

// ── Helpers ────────────────────────────────────────────────────────────

fn require_column<'a>(frame: &'a DataFrame, name: &str) -> Result<&'a Column, ResampleError> {
    frame.require_column(name).map_err(|err| match err {
        FrameError::UnknownColumn(column) => ResampleError::Schema { column, row: None },
        other => ResampleError::Frame(other),
    })
}

fn resolve_categorical_columns(
    frame: &DataFrame,
    options: &ResampleOptions,
) -> Result<Vec<String>, ResampleError> {
    let is_role_column =
        |name: &str| name == options.date_column || name == options.value_column;

    match &options.categorical {
        CategoricalSelection::FromSchema => Ok(frame
            .schema()
            .into_iter()
            .filter(|(name, dtype)| *dtype == DType::Utf8 && !is_role_column(name))
            .map(|(name, _)| name.to_owned())
            .collect()),
        CategoricalSelection::Columns(names) => {
            let mut seen = BTreeSet::new();
            for name in names {
                if is_role_column(name) {
                    return Err(ResampleError::Rejected(format!(
                        "column '{name}' cannot be both categorical and the date or value column"
                    )));
                }
                if !seen.insert(name.as_str()) {
                    return Err(ResampleError::Rejected(format!(
                        "duplicate categorical column '{name}'"
                    )));
                }
                require_column(frame, name)?;
            }
            Ok(names.clone())
        }
    }
}

fn parse_date_column(
    dates: &Column,
    column: &str,
) -> Result<Vec<Option<NaiveDateTime>>, ResampleError> {
    if dates.dtype() == DType::Timestamp {
        return Ok(dates.values().iter().map(Scalar::as_timestamp).collect());
    }

    dates
        .values()
        .iter()
        .enumerate()
        .map(|(row, value)| {
            parse_timestamp(value).map_err(|_| ResampleError::Parse {
                column: column.to_owned(),
                row,
                value: value.to_string(),
            })
        })
        .collect()
}

fn ensure_numeric(values: &Column, column: &str) -> Result<(), ResampleError> {
    if values.dtype().is_numeric() {
        return Ok(());
    }
    match values.values().iter().enumerate().find(|(_, v)| !v.is_missing()) {
        Some((row, value)) => Err(ResampleError::NonNumericValue {
            column: column.to_owned(),
            row,
            value: value.to_string(),
        }),
        None => Ok(()),
    }
}

/// Integer sums keep `Int64` when the fill is a whole `i64`; any other fill
/// turns the column into `Float64`.
fn fill_gaps(values: &Column, fill_value: f64) -> Result<Column, ResampleError> {
    let whole = fill_value.fract() == 0.0
        && fill_value >= i64::MIN as f64
        && fill_value < i64::MAX as f64;
    if values.dtype() == DType::Int64 && whole {
        return Ok(values.fillna(&Scalar::Int64(fill_value as i64))?);
    }
    Ok(values
        .astype(DType::Float64)?
        .fillna(&Scalar::Float64(fill_value))?)
}

fn groupby_error(err: GroupByError, value_column: &str) -> ResampleError {
    match err {
        GroupByError::NonNumeric { row, value } => ResampleError::NonNumericValue {
            column: value_column.to_owned(),
            row,
            value,
        },
        GroupByError::Overflow { row } => ResampleError::SumOverflow {
            column: value_column.to_owned(),
            row,
        },
        other => ResampleError::GroupBy(other),
    }
}
