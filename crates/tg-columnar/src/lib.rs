#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tg_types::{DType, Scalar, TypeError, cast_scalar, cast_scalar_owned, infer_dtype};
use thiserror::Error;

/// Packed validity bits, one per row; a set bit marks a present value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityMask {
    words: Vec<u64>,
    len: usize,
}

impl ValidityMask {
    #[must_use]
    pub fn from_values(values: &[Scalar]) -> Self {
        let len = values.len();
        let mut words = vec![0_u64; len.div_ceil(64)];
        for (idx, value) in values.iter().enumerate() {
            if !value.is_missing() {
                words[idx / 64] |= 1_u64 << (idx % 64);
            }
        }
        Self { words, len }
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    #[must_use]
    pub fn count_valid(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
    validity: ValidityMask,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl Column {
    /// Construct a column, coercing values to the target dtype. Values that
    /// already carry the target dtype are moved, not cloned.
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let coerced = values
            .into_iter()
            .map(|value| cast_scalar_owned(value, dtype))
            .collect::<Result<Vec<_>, _>>()?;
        let validity = ValidityMask::from_values(&coerced);

        Ok(Self {
            dtype,
            values: coerced,
            validity,
        })
    }

    pub fn from_values(values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let dtype = infer_dtype(&values)?;
        Self::new(dtype, values)
    }

    #[must_use]
    pub fn from_f64(values: Vec<f64>) -> Self {
        let values: Vec<Scalar> = values.into_iter().map(Scalar::Float64).collect();
        let validity = ValidityMask::from_values(&values);
        Self {
            dtype: DType::Float64,
            values,
            validity,
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    #[must_use]
    pub fn validity(&self) -> &ValidityMask {
        &self.validity
    }

    /// Gather rows by position; `None` (or an out-of-range position) yields
    /// the dtype's missing marker.
    pub fn reindex_by_positions(&self, positions: &[Option<usize>]) -> Result<Self, ColumnError> {
        let values = positions
            .iter()
            .map(|slot| {
                slot.and_then(|idx| self.values.get(idx).cloned())
                    .unwrap_or_else(|| Scalar::missing_for_dtype(self.dtype))
            })
            .collect::<Vec<_>>();

        Self::new(self.dtype, values)
    }

    /// Gather rows by position where every position is known to exist.
    pub fn take(&self, positions: &[usize]) -> Result<Self, ColumnError> {
        let mut values = Vec::with_capacity(positions.len());
        for &idx in positions {
            let value = self.values.get(idx).ok_or(ColumnError::LengthMismatch {
                left: self.values.len(),
                right: idx + 1,
            })?;
            values.push(value.clone());
        }
        Self::new(self.dtype, values)
    }

    /// Replace every missing position with `fill_value`, cast to the column's dtype.
    pub fn fillna(&self, fill_value: &Scalar) -> Result<Self, ColumnError> {
        let cast_fill = cast_scalar(fill_value, self.dtype)?;
        let values = self
            .values
            .iter()
            .map(|v| {
                if v.is_missing() {
                    cast_fill.clone()
                } else {
                    v.clone()
                }
            })
            .collect();

        Self::new(self.dtype, values)
    }

    /// Cast every value to `dtype`; missing values take the target's marker.
    pub fn astype(&self, dtype: DType) -> Result<Self, ColumnError> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        Self::new(dtype, self.values.clone())
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(left, right)| left.semantic_eq(right))
    }
}
