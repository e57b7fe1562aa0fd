#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tg_columnar::{Column, ColumnError};
use tg_types::{DType, NullKind, Scalar};
use thiserror::Error;

/// One input row: column name to value.
pub type Record = BTreeMap<String, Scalar>;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("column '{column}' has {actual} rows but the frame has {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate column name: '{0}'")]
    DuplicateColumn(String),
    #[error("column '{0}' not found")]
    UnknownColumn(String),
    #[error("column '{column}': {source}")]
    ColumnBuild {
        column: String,
        #[source]
        source: ColumnError,
    },
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// A table of equally long, named, typed columns with a fixed column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    len: usize,
    columns: BTreeMap<String, Column>,
    column_order: Vec<String>,
}

impl DataFrame {
    /// Build from `(name, column)` pairs; pair order becomes column order.
    pub fn from_columns(columns: Vec<(String, Column)>) -> Result<Self, FrameError> {
        let len = columns.first().map_or(0, |(_, column)| column.len());
        let mut out = BTreeMap::new();
        let mut column_order = Vec::with_capacity(columns.len());

        for (name, column) in columns {
            if column.len() != len {
                return Err(FrameError::LengthMismatch {
                    column: name,
                    expected: len,
                    actual: column.len(),
                });
            }
            if out.contains_key(&name) {
                return Err(FrameError::DuplicateColumn(name));
            }
            column_order.push(name.clone());
            out.insert(name, column);
        }

        Ok(Self {
            len,
            columns: out,
            column_order,
        })
    }

    /// Construct from a list of column vectors, inferring each column's dtype.
    ///
    /// Matches `pd.DataFrame({"a": [1, 2], "b": [3, 4]})`; argument order is
    /// column order.
    pub fn from_dict(data: Vec<(&str, Vec<Scalar>)>) -> Result<Self, FrameError> {
        let columns = data
            .into_iter()
            .map(|(name, values)| {
                let column = Column::from_values(values).map_err(|source| {
                    FrameError::ColumnBuild {
                        column: name.to_owned(),
                        source,
                    }
                })?;
                Ok((name.to_owned(), column))
            })
            .collect::<Result<Vec<_>, FrameError>>()?;
        Self::from_columns(columns)
    }

    /// Construct from row records.
    ///
    /// Columns are discovered in first-seen order across records unless
    /// `column_order` is given. Keys absent from a record become nulls.
    pub fn from_records(
        records: &[Record],
        column_order: Option<&[String]>,
    ) -> Result<Self, FrameError> {
        let output_order = match column_order {
            Some(requested) => {
                let mut seen = BTreeSet::new();
                for name in requested {
                    if !seen.insert(name.as_str()) {
                        return Err(FrameError::DuplicateColumn(name.clone()));
                    }
                }
                requested.to_vec()
            }
            None => {
                let mut discovered = Vec::new();
                let mut seen = BTreeSet::new();
                for key in records.iter().flat_map(|record| record.keys()) {
                    if seen.insert(key.as_str()) {
                        discovered.push(key.clone());
                    }
                }
                discovered
            }
        };

        let mut columns = Vec::with_capacity(output_order.len());
        for name in output_order {
            let values = records
                .iter()
                .map(|record| {
                    record
                        .get(&name)
                        .cloned()
                        .unwrap_or(Scalar::Null(NullKind::Null))
                })
                .collect::<Vec<_>>();
            let column = Column::from_values(values).map_err(|source| FrameError::ColumnBuild {
                column: name.clone(),
                source,
            })?;
            columns.push((name, column));
        }

        if columns.is_empty() {
            // Records without keys still count as rows.
            return Ok(Self {
                len: records.len(),
                columns: BTreeMap::new(),
                column_order: Vec::new(),
            });
        }
        Self::from_columns(columns)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn require_column(&self, name: &str) -> Result<&Column, FrameError> {
        self.column(name)
            .ok_or_else(|| FrameError::UnknownColumn(name.to_owned()))
    }

    /// The typed schema, in column order.
    #[must_use]
    pub fn schema(&self) -> Vec<(&str, DType)> {
        self.column_order
            .iter()
            .filter_map(|name| {
                self.columns
                    .get(name)
                    .map(|column| (name.as_str(), column.dtype()))
            })
            .collect()
    }

    /// Materialize row `idx` as a record.
    #[must_use]
    pub fn row(&self, idx: usize) -> Option<Record> {
        if idx >= self.len {
            return None;
        }
        Some(
            self.column_order
                .iter()
                .filter_map(|name| {
                    let value = self.columns.get(name)?.value(idx)?;
                    Some((name.clone(), value.clone()))
                })
                .collect(),
        )
    }

    #[must_use]
    pub fn to_records(&self) -> Vec<Record> {
        (0..self.len).filter_map(|idx| self.row(idx)).collect()
    }

    /// Cell-wise equality treating NaN as equal to NaN.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.len == other.len
            && self.column_order == other.column_order
            && self.column_order.iter().all(|name| {
                match (self.columns.get(name), other.columns.get(name)) {
                    (Some(left), Some(right)) => left.semantic_eq(right),
                    _ => false,
                }
            })
    }
}
