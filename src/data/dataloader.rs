//! DataLoader: ordered iteration over row batches.

use ndarray::{ArrayViewD, Axis, Slice};
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("features and labels must have at least one axis")]
    ScalarArray,
    #[error("features have {features} rows but labels have {labels}")]
    RowMismatch { features: usize, labels: usize },
}

/// One batch: a pair of row views plus the rows they cover.
#[derive(Debug, Clone)]
pub struct Batch<'a> {
    pub features: ArrayViewD<'a, f32>,
    pub labels: ArrayViewD<'a, f32>,
    pub rows: Range<usize>,
}

/// Splits a (features, labels) pair into contiguous batches along axis 0.
#[derive(Debug, Clone)]
pub struct DataLoader<'a> {
    features: ArrayViewD<'a, f32>,
    labels: ArrayViewD<'a, f32>,
    batch_size: usize,
}

impl<'a> DataLoader<'a> {
    pub fn new(
        features: ArrayViewD<'a, f32>,
        labels: ArrayViewD<'a, f32>,
        batch_size: usize,
    ) -> Result<Self, DataError> {
        if batch_size == 0 {
            return Err(DataError::ZeroBatchSize);
        }
        if features.ndim() == 0 || labels.ndim() == 0 {
            return Err(DataError::ScalarArray);
        }
        let (n_features, n_labels) = (features.len_of(Axis(0)), labels.len_of(Axis(0)));
        if n_features != n_labels {
            return Err(DataError::RowMismatch { features: n_features, labels: n_labels });
        }
        Ok(Self { features, labels, batch_size })
    }

    pub fn num_batches(&self) -> usize {
        num_batches(self.rows(), self.batch_size)
    }

    fn rows(&self) -> usize {
        self.features.len_of(Axis(0))
    }

    pub fn iter(&self) -> impl Iterator<Item = Batch<'a>> + '_ {
        let n = self.rows();
        (0..n).step_by(self.batch_size).map(move |start| {
            let rows = start..(start + self.batch_size).min(n);
            Batch {
                features: rows_of(&self.features, &rows),
                labels: rows_of(&self.labels, &rows),
                rows,
            }
        })
    }
}

fn rows_of<'a>(view: &ArrayViewD<'a, f32>, rows: &Range<usize>) -> ArrayViewD<'a, f32> {
    let mut chunk = view.clone();
    chunk.slice_axis_inplace(Axis(0), Slice::from(rows.clone()));
    chunk
}

/// `ceil(rows / batch_size)`; zero rows give zero batches.
pub fn num_batches(rows: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    rows.div_ceil(batch_size)
}
