//! # Data Loading Module
//!
//! Mini-batch iteration over in-memory arrays.
//!
//! [`DataLoader`] borrows a feature array and a label array with the same
//! number of rows and walks them in contiguous, ordered chunks of
//! `batch_size` rows. The last chunk holds the remainder, so `N` rows give
//! `ceil(N / batch_size)` batches. No shuffling: every epoch sees the same
//! batches in the same order.
//!
//! ## Example
//!
//! ```
//! use ndarray::ArrayD;
//! use protonn::data::DataLoader;
//!
//! let x = ArrayD::<f32>::zeros(ndarray::IxDyn(&[10, 4]));
//! let y = ArrayD::<f32>::zeros(ndarray::IxDyn(&[10, 2]));
//! let loader = DataLoader::new(x.view(), y.view(), 3).unwrap();
//!
//! let sizes: Vec<usize> = loader.iter().map(|batch| batch.rows.len()).collect();
//! assert_eq!(sizes, vec![3, 3, 3, 1]);
//! ```

pub mod dataloader;

pub use dataloader::{Batch, DataError, DataLoader};
