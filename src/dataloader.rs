//! Data loader
//!
//! Holds a train/validation split as row-major feature matrices with class-index labels and
//! draws random minibatches from it.

use ndarray::{Array2, ArrayView2, Axis};
use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

use crate::scalar::Scalar;

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error(
        "Train and validation samples must have the same dimension, got {train} and {val}"
    )]
    InputDimensionMismatch { train: usize, val: usize },
    #[error("Labels must have the same length as the data")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("The {0} split is empty")]
    EmptySplit(&'static str),
    #[error("Validation fraction must be in (0, 1), got {0}")]
    InvalidFraction(f64),
}

fn check_labels<T>(x: &Array2<T>, y: &[usize]) -> Result<(), DataLoaderError> {
    if x.nrows() != y.len() {
        return Err(DataLoaderError::LabelLengthMismatch {
            label_len: y.len(),
            data_len: x.nrows(),
        });
    }
    Ok(())
}

/// Training and validation data, one sample per row
#[derive(Debug, Clone, PartialEq)]
pub struct SplitData<T> {
    x_train: Array2<T>,
    y_train: Vec<usize>,
    x_val: Array2<T>,
    y_val: Vec<usize>,
}

impl<T: Scalar> SplitData<T> {
    pub fn new(
        x_train: Array2<T>,
        y_train: Vec<usize>,
        x_val: Array2<T>,
        y_val: Vec<usize>,
    ) -> Result<Self, DataLoaderError> {
        check_labels(&x_train, &y_train)?;
        check_labels(&x_val, &y_val)?;
        if x_train.nrows() == 0 {
            return Err(DataLoaderError::EmptySplit("train"));
        }
        if x_val.nrows() == 0 {
            return Err(DataLoaderError::EmptySplit("validation"));
        }
        if x_train.ncols() != x_val.ncols() {
            return Err(DataLoaderError::InputDimensionMismatch {
                train: x_train.ncols(),
                val: x_val.ncols(),
            });
        }
        Ok(Self {
            x_train,
            y_train,
            x_val,
            y_val,
        })
    }

    /// Shuffles the samples and holds out `val_fraction` of them (at least one) for validation
    pub fn split<R: Rng + ?Sized>(
        x: Array2<T>,
        y: Vec<usize>,
        val_fraction: f64,
        rng: &mut R,
    ) -> Result<Self, DataLoaderError> {
        check_labels(&x, &y)?;
        if !(val_fraction > 0.0 && val_fraction < 1.0) {
            return Err(DataLoaderError::InvalidFraction(val_fraction));
        }
        let mut indices = (0..y.len()).collect::<Vec<_>>();
        indices.shuffle(rng);
        let num_val = ((y.len() as f64 * val_fraction).round() as usize).max(1);
        let (val_idx, train_idx) = indices.split_at(num_val.min(indices.len()));

        let select = |idx: &[usize]| {
            (
                x.select(Axis(0), idx),
                idx.iter().map(|&i| y[i]).collect::<Vec<_>>(),
            )
        };
        let (x_train, y_train) = select(train_idx);
        let (x_val, y_val) = select(val_idx);
        Self::new(x_train, y_train, x_val, y_val)
    }

    pub fn x_train(&self) -> ArrayView2<'_, T> {
        self.x_train.view()
    }

    pub fn y_train(&self) -> &[usize] {
        &self.y_train
    }

    pub fn x_val(&self) -> ArrayView2<'_, T> {
        self.x_val.view()
    }

    pub fn y_val(&self) -> &[usize] {
        &self.y_val
    }

    pub fn num_train(&self) -> usize {
        self.y_train.len()
    }

    pub fn num_val(&self) -> usize {
        self.y_val.len()
    }

    pub fn num_features(&self) -> usize {
        self.x_train.ncols()
    }

    /// Number of classes seen in either split (largest label + 1)
    pub fn num_classes(&self) -> usize {
        self.y_train
            .iter()
            .chain(&self.y_val)
            .max()
            .map_or(0, |&c| c + 1)
    }

    /// A minibatch of `batch_size` training samples drawn uniformly with replacement
    pub fn sample_batch<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> (Array2<T>, Vec<usize>) {
        sample_rows(self.x_train.view(), &self.y_train, batch_size, rng)
    }
}

/// Draws `n` rows (and their labels) uniformly with replacement
pub fn sample_rows<T: Scalar, R: Rng + ?Sized>(
    x: ArrayView2<T>,
    y: &[usize],
    n: usize,
    rng: &mut R,
) -> (Array2<T>, Vec<usize>) {
    if y.is_empty() {
        return (Array2::zeros((0, x.ncols())), Vec::new());
    }
    let indices = (0..n)
        .map(|_| rng.random_range(0..y.len()))
        .collect::<Vec<_>>();
    let labels = indices.iter().map(|&i| y[i]).collect();
    (x.select(Axis(0), &indices), labels)
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn toy() -> (Array2<f64>, Vec<usize>) {
        let x = Array2::from_shape_fn((10, 2), |(i, j)| (i * 10 + j) as f64);
        let y = (0..10).map(|i| i % 3).collect();
        (x, y)
    }

    #[test]
    fn test_split() {
        let (x, y) = toy();
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let data = SplitData::split(x, y, 0.3, &mut rng).unwrap();
        assert_eq!(data.num_train(), 7);
        assert_eq!(data.num_val(), 3);
        assert_eq!(data.num_features(), 2);
        assert_eq!(data.num_classes(), 3);

        // every sample lands in exactly one split, with its own label
        let mut firsts = data
            .x_train()
            .column(0)
            .iter()
            .chain(data.x_val().column(0).iter())
            .map(|&v| v as usize)
            .collect::<Vec<_>>();
        for (row, &label) in data.x_train().outer_iter().zip(data.y_train()) {
            assert_eq!((row[0] as usize / 10) % 3, label);
        }
        firsts.sort();
        assert_eq!(firsts, (0..10).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_is_seeded() {
        let (x, y) = toy();
        let a = SplitData::split(x.clone(), y.clone(), 0.5, &mut Pcg64Mcg::seed_from_u64(1));
        let b = SplitData::split(x, y, 0.5, &mut Pcg64Mcg::seed_from_u64(1));
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[test]
    fn test_sample_batch() {
        let (x, y) = toy();
        let data = SplitData::new(x.clone(), y, array![[0.0, 1.0]], vec![0]).unwrap();
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let (xb, yb) = data.sample_batch(25, &mut rng);
        assert_eq!(xb.dim(), (25, 2));
        assert_eq!(yb.len(), 25);
        for (row, &label) in xb.outer_iter().zip(&yb) {
            let i = row[0] as usize / 10;
            assert_eq!(row, x.row(i));
            assert_eq!(i % 3, label);
        }
    }

    #[test]
    fn test_dataloader_errors() {
        let (x, y) = toy();
        let expected_data_len = x.nrows();
        let result = SplitData::new(x.clone(), vec![0; 3], x.clone(), y.clone());
        assert!(matches!(
            result,
            Err(DataLoaderError::LabelLengthMismatch {
                label_len: 3,
                data_len,
            }) if data_len == expected_data_len
        ));
        assert!(matches!(
            SplitData::new(x.clone(), y.clone(), array![[1.0, 2.0, 3.0]], vec![0]),
            Err(DataLoaderError::InputDimensionMismatch { train: 2, val: 3 })
        ));
        assert!(matches!(
            SplitData::new(x.clone(), y.clone(), Array2::zeros((0, 2)), vec![]),
            Err(DataLoaderError::EmptySplit("validation"))
        ));
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        assert!(matches!(
            SplitData::split(x, y, 1.0, &mut rng),
            Err(DataLoaderError::InvalidFraction(_))
        ));
    }
}
