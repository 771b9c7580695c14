//! Layer primitives
//!
//! Each layer is a pair of stateless functions. `*_forward` computes the output and a cache
//! record holding exactly what the matching `*_backward` needs. The backward pass takes the
//! cache by value, so a cache is consumed by the one backward call it was produced for.

use ndarray::{
    Array, Array1, Array2, ArrayBase, ArrayView, ArrayView1, ArrayView2, Axis, CowArray, Data,
    Dimension, Ix2, ShapeError, Zip,
};
use rand::Rng;
use thiserror::Error;

use crate::scalar::Scalar;

/// Errors raised by layer primitives
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("Shape mismatch in {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Cannot normalize an empty batch")]
    EmptyBatch,
    #[error("Dropout probability must be in [0, 1), got {0}")]
    InvalidDropout(f64),
    #[error(transparent)]
    Reshape(#[from] ShapeError),
}

pub(crate) fn check_shape(
    what: &'static str,
    expected: &[usize],
    got: &[usize],
) -> Result<(), LayerError> {
    if expected != got {
        return Err(LayerError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            got: got.to_vec(),
        });
    }
    Ok(())
}

/// Whether a layer runs with training-time or test-time behavior.
/// Only dropout and batch normalization behave differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Test,
}

/// Views an `(N, d_1, ..., d_k)` input as an `(N, d_1 * ... * d_k)` matrix
fn flatten_rows<'a, T, S, D>(
    x: &'a ArrayBase<S, D>,
    features: usize,
) -> Result<CowArray<'a, T, Ix2>, LayerError>
where
    T: Scalar,
    S: Data<Elem = T>,
    D: Dimension,
{
    let shape = x.shape();
    let Some((&n, rest)) = shape.split_first() else {
        return Err(LayerError::ShapeMismatch {
            what: "affine input",
            expected: vec![0, features],
            got: vec![],
        });
    };
    let d: usize = rest.iter().product();
    if d != features {
        return Err(LayerError::ShapeMismatch {
            what: "affine input",
            expected: vec![n, features],
            got: shape.to_vec(),
        });
    }
    Ok(x.to_shape((n, d))?)
}

/// Values saved by [`affine_forward`]
#[derive(Debug, Clone)]
pub struct AffineCache<T, D: ndarray::Dimension> {
    x: Array<T, D>,
    w: Array2<T>,
}

/// Fully-connected layer: `out = reshape(x, (N, D)) . w + b`
///
/// `x` may have any number of trailing dimensions as long as their product equals the number
/// of rows of `w`.
pub fn affine_forward<T: Scalar, D: Dimension>(
    x: ArrayView<T, D>,
    w: ArrayView2<T>,
    b: ArrayView1<T>,
) -> Result<(Array2<T>, AffineCache<T, D>), LayerError> {
    check_shape("affine bias", &[w.ncols()], b.shape())?;
    let out = {
        let x2 = flatten_rows(&x, w.nrows())?;
        x2.dot(&w) + &b
    };
    let cache = AffineCache {
        x: x.to_owned(),
        w: w.to_owned(),
    };
    Ok((out, cache))
}

/// Returns `(dx, dw, db)`, with `dx` in the original (unflattened) input shape
pub fn affine_backward<T: Scalar, D: Dimension>(
    dout: ArrayView2<T>,
    cache: AffineCache<T, D>,
) -> Result<(Array<T, D>, Array2<T>, Array1<T>), LayerError> {
    let AffineCache { x, w } = cache;
    let x2 = flatten_rows(&x, w.nrows())?;
    check_shape(
        "affine upstream gradient",
        &[x2.nrows(), w.ncols()],
        dout.shape(),
    )?;
    let dx = dout.dot(&w.t()).into_shape_with_order(x.raw_dim())?;
    let dw = x2.t().dot(&dout);
    let db = dout.sum_axis(Axis(0));
    Ok((dx, dw, db))
}

/// Values saved by [`relu_forward`]: the pre-activation input
#[derive(Debug, Clone)]
pub struct ReluCache<T, D: ndarray::Dimension> {
    x: Array<T, D>,
}

impl<T: Scalar, D: Dimension> ReluCache<T, D> {
    /// Number of units that were not active (used for debugging dead neurons)
    pub fn n_inactive(&self) -> usize {
        self.x.iter().filter(|v| **v <= T::zero()).count()
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

pub fn relu_forward<T: Scalar, D: Dimension>(
    x: ArrayView<T, D>,
) -> (Array<T, D>, ReluCache<T, D>) {
    let out = x.mapv(|v| if v > T::zero() { v } else { T::zero() });
    (out, ReluCache { x: x.to_owned() })
}

/// Passes the upstream gradient through where the input was strictly positive.
/// The sub-gradient at exactly zero is zero.
pub fn relu_backward<T: Scalar, D: Dimension>(
    dout: ArrayView<T, D>,
    cache: ReluCache<T, D>,
) -> Result<Array<T, D>, LayerError> {
    check_shape("relu upstream gradient", cache.x.shape(), dout.shape())?;
    let mut dx = dout.to_owned();
    Zip::from(&mut dx).and(&cache.x).for_each(|d, &x| {
        if x <= T::zero() {
            *d = T::zero();
        }
    });
    Ok(dx)
}

/// Configuration of an inverted dropout layer. `p` is the probability of dropping a unit.
#[derive(Debug, Clone, Copy)]
pub struct DropoutParam {
    pub p: f64,
    pub mode: Mode,
}

/// The scaled keep-mask used at train time, `None` at test time
#[derive(Debug, Clone)]
pub struct DropoutCache<T, D: ndarray::Dimension> {
    mask: Option<Array<T, D>>,
}

/// Inverted dropout. At train time each unit is kept with probability `1 - p` and kept units
/// are scaled by `1 / (1 - p)`, so test time is the identity.
pub fn dropout_forward<T, D, R>(
    x: ArrayView<T, D>,
    param: DropoutParam,
    rng: &mut R,
) -> Result<(Array<T, D>, DropoutCache<T, D>), LayerError>
where
    T: Scalar,
    D: Dimension,
    R: Rng + ?Sized,
{
    if !(0.0..1.0).contains(&param.p) {
        return Err(LayerError::InvalidDropout(param.p));
    }
    match param.mode {
        Mode::Train => {
            let keep = 1.0 - param.p;
            let scale = T::cast(1.0 / keep);
            let mask = Array::from_shape_simple_fn(x.raw_dim(), || {
                if rng.random::<f64>() < keep {
                    scale
                } else {
                    T::zero()
                }
            });
            let out = &x * &mask;
            Ok((out, DropoutCache { mask: Some(mask) }))
        }
        Mode::Test => Ok((x.to_owned(), DropoutCache { mask: None })),
    }
}

pub fn dropout_backward<T: Scalar, D: Dimension>(
    dout: ArrayView<T, D>,
    cache: DropoutCache<T, D>,
) -> Result<Array<T, D>, LayerError> {
    match cache.mask {
        Some(mask) => {
            check_shape("dropout upstream gradient", mask.shape(), dout.shape())?;
            Ok(&dout * &mask)
        }
        None => Ok(dout.to_owned()),
    }
}

/// Running statistics and constants of one batch normalization layer
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormParam<T> {
    pub eps: T,
    pub momentum: T,
    pub running_mean: Array1<T>,
    pub running_var: Array1<T>,
}

impl<T: Scalar> BatchNormParam<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            eps: T::cast(1e-5),
            momentum: T::cast(0.9),
            running_mean: Array1::zeros(dim),
            running_var: Array1::zeros(dim),
        }
    }
}

/// Values saved by [`batchnorm_forward`]
#[derive(Debug, Clone)]
pub struct BatchNormCache<T> {
    x_hat: Array2<T>,
    gamma: Array1<T>,
    inv_std: Array1<T>,
    mode: Mode,
}

/// Batch normalization over the rows of `x`.
///
/// Train mode normalizes with the batch mean and (biased) batch variance and returns running
/// statistics updated as `running = momentum * running + (1 - momentum) * batch`. Test mode
/// normalizes with the running statistics and returns them unchanged. The caller replaces its
/// stored parameter with the returned one.
pub fn batchnorm_forward<T: Scalar>(
    x: ArrayView2<T>,
    gamma: ArrayView1<T>,
    beta: ArrayView1<T>,
    param: &BatchNormParam<T>,
    mode: Mode,
) -> Result<(Array2<T>, BatchNormCache<T>, BatchNormParam<T>), LayerError> {
    let d = x.ncols();
    check_shape("batchnorm gamma", &[d], gamma.shape())?;
    check_shape("batchnorm beta", &[d], beta.shape())?;
    check_shape("batchnorm running mean", &[d], param.running_mean.shape())?;
    check_shape("batchnorm running variance", &[d], param.running_var.shape())?;

    let (x_hat, inv_std, updated) = match mode {
        Mode::Train => {
            if x.nrows() == 0 {
                return Err(LayerError::EmptyBatch);
            }
            let n = T::cast(x.nrows() as f64);
            let mean = x.sum_axis(Axis(0)) / n;
            let centered = &x - &mean;
            let var = centered.mapv(|v| v * v).sum_axis(Axis(0)) / n;
            let inv_std = var.mapv(|v| T::one() / (v + param.eps).sqrt());
            let x_hat = &centered * &inv_std;

            let m = param.momentum;
            let updated = BatchNormParam {
                eps: param.eps,
                momentum: m,
                running_mean: &param.running_mean * m + &mean * (T::one() - m),
                running_var: &param.running_var * m + &var * (T::one() - m),
            };
            (x_hat, inv_std, updated)
        }
        Mode::Test => {
            let inv_std = param
                .running_var
                .mapv(|v| T::one() / (v + param.eps).sqrt());
            let x_hat = (&x - &param.running_mean) * &inv_std;
            (x_hat, inv_std, param.clone())
        }
    };

    let out = &x_hat * &gamma + &beta;
    let cache = BatchNormCache {
        x_hat,
        gamma: gamma.to_owned(),
        inv_std,
        mode,
    };
    Ok((out, cache, updated))
}

/// Returns `(dx, dgamma, dbeta)`
pub fn batchnorm_backward<T: Scalar>(
    dout: ArrayView2<T>,
    cache: BatchNormCache<T>,
) -> Result<(Array2<T>, Array1<T>, Array1<T>), LayerError> {
    let BatchNormCache {
        x_hat,
        gamma,
        inv_std,
        mode,
    } = cache;
    check_shape("batchnorm upstream gradient", x_hat.shape(), dout.shape())?;

    let dbeta = dout.sum_axis(Axis(0));
    let dgamma = (&dout * &x_hat).sum_axis(Axis(0));
    let dx_hat = &dout * &gamma;

    let dx = match mode {
        // running statistics are constants w.r.t. x
        Mode::Test => dx_hat * &inv_std,
        Mode::Train => {
            let n = T::cast(x_hat.nrows() as f64);
            let sum_dx_hat = dx_hat.sum_axis(Axis(0));
            let sum_dx_hat_x_hat = (&dx_hat * &x_hat).sum_axis(Axis(0));
            (&dx_hat * n - &sum_dx_hat - &x_hat * &sum_dx_hat_x_hat) * &inv_std / n
        }
    };
    Ok((dx, dgamma, dbeta))
}
