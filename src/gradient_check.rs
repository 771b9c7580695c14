//! Central-difference numeric gradients for verifying backward passes
//!
//! These are slow (two function evaluations per element) and are meant for tests and
//! debugging only, never for training.

use ndarray::{Array, ArrayBase, Data, Dimension, IntoDimension, Zip};

use crate::scalar::Scalar;

/// Maximum elementwise relative error `|x - y| / max(1e-8, |x| + |y|)`
pub fn rel_error<T, S1, S2, D>(x: &ArrayBase<S1, D>, y: &ArrayBase<S2, D>) -> f64
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    D: Dimension,
{
    let mut max_err = 0.0f64;
    Zip::from(x).and(y).for_each(|&a, &b| {
        let (a, b) = (a.as_f64(), b.as_f64());
        let err = (a - b).abs() / (a.abs() + b.abs()).max(1e-8);
        max_err = max_err.max(err);
    });
    max_err
}

/// Every index of `x`, in logical order
fn indices<T, D: Dimension>(x: &Array<T, D>) -> Vec<D> {
    x.indexed_iter()
        .map(|(idx, _)| idx.into_dimension())
        .collect()
}

/// Numeric gradient of a scalar function `f` at `x`
pub fn eval_numerical_gradient<T, D, F>(mut f: F, x: &Array<T, D>, h: T) -> Array<T, D>
where
    T: Scalar,
    D: Dimension,
    F: FnMut(&Array<T, D>) -> T,
{
    let mut x = x.to_owned();
    let mut grad = Array::zeros(x.raw_dim());
    let two_h = h + h;
    for idx in indices(&x) {
        let old = x[idx.clone()];
        x[idx.clone()] = old + h;
        let fxph = f(&x);
        x[idx.clone()] = old - h;
        let fxmh = f(&x);
        x[idx.clone()] = old;
        grad[idx] = (fxph - fxmh) / two_h;
    }
    grad
}

/// Numeric gradient of `sum(f(x) * df)` at `x`, for array-valued `f` with upstream gradient `df`
pub fn eval_numerical_gradient_array<T, D, E, F>(
    mut f: F,
    x: &Array<T, D>,
    df: &Array<T, E>,
    h: T,
) -> Array<T, D>
where
    T: Scalar,
    D: Dimension,
    E: Dimension,
    F: FnMut(&Array<T, D>) -> Array<T, E>,
{
    let mut x = x.to_owned();
    let mut grad = Array::zeros(x.raw_dim());
    let two_h = h + h;
    for idx in indices(&x) {
        let old = x[idx.clone()];
        x[idx.clone()] = old + h;
        let pos = f(&x);
        x[idx.clone()] = old - h;
        let neg = f(&x);
        x[idx.clone()] = old;
        grad[idx] = ((pos - neg) * df).sum() / two_h;
    }
    grad
}

#[cfg(test)]
pub mod tests {
    use ndarray::array;

    use super::*;

    /// Asserts two floats agree to within `1e-6`, or an explicit tolerance
    #[macro_export]
    macro_rules! assert_eq_float {
        ($a:expr, $b:expr) => {
            assert!((($a) - ($b)).abs() < 1e-6, "{} != {}", $a, $b);
        };
        ($a:expr, $b:expr, $tol:expr) => {
            assert!((($a) - ($b)).abs() < $tol, "{} != {}", $a, $b);
        };
    }

    #[test]
    fn test_rel_error() {
        let x = array![1.0, 2.0, 0.0];
        let y = array![1.0, 2.2, 0.0];
        assert_eq_float!(rel_error(&x, &y), 0.2 / 4.2, 1e-12);
        assert_eq!(rel_error(&x, &x), 0.0);
    }

    #[test]
    fn test_numerical_gradient_of_quadratic() {
        // f(x) = sum(x^2), df/dx = 2x
        let x = array![[1.0, -2.0], [0.5, 3.0]];
        let grad = eval_numerical_gradient(|x| x.mapv(|v| v * v).sum(), &x, 1e-5);
        assert!(rel_error(&grad, &(&x * 2.0)) < 1e-8);
    }

    #[test]
    fn test_numerical_gradient_array_of_elementwise_product() {
        // f(x) = x * c elementwise, so d sum(f(x) * df) / dx = c * df
        let x = array![1.0, 2.0, 3.0];
        let c = array![4.0, -1.0, 0.5];
        let df = array![1.0, 2.0, -3.0];
        let grad = eval_numerical_gradient_array(|x| x * &c, &x, &df, 1e-5);
        assert!(rel_error(&grad, &(&c * &df)) < 1e-8);
        // the input itself is left untouched
        assert_eq!(x, array![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_numerical_gradient_of_transposed_input() {
        // f(x) = sum(x * c), df/dx = c regardless of the memory layout of x
        let c = array![[1.0, -2.0, 0.5], [4.0, 3.0, -1.5]];
        let x = ndarray::Array2::from_shape_fn((3, 2), |(i, j)| (i * 2 + j) as f64).reversed_axes();
        let grad = eval_numerical_gradient(|x| (x * &c).sum(), &x, 1e-5);
        assert!(rel_error(&grad, &c) < 1e-8);

        let df = array![[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]];
        let grad = eval_numerical_gradient_array(|x| x * &c, &x, &df, 1e-5);
        assert!(rel_error(&grad, &(&c * &df)) < 1e-8);
    }
}
