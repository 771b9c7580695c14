//! Floating-point element type used by every layer, loss and optimizer
use ndarray::NdFloat;

/// The numeric precision a network is computed in, `f32` or `f64`.
///
/// A thin layer over the `NumCast`/`ToPrimitive` conversions every `NdFloat` already carries.
pub trait Scalar: NdFloat {
    /// Converts a hyperparameter or constant into this precision
    fn cast(v: f64) -> Self;
    fn as_f64(self) -> f64;
}

impl<F: NdFloat> Scalar for F {
    fn cast(v: f64) -> Self {
        F::from(v).unwrap_or_else(F::nan)
    }

    fn as_f64(self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }
}
