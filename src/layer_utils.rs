//! Convenience "sandwich" layers chaining common primitive sequences
//!
//! These compose the primitives in [`crate::layers`] and add no arithmetic of their own, so
//! their outputs and gradients are exactly those of calling the primitives by hand.

use ndarray::{Array, Array1, Array2, ArrayView, ArrayView1, ArrayView2, Dimension, Ix2};

use crate::{
    layers::{
        AffineCache, BatchNormCache, BatchNormParam, LayerError, Mode, ReluCache,
        affine_backward, affine_forward, batchnorm_backward, batchnorm_forward, relu_backward,
        relu_forward,
    },
    scalar::Scalar,
};

/// Caches of the affine and ReLU halves of [`affine_relu_forward`]
#[derive(Debug, Clone)]
pub struct AffineReluCache<T, D: Dimension> {
    pub affine: AffineCache<T, D>,
    pub relu: ReluCache<T, Ix2>,
}

/// Affine transform followed by a ReLU
pub fn affine_relu_forward<T: Scalar, D: Dimension>(
    x: ArrayView<T, D>,
    w: ArrayView2<T>,
    b: ArrayView1<T>,
) -> Result<(Array2<T>, AffineReluCache<T, D>), LayerError> {
    let (a, affine) = affine_forward(x, w, b)?;
    let (out, relu) = relu_forward(a.view());
    Ok((out, AffineReluCache { affine, relu }))
}

/// Returns `(dx, dw, db)`
pub fn affine_relu_backward<T: Scalar, D: Dimension>(
    dout: ArrayView2<T>,
    cache: AffineReluCache<T, D>,
) -> Result<(Array<T, D>, Array2<T>, Array1<T>), LayerError> {
    let da = relu_backward(dout, cache.relu)?;
    affine_backward(da.view(), cache.affine)
}

/// Caches of [`affine_bn_relu_forward`]
#[derive(Debug, Clone)]
pub struct AffineBnReluCache<T, D: Dimension> {
    pub affine: AffineCache<T, D>,
    pub bn: BatchNormCache<T>,
    pub relu: ReluCache<T, Ix2>,
}

/// Affine transform, batch normalization, then ReLU. Also returns the batch normalization
/// parameter with its running statistics updated (unchanged in [`Mode::Test`]).
pub fn affine_bn_relu_forward<T: Scalar, D: Dimension>(
    x: ArrayView<T, D>,
    w: ArrayView2<T>,
    b: ArrayView1<T>,
    gamma: ArrayView1<T>,
    beta: ArrayView1<T>,
    bn_param: &BatchNormParam<T>,
    mode: Mode,
) -> Result<(Array2<T>, AffineBnReluCache<T, D>, BatchNormParam<T>), LayerError> {
    let (a, affine) = affine_forward(x, w, b)?;
    let (a_bn, bn, bn_param) = batchnorm_forward(a.view(), gamma, beta, bn_param, mode)?;
    let (out, relu) = relu_forward(a_bn.view());
    Ok((out, AffineBnReluCache { affine, bn, relu }, bn_param))
}

/// Returns `(dx, dw, db, dgamma, dbeta)`
#[allow(clippy::type_complexity)]
pub fn affine_bn_relu_backward<T: Scalar, D: Dimension>(
    dout: ArrayView2<T>,
    cache: AffineBnReluCache<T, D>,
) -> Result<(Array<T, D>, Array2<T>, Array1<T>, Array1<T>, Array1<T>), LayerError> {
    let da_bn = relu_backward(dout, cache.relu)?;
    let (da, dgamma, dbeta) = batchnorm_backward(da_bn.view(), cache.bn)?;
    let (dx, dw, db) = affine_backward(da.view(), cache.affine)?;
    Ok((dx, dw, db, dgamma, dbeta))
}
