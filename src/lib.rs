//! Fully-connected neural networks for multiclass classification, built from explicit
//! forward/backward layer primitives on `ndarray` arrays.
//!
//! Every computation is generic over the element type ([`scalar::Scalar`], `f32` or `f64`).

pub mod dataloader;
pub mod datasets;
pub mod gradient_check;
pub mod layer_utils;
pub mod layers;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod params;
pub mod scalar;
pub mod solver;
