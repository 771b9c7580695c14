//! Fully-connected classification network
//!
//! A network with `L - 1` hidden layers computes
//!
//! ```text
//! {affine -> [batchnorm] -> relu -> [dropout]} x (L - 1) -> affine -> loss
//! ```
//!
//! where batch normalization and dropout are optional. Parameters live in a [`ParamStore`]
//! under the keys `W1..WL`, `b1..bL` and, with batch normalization, `gamma1..gamma{L-1}` and
//! `beta1..beta{L-1}`.

use ndarray::{Array1, Array2, ArrayView, ArrayView2, Axis, CowArray, Dimension, Ix2};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    layer_utils::{
        AffineBnReluCache, AffineReluCache, affine_bn_relu_backward, affine_bn_relu_forward,
        affine_relu_backward, affine_relu_forward,
    },
    layers::{
        AffineCache, BatchNormParam, DropoutCache, DropoutParam, LayerError, Mode, ReluCache,
        affine_backward, affine_forward, dropout_backward, dropout_forward,
    },
    loss::{Loss, LossError},
    params::{Gradients, ParamError, ParamStore},
    scalar::Scalar,
};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Invalid network configuration: {0}")]
    Config(String),
    #[error("Input size mismatch: expected {expected} features per sample, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Loss(#[from] LossError),
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Architecture and hyperparameters of a [`FullyConnectedNet`]
#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    /// Width of each hidden layer, in order. Must not be empty.
    pub hidden_dims: Vec<usize>,
    pub input_dim: usize,
    pub num_classes: usize,
    /// Standard deviation of the zero-mean Gaussian the weights are drawn from
    pub weight_scale: f64,
    /// L2 regularization strength
    pub reg: f64,
    /// Drop probability of the dropout layer after each hidden ReLU. `None` disables dropout.
    pub dropout: Option<f64>,
    pub use_batchnorm: bool,
    pub loss: Loss,
    /// Seed for weight initialization and dropout masks
    pub seed: Option<u64>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![100],
            input_dim: 3 * 32 * 32,
            num_classes: 10,
            weight_scale: 1e-2,
            reg: 0.0,
            dropout: None,
            use_batchnorm: false,
            loss: Loss::default(),
            seed: None,
        }
    }
}

impl NetConfig {
    pub fn with_hidden_dims(mut self, hidden_dims: Vec<usize>) -> Self {
        self.hidden_dims = hidden_dims;
        self
    }

    pub fn with_input_dim(mut self, input_dim: usize) -> Self {
        self.input_dim = input_dim;
        self
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    pub fn with_weight_scale(mut self, weight_scale: f64) -> Self {
        self.weight_scale = weight_scale;
        self
    }

    pub fn with_reg(mut self, reg: f64) -> Self {
        self.reg = reg;
        self
    }

    pub fn with_dropout(mut self, p: f64) -> Self {
        self.dropout = Some(p);
        self
    }

    pub fn with_batchnorm(mut self, use_batchnorm: bool) -> Self {
        self.use_batchnorm = use_batchnorm;
        self
    }

    pub fn with_loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Layer sizes from input to output: `[input_dim, hidden_dims.., num_classes]`
    pub fn layer_dims(&self) -> Vec<usize> {
        std::iter::once(self.input_dim)
            .chain(self.hidden_dims.iter().copied())
            .chain(std::iter::once(self.num_classes))
            .collect()
    }

    pub fn validate(&self) -> Result<(), NNError> {
        if self.hidden_dims.is_empty() {
            return Err(NNError::Config(
                "at least one hidden layer is required".to_string(),
            ));
        }
        if let Some(i) = self.layer_dims().iter().position(|&d| d == 0) {
            return Err(NNError::Config(format!(
                "layer dimension {i} must be positive, got 0"
            )));
        }
        if !(self.weight_scale.is_finite() && self.weight_scale > 0.0) {
            return Err(NNError::Config(format!(
                "weight_scale must be positive, got {}",
                self.weight_scale
            )));
        }
        if !(self.reg.is_finite() && self.reg >= 0.0) {
            return Err(NNError::Config(format!(
                "reg must be non-negative, got {}",
                self.reg
            )));
        }
        match self.dropout {
            Some(p) if !(0.0..1.0).contains(&p) => Err(NNError::Config(format!(
                "dropout must be in [0, 1), got {p}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Snapshot of everything a network learns: parameters and batch normalization statistics
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint<T> {
    params: ParamStore<T>,
    bn_params: Vec<BatchNormParam<T>>,
}

impl<T> Checkpoint<T> {
    pub fn params(&self) -> &ParamStore<T> {
        &self.params
    }
}

enum LayerCache<T> {
    AffineRelu(AffineReluCache<T, Ix2>),
    AffineBnRelu(AffineBnReluCache<T, Ix2>),
}

impl<T> LayerCache<T> {
    fn relu(&self) -> &ReluCache<T, Ix2> {
        match self {
            LayerCache::AffineRelu(c) => &c.relu,
            LayerCache::AffineBnRelu(c) => &c.relu,
        }
    }
}

struct HiddenCache<T> {
    layer: LayerCache<T>,
    dropout: Option<DropoutCache<T, Ix2>>,
}

struct ForwardPass<T> {
    scores: Array2<T>,
    hidden: Vec<HiddenCache<T>>,
    output: AffineCache<T, Ix2>,
    bn_params: Vec<BatchNormParam<T>>,
}

/// A fully-connected network with ReLU nonlinearities and a softmax or SVM loss
#[derive(Debug, Clone)]
pub struct FullyConnectedNet<T> {
    config: NetConfig,
    reg: T,
    params: ParamStore<T>,
    /// One per hidden layer when batch normalization is enabled, empty otherwise
    bn_params: Vec<BatchNormParam<T>>,
    rng: Pcg64Mcg,
}

impl<T: Scalar> FullyConnectedNet<T> {
    /// Builds the network, drawing weights from `N(0, weight_scale^2)` and setting biases to
    /// zero (batch normalization scales to one and shifts to zero).
    pub fn new(config: NetConfig) -> Result<Self, NNError> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => Pcg64Mcg::seed_from_u64(seed),
            None => Pcg64Mcg::from_rng(&mut rand::rng()),
        };
        let normal =
            Normal::new(0.0, config.weight_scale).map_err(|e| NNError::Config(e.to_string()))?;

        let dims = config.layer_dims();
        let num_hidden = config.hidden_dims.len();
        let mut params = ParamStore::new();
        let mut bn_params = Vec::new();
        for (i, pair) in dims.windows(2).enumerate() {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let layer = i + 1;
            let w = Array2::from_shape_simple_fn((fan_in, fan_out), || {
                T::cast(normal.sample(&mut rng))
            });
            params.insert(format!("W{layer}"), w.into_dyn());
            params.insert(format!("b{layer}"), Array1::<T>::zeros(fan_out).into_dyn());
            if config.use_batchnorm && layer <= num_hidden {
                params.insert(format!("gamma{layer}"), Array1::<T>::ones(fan_out).into_dyn());
                params.insert(format!("beta{layer}"), Array1::<T>::zeros(fan_out).into_dyn());
                bn_params.push(BatchNormParam::new(fan_out));
            }
        }
        log::debug!(
            "Initialized network with layer sizes {:?} ({} parameters)",
            dims,
            params.n_elements()
        );

        Ok(Self {
            reg: T::cast(config.reg),
            config,
            params,
            bn_params,
            rng,
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.config.hidden_dims.len() + 1
    }

    pub fn params(&self) -> &ParamStore<T> {
        &self.params
    }

    /// Mutable access for updates. [`ParamStore::replace`] keeps keys and shapes fixed.
    pub fn params_mut(&mut self) -> &mut ParamStore<T> {
        &mut self.params
    }

    pub fn bn_params(&self) -> &[BatchNormParam<T>] {
        &self.bn_params
    }

    pub fn reg(&self) -> T {
        self.reg
    }

    pub fn set_reg(&mut self, reg: f64) -> Result<(), NNError> {
        if !(reg.is_finite() && reg >= 0.0) {
            return Err(NNError::Config(format!(
                "reg must be non-negative, got {reg}"
            )));
        }
        self.config.reg = reg;
        self.reg = T::cast(reg);
        Ok(())
    }

    /// Reseeds the generator used for dropout masks
    pub fn reseed(&mut self, seed: u64) {
        self.rng = Pcg64Mcg::seed_from_u64(seed);
    }

    pub fn checkpoint(&self) -> Checkpoint<T> {
        Checkpoint {
            params: self.params.clone(),
            bn_params: self.bn_params.clone(),
        }
    }

    /// Restores a checkpoint taken from a network of the same architecture. A checkpoint
    /// with different parameter keys or shapes is rejected and the network is left as is.
    pub fn restore(&mut self, checkpoint: Checkpoint<T>) -> Result<(), NNError> {
        self.params.check_layout(&checkpoint.params)?;
        if checkpoint.bn_params.len() != self.bn_params.len() {
            return Err(NNError::Config(format!(
                "checkpoint has {} batch normalization layers, expected {}",
                checkpoint.bn_params.len(),
                self.bn_params.len()
            )));
        }
        for (layer, (current, restored)) in
            self.bn_params.iter().zip(&checkpoint.bn_params).enumerate()
        {
            for (name, expected, got) in [
                ("running_mean", &current.running_mean, &restored.running_mean),
                ("running_var", &current.running_var, &restored.running_var),
            ] {
                if expected.shape() != got.shape() {
                    return Err(ParamError::ShapeMismatch {
                        key: format!("{name}{}", layer + 1),
                        expected: expected.shape().to_vec(),
                        got: got.shape().to_vec(),
                    }
                    .into());
                }
            }
        }
        self.params = checkpoint.params;
        self.bn_params = checkpoint.bn_params;
        Ok(())
    }

    /// Views an `(N, d_1, ..., d_k)` input as an `(N, input_dim)` batch
    fn as_batch<'a, D: Dimension>(
        &self,
        x: &'a ArrayView<'_, T, D>,
    ) -> Result<CowArray<'a, T, Ix2>, NNError> {
        let shape = x.shape();
        let n = shape.first().copied().unwrap_or(0);
        let got: usize = shape.iter().skip(1).product();
        if shape.len() < 2 || got != self.config.input_dim {
            return Err(NNError::InputSizeMismatch {
                expected: self.config.input_dim,
                got,
            });
        }
        Ok(x.to_shape((n, got)).map_err(LayerError::from)?)
    }

    fn forward<R: Rng + ?Sized>(
        &self,
        x: ArrayView2<T>,
        mode: Mode,
        rng: &mut R,
    ) -> Result<ForwardPass<T>, NNError> {
        let num_hidden = self.config.hidden_dims.len();
        let mut hidden = Vec::with_capacity(num_hidden);
        let mut bn_params = Vec::with_capacity(self.bn_params.len());
        let mut h = CowArray::from(x);

        for i in 0..num_hidden {
            let layer = i + 1;
            let w = self.params.matrix(&format!("W{layer}"))?;
            let b = self.params.vector(&format!("b{layer}"))?;
            let (out, cache) = if self.config.use_batchnorm {
                let gamma = self.params.vector(&format!("gamma{layer}"))?;
                let beta = self.params.vector(&format!("beta{layer}"))?;
                let (out, cache, bn_param) =
                    affine_bn_relu_forward(h.view(), w, b, gamma, beta, &self.bn_params[i], mode)?;
                bn_params.push(bn_param);
                (out, LayerCache::AffineBnRelu(cache))
            } else {
                let (out, cache) = affine_relu_forward(h.view(), w, b)?;
                (out, LayerCache::AffineRelu(cache))
            };

            let relu = cache.relu();
            log::debug!(
                "Hidden layer {layer}: {}/{} ReLU units inactive",
                relu.n_inactive(),
                relu.len()
            );

            let (out, dropout) = match self.config.dropout {
                Some(p) => {
                    let (out, cache) = dropout_forward(out.view(), DropoutParam { p, mode }, rng)?;
                    (out, Some(cache))
                }
                None => (out, None),
            };
            hidden.push(HiddenCache {
                layer: cache,
                dropout,
            });
            h = CowArray::from(out);
        }

        let last = num_hidden + 1;
        let (scores, output) = affine_forward(
            h.view(),
            self.params.matrix(&format!("W{last}"))?,
            self.params.vector(&format!("b{last}"))?,
        )?;
        Ok(ForwardPass {
            scores,
            hidden,
            output,
            bn_params,
        })
    }

    /// Class scores of shape `(N, num_classes)` with test-time behavior: dropout is disabled
    /// and batch normalization uses its running statistics.
    pub fn scores<D: Dimension>(&self, x: ArrayView<T, D>) -> Result<Array2<T>, NNError> {
        let batch = self.as_batch(&x)?;
        // test mode draws no random numbers
        let mut rng = self.rng.clone();
        Ok(self.forward(batch.view(), Mode::Test, &mut rng)?.scores)
    }

    /// Predicted class of every sample (argmax of its scores)
    pub fn predict<D: Dimension>(&self, x: ArrayView<T, D>) -> Result<Vec<usize>, NNError> {
        let scores = self.scores(x)?;
        Ok(scores
            .axis_iter(Axis(0))
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, T::neg_infinity()), |(best, max), (j, &v)| {
                        if v > max { (j, v) } else { (best, max) }
                    })
                    .0
            })
            .collect())
    }

    /// Training loss and the gradient of every parameter.
    ///
    /// Runs the train-time forward pass (fresh dropout masks, batch statistics), adds the L2
    /// penalty `0.5 * reg * sum(W^2)` over the weights (not biases, scales or shifts) and
    /// backpropagates through every layer. Batch normalization running statistics are
    /// updated as a side effect. The returned gradients have exactly the keys and shapes of
    /// [`Self::params`].
    pub fn loss<D: Dimension>(
        &mut self,
        x: ArrayView<T, D>,
        y: &[usize],
    ) -> Result<(T, Gradients<T>), NNError> {
        let batch = self.as_batch(&x)?;
        let mut rng = self.rng.clone();
        let ForwardPass {
            scores,
            hidden,
            output,
            bn_params,
        } = self.forward(batch.view(), Mode::Train, &mut rng)?;
        let (data_loss, dscores) = self.config.loss.call(scores.view(), y)?;

        let mut grads = Gradients::new();
        let last = hidden.len() + 1;
        let (mut dh, dw, db) = affine_backward(dscores.view(), output)?;
        let mut sum_sq = self.insert_affine_grads(&mut grads, last, dw, db)?;

        for (i, cache) in hidden.into_iter().enumerate().rev() {
            let layer = i + 1;
            let dh_relu = match cache.dropout {
                Some(dropout) => dropout_backward(dh.view(), dropout)?,
                None => dh,
            };
            let (dx, dw, db) = match cache.layer {
                LayerCache::AffineRelu(c) => affine_relu_backward(dh_relu.view(), c)?,
                LayerCache::AffineBnRelu(c) => {
                    let (dx, dw, db, dgamma, dbeta) = affine_bn_relu_backward(dh_relu.view(), c)?;
                    grads.insert(format!("gamma{layer}"), dgamma.into_dyn());
                    grads.insert(format!("beta{layer}"), dbeta.into_dyn());
                    (dx, dw, db)
                }
            };
            sum_sq += self.insert_affine_grads(&mut grads, layer, dw, db)?;
            dh = dx;
        }
        self.params.check_gradients(&grads)?;

        self.bn_params = bn_params;
        self.rng = rng;
        let loss = data_loss + T::cast(0.5) * self.reg * sum_sq;
        Ok((loss, grads))
    }

    /// Stores the gradients of layer `layer`'s affine transform, adding `reg * W` to the
    /// weight gradient. Returns `sum(W^2)` for the regularization loss.
    fn insert_affine_grads(
        &self,
        grads: &mut Gradients<T>,
        layer: usize,
        mut dw: Array2<T>,
        db: Array1<T>,
    ) -> Result<T, NNError> {
        let w = self.params.matrix(&format!("W{layer}"))?;
        dw.scaled_add(self.reg, &w);
        grads.insert(format!("W{layer}"), dw.into_dyn());
        grads.insert(format!("b{layer}"), db.into_dyn());
        Ok(w.iter().fold(T::zero(), |acc, &v| acc + v * v))
    }
}
