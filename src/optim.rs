//! Optimizer update rules
//!
//! Every rule maps `(w, dw, config)` to `(next_w, next_config)`: the config carries the rule's
//! hyperparameters together with its per-parameter state (velocity, moment estimates, ...).
//! Nothing is mutated in place; the caller replaces the parameter and the config with the
//! returned values. One config is kept per parameter, with state shaped like that parameter.

use ndarray::ArrayD;
use thiserror::Error;

use crate::scalar::Scalar;

/// Errors for the update rules
#[derive(Debug, Error)]
pub enum OptimError {
    #[error("Missing required hyperparameter '{0}'")]
    MissingHyperparameter(&'static str),
    #[error("Invalid value {value} for hyperparameter '{name}'")]
    InvalidHyperparameter { name: &'static str, value: f64 },
    #[error("Shape mismatch in {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

/// Which update rule to train with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum UpdateRule {
    #[default]
    Sgd,
    SgdMomentum,
    Rmsprop,
    Adam,
}

/// User-supplied hyperparameters. `learning_rate` is required, unset fields fall back to
/// momentum `0.9`, decay rate `0.99`, beta1 `0.9`, beta2 `0.999` and epsilon `1e-8`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OptimSettings {
    pub learning_rate: Option<f64>,
    pub momentum: Option<f64>,
    pub decay_rate: Option<f64>,
    pub beta1: Option<f64>,
    pub beta2: Option<f64>,
    pub epsilon: Option<f64>,
}

impl OptimSettings {
    pub fn with_learning_rate(learning_rate: f64) -> Self {
        Self {
            learning_rate: Some(learning_rate),
            ..Self::default()
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<f64, OptimError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(OptimError::InvalidHyperparameter { name, value })
    }
}

/// Accepts values in `[0, 1)`
fn rate(name: &'static str, value: f64) -> Result<f64, OptimError> {
    if (0.0..1.0).contains(&value) {
        Ok(value)
    } else {
        Err(OptimError::InvalidHyperparameter { name, value })
    }
}

fn check_shapes<T>(
    w: &ArrayD<T>,
    dw: &ArrayD<T>,
    state: Option<&ArrayD<T>>,
) -> Result<(), OptimError> {
    if dw.shape() != w.shape() {
        return Err(OptimError::ShapeMismatch {
            what: "gradient",
            expected: w.shape().to_vec(),
            got: dw.shape().to_vec(),
        });
    }
    match state {
        Some(state) if state.shape() != w.shape() => Err(OptimError::ShapeMismatch {
            what: "optimizer state",
            expected: w.shape().to_vec(),
            got: state.shape().to_vec(),
        }),
        _ => Ok(()),
    }
}

/// Vanilla stochastic gradient descent
#[derive(Debug, Clone, PartialEq)]
pub struct SgdConfig<T> {
    pub learning_rate: T,
}

/// SGD with momentum
#[derive(Debug, Clone, PartialEq)]
pub struct MomentumConfig<T> {
    pub learning_rate: T,
    pub momentum: T,
    pub velocity: ArrayD<T>,
}

/// RMSProp: divides the step by a running average of squared gradients
#[derive(Debug, Clone, PartialEq)]
pub struct RmspropConfig<T> {
    pub learning_rate: T,
    pub decay_rate: T,
    pub epsilon: T,
    pub cache: ArrayD<T>,
}

/// Adam: bias-corrected running averages of the gradient and its square
#[derive(Debug, Clone, PartialEq)]
pub struct AdamConfig<T> {
    pub learning_rate: T,
    pub beta1: T,
    pub beta2: T,
    pub epsilon: T,
    pub m: ArrayD<T>,
    pub v: ArrayD<T>,
    pub t: i32,
}

/// `w - learning_rate * dw`
pub fn sgd<T: Scalar>(
    w: &ArrayD<T>,
    dw: &ArrayD<T>,
    config: SgdConfig<T>,
) -> Result<(ArrayD<T>, SgdConfig<T>), OptimError> {
    check_shapes(w, dw, None)?;
    let next_w = w - &(dw * config.learning_rate);
    Ok((next_w, config))
}

/// `v = momentum * v - learning_rate * dw; w + v`
pub fn sgd_momentum<T: Scalar>(
    w: &ArrayD<T>,
    dw: &ArrayD<T>,
    config: MomentumConfig<T>,
) -> Result<(ArrayD<T>, MomentumConfig<T>), OptimError> {
    check_shapes(w, dw, Some(&config.velocity))?;
    let MomentumConfig {
        learning_rate,
        momentum,
        velocity,
    } = config;
    let velocity = velocity * momentum - &(dw * learning_rate);
    let next_w = w + &velocity;
    Ok((
        next_w,
        MomentumConfig {
            learning_rate,
            momentum,
            velocity,
        },
    ))
}

/// `cache = decay * cache + (1 - decay) * dw^2; w - learning_rate * dw / (sqrt(cache) + eps)`
pub fn rmsprop<T: Scalar>(
    w: &ArrayD<T>,
    dw: &ArrayD<T>,
    config: RmspropConfig<T>,
) -> Result<(ArrayD<T>, RmspropConfig<T>), OptimError> {
    check_shapes(w, dw, Some(&config.cache))?;
    let RmspropConfig {
        learning_rate,
        decay_rate,
        epsilon,
        cache,
    } = config;
    let cache = cache * decay_rate + &(dw.mapv(|g| g * g) * (T::one() - decay_rate));
    let step = dw * learning_rate / &cache.mapv(|c| c.sqrt() + epsilon);
    let next_w = w - &step;
    Ok((
        next_w,
        RmspropConfig {
            learning_rate,
            decay_rate,
            epsilon,
            cache,
        },
    ))
}

/// Adam. The timestep is incremented before it is used for bias correction.
pub fn adam<T: Scalar>(
    w: &ArrayD<T>,
    dw: &ArrayD<T>,
    config: AdamConfig<T>,
) -> Result<(ArrayD<T>, AdamConfig<T>), OptimError> {
    check_shapes(w, dw, Some(&config.m))?;
    check_shapes(w, dw, Some(&config.v))?;
    let AdamConfig {
        learning_rate,
        beta1,
        beta2,
        epsilon,
        m,
        v,
        t,
    } = config;
    let t = t + 1;
    let m = m * beta1 + &(dw * (T::one() - beta1));
    let v = v * beta2 + &(dw.mapv(|g| g * g) * (T::one() - beta2));
    let m_hat = &m / (T::one() - beta1.powi(t));
    let v_hat = &v / (T::one() - beta2.powi(t));
    let step = m_hat * learning_rate / &v_hat.mapv(|s| s.sqrt() + epsilon);
    let next_w = w - &step;
    Ok((
        next_w,
        AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            m,
            v,
            t,
        },
    ))
}

/// An update rule together with its hyperparameters and state for one parameter
#[derive(Debug, Clone, PartialEq)]
pub enum OptimConfig<T> {
    Sgd(SgdConfig<T>),
    SgdMomentum(MomentumConfig<T>),
    Rmsprop(RmspropConfig<T>),
    Adam(AdamConfig<T>),
}

impl<T: Scalar> OptimConfig<T> {
    /// Builds the config for a parameter of the given shape with zero-initialized state.
    /// Fails if the learning rate is missing or a hyperparameter is out of range.
    pub fn new(
        rule: UpdateRule,
        settings: &OptimSettings,
        shape: &[usize],
    ) -> Result<Self, OptimError> {
        let learning_rate = settings
            .learning_rate
            .ok_or(OptimError::MissingHyperparameter("learning_rate"))?;
        let learning_rate = T::cast(positive("learning_rate", learning_rate)?);
        let zeros = || ArrayD::zeros(shape);

        let config = match rule {
            UpdateRule::Sgd => OptimConfig::Sgd(SgdConfig { learning_rate }),
            UpdateRule::SgdMomentum => OptimConfig::SgdMomentum(MomentumConfig {
                learning_rate,
                momentum: T::cast(rate("momentum", settings.momentum.unwrap_or(0.9))?),
                velocity: zeros(),
            }),
            UpdateRule::Rmsprop => OptimConfig::Rmsprop(RmspropConfig {
                learning_rate,
                decay_rate: T::cast(rate("decay_rate", settings.decay_rate.unwrap_or(0.99))?),
                epsilon: T::cast(positive("epsilon", settings.epsilon.unwrap_or(1e-8))?),
                cache: zeros(),
            }),
            UpdateRule::Adam => OptimConfig::Adam(AdamConfig {
                learning_rate,
                beta1: T::cast(rate("beta1", settings.beta1.unwrap_or(0.9))?),
                beta2: T::cast(rate("beta2", settings.beta2.unwrap_or(0.999))?),
                epsilon: T::cast(positive("epsilon", settings.epsilon.unwrap_or(1e-8))?),
                m: zeros(),
                v: zeros(),
                t: 0,
            }),
        };
        Ok(config)
    }

    /// Applies one step of the rule, returning the next parameter value and the next config
    pub fn update(self, w: &ArrayD<T>, dw: &ArrayD<T>) -> Result<(ArrayD<T>, Self), OptimError> {
        match self {
            OptimConfig::Sgd(c) => sgd(w, dw, c).map(|(w, c)| (w, OptimConfig::Sgd(c))),
            OptimConfig::SgdMomentum(c) => {
                sgd_momentum(w, dw, c).map(|(w, c)| (w, OptimConfig::SgdMomentum(c)))
            }
            OptimConfig::Rmsprop(c) => {
                rmsprop(w, dw, c).map(|(w, c)| (w, OptimConfig::Rmsprop(c)))
            }
            OptimConfig::Adam(c) => adam(w, dw, c).map(|(w, c)| (w, OptimConfig::Adam(c))),
        }
    }

    pub fn rule(&self) -> UpdateRule {
        match self {
            OptimConfig::Sgd(_) => UpdateRule::Sgd,
            OptimConfig::SgdMomentum(_) => UpdateRule::SgdMomentum,
            OptimConfig::Rmsprop(_) => UpdateRule::Rmsprop,
            OptimConfig::Adam(_) => UpdateRule::Adam,
        }
    }

    pub fn learning_rate(&self) -> T {
        match self {
            OptimConfig::Sgd(c) => c.learning_rate,
            OptimConfig::SgdMomentum(c) => c.learning_rate,
            OptimConfig::Rmsprop(c) => c.learning_rate,
            OptimConfig::Adam(c) => c.learning_rate,
        }
    }

    /// Multiplies the learning rate by `factor` (learning rate decay)
    pub fn decay_learning_rate(&mut self, factor: T) {
        let lr = match self {
            OptimConfig::Sgd(c) => &mut c.learning_rate,
            OptimConfig::SgdMomentum(c) => &mut c.learning_rate,
            OptimConfig::Rmsprop(c) => &mut c.learning_rate,
            OptimConfig::Adam(c) => &mut c.learning_rate,
        };
        *lr *= factor;
    }
}
