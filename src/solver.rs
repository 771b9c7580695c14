//! Training loop
//!
//! A [`Solver`] owns a network, the data it is trained on and one [`OptimConfig`] per
//! parameter. Each iteration samples a minibatch, computes the loss and gradients and
//! replaces every parameter with the output of its update rule. Accuracy on the train and
//! validation splits is checked at the first and last iteration and at the end of every
//! epoch; the parameters with the best validation accuracy are restored when training ends.

use std::collections::BTreeMap;

use ndarray::{ArrayView2, Axis};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    dataloader::{DataLoaderError, SplitData, sample_rows},
    nn::{Checkpoint, FullyConnectedNet, NNError},
    optim::{OptimConfig, OptimError, OptimSettings, UpdateRule},
    params::ParamError,
    scalar::Scalar,
};

/// Errors for the solver
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Invalid solver configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Model(#[from] NNError),
    #[error(transparent)]
    Optim(#[from] OptimError),
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Data(#[from] DataLoaderError),
}

/// Training hyperparameters
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    pub update_rule: UpdateRule,
    /// Hyperparameters of the update rule. The learning rate is required.
    pub optim_settings: OptimSettings,
    /// Factor the learning rate is multiplied by after every epoch
    pub lr_decay: f64,
    pub num_epochs: usize,
    pub batch_size: usize,
    /// Log the loss every this many iterations, `0` to never log it
    pub print_every: usize,
    /// Subsample the training set to this many samples when checking accuracy
    pub num_train_samples: Option<usize>,
    /// Subsample the validation set to this many samples when checking accuracy
    pub num_val_samples: Option<usize>,
    pub verbose: bool,
    /// Seed for minibatch sampling and accuracy subsampling
    pub seed: Option<u64>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            update_rule: UpdateRule::default(),
            optim_settings: OptimSettings::default(),
            lr_decay: 1.0,
            num_epochs: 10,
            batch_size: 100,
            print_every: 10,
            num_train_samples: Some(1000),
            num_val_samples: None,
            verbose: true,
            seed: None,
        }
    }
}

impl SolverConfig {
    pub fn with_update_rule(mut self, update_rule: UpdateRule) -> Self {
        self.update_rule = update_rule;
        self
    }

    pub fn with_optim_settings(mut self, optim_settings: OptimSettings) -> Self {
        self.optim_settings = optim_settings;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.optim_settings.learning_rate = Some(learning_rate);
        self
    }

    pub fn with_lr_decay(mut self, lr_decay: f64) -> Self {
        self.lr_decay = lr_decay;
        self
    }

    pub fn with_num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_print_every(mut self, print_every: usize) -> Self {
        self.print_every = print_every;
        self
    }

    pub fn with_num_train_samples(mut self, num_train_samples: Option<usize>) -> Self {
        self.num_train_samples = num_train_samples;
        self
    }

    pub fn with_num_val_samples(mut self, num_val_samples: Option<usize>) -> Self {
        self.num_val_samples = num_val_samples;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validate(&self) -> Result<(), SolverError> {
        if !(self.lr_decay > 0.0 && self.lr_decay <= 1.0) {
            return Err(SolverError::Config(format!(
                "lr_decay must be in (0, 1], got {}",
                self.lr_decay
            )));
        }
        if self.num_epochs == 0 {
            return Err(SolverError::Config("num_epochs must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(SolverError::Config("batch_size must be positive".to_string()));
        }
        for (name, samples) in [
            ("num_train_samples", self.num_train_samples),
            ("num_val_samples", self.num_val_samples),
        ] {
            if samples == Some(0) {
                return Err(SolverError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Fraction of `y` predicted correctly, evaluating the model in chunks of `batch_size` rows.
/// With `num_samples` set and smaller than the data, a random subsample is evaluated.
fn accuracy<T: Scalar>(
    model: &FullyConnectedNet<T>,
    x: ArrayView2<T>,
    y: &[usize],
    num_samples: Option<usize>,
    batch_size: usize,
    rng: &mut Pcg64Mcg,
) -> Result<f64, SolverError> {
    if x.nrows() != y.len() {
        return Err(DataLoaderError::LabelLengthMismatch {
            label_len: y.len(),
            data_len: x.nrows(),
        }
        .into());
    }
    if num_samples == Some(0) {
        return Err(SolverError::Config(
            "cannot check accuracy on zero samples".to_string(),
        ));
    }
    if y.is_empty() {
        return Ok(0.0);
    }
    let subsample;
    let (x, y) = match num_samples {
        Some(n) if n < y.len() => {
            subsample = sample_rows(x, y, n, rng);
            (subsample.0.view(), subsample.1.as_slice())
        }
        _ => (x, y),
    };

    let mut correct = 0;
    for (chunk, labels) in x
        .axis_chunks_iter(Axis(0), batch_size.max(1))
        .zip(y.chunks(batch_size.max(1)))
    {
        let predicted = model.predict(chunk)?;
        correct += predicted.iter().zip(labels).filter(|(p, l)| p == l).count();
    }
    Ok(correct as f64 / y.len() as f64)
}

/// Trains a [`FullyConnectedNet`] on a [`SplitData`]
pub struct Solver<T> {
    model: FullyConnectedNet<T>,
    data: SplitData<T>,
    config: SolverConfig,
    optim_configs: BTreeMap<String, OptimConfig<T>>,
    epoch: usize,
    best_val_acc: Option<f64>,
    best_params: Option<Checkpoint<T>>,
    loss_history: Vec<T>,
    train_acc_history: Vec<f64>,
    val_acc_history: Vec<f64>,
    rng: Pcg64Mcg,
}

impl<T: Scalar> Solver<T> {
    /// Validates the configuration and builds a fresh optimizer state for every parameter
    pub fn new(
        model: FullyConnectedNet<T>,
        data: SplitData<T>,
        config: SolverConfig,
    ) -> Result<Self, SolverError> {
        config.validate()?;
        let optim_configs = model
            .params()
            .iter()
            .map(|(key, param)| {
                let optim =
                    OptimConfig::new(config.update_rule, &config.optim_settings, param.shape())?;
                Ok((key.clone(), optim))
            })
            .collect::<Result<BTreeMap<_, _>, OptimError>>()?;
        let rng = match config.seed {
            Some(seed) => Pcg64Mcg::seed_from_u64(seed),
            None => Pcg64Mcg::from_rng(&mut rand::rng()),
        };
        Ok(Self {
            model,
            data,
            config,
            optim_configs,
            epoch: 0,
            best_val_acc: None,
            best_params: None,
            loss_history: Vec::new(),
            train_acc_history: Vec::new(),
            val_acc_history: Vec::new(),
            rng,
        })
    }

    /// Makes a single gradient update on a random minibatch and returns its loss
    pub fn step(&mut self) -> Result<T, SolverError> {
        let (x_batch, y_batch) = self
            .data
            .sample_batch(self.config.batch_size, &mut self.rng);
        let (loss, grads) = self.model.loss(x_batch.view(), &y_batch)?;
        self.loss_history.push(loss);

        // every update is computed before any parameter is replaced
        let mut updates = Vec::with_capacity(self.optim_configs.len());
        for (key, config) in &self.optim_configs {
            let w = self.model.params().get(key)?;
            let dw = grads
                .get(key)
                .ok_or_else(|| ParamError::Unknown(key.clone()))?;
            updates.push((key.clone(), config.clone().update(w, dw)?));
        }
        for (key, (next_w, next_config)) in updates {
            self.model.params_mut().replace(&key, next_w)?;
            self.optim_configs.insert(key, next_config);
        }
        Ok(loss)
    }

    /// Accuracy of the current model on `(x, y)`, optionally on a random subsample of
    /// `num_samples` rows
    pub fn check_accuracy(
        &mut self,
        x: ArrayView2<T>,
        y: &[usize],
        num_samples: Option<usize>,
    ) -> Result<f64, SolverError> {
        accuracy(
            &self.model,
            x,
            y,
            num_samples,
            self.config.batch_size,
            &mut self.rng,
        )
    }

    fn record_accuracy(&mut self, num_epochs: usize) -> Result<(), SolverError> {
        let batch_size = self.config.batch_size;
        let train_acc = accuracy(
            &self.model,
            self.data.x_train(),
            self.data.y_train(),
            self.config.num_train_samples,
            batch_size,
            &mut self.rng,
        )?;
        let val_acc = accuracy(
            &self.model,
            self.data.x_val(),
            self.data.y_val(),
            self.config.num_val_samples,
            batch_size,
            &mut self.rng,
        )?;
        self.train_acc_history.push(train_acc);
        self.val_acc_history.push(val_acc);
        if self.config.verbose {
            log::info!(
                "(Epoch {} / {}) train acc: {:.6}; val_acc: {:.6}",
                self.epoch,
                num_epochs,
                train_acc,
                val_acc
            );
        }

        if self.best_val_acc.is_none_or(|best| val_acc > best) {
            log::debug!("New best validation accuracy {val_acc:.6} at epoch {}", self.epoch);
            self.best_val_acc = Some(val_acc);
            self.best_params = Some(self.model.checkpoint());
        }
        Ok(())
    }

    /// Runs `num_epochs` epochs of optimization, then restores the best parameters
    pub fn train(&mut self) -> Result<(), SolverError> {
        let num_epochs = self.config.num_epochs;
        let iterations_per_epoch = (self.data.num_train() / self.config.batch_size).max(1);
        let num_iterations = num_epochs * iterations_per_epoch;
        let lr_decay = T::cast(self.config.lr_decay);

        for t in 0..num_iterations {
            let loss = self.step()?;
            let print_every = self.config.print_every;
            if self.config.verbose && print_every > 0 && t % print_every == 0 {
                log::info!("(Iteration {} / {}) loss: {}", t + 1, num_iterations, loss);
            }

            let epoch_end = (t + 1) % iterations_per_epoch == 0;
            if epoch_end {
                self.epoch += 1;
                for config in self.optim_configs.values_mut() {
                    config.decay_learning_rate(lr_decay);
                }
            }

            if t == 0 || t + 1 == num_iterations || epoch_end {
                self.record_accuracy(num_epochs)?;
            }
        }

        if let Some(best) = &self.best_params {
            self.model.restore(best.clone())?;
        }
        Ok(())
    }

    pub fn model(&self) -> &FullyConnectedNet<T> {
        &self.model
    }

    pub fn into_model(self) -> FullyConnectedNet<T> {
        self.model
    }

    pub fn data(&self) -> &SplitData<T> {
        &self.data
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn optim_configs(&self) -> &BTreeMap<String, OptimConfig<T>> {
        &self.optim_configs
    }

    /// Number of completed epochs
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Best validation accuracy seen so far, `None` before the first accuracy check
    pub fn best_val_acc(&self) -> Option<f64> {
        self.best_val_acc
    }

    pub fn best_params(&self) -> Option<&Checkpoint<T>> {
        self.best_params.as_ref()
    }

    pub fn loss_history(&self) -> &[T] {
        &self.loss_history
    }

    pub fn train_acc_history(&self) -> &[f64] {
        &self.train_acc_history
    }

    pub fn val_acc_history(&self) -> &[f64] {
        &self.val_acc_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datasets::{Dataset, load_dataset},
        nn::NetConfig,
    };

    fn line_data(seed: u64) -> SplitData<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let (x, y) = load_dataset(Dataset::Line, 60, &mut rng);
        SplitData::split(x, y, 0.25, &mut rng).unwrap()
    }

    fn small_net(seed: u64) -> FullyConnectedNet<f64> {
        let config = NetConfig::default()
            .with_input_dim(2)
            .with_hidden_dims(vec![32])
            .with_num_classes(2)
            .with_weight_scale(1e-1)
            .with_seed(seed);
        FullyConnectedNet::new(config).unwrap()
    }

    #[test]
    fn test_train_learns_separable_data() {
        let data = line_data(0);
        let config = SolverConfig::default()
            .with_update_rule(UpdateRule::Adam)
            .with_learning_rate(1e-2)
            .with_num_epochs(50)
            .with_batch_size(30)
            .with_verbose(false)
            .with_seed(1);
        let mut solver = Solver::new(small_net(2), data, config).unwrap();
        solver.train().unwrap();

        let losses = solver.loss_history();
        let head = losses[..10].iter().sum::<f64>() / 10.0;
        let tail = losses[losses.len() - 10..].iter().sum::<f64>() / 10.0;
        assert!(tail < head, "loss went from {head} to {tail}");

        let (x, y) = (solver.data().x_train().to_owned(), solver.data().y_train().to_vec());
        let train_acc = solver.check_accuracy(x.view(), &y, None).unwrap();
        assert!(train_acc >= 0.9, "train accuracy {train_acc}");
        assert!(solver.best_val_acc().unwrap() >= 0.8);
    }

    #[test]
    fn test_train_in_single_precision() {
        let mut rng = Pcg64Mcg::seed_from_u64(21);
        let (x, y) = load_dataset::<f32, _>(Dataset::Line, 60, &mut rng);
        let data = SplitData::split(x, y, 0.25, &mut rng).unwrap();
        let net = FullyConnectedNet::<f32>::new(
            NetConfig::default()
                .with_input_dim(2)
                .with_hidden_dims(vec![16, 16])
                .with_num_classes(2)
                .with_weight_scale(1e-1)
                .with_batchnorm(true)
                .with_dropout(0.1)
                .with_seed(22),
        )
        .unwrap();
        let config = SolverConfig::default()
            .with_update_rule(UpdateRule::Adam)
            .with_learning_rate(1e-2)
            .with_num_epochs(10)
            .with_batch_size(30)
            .with_verbose(false)
            .with_seed(23);
        let mut solver = Solver::new(net, data, config).unwrap();
        solver.train().unwrap();

        // 90 training samples in batches of 30
        assert_eq!(solver.loss_history().len(), 30);
        assert!(solver.loss_history().iter().all(|l| l.is_finite()));
        let best = solver.best_val_acc().unwrap();
        assert!((0.0..=1.0).contains(&best));
    }

    #[test]
    fn test_histories_and_lr_decay() {
        let data = line_data(3);
        // 90 training samples in batches of 20: 4 iterations per epoch
        assert_eq!(data.num_train(), 90);
        let config = SolverConfig::default()
            .with_update_rule(UpdateRule::SgdMomentum)
            .with_learning_rate(1e-2)
            .with_lr_decay(0.9)
            .with_num_epochs(3)
            .with_batch_size(20)
            .with_print_every(5)
            .with_seed(4);
        let mut solver = Solver::new(small_net(5), data, config).unwrap();
        solver.train().unwrap();

        assert_eq!(solver.epoch(), 3);
        assert_eq!(solver.loss_history().len(), 12);
        // first iteration plus the end of each epoch
        assert_eq!(solver.train_acc_history().len(), 4);
        assert_eq!(solver.val_acc_history().len(), 4);
        let expected_lr = 1e-2 * 0.9f64.powi(3);
        for config in solver.optim_configs().values() {
            assert_eq!(config.rule(), UpdateRule::SgdMomentum);
            assert!((config.learning_rate() - expected_lr).abs() < 1e-15);
        }
    }

    #[test]
    fn test_best_params_are_restored() {
        let config = SolverConfig::default()
            .with_update_rule(UpdateRule::Sgd)
            .with_learning_rate(5e-2)
            .with_num_epochs(5)
            .with_batch_size(10)
            .with_num_val_samples(None)
            .with_verbose(false)
            .with_seed(6);
        let mut solver = Solver::new(small_net(7), line_data(8), config).unwrap();
        solver.train().unwrap();

        let best = solver.best_val_acc().unwrap();
        let max_seen = solver
            .val_acc_history()
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(best, max_seen);
        assert_eq!(
            solver.model().params(),
            solver.best_params().unwrap().params()
        );

        let (x, y) = (solver.data().x_val().to_owned(), solver.data().y_val().to_vec());
        assert_eq!(solver.check_accuracy(x.view(), &y, None).unwrap(), best);
    }

    #[test]
    fn test_seeded_training_is_reproducible() {
        let run = || {
            let config = SolverConfig::default()
                .with_update_rule(UpdateRule::Rmsprop)
                .with_learning_rate(1e-3)
                .with_num_epochs(2)
                .with_batch_size(15)
                .with_verbose(false)
                .with_seed(9);
            let mut solver = Solver::new(small_net(10), line_data(11), config).unwrap();
            solver.train().unwrap();
            (solver.loss_history().to_vec(), solver.into_model().checkpoint())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_step_updates_parameters() {
        let config = SolverConfig::default()
            .with_learning_rate(1e-1)
            .with_batch_size(16)
            .with_seed(12);
        let mut solver = Solver::new(small_net(13), line_data(14), config).unwrap();
        let before = solver.model().params().clone();
        solver.step().unwrap();
        assert_eq!(solver.loss_history().len(), 1);
        assert_ne!(solver.model().params().get("W1").unwrap(), before.get("W1").unwrap());
        assert_ne!(solver.model().params().get("W2").unwrap(), before.get("W2").unwrap());
    }

    #[test]
    fn test_config_errors() {
        let missing_lr = Solver::new(small_net(0), line_data(0), SolverConfig::default());
        assert!(matches!(
            missing_lr,
            Err(SolverError::Optim(OptimError::MissingHyperparameter(
                "learning_rate"
            )))
        ));

        let base = SolverConfig::default().with_learning_rate(1e-3);
        for config in [
            base.clone().with_lr_decay(0.0),
            base.clone().with_lr_decay(1.5),
            base.clone().with_num_epochs(0),
            base.clone().with_batch_size(0),
        ] {
            assert!(matches!(
                Solver::new(small_net(0), line_data(0), config),
                Err(SolverError::Config(_))
            ));
        }

        for config in [
            base.clone().with_num_train_samples(Some(0)),
            base.clone().with_num_val_samples(Some(0)),
        ] {
            assert!(matches!(
                Solver::new(small_net(0), line_data(0), config),
                Err(SolverError::Config(_))
            ));
        }

        let mut solver = Solver::new(small_net(0), line_data(0), base).unwrap();
        let x = solver.data().x_val().to_owned();
        assert!(matches!(
            solver.check_accuracy(x.view(), &[0], None),
            Err(SolverError::Data(DataLoaderError::LabelLengthMismatch { .. }))
        ));
        let y = solver.data().y_val().to_vec();
        assert!(matches!(
            solver.check_accuracy(x.view(), &y, Some(0)),
            Err(SolverError::Config(_))
        ));
    }

    #[test]
    fn test_accuracy_subsample_is_finite() {
        let config = SolverConfig::default()
            .with_learning_rate(1e-2)
            .with_num_epochs(2)
            .with_batch_size(30)
            .with_num_train_samples(Some(1))
            .with_num_val_samples(Some(5))
            .with_verbose(false)
            .with_seed(15);
        let mut solver = Solver::new(small_net(16), line_data(17), config).unwrap();
        solver.train().unwrap();
        let mut accs = solver
            .train_acc_history()
            .iter()
            .chain(solver.val_acc_history());
        assert!(accs.all(|a| (0.0..=1.0).contains(a)));
        let best = solver.best_val_acc().unwrap();
        assert!(solver.val_acc_history().contains(&best));
    }

    #[test]
    fn test_failed_step_leaves_state_untouched() {
        let config = SolverConfig::default()
            .with_update_rule(UpdateRule::SgdMomentum)
            .with_learning_rate(1e-1)
            .with_batch_size(16)
            .with_seed(18);
        let mut solver = Solver::new(small_net(19), line_data(20), config).unwrap();
        // keys update in sorted order: W1, W2, b1, b2
        let bad = OptimConfig::new(
            UpdateRule::SgdMomentum,
            &OptimSettings::with_learning_rate(1e-1),
            &[3],
        )
        .unwrap();
        solver.optim_configs.insert("b1".to_string(), bad);
        let params = solver.model().params().clone();
        let configs = solver.optim_configs().clone();

        assert!(matches!(
            solver.step(),
            Err(SolverError::Optim(OptimError::ShapeMismatch { .. }))
        ));
        assert_eq!(solver.model().params(), &params);
        assert_eq!(solver.optim_configs(), &configs);
    }
}
