//! Trains a fully-connected network on a synthetic 2-D dataset using `fc_nets`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! RUST_LOG=info cargo run -- --dataset spiral --update-rule adam --lr 1e-2
//! ```

use fc_nets::{
    dataloader::SplitData,
    datasets::{Dataset, load_dataset},
    loss::Loss,
    nn::{FullyConnectedNet, NetConfig},
    optim::{OptimSettings, UpdateRule},
    scalar::Scalar,
    solver::{Solver, SolverConfig, SolverError},
};

use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Precision {
    F32,
    F64,
}

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Dataset::Spiral)]
    dataset: Dataset,
    #[clap(short, long, default_value_t = 300)]
    class_size: usize,
    /// Fraction of the samples held out for validation
    #[clap(long, default_value_t = 0.2)]
    val_fraction: f64,
    /// Width of each hidden layer
    #[clap(long, num_args = 1.., default_values_t = [100, 100])]
    hidden_dims: Vec<usize>,
    #[clap(short, long, value_enum, default_value_t = UpdateRule::Adam)]
    update_rule: UpdateRule,
    #[clap(short, long, default_value_t = 1e-2)]
    lr: f64,
    #[clap(long, default_value_t = 0.95)]
    lr_decay: f64,
    /// Momentum coefficient for sgd-momentum
    #[clap(short, long)]
    momentum: Option<f64>,
    #[clap(short, long, default_value_t = 20)]
    epochs: usize,
    #[clap(short, long, default_value_t = 50)]
    batch_size: usize,
    #[clap(long, default_value_t = 1e-3)]
    reg: f64,
    #[clap(long, default_value_t = 1e-1)]
    weight_scale: f64,
    /// Drop probability after each hidden layer, disabled when unset
    #[clap(long)]
    dropout: Option<f64>,
    #[clap(long, default_value_t = false)]
    batchnorm: bool,
    #[clap(long, value_enum, default_value_t = Loss::Softmax)]
    loss: Loss,
    #[clap(long, value_enum, default_value_t = Precision::F64)]
    precision: Precision,
    #[clap(short, long)]
    seed: Option<u64>,
    #[clap(short, long, default_value_t = 20)]
    print_every: usize,
}

fn run<T: Scalar>(args: &Args) -> Result<(), SolverError> {
    let mut rng = match args.seed {
        Some(seed) => Pcg64Mcg::seed_from_u64(seed),
        None => Pcg64Mcg::from_rng(&mut rand::rng()),
    };
    let (x, y) = load_dataset::<T, _>(args.dataset, args.class_size, &mut rng);
    let data = SplitData::split(x, y, args.val_fraction, &mut rng)?;
    log::info!(
        "Dataset '{}': {} train / {} validation samples",
        args.dataset,
        data.num_train(),
        data.num_val()
    );

    let mut net_config = NetConfig::default()
        .with_input_dim(data.num_features())
        .with_hidden_dims(args.hidden_dims.clone())
        .with_num_classes(args.dataset.num_classes())
        .with_weight_scale(args.weight_scale)
        .with_reg(args.reg)
        .with_batchnorm(args.batchnorm)
        .with_loss(args.loss);
    if let Some(p) = args.dropout {
        net_config = net_config.with_dropout(p);
    }
    if let Some(seed) = args.seed {
        net_config = net_config.with_seed(seed);
    }
    let model = FullyConnectedNet::<T>::new(net_config)?;

    let mut solver_config = SolverConfig::default()
        .with_update_rule(args.update_rule)
        .with_optim_settings(OptimSettings {
            learning_rate: Some(args.lr),
            momentum: args.momentum,
            ..OptimSettings::default()
        })
        .with_lr_decay(args.lr_decay)
        .with_num_epochs(args.epochs)
        .with_batch_size(args.batch_size)
        .with_print_every(args.print_every);
    if let Some(seed) = args.seed {
        solver_config = solver_config.with_seed(seed);
    }

    let mut solver = Solver::new(model, data, solver_config)?;
    solver.train()?;

    let (x_val, y_val) = (solver.data().x_val().to_owned(), solver.data().y_val().to_vec());
    let val_acc = solver.check_accuracy(x_val.view(), &y_val, None)?;
    log::info!(
        "Best validation accuracy {:.4} (restored model: {:.4})",
        solver.best_val_acc().unwrap_or(0.0),
        val_acc
    );
    Ok(())
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    let result = match args.precision {
        Precision::F32 => run::<f32>(&args),
        Precision::F64 => run::<f64>(&args),
    };
    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}
