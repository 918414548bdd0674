//! Trains ProtoNN on Gaussian blobs, one blob per class.
//!
//! ```text
//! cargo run --example protonn_synthetic -- --epochs 9 --loss xentropy
//! RUST_LOG=debug cargo run --example protonn_synthetic -- --config trainer.json
//! ```

use protonn::model::{HyperParams, ProtoNN};
use protonn::runtime::session::Session;
use protonn::tensor::{GraphContext, Tensor};
use protonn::trainer::{LossType, ProtoNnTrainer, TrainOptions, TrainerConfig};

use clap::Parser;
use log::info;
use ndarray::{Array2, ArrayD, Axis};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about = "ProtoNN on synthetic clusters", long_about = None)]
struct Args {
    /// Trainer configuration as JSON. Command-line flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 20)]
    epochs: usize,

    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    #[arg(long)]
    learning_rate: Option<f32>,

    /// `l2` or `xentropy`.
    #[arg(long)]
    loss: Option<String>,

    #[arg(long, default_value_t = 4)]
    features: usize,

    #[arg(long, default_value_t = 3)]
    classes: usize,

    /// Projection dimension.
    #[arg(long, default_value_t = 3)]
    projection: usize,

    #[arg(long, default_value_t = 6)]
    prototypes: usize,

    #[arg(long, default_value_t = 1.0)]
    gamma: f32,

    #[arg(long, default_value_t = 40)]
    samples_per_class: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 10)]
    print_step: usize,
}

/// Samples `per_class` points around a distinct center for every class.
/// Labels are one-hot.
fn blobs(
    rng: &mut StdRng,
    classes: usize,
    features: usize,
    per_class: usize,
) -> Result<(ArrayD<f32>, ArrayD<f32>), Box<dyn std::error::Error>> {
    let rows = classes * per_class;
    let noise = Normal::new(0.0f32, 0.35)?;
    let mut x = Array2::random_using((rows, features), noise, rng);
    let mut y = Array2::<f32>::zeros((rows, classes));
    for (row, (mut sample, mut label)) in x.axis_iter_mut(Axis(0)).zip(y.axis_iter_mut(Axis(0))).enumerate() {
        let class = row % classes;
        sample[class % features] += 2.0;
        if class >= features {
            sample[(class + 1) % features] -= 2.0;
        }
        label[class] = 1.0;
    }
    Ok((x.into_dyn(), y.into_dyn()))
}

fn load_config(args: &Args) -> Result<TrainerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => TrainerConfig::default(),
    };
    if let Some(lr) = args.learning_rate {
        config.learning_rate = lr;
    }
    if let Some(loss) = &args.loss {
        config.loss_type = loss.parse::<LossType>()?;
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let config = load_config(&args)?;

    let hyper = HyperParams {
        d: args.features,
        d_cap: args.projection,
        m: args.prototypes,
        l: args.classes,
        gamma: args.gamma,
    };
    println!("--- ProtoNN on synthetic clusters ---");
    println!("[Config] {:?}", hyper);
    println!("[Config] {}", serde_json::to_string(&config)?);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let (x_train, y_train) = blobs(&mut rng, args.classes, args.features, args.samples_per_class)?;
    let (x_val, y_val) = blobs(&mut rng, args.classes, args.features, args.samples_per_class / 4 + 1)?;

    let context = GraphContext::shared();
    let x = Tensor::new_input(&context, "X", &[None, Some(hyper.d)]);
    let y = Tensor::new_input(&context, "Y", &[None, Some(hyper.l)]);
    let model = ProtoNN::new(&context, hyper);
    let trainer = ProtoNnTrainer::new(model, config, x, y)?;

    let mut session = Session::with_seed(&context, args.seed);
    let options = TrainOptions { print_step: args.print_step, ..TrainOptions::default() };

    let start = Instant::now();
    let report = trainer.train(
        args.batch_size,
        args.epochs,
        &mut session,
        &x_train,
        &x_val,
        &y_train,
        &y_val,
        options,
        None,
    )?;
    info!(steps = report.steps; "training finished");

    let (loss, accuracy) = trainer.evaluate(&mut session, &x_val, &y_val)?;
    println!("\n--- Done in {:.2?} after {} steps ---", start.elapsed(), report.steps);
    println!("Final validation loss: {:.5} accuracy: {:.5}", loss, accuracy);
    Ok(())
}
