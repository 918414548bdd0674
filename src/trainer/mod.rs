//! ProtoNN trainer: loss graph, Adam step and the mini-batch training loop.
//!
//! The trainer is built once per model. Construction validates the
//! configuration and the placeholders, then appends the loss and the
//! optimizer step to the model's graph. `train` runs epochs of optimizer
//! steps over contiguous batches and reports loss and accuracy along the way.

pub mod config;
pub mod error;

pub use config::{LossType, TrainOptions, TrainerConfig};
pub use error::{TrainerError, TrainerResult};

use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{DType, Shape, Value};
use crate::data::DataLoader;
use crate::losses::{l2_loss, softmax_cross_entropy_with_logits, squared_error_loss};
use crate::metrics::RunningMean;
use crate::model::{HyperParams, ModelMatrices, ProtoNnModel};
use crate::optimizers::{Adam, TrainStep};
use crate::runtime::session::Session;
use crate::tensor::Tensor;
use log::{debug, info};
use ndarray::ArrayD;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

/// One progress line: loss and accuracy of a training batch right after its
/// optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressRecord {
    pub epoch: usize,
    pub batch: usize,
    pub loss: f32,
    pub accuracy: f32,
}

/// Validation loss and accuracy averaged over validation batches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationRecord {
    /// Zero-based epoch after which the pass ran.
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
}

/// What a `train` call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    pub epochs: usize,
    pub train_batches: usize,
    pub val_batches: usize,
    pub steps: usize,
    pub progress: Vec<ProgressRecord>,
    pub validations: Vec<ValidationRecord>,
}

impl TrainReport {
    pub fn last_validation(&self) -> Option<&ValidationRecord> {
        self.validations.last()
    }
}

pub struct ProtoNnTrainer<M: ProtoNnModel> {
    model: M,
    config: TrainerConfig,
    hyper: HyperParams,
    x: Tensor,
    y: Tensor,
    x_name: String,
    y_name: String,
    prediction: Tensor,
    loss: Tensor,
    train_step: TrainStep,
    accuracy: Tensor,
}

impl<M: ProtoNnModel> ProtoNnTrainer<M> {
    /// Validates the setup and builds loss, optimizer step and accuracy.
    ///
    /// # Arguments
    ///
    /// * `model` - Model to train. Its matrices must live in the same graph
    ///   context as `x` and `y`.
    /// * `x` - Placeholder for samples, declared `[?, d]`.
    /// * `y` - Placeholder for labels, declared `[?, L]`.
    pub fn new(model: M, config: TrainerConfig, x: Tensor, y: Tensor) -> TrainerResult<Self> {
        config.validate_sparsity()?;
        let hyper = model.hyper_params();
        let y_name = check_placeholder("Y", &y, hyper.l, "num labels/classes")?;
        let x_name = check_placeholder("X", &x, hyper.d, "featureDimension")?;
        config.validate_rates()?;
        if !Rc::ptr_eq(&x.context, &y.context) {
            return Err(TrainerError::InvalidArgument(
                "X and Y must belong to the same graph context".to_string(),
            ));
        }
        let matrices = model.model_matrices();
        if [&matrices.w, &matrices.b, &matrices.z].iter().any(|m| !Rc::ptr_eq(&m.context, &x.context)) {
            return Err(TrainerError::InvalidArgument(
                "model matrices must belong to the graph context of X and Y".to_string(),
            ));
        }

        let prediction = model.forward(&x, &y);
        let loss = build_loss(&config, &prediction, &y, &matrices);
        let train_step = Adam::new(config.learning_rate).minimize(&loss)?;
        let accuracy = model
            .accuracy_op()
            .ok_or_else(|| TrainerError::Model("model defines no accuracy operation".to_string()))?;

        let trainer = Self { model, config, hyper, x, y, x_name, y_name, prediction, loss, train_step, accuracy };
        trainer.check_graph()?;
        debug!(
            target: "protonn-gradient-adam",
            params = trainer.train_step.params.len();
            "trainer ready"
        );
        Ok(trainer)
    }

    /// Static shape check of loss and accuracy with a one-row batch.
    fn check_graph(&self) -> TrainerResult<()> {
        let ctx = self.loss.context.borrow();
        let mut graph = ctx.main_graph().clone();
        graph.set_outputs(vec![self.loss.node_id, self.accuracy.node_id]);

        let mut shapes: HashMap<String, (Shape, DType)> = ctx
            .parameters()
            .iter()
            .map(|p| (p.name.clone(), (p.shape.clone(), DType::F32)))
            .collect();
        shapes.insert(self.x_name.clone(), (vec![1, self.hyper.d], DType::F32));
        shapes.insert(self.y_name.clone(), (vec![1, self.hyper.l], DType::F32));
        ShapeInference::run(&mut graph, &shapes)?;

        for (what, id) in [("loss", self.loss.node_id), ("accuracy", self.accuracy.node_id)] {
            let shape = graph.get_node(id).ok().and_then(|n| n.shape.clone());
            if shape.as_ref().map_or(true, |s| s.iter().product::<usize>() != 1) {
                return Err(TrainerError::Model(format!("{} should be a scalar, has shape {:?}", what, shape)));
            }
        }
        Ok(())
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn loss(&self) -> &Tensor {
        &self.loss
    }

    pub fn accuracy(&self) -> &Tensor {
        &self.accuracy
    }

    pub fn prediction(&self) -> &Tensor {
        &self.prediction
    }

    pub fn train_step(&self) -> &TrainStep {
        &self.train_step
    }

    pub fn placeholders(&self) -> (&Tensor, &Tensor) {
        (&self.x, &self.y)
    }

    /// Dense training.
    ///
    /// Progress lines go to `sink` (stdout when `None`); validation summaries
    /// always go to stdout.
    #[allow(clippy::too_many_arguments)]
    pub fn train(
        &self,
        batch_size: usize,
        total_epochs: usize,
        session: &mut Session,
        x_train: &ArrayD<f32>,
        x_val: &ArrayD<f32>,
        y_train: &ArrayD<f32>,
        y_val: &ArrayD<f32>,
        options: TrainOptions,
        sink: Option<&mut dyn Write>,
    ) -> TrainerResult<TrainReport> {
        let mut stdout = io::stdout();
        match sink {
            Some(progress) => self.train_with_output(
                batch_size, total_epochs, session, x_train, x_val, y_train, y_val, options, progress, &mut stdout,
            ),
            None => {
                let mut progress = io::stdout();
                self.train_with_output(
                    batch_size, total_epochs, session, x_train, x_val, y_train, y_val, options, &mut progress,
                    &mut stdout,
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn train_with_output(
        &self,
        batch_size: usize,
        total_epochs: usize,
        session: &mut Session,
        x_train: &ArrayD<f32>,
        x_val: &ArrayD<f32>,
        y_train: &ArrayD<f32>,
        y_val: &ArrayD<f32>,
        options: TrainOptions,
        progress: &mut dyn Write,
        summary: &mut dyn Write,
    ) -> TrainerResult<TrainReport> {
        if batch_size < 1 {
            return Err(TrainerError::InvalidArgument("Batch size should be positive integer".to_string()));
        }
        if total_epochs < 1 {
            return Err(TrainerError::InvalidArgument("Total epochs should be positive integer".to_string()));
        }
        if options.print_step < 1 {
            return Err(TrainerError::InvalidArgument("Print step should be positive integer".to_string()));
        }
        self.check_pair("x_train", x_train, "y_train", y_train)?;
        self.check_pair("x_val", x_val, "y_val", y_val)?;
        self.check_session(session)?;

        if !options.skip_init {
            session.initialize_variables()?;
        }

        let train = DataLoader::new(x_train.view(), y_train.view(), batch_size)?;
        let val = DataLoader::new(x_val.view(), y_val.view(), batch_size)?;
        let mut report = TrainReport {
            epochs: total_epochs,
            train_batches: train.num_batches(),
            val_batches: val.num_batches(),
            ..TrainReport::default()
        };
        info!(
            epochs = total_epochs, train_batches = report.train_batches, val_batches = report.val_batches;
            "training ProtoNN ({} loss)", self.config.loss_type
        );

        for epoch in 0..total_epochs {
            for (i, batch) in train.iter().enumerate() {
                let feeds = self.feeds(batch.features.to_owned(), batch.labels.to_owned());
                session.run_train_step(&self.train_step, &feeds)?;
                report.steps += 1;

                if i % options.print_step == 0 {
                    let (loss, accuracy) = self.loss_and_accuracy(session, &feeds)?;
                    writeln!(progress, "Epoch: {:3} Batch: {:3} Loss: {:3.5} Accuracy: {:2.5}", epoch, i, loss, accuracy)?;
                    report.progress.push(ProgressRecord { epoch, batch: i, loss, accuracy });
                }
            }

            if (epoch + 1) % 3 == 0 {
                let mut loss_mean = RunningMean::new();
                let mut acc_mean = RunningMean::new();
                for batch in val.iter() {
                    let feeds = self.feeds(batch.features.to_owned(), batch.labels.to_owned());
                    let (loss, accuracy) = self.loss_and_accuracy(session, &feeds)?;
                    loss_mean.update(loss as f64);
                    acc_mean.update(accuracy as f64);
                }
                let record = ValidationRecord {
                    epoch,
                    loss: loss_mean.compute() as f32,
                    accuracy: acc_mean.compute() as f32,
                };
                debug!(epoch = epoch, batches = loss_mean.count(); "validation pass");
                writeln!(summary, "Test Loss: {:2.5} Accuracy: {:2.5}", record.loss, record.accuracy)?;
                report.validations.push(record);
            }
        }

        info!(steps = report.steps; "training done");
        Ok(report)
    }

    /// Loss and accuracy over whole arrays in a single run.
    pub fn evaluate(&self, session: &mut Session, x: &ArrayD<f32>, y: &ArrayD<f32>) -> TrainerResult<(f32, f32)> {
        self.check_pair("x", x, "y", y)?;
        self.check_session(session)?;
        let feeds = self.feeds(x.clone(), y.clone());
        self.loss_and_accuracy(session, &feeds)
    }

    fn feeds(&self, x: ArrayD<f32>, y: ArrayD<f32>) -> HashMap<String, Value> {
        HashMap::from([
            (self.x_name.clone(), Value::Tensor(x)),
            (self.y_name.clone(), Value::Tensor(y)),
        ])
    }

    fn loss_and_accuracy(&self, session: &mut Session, feeds: &HashMap<String, Value>) -> TrainerResult<(f32, f32)> {
        let out = session.run(&[&self.loss, &self.accuracy], feeds)?;
        let scalar = |i: usize, what: &str| {
            out.get(i)
                .and_then(Value::as_scalar)
                .ok_or_else(|| TrainerError::Model(format!("{} did not evaluate to a scalar", what)))
        };
        Ok((scalar(0, "loss")?, scalar(1, "accuracy")?))
    }

    fn check_pair(&self, x_label: &str, x: &ArrayD<f32>, y_label: &str, y: &ArrayD<f32>) -> TrainerResult<()> {
        check_array(x_label, x, self.hyper.d)?;
        check_array(y_label, y, self.hyper.l)?;
        let (nx, ny) = (x.shape()[0], y.shape()[0]);
        if nx != ny {
            return Err(TrainerError::Shape(format!(
                "{} has {} rows but {} has {}",
                x_label, nx, y_label, ny
            )));
        }
        if nx == 0 {
            return Err(TrainerError::InvalidArgument(format!("{} has no rows", x_label)));
        }
        Ok(())
    }

    fn check_session(&self, session: &Session) -> TrainerResult<()> {
        if !session.is_open() {
            return Err(TrainerError::InvalidSession("session is closed".to_string()));
        }
        if !session.is_bound_to(&self.x.context) {
            return Err(TrainerError::InvalidSession(
                "session is bound to a different graph context".to_string(),
            ));
        }
        Ok(())
    }
}

/// Assembles `data term + regW·l2(W) + regB·l2(B) + regZ·l2(Z)`.
fn build_loss(config: &TrainerConfig, prediction: &Tensor, y: &Tensor, matrices: &ModelMatrices) -> Tensor {
    let scope = config.loss_type.scope();
    let data_term = match config.loss_type {
        LossType::L2 => squared_error_loss(prediction, y),
        LossType::Xentropy => softmax_cross_entropy_with_logits(prediction, y),
    };

    let ctx = &prediction.context;
    let weighted = |reg: f32, t: &Tensor| &Tensor::scalar(ctx, reg) * &l2_loss(t);
    let reg = &(&weighted(config.reg_w, &matrices.w) + &weighted(config.reg_b, &matrices.b))
        + &weighted(config.reg_z, &matrices.z);
    let loss = &data_term + &reg;

    debug!(target: scope, nodes = loss.graph_len(); "built loss graph");
    loss
}

/// Checks a placeholder is declared `[?, expected]` and returns its name.
fn check_placeholder(label: &str, t: &Tensor, expected: usize, dim_name: &str) -> TrainerResult<String> {
    let msg = format!(
        "{} should be of dimension [-1, {}] specified as part of ProtoNN object ({})",
        label, dim_name, expected
    );
    let shape = t.symbolic_shape().ok_or_else(|| TrainerError::Shape(format!("{}: not a placeholder", msg)))?;
    if shape.len() != 2 || shape[1] != Some(expected) {
        return Err(TrainerError::Shape(format!("{}, got {:?}", msg, shape)));
    }
    t.name().ok_or_else(|| TrainerError::Shape(format!("{}: placeholder has no name", msg)))
}

fn check_array(label: &str, a: &ArrayD<f32>, expected: usize) -> TrainerResult<()> {
    if a.ndim() != 2 {
        return Err(TrainerError::Shape(format!(
            "Expected {} to be of rank 2, got rank {}",
            label,
            a.ndim()
        )));
    }
    if a.shape()[1] != expected {
        return Err(TrainerError::Shape(format!(
            "Expected {} to be [-1, {}], got {:?}",
            label,
            expected,
            a.shape()
        )));
    }
    Ok(())
}
