//! End-to-end behaviour of the ProtoNN trainer.

use ndarray::{array, ArrayD, Axis, IxDyn};
use protonn::model::protonn::ProtoNnInit;
use protonn::model::{HyperParams, ModelMatrices, ProtoNN, ProtoNnModel};
use protonn::runtime::session::Session;
use protonn::tensor::{GraphContext, Initializer, Tensor};
use protonn::trainer::{LossType, ProtoNnTrainer, TrainOptions, TrainerConfig, TrainerError};
use std::cell::RefCell;
use std::rc::Rc;

type Ctx = Rc<RefCell<GraphContext>>;

const HYPER: HyperParams = HyperParams { d: 2, d_cap: 2, m: 2, l: 2, gamma: 1.0 };

/// Prototypes at the two class centres, label scores still zero. Keeps the
/// loop tests independent of the initializer RNG.
fn separable_init() -> ProtoNnInit {
    ProtoNnInit {
        w: Initializer::Constant(array![[1.0_f32, 0.0], [0.0, 1.0]].into_dyn()),
        b: Initializer::Constant(array![[-1.0_f32, 1.0], [-1.0, 1.0]].into_dyn()),
        z: Initializer::Zeros,
    }
}

fn build(config: TrainerConfig) -> (Ctx, ProtoNnTrainer<ProtoNN>) {
    let ctx = GraphContext::shared();
    let model = ProtoNN::with_init(&ctx, HYPER, separable_init());
    let x = Tensor::new_input(&ctx, "X", &[None, Some(HYPER.d)]);
    let y = Tensor::new_input(&ctx, "Y", &[None, Some(HYPER.l)]);
    let trainer = ProtoNnTrainer::new(model, config, x, y).unwrap();
    (ctx, trainer)
}

fn try_build(config: TrainerConfig, x_shape: &[Option<usize>], y_shape: &[Option<usize>]) -> Result<(), TrainerError> {
    let ctx = GraphContext::shared();
    let model = ProtoNN::new(&ctx, HYPER);
    let x = Tensor::new_input(&ctx, "X", x_shape);
    let y = Tensor::new_input(&ctx, "Y", y_shape);
    ProtoNnTrainer::new(model, config, x, y).map(|_| ())
}

/// Two clusters around (-1, -1) and (1, 1), classes interleaved row by row.
fn clusters(offsets: &[f32]) -> (ArrayD<f32>, ArrayD<f32>) {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for &a in offsets {
        for &b in offsets {
            for (class, centre) in [-1.0_f32, 1.0].into_iter().enumerate() {
                xs.extend([centre + a, centre + b]);
                ys.extend(if class == 0 { [1.0, 0.0] } else { [0.0, 1.0] });
            }
        }
    }
    let n = xs.len() / 2;
    (
        ArrayD::from_shape_vec(IxDyn(&[n, 2]), xs).unwrap(),
        ArrayD::from_shape_vec(IxDyn(&[n, 2]), ys).unwrap(),
    )
}

fn quiet(print_step: usize, skip_init: bool) -> TrainOptions {
    TrainOptions { skip_init, print_step }
}

#[test]
fn sparsity_out_of_range_names_the_matrix() {
    let shapes = (&[None, Some(2)][..], &[None, Some(2)][..]);
    for (config, name) in [
        (TrainerConfig { sparsity_w: -0.1, ..TrainerConfig::default() }, "W"),
        (TrainerConfig { sparsity_b: 1.01, ..TrainerConfig::default() }, "B"),
        (TrainerConfig { sparsity_z: 7.0, ..TrainerConfig::default() }, "Z"),
    ] {
        match try_build(config, shapes.0, shapes.1) {
            Err(TrainerError::Config { param, message }) => {
                assert_eq!(param, name);
                assert!(message.contains("between 0 and 1"));
            }
            other => panic!("expected a config error for {}, got {:?}", name, other),
        }
    }
}

#[test]
fn sparsity_is_checked_before_shapes() {
    let config = TrainerConfig { sparsity_w: 2.0, ..TrainerConfig::default() };
    let err = try_build(config, &[None, Some(5)], &[None, Some(9)]).unwrap_err();
    assert!(matches!(err, TrainerError::Config { .. }));
}

#[test]
fn placeholder_shapes_must_match_the_model() {
    let ok = [None, Some(2)];
    let err = try_build(TrainerConfig::default(), &[None, Some(3)], &ok).unwrap_err();
    assert!(matches!(err, TrainerError::Shape(ref m) if m.starts_with("X ")));

    let err = try_build(TrainerConfig::default(), &ok, &[None, Some(3)]).unwrap_err();
    assert!(matches!(err, TrainerError::Shape(ref m) if m.starts_with("Y ")));

    let err = try_build(TrainerConfig::default(), &[None, Some(2), Some(1)], &ok).unwrap_err();
    assert!(matches!(err, TrainerError::Shape(_)));

    // Y is validated first
    let err = try_build(TrainerConfig::default(), &[None, Some(3)], &[None, Some(3)]).unwrap_err();
    assert!(matches!(err, TrainerError::Shape(ref m) if m.starts_with("Y ")));

    assert!(try_build(TrainerConfig::default(), &ok, &ok).is_ok());
}

#[test]
fn unknown_loss_type_is_a_value_error() {
    let err = serde_json::from_str::<TrainerConfig>(r#"{"loss_type": "hinge"}"#).unwrap_err();
    assert!(err.to_string().contains("Values can be 'l2' or 'xentropy'"));
    assert!(matches!("l1".parse::<LossType>(), Err(TrainerError::InvalidLossType(_))));

    let config: TrainerConfig = serde_json::from_str(r#"{"loss_type": "xentropy", "reg_w": 0.1}"#).unwrap();
    assert_eq!(config.loss_type, LossType::Xentropy);
    assert_eq!(config.learning_rate, TrainerConfig::default().learning_rate);
}

#[test]
fn bad_rates_fail_construction() {
    let ok = [None, Some(2)];
    let config = TrainerConfig { learning_rate: f32::NAN, ..TrainerConfig::default() };
    assert!(matches!(try_build(config, &ok, &ok), Err(TrainerError::Config { .. })));
    let config = TrainerConfig { reg_b: -1.0, ..TrainerConfig::default() };
    assert!(matches!(try_build(config, &ok, &ok), Err(TrainerError::Config { ref param, .. }) if param == "regB"));
}

#[test]
fn ten_rows_in_batches_of_three_give_four_steps_per_epoch() {
    let (ctx, trainer) = build(TrainerConfig::default());
    let mut sess = Session::with_seed(&ctx, 0);
    let (x, y) = clusters(&[-0.2, 0.0, 0.2]);
    let x = x.slice_axis(Axis(0), (0..10).into()).to_owned();
    let y = y.slice_axis(Axis(0), (0..10).into()).to_owned();

    let mut sink = Vec::<u8>::new();
    let report = trainer
        .train(3, 2, &mut sess, &x, &x, &y, &y, quiet(1, false), Some(&mut sink))
        .unwrap();

    assert_eq!(report.train_batches, 4);
    assert_eq!(report.steps, 8);
    let batches: Vec<usize> = report.progress.iter().map(|p| p.batch).collect();
    assert_eq!(batches, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    let text = String::from_utf8(sink).unwrap();
    assert_eq!(text.lines().count(), 8);
    assert!(text.lines().nth(5).unwrap().starts_with("Epoch:   1 Batch:   1 "));
}

#[test]
fn zero_batch_size_or_epochs_fail_before_any_work() {
    let (ctx, trainer) = build(TrainerConfig::default());
    let mut sess = Session::new(&ctx);
    let (x, y) = clusters(&[0.0]);
    let mut sink = Vec::<u8>::new();

    let err = trainer.train(0, 3, &mut sess, &x, &x, &y, &y, quiet(1, false), Some(&mut sink)).unwrap_err();
    assert!(matches!(err, TrainerError::InvalidArgument(_)));
    let err = trainer.train(2, 0, &mut sess, &x, &x, &y, &y, quiet(1, false), Some(&mut sink)).unwrap_err();
    assert!(matches!(err, TrainerError::InvalidArgument(_)));

    assert_eq!(sess.init_count(), 0);
    assert!(sink.is_empty());
}

#[test]
fn data_arrays_must_match_model_dimensions() {
    let (ctx, trainer) = build(TrainerConfig::default());
    let mut sess = Session::new(&ctx);
    let (x, y) = clusters(&[0.0]);
    let wide = ArrayD::<f32>::zeros(IxDyn(&[2, 3]));
    let flat = ArrayD::<f32>::zeros(IxDyn(&[4]));
    let mut sink = Vec::<u8>::new();

    let err = trainer.train(2, 1, &mut sess, &wide, &x, &y, &y, quiet(1, false), Some(&mut sink)).unwrap_err();
    assert!(matches!(err, TrainerError::Shape(_)));
    let err = trainer.train(2, 1, &mut sess, &x, &x, &y, &flat, quiet(1, false), Some(&mut sink)).unwrap_err();
    assert!(matches!(err, TrainerError::Shape(_)));
    assert_eq!(sess.init_count(), 0);
}

#[test]
fn session_must_be_open_and_bound() {
    let (ctx, trainer) = build(TrainerConfig::default());
    let (x, y) = clusters(&[0.0]);
    let mut sink = Vec::<u8>::new();

    let mut foreign = Session::new(&GraphContext::shared());
    let err = trainer.train(2, 1, &mut foreign, &x, &x, &y, &y, quiet(1, false), Some(&mut sink)).unwrap_err();
    assert!(matches!(err, TrainerError::InvalidSession(_)));

    let mut closed = Session::new(&ctx);
    closed.close();
    let err = trainer.train(2, 1, &mut closed, &x, &x, &y, &y, quiet(1, false), Some(&mut sink)).unwrap_err();
    assert!(matches!(err, TrainerError::InvalidSession(_)));
}

#[test]
fn skip_init_keeps_trained_parameters() {
    let (ctx, trainer) = build(TrainerConfig { learning_rate: 0.05, ..TrainerConfig::default() });
    let mut sess = Session::with_seed(&ctx, 0);
    let (x, y) = clusters(&[-0.4, 0.0, 0.4]);
    let mut sink = Vec::<u8>::new();

    trainer.train(6, 3, &mut sess, &x, &x, &y, &y, quiet(100, false), Some(&mut sink)).unwrap();
    assert_eq!(sess.init_count(), 1);
    let z_after_first = sess.variable("Z").cloned().unwrap();
    let (loss_after_first, _) = trainer.evaluate(&mut sess, &x, &y).unwrap();

    trainer.train(6, 1, &mut sess, &x, &x, &y, &y, quiet(100, true), Some(&mut sink)).unwrap();
    assert_eq!(sess.init_count(), 1);
    assert_ne!(sess.variable("Z").cloned().unwrap(), z_after_first);
    let (loss_after_second, _) = trainer.evaluate(&mut sess, &x, &y).unwrap();
    assert!(loss_after_second < loss_after_first);

    // Without skip_init everything starts over from the initializers.
    trainer.train(6, 1, &mut sess, &x, &x, &y, &y, quiet(100, false), Some(&mut sink)).unwrap();
    assert_eq!(sess.init_count(), 2);
}

#[test]
fn reinitialization_discards_training() {
    let (ctx, trainer) = build(TrainerConfig { learning_rate: 0.05, ..TrainerConfig::default() });
    let mut sess = Session::with_seed(&ctx, 0);
    let (x, y) = clusters(&[-0.4, 0.0, 0.4]);

    sess.initialize_variables().unwrap();
    let (fresh_loss, _) = trainer.evaluate(&mut sess, &x, &y).unwrap();
    trainer.train(6, 3, &mut sess, &x, &x, &y, &y, quiet(100, false), Some(&mut Vec::<u8>::new())).unwrap();
    let (trained_loss, _) = trainer.evaluate(&mut sess, &x, &y).unwrap();
    assert!(trained_loss < fresh_loss);

    sess.initialize_variables().unwrap();
    let (reset_loss, _) = trainer.evaluate(&mut sess, &x, &y).unwrap();
    assert!((reset_loss - fresh_loss).abs() < 1e-6);
}

#[test]
fn validation_runs_after_every_third_epoch() {
    let (ctx, trainer) = build(TrainerConfig::default());
    let mut sess = Session::with_seed(&ctx, 0);
    let (x, y) = clusters(&[-0.2, 0.2]);
    let report = trainer
        .train(4, 7, &mut sess, &x, &x, &y, &y, quiet(100, false), Some(&mut Vec::<u8>::new()))
        .unwrap();
    let epochs: Vec<usize> = report.validations.iter().map(|v| v.epoch + 1).collect();
    assert_eq!(epochs, vec![3, 6]);
}

#[test]
fn separable_clusters_reach_high_validation_accuracy_with_l2() {
    let config = TrainerConfig { learning_rate: 0.05, loss_type: LossType::L2, ..TrainerConfig::default() };
    let (ctx, trainer) = build(config);
    let mut sess = Session::with_seed(&ctx, 42);
    let (x_train, y_train) = clusters(&[-0.4, 0.0, 0.4]);
    let (x_val, y_val) = clusters(&[-0.3, 0.3]);

    let report = trainer
        .train(6, 30, &mut sess, &x_train, &x_val, &y_train, &y_val, quiet(10, false), Some(&mut Vec::<u8>::new()))
        .unwrap();

    assert_eq!(report.validations.len(), 10);
    let last = report.last_validation().unwrap();
    assert!(last.accuracy >= 0.95, "validation accuracy {}", last.accuracy);
    let (_, accuracy) = trainer.evaluate(&mut sess, &x_val, &y_val).unwrap();
    assert!(accuracy >= 0.95);
}

#[test]
fn xentropy_training_lowers_the_loss() {
    let config = TrainerConfig { learning_rate: 0.05, loss_type: LossType::Xentropy, ..TrainerConfig::default() };
    let (ctx, trainer) = build(config);
    let mut sess = Session::with_seed(&ctx, 7);
    let (x, y) = clusters(&[-0.4, 0.0, 0.4]);

    sess.initialize_variables().unwrap();
    let (before, _) = trainer.evaluate(&mut sess, &x, &y).unwrap();
    assert!((before - std::f32::consts::LN_2).abs() < 1e-5);

    trainer.train(6, 9, &mut sess, &x, &x, &y, &y, quiet(100, true), Some(&mut Vec::<u8>::new())).unwrap();
    let (after, accuracy) = trainer.evaluate(&mut sess, &x, &y).unwrap();
    assert!(after < before);
    assert!(accuracy >= 0.95);
}

#[test]
fn random_init_reaches_high_validation_accuracy() {
    // enough prototypes and a soft kernel so no seed starts with vanishing similarities
    let hyper = HyperParams { d: 2, d_cap: 4, m: 16, l: 2, gamma: 0.5 };
    let (x_train, y_train) = clusters(&[-0.4, 0.0, 0.4]);
    let (x_val, y_val) = clusters(&[-0.3, 0.3]);

    for seed in [1, 42, 2024] {
        let ctx = GraphContext::shared();
        let model = ProtoNN::new(&ctx, hyper);
        let x = Tensor::new_input(&ctx, "X", &[None, Some(hyper.d)]);
        let y = Tensor::new_input(&ctx, "Y", &[None, Some(hyper.l)]);
        let config = TrainerConfig { learning_rate: 0.05, ..TrainerConfig::default() };
        let trainer = ProtoNnTrainer::new(model, config, x, y).unwrap();

        let mut sess = Session::with_seed(&ctx, seed);
        let report = trainer
            .train(6, 30, &mut sess, &x_train, &x_val, &y_train, &y_val, quiet(100, false), Some(&mut Vec::<u8>::new()))
            .unwrap();
        let last = report.last_validation().unwrap();
        assert!(last.accuracy >= 0.95, "seed {}: validation accuracy {}", seed, last.accuracy);
    }
}

#[test]
fn trainer_builds_after_forward_on_other_placeholders() {
    let ctx = GraphContext::shared();
    let model = ProtoNN::with_init(&ctx, HYPER, separable_init());
    let x_infer = Tensor::new_input(&ctx, "X_infer", &[None, Some(HYPER.d)]);
    let y_infer = Tensor::new_input(&ctx, "Y_infer", &[None, Some(HYPER.l)]);
    model.forward(&x_infer, &y_infer);

    let x = Tensor::new_input(&ctx, "X", &[None, Some(HYPER.d)]);
    let y = Tensor::new_input(&ctx, "Y", &[None, Some(HYPER.l)]);
    let trainer = ProtoNnTrainer::new(model, TrainerConfig::default(), x, y).unwrap();
    assert_eq!(trainer.model().accuracy_op().unwrap().node_id, trainer.accuracy().node_id);

    let mut sess = Session::with_seed(&ctx, 0);
    let (xs, ys) = clusters(&[-0.2, 0.2]);
    let report = trainer
        .train(4, 3, &mut sess, &xs, &xs, &ys, &ys, quiet(100, false), Some(&mut Vec::<u8>::new()))
        .unwrap();
    assert_eq!(report.validations.len(), 1);
}

#[test]
fn model_from_another_graph_context_is_rejected() {
    let model_ctx = GraphContext::shared();
    let model = ProtoNN::new(&model_ctx, HYPER);
    let ctx = GraphContext::shared();
    let x = Tensor::new_input(&ctx, "X", &[None, Some(2)]);
    let y = Tensor::new_input(&ctx, "Y", &[None, Some(2)]);
    let err = ProtoNnTrainer::new(model, TrainerConfig::default(), x, y).err().unwrap();
    assert!(matches!(err, TrainerError::InvalidArgument(ref m) if m.contains("model matrices")));
    // nothing was appended to either graph
    assert_eq!(ctx.borrow().main_graph().nodes.len(), 2);
}

/// Linear scores `x·V` that never define an accuracy node.
struct NoAccuracy {
    v: Tensor,
    gamma: Tensor,
}

impl ProtoNnModel for NoAccuracy {
    fn forward(&self, x: &Tensor, _y: &Tensor) -> Tensor {
        x.dot(&self.v)
    }

    fn hyper_params(&self) -> HyperParams {
        HYPER
    }

    fn model_matrices(&self) -> ModelMatrices {
        ModelMatrices { w: self.v.clone(), b: self.v.clone(), z: self.v.clone(), gamma: self.gamma.clone() }
    }

    fn accuracy_op(&self) -> Option<Tensor> {
        None
    }
}

#[test]
fn model_without_accuracy_is_rejected() {
    let ctx = GraphContext::shared();
    let model = NoAccuracy {
        v: Tensor::new_parameter(&ctx, "V", &[2, 2], Initializer::Zeros),
        gamma: Tensor::scalar(&ctx, 1.0),
    };
    let x = Tensor::new_input(&ctx, "X", &[None, Some(2)]);
    let y = Tensor::new_input(&ctx, "Y", &[None, Some(2)]);
    let err = ProtoNnTrainer::new(model, TrainerConfig::default(), x, y).err().unwrap();
    assert!(matches!(err, TrainerError::Model(_)));
}

#[test]
fn model_with_mismatched_matrices_fails_at_construction() {
    let ctx = GraphContext::shared();
    let model = ProtoNN::new(&ctx, HYPER);
    let x = Tensor::new_input(&ctx, "X", &[None, Some(2)]);
    let y = Tensor::new_input(&ctx, "Y", &[None, Some(2)]);
    // projects to 3 dimensions while the prototypes live in 2
    let bad_w = Tensor::new_parameter(&ctx, "W3", &[2, 3], Initializer::Zeros);
    struct Wrapped(ProtoNN, Tensor);
    impl ProtoNnModel for Wrapped {
        fn forward(&self, x: &Tensor, y: &Tensor) -> Tensor {
            let y_hat = self.0.forward(x, y);
            &y_hat + &x.dot(&self.1).dot(&self.0.model_matrices().b)
        }
        fn hyper_params(&self) -> HyperParams {
            self.0.hyper_params()
        }
        fn model_matrices(&self) -> ModelMatrices {
            self.0.model_matrices()
        }
        fn accuracy_op(&self) -> Option<Tensor> {
            self.0.accuracy_op()
        }
    }
    let err = ProtoNnTrainer::new(Wrapped(model, bad_w), TrainerConfig::default(), x, y).err().unwrap();
    assert!(matches!(err, TrainerError::ShapeInference(_)));
}
