//! ProtoNN: projection, prototypes and RBF similarity in the graph paradigm.

use super::{HyperParams, ModelMatrices, ProtoNnModel};
use crate::tensor::{GraphContext, Initializer, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Prototype-based compressed classifier.
///
/// Like every layer of the engine it stores no numbers, only symbolic handles
/// to its `Parameter` nodes:
///
/// * `W` `[d, d̂]` projects a sample into the low-dimensional space,
/// * `B` `[d̂, m]` holds one prototype per column,
/// * `Z` `[L, m]` holds the label scores of each prototype.
///
/// A projected sample `Wx` scores prototype `j` with
/// `exp(-γ² ‖Wx - b_j‖²)`; the prediction is the similarity-weighted sum of
/// prototype labels.
pub struct ProtoNN {
    hyper: HyperParams,
    w: Tensor,
    b: Tensor,
    z: Tensor,
    gamma: Tensor,
    accuracy: RefCell<Option<Tensor>>,
}

/// Starting values for the three trainable matrices.
#[derive(Debug, Clone)]
pub struct ProtoNnInit {
    pub w: Initializer,
    pub b: Initializer,
    pub z: Initializer,
}

impl Default for ProtoNnInit {
    fn default() -> Self {
        let normal = Initializer::Normal { mean: 0.0, std_dev: 1.0 };
        Self { w: normal.clone(), b: normal.clone(), z: normal }
    }
}

impl ProtoNN {
    /// Registers `W`, `B`, `Z` with standard-normal initial values.
    pub fn new(context: &Rc<RefCell<GraphContext>>, hyper: HyperParams) -> Self {
        Self::with_init(context, hyper, ProtoNnInit::default())
    }

    pub fn with_init(context: &Rc<RefCell<GraphContext>>, hyper: HyperParams, init: ProtoNnInit) -> Self {
        let w = Tensor::new_parameter(context, "W", &[hyper.d, hyper.d_cap], init.w);
        let b = Tensor::new_parameter(context, "B", &[hyper.d_cap, hyper.m], init.b);
        let z = Tensor::new_parameter(context, "Z", &[hyper.l, hyper.m], init.z);
        let gamma = Tensor::scalar(context, hyper.gamma);
        Self { hyper, w, b, z, gamma, accuracy: RefCell::new(None) }
    }

    /// Squared distances between every projected sample and every prototype, `[n, m]`.
    fn l2_sim(&self, wx: &Tensor) -> Tensor {
        let two = Tensor::scalar(&wx.context, 2.0);
        let wx_sq = wx.square().sum_axis(1);
        let b_sq = self.b.square().sum_axis(0);
        let cross = &two * &wx.dot(&self.b);
        &(&wx_sq - &cross) + &b_sq
    }
}

impl ProtoNnModel for ProtoNN {
    fn forward(&self, x: &Tensor, y: &Tensor) -> Tensor {
        let wx = x.dot(&self.w);
        let l2_sim = self.l2_sim(&wx);
        let neg_gamma_sq = self.gamma.square().neg();
        let similarity = (&neg_gamma_sq * &l2_sim).exp();
        let y_hat = similarity.dot(&self.z.transpose(0, 1));

        let hits = y_hat.argmax().equal(&y.argmax());
        // latest forward call defines the accuracy node
        *self.accuracy.borrow_mut() = Some(hits.mean());
        y_hat
    }

    fn hyper_params(&self) -> HyperParams {
        self.hyper
    }

    fn model_matrices(&self) -> ModelMatrices {
        ModelMatrices {
            w: self.w.clone(),
            b: self.b.clone(),
            z: self.z.clone(),
            gamma: self.gamma.clone(),
        }
    }

    fn accuracy_op(&self) -> Option<Tensor> {
        self.accuracy.borrow().clone()
    }
}
