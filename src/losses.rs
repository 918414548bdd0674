//! Loss functions in the graph paradigm.
//!
//! Loss functions here are regular Rust functions that take symbolic
//! `Tensor` handles and append the nodes needed to compute the error value.
//!
//! # Available Loss Functions
//!
//! - **Halved squared L2 norm**: `l2_loss`
//! - **Squared error**: `squared_error_loss`
//! - **Softmax cross-entropy**: `softmax_cross_entropy_with_logits`

use crate::tensor::Tensor;

// ============================================================================
// L2
// ============================================================================

/// Half the squared L2 norm of a tensor.
///
/// Formula: `l2(t) = 0.5 * sum(t^2)`.
///
/// Used both for the squared-error data term and for weight regularization.
pub fn l2_loss(t: &Tensor) -> Tensor {
    let half = Tensor::scalar(&t.context, 0.5);
    &half * &t.square().sum()
}

/// Computes `0.5 * sum((y_true - y_pred)^2)`.
pub fn squared_error_loss(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    l2_loss(&(y_true - y_pred))
}

// ============================================================================
// Cross-Entropy
// ============================================================================

/// Batch mean of the softmax cross-entropy between unnormalized `logits` and
/// target distributions `labels`.
///
/// Formula: `mean_i( -sum_j labels_ij * log_softmax(logits)_ij )`.
///
/// # Arguments
///
/// * `logits` - Scores of shape `[batch, classes]`.
/// * `labels` - Target distributions of the same shape. Treated as data: no
///   gradient flows into them.
pub fn softmax_cross_entropy_with_logits(logits: &Tensor, labels: &Tensor) -> Tensor {
    logits.softmax_cross_entropy(labels).mean()
}
