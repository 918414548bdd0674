//! Trainer configuration.

use super::error::{TrainerError, TrainerResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Data-fit term of the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LossType {
    /// Halved sum of squared errors over the whole batch.
    L2,
    /// Batch mean of softmax cross-entropy with the scores as logits.
    Xentropy,
}

impl LossType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossType::L2 => "l2",
            LossType::Xentropy => "xentropy",
        }
    }

    /// Log target of records emitted while building this loss.
    pub fn scope(&self) -> &'static str {
        match self {
            LossType::L2 => "protonn-l2-loss",
            LossType::Xentropy => "protonn-xentropy-loss",
        }
    }
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossType {
    type Err = TrainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l2" => Ok(LossType::L2),
            "xentropy" => Ok(LossType::Xentropy),
            other => Err(TrainerError::InvalidLossType(other.to_string())),
        }
    }
}

impl TryFrom<String> for LossType {
    type Error = TrainerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LossType> for String {
    fn from(value: LossType) -> Self {
        value.as_str().to_string()
    }
}

/// Hyperparameters owned by the trainer. Validated once when the trainer is
/// built and never changed afterwards.
///
/// Sparsity targets are checked but not enforced: training is dense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub reg_w: f32,
    pub reg_b: f32,
    pub reg_z: f32,
    pub sparsity_w: f32,
    pub sparsity_b: f32,
    pub sparsity_z: f32,
    pub learning_rate: f32,
    pub loss_type: LossType,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            reg_w: 0.0,
            reg_b: 0.0,
            reg_z: 0.0,
            sparsity_w: 1.0,
            sparsity_b: 1.0,
            sparsity_z: 1.0,
            learning_rate: 0.01,
            loss_type: LossType::L2,
        }
    }
}

impl TrainerConfig {
    /// Each sparsity target must lie in `[0, 1]`.
    pub fn validate_sparsity(&self) -> TrainerResult<()> {
        for (param, value) in [("W", self.sparsity_w), ("B", self.sparsity_b), ("Z", self.sparsity_z)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TrainerError::Config {
                    param: param.to_string(),
                    message: format!("Sparsity value should be between 0 and 1 (both inclusive), got {}", value),
                });
            }
        }
        Ok(())
    }

    /// Regularization weights must be finite and non-negative, the learning
    /// rate finite and positive.
    pub fn validate_rates(&self) -> TrainerResult<()> {
        for (param, value) in [("regW", self.reg_w), ("regB", self.reg_b), ("regZ", self.reg_z)] {
            if !value.is_finite() || value < 0.0 {
                return Err(TrainerError::Config {
                    param: param.to_string(),
                    message: format!("Regularization weight should be finite and non-negative, got {}", value),
                });
            }
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainerError::Config {
                param: "learningRate".to_string(),
                message: format!("Learning rate should be finite and positive, got {}", self.learning_rate),
            });
        }
        Ok(())
    }
}

/// Per-call switches of [`ProtoNnTrainer::train`](super::ProtoNnTrainer::train).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainOptions {
    /// Keep the current variable values and optimizer state instead of
    /// reinitializing them.
    pub skip_init: bool,
    /// A progress line is written for every batch whose index is a multiple
    /// of this.
    pub print_step: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self { skip_init: false, print_step: 10 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_type_parses_known_kinds_only() {
        assert_eq!("l2".parse::<LossType>().unwrap(), LossType::L2);
        assert_eq!("xentropy".parse::<LossType>().unwrap(), LossType::Xentropy);
        let err = "hinge".parse::<LossType>().unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, TrainerError::InvalidLossType(ref s) if s == "hinge"));
        assert!(msg.contains("'l2'") && msg.contains("'xentropy'"));
    }

    #[test]
    fn sparsity_error_names_the_matrix() {
        let config = TrainerConfig { sparsity_b: 1.5, ..TrainerConfig::default() };
        match config.validate_sparsity() {
            Err(TrainerError::Config { param, .. }) => assert_eq!(param, "B"),
            other => panic!("unexpected {:?}", other),
        }
        let nan = TrainerConfig { sparsity_z: f32::NAN, ..TrainerConfig::default() };
        assert!(matches!(nan.validate_sparsity(), Err(TrainerError::Config { ref param, .. }) if param == "Z"));
        let edges = TrainerConfig { sparsity_w: 0.0, sparsity_b: 1.0, ..TrainerConfig::default() };
        assert!(edges.validate_sparsity().is_ok());
    }

    #[test]
    fn rates_must_be_sane() {
        let negative = TrainerConfig { reg_z: -0.1, ..TrainerConfig::default() };
        assert!(negative.validate_rates().is_err());
        let zero_lr = TrainerConfig { learning_rate: 0.0, ..TrainerConfig::default() };
        assert!(zero_lr.validate_rates().is_err());
        assert!(TrainerConfig::default().validate_rates().is_ok());
    }
}
