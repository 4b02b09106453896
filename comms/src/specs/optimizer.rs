use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{Precision, Result};

/// The hyperparameters of the Adagrad algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdagradSpec {
    pub epsilon: f32,
}

impl Default for AdagradSpec {
    fn default() -> Self {
        Self { epsilon: 1e-8 }
    }
}

/// The hyperparameters of the Adam algorithm.
///
/// A `weight_decay` of zero disables decoupled weight decay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamSpec {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
}

impl Default for AdamSpec {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.,
        }
    }
}

/// The specification for the `Optimizer` trait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmSpec {
    Sgd,
    Adagrad(AdagradSpec),
    Adam(AdamSpec),
}

impl AlgorithmSpec {
    /// Returns the name of the algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sgd => "sgd",
            Self::Adagrad(_) => "adagrad",
            Self::Adam(_) => "adam",
        }
    }

    /// Overrides hyperparameters from a positional list.
    ///
    /// The order is fixed per algorithm, Adagrad takes `[epsilon]` and Adam takes
    /// `[beta1, beta2, epsilon, weight_decay]`. Trailing values that are omitted keep
    /// their current value and extra values are ignored.
    ///
    /// # Arguments
    /// * `values` - The positional hyperparameters.
    ///
    /// # Returns
    /// A copy of this spec with the given values applied.
    pub fn with_positional(mut self, values: &[f32]) -> Self {
        match &mut self {
            Self::Sgd => {}
            Self::Adagrad(spec) => {
                if let Some(&epsilon) = values.first() {
                    spec.epsilon = epsilon;
                }
            }
            Self::Adam(spec) => {
                let fields = [
                    &mut spec.beta1,
                    &mut spec.beta2,
                    &mut spec.epsilon,
                    &mut spec.weight_decay,
                ];

                for (field, &value) in fields.into_iter().zip(values) {
                    *field = value;
                }
            }
        }

        self
    }
}

/// The specification for the `Clipper` trait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipperSpec {
    Norm { threshold: f32 },
    Elementwise { threshold: f32 },
    ReportNorm,
}

/// The specification for the exponential smoothing of parameters.
///
/// A `ref_batch_words` of zero disables the batch size correction of the decay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothingSpec {
    pub decay: f32,
    #[serde(default)]
    pub ref_batch_words: usize,
}

fn default_precision() -> Vec<Precision> {
    vec![Precision::Float32, Precision::Float32]
}

/// The specification for a complete optimizer, including its lifecycle settings.
///
/// `precision` lists the storage precision of the parameters followed by the
/// precision the optimizer does its math and keeps its statistics in.
/// `optimizer_params` overrides the algorithm's hyperparameters positionally, see
/// `AlgorithmSpec::with_positional`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    pub algorithm: AlgorithmSpec,
    pub learning_rate: f32,
    #[serde(default)]
    pub optimizer_params: Vec<f32>,
    #[serde(default)]
    pub mini_batch_words_ref: usize,
    #[serde(default = "default_precision")]
    pub precision: Vec<Precision>,
    #[serde(default)]
    pub clipper: Option<ClipperSpec>,
    #[serde(default)]
    pub smoothing: Option<SmoothingSpec>,
}

impl OptimizerSpec {
    /// Creates a new `OptimizerSpec` with every optional setting disabled.
    ///
    /// # Arguments
    /// * `algorithm` - The update rule and its hyperparameters.
    /// * `learning_rate` - The base learning rate.
    pub fn new(algorithm: AlgorithmSpec, learning_rate: f32) -> Self {
        Self {
            algorithm,
            learning_rate,
            optimizer_params: Vec::new(),
            mini_batch_words_ref: 0,
            precision: default_precision(),
            clipper: None,
            smoothing: None,
        }
    }

    /// Returns the algorithm with `optimizer_params` applied.
    pub fn resolved_algorithm(&self) -> AlgorithmSpec {
        self.algorithm.with_positional(&self.optimizer_params)
    }

    /// Parses an `OptimizerSpec` out of a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads an `OptimizerSpec` from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{ "algorithm": { "adam": {} }, "learning_rate": 0.001 }"#;
        let spec = OptimizerSpec::from_json(json).unwrap();

        assert_eq!(spec.algorithm, AlgorithmSpec::Adam(AdamSpec::default()));
        assert_eq!(spec.mini_batch_words_ref, 0);
        assert!(spec.optimizer_params.is_empty());
        assert_eq!(spec.precision, default_precision());
        assert!(spec.clipper.is_none());
        assert!(spec.smoothing.is_none());
    }

    #[test]
    fn test_full_json() {
        let json = r#"{
            "algorithm": { "adagrad": { "epsilon": 1e-6 } },
            "learning_rate": 0.1,
            "mini_batch_words_ref": 1000,
            "precision": ["float16", "float32"],
            "clipper": { "norm": { "threshold": 1.0 } },
            "smoothing": { "decay": 0.0001 }
        }"#;
        let spec: OptimizerSpec = serde_json::from_str(json).unwrap();

        assert_eq!(spec.algorithm, AlgorithmSpec::Adagrad(AdagradSpec { epsilon: 1e-6 }));
        assert_eq!(spec.precision, vec![Precision::Float16, Precision::Float32]);
        assert_eq!(spec.clipper, Some(ClipperSpec::Norm { threshold: 1.0 }));
        assert_eq!(spec.smoothing.unwrap().ref_batch_words, 0);
    }

    #[test]
    fn test_optimizer_params_override_algorithm() {
        let json = r#"{
            "algorithm": { "adam": { "epsilon": 1e-6 } },
            "learning_rate": 0.1,
            "optimizer_params": [0.8]
        }"#;
        let spec = OptimizerSpec::from_json(json).unwrap();

        let expected = AdamSpec {
            beta1: 0.8,
            epsilon: 1e-6,
            ..Default::default()
        };
        assert_eq!(spec.resolved_algorithm(), AlgorithmSpec::Adam(expected));
    }

    #[test]
    fn test_invalid_json() {
        let json = r#"{ "algorithm": "rmsprop", "learning_rate": 0.1 }"#;
        let res = OptimizerSpec::from_json(json);
        assert!(matches!(res, Err(crate::CommsErr::Spec(_))));
    }

    #[test]
    fn test_sgd_is_a_plain_string() {
        let json = r#"{ "algorithm": "sgd", "learning_rate": 0.5 }"#;
        let spec: OptimizerSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.algorithm, AlgorithmSpec::Sgd);
    }

    #[test]
    fn test_positional_adam_keeps_trailing_defaults() {
        let spec = AlgorithmSpec::Adam(AdamSpec::default()).with_positional(&[0.8, 0.99]);

        let AlgorithmSpec::Adam(adam) = spec else {
            panic!("expected adam");
        };
        assert_eq!(adam.beta1, 0.8);
        assert_eq!(adam.beta2, 0.99);
        assert_eq!(adam.epsilon, 1e-8);
        assert_eq!(adam.weight_decay, 0.);
    }

    #[test]
    fn test_positional_adagrad_and_sgd() {
        let spec = AlgorithmSpec::Adagrad(AdagradSpec::default()).with_positional(&[1e-4, 7.]);
        assert_eq!(spec, AlgorithmSpec::Adagrad(AdagradSpec { epsilon: 1e-4 }));

        assert_eq!(AlgorithmSpec::Sgd.with_positional(&[1.]), AlgorithmSpec::Sgd);
    }
}
