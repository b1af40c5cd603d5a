//! Harness configuration via TOML files.
//!
//! Sections are optional; missing keys fall back to the MNIST defaults
//! (10-way digit labels, Adam at `1e-3`).
//!
//! ```
//! use metagrad_core::HarnessConfig;
//!
//! let config = HarnessConfig::from_str(
//!     r#"
//!     [sampler]
//!     batch_size = 4
//!     num_classes_per_batch = 3
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.sampler.batch_size, 4);
//! assert_eq!(config.sampler.label_depth, 10);
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, MetaResult};
use crate::model::layer::LayerSpec;
use crate::model::loss::LossFn;
use crate::model::optimizer::OptimizerKind;

/// Upper bound on the number of meta-batches materialized per pass.
pub const DEFAULT_MAX_META_BATCHES: usize = 1000;

/// Sampler geometry and label selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplerConfig {
    /// Examples drawn per (task, class position)
    pub batch_size: usize,
    /// Tasks per meta-batch
    pub meta_batch_size: usize,
    /// Classes per task (the N in N-way)
    pub num_classes_per_batch: usize,
    /// Dataset labels eligible for training tasks
    pub train_digits: Vec<usize>,
    /// Dataset labels eligible for evaluation tasks
    pub test_digits: Vec<usize>,
    /// Emit one-hot label tensors instead of class indices
    pub one_hot_labels: bool,
    /// Replace labels by the inputs themselves (reconstruction tasks)
    pub same_input_and_label: bool,
    /// Number of dataset-level classes; valid labels are `0..label_depth`
    pub label_depth: usize,
    /// Cap on meta-batches per generation pass
    pub max_meta_batches: usize,
    /// Seed for pool shuffling and training draws
    pub seed: u64,
}

impl SamplerConfig {
    /// Examples in one task block (`batch_size * num_classes_per_batch`).
    pub fn task_examples(&self) -> usize {
        self.batch_size * self.num_classes_per_batch
    }

    /// Examples in one meta-batch.
    pub fn meta_batch_examples(&self) -> usize {
        self.task_examples() * self.meta_batch_size
    }

    pub fn validate(&self) -> MetaResult<()> {
        if self.batch_size == 0 {
            return Err(MetaError::config("batch_size", "must be non-zero"));
        }
        if self.meta_batch_size == 0 {
            return Err(MetaError::config("meta_batch_size", "must be non-zero"));
        }
        if self.num_classes_per_batch == 0 {
            return Err(MetaError::config(
                "num_classes_per_batch",
                "must be non-zero",
            ));
        }
        if self.label_depth == 0 {
            return Err(MetaError::config("label_depth", "must be non-zero"));
        }
        if self.max_meta_batches == 0 {
            return Err(MetaError::config("max_meta_batches", "must be non-zero"));
        }
        let examples = self
            .batch_size
            .checked_mul(self.num_classes_per_batch)
            .and_then(|n| n.checked_mul(self.meta_batch_size));
        if examples.is_none() {
            return Err(MetaError::config(
                "batch_size",
                format!(
                    "{} x {} classes x {} tasks overflows the meta-batch size",
                    self.batch_size, self.num_classes_per_batch, self.meta_batch_size
                ),
            ));
        }
        Ok(())
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            meta_batch_size: default_meta_batch_size(),
            num_classes_per_batch: default_num_classes_per_batch(),
            train_digits: default_train_digits(),
            test_digits: default_test_digits(),
            one_hot_labels: true,
            same_input_and_label: false,
            label_depth: default_label_depth(),
            max_meta_batches: DEFAULT_MAX_META_BATCHES,
            seed: default_seed(),
        }
    }
}

/// Model architecture, loss and optimizer selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Name used for checkpoint directories and parameter prefixes
    pub name: String,
    /// Shape of a single example, without the batch axis
    pub input_shape: Vec<usize>,
    /// Layers threaded in order
    pub layers: Vec<LayerSpec>,
    pub loss: LossFn,
    pub optimizer: OptimizerKind,
    pub learning_rate: f32,
    /// Momentum for SGD; ignored by Adam
    pub momentum: f32,
    /// L2 regularization strength
    pub weight_decay: f32,
    /// Seed for parameter initialization
    pub seed: u64,
}

impl ModelConfig {
    pub fn validate(&self) -> MetaResult<()> {
        if self.name.is_empty() {
            return Err(MetaError::config("model.name", "must not be empty"));
        }
        if self.input_shape.is_empty() || self.input_shape.contains(&0) {
            return Err(MetaError::config(
                "model.input_shape",
                format!("{:?} must be non-empty with positive extents", self.input_shape),
            ));
        }
        if self.layers.is_empty() {
            return Err(MetaError::config("model.layers", "at least one layer required"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(MetaError::config("model.learning_rate", "must be positive"));
        }
        if !self.momentum.is_finite() || !(0.0..1.0).contains(&self.momentum) {
            return Err(MetaError::config("model.momentum", "must be in [0, 1)"));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(MetaError::config("model.weight_decay", "must be >= 0"));
        }
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            input_shape: default_input_shape(),
            layers: default_layers(),
            loss: LossFn::default(),
            optimizer: OptimizerKind::default(),
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            weight_decay: 0.0,
            seed: default_model_seed(),
        }
    }
}

/// Complete harness configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HarnessConfig {
    pub sampler: SamplerConfig,
    pub model: ModelConfig,
}

impl HarnessConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> MetaResult<Self> {
        let contents = fs::read_to_string(&path)?;
        Self::from_str(&contents)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(toml_str: &str) -> MetaResult<Self> {
        let raw: RawHarnessConfig =
            toml::from_str(toml_str).map_err(|err| MetaError::config("toml", err.to_string()))?;

        let sampler = SamplerConfig::from(raw.sampler);
        sampler.validate()?;
        let model = ModelConfig::from(raw.model);
        model.validate()?;

        Ok(Self { sampler, model })
    }
}

#[derive(Debug, Deserialize)]
struct RawHarnessConfig {
    #[serde(default)]
    sampler: RawSampler,
    #[serde(default)]
    model: RawModel,
}

#[derive(Debug, Deserialize)]
struct RawSampler {
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_meta_batch_size")]
    meta_batch_size: usize,
    #[serde(default = "default_num_classes_per_batch")]
    num_classes_per_batch: usize,
    #[serde(default = "default_train_digits")]
    train_digits: Vec<usize>,
    #[serde(default = "default_test_digits")]
    test_digits: Vec<usize>,
    #[serde(default = "default_true")]
    one_hot_labels: bool,
    #[serde(default)]
    same_input_and_label: bool,
    #[serde(default = "default_label_depth")]
    label_depth: usize,
    #[serde(default = "default_max_meta_batches")]
    max_meta_batches: usize,
    #[serde(default = "default_seed")]
    seed: u64,
}

impl Default for RawSampler {
    fn default() -> Self {
        let defaults = SamplerConfig::default();
        Self {
            batch_size: defaults.batch_size,
            meta_batch_size: defaults.meta_batch_size,
            num_classes_per_batch: defaults.num_classes_per_batch,
            train_digits: defaults.train_digits,
            test_digits: defaults.test_digits,
            one_hot_labels: defaults.one_hot_labels,
            same_input_and_label: defaults.same_input_and_label,
            label_depth: defaults.label_depth,
            max_meta_batches: defaults.max_meta_batches,
            seed: defaults.seed,
        }
    }
}

impl From<RawSampler> for SamplerConfig {
    fn from(raw: RawSampler) -> Self {
        Self {
            batch_size: raw.batch_size,
            meta_batch_size: raw.meta_batch_size,
            num_classes_per_batch: raw.num_classes_per_batch,
            train_digits: raw.train_digits,
            test_digits: raw.test_digits,
            one_hot_labels: raw.one_hot_labels,
            same_input_and_label: raw.same_input_and_label,
            label_depth: raw.label_depth,
            max_meta_batches: raw.max_meta_batches,
            seed: raw.seed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawModel {
    #[serde(default = "default_model_name")]
    name: String,
    #[serde(default = "default_input_shape")]
    input_shape: Vec<usize>,
    #[serde(default = "default_layers")]
    layers: Vec<LayerSpec>,
    #[serde(default)]
    loss: LossFn,
    #[serde(default)]
    optimizer: OptimizerKind,
    #[serde(default = "default_learning_rate")]
    learning_rate: f32,
    #[serde(default = "default_momentum")]
    momentum: f32,
    #[serde(default)]
    weight_decay: f32,
    #[serde(default = "default_model_seed")]
    seed: u64,
}

impl Default for RawModel {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            input_shape: default_input_shape(),
            layers: default_layers(),
            loss: LossFn::default(),
            optimizer: OptimizerKind::default(),
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            weight_decay: 0.0,
            seed: default_model_seed(),
        }
    }
}

impl From<RawModel> for ModelConfig {
    fn from(raw: RawModel) -> Self {
        Self {
            name: raw.name,
            input_shape: raw.input_shape,
            layers: raw.layers,
            loss: raw.loss,
            optimizer: raw.optimizer,
            learning_rate: raw.learning_rate,
            momentum: raw.momentum,
            weight_decay: raw.weight_decay,
            seed: raw.seed,
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_meta_batch_size() -> usize {
    7
}

fn default_num_classes_per_batch() -> usize {
    2
}

fn default_train_digits() -> Vec<usize> {
    (0..8).collect()
}

fn default_test_digits() -> Vec<usize> {
    vec![8, 9]
}

fn default_true() -> bool {
    true
}

fn default_label_depth() -> usize {
    10
}

fn default_max_meta_batches() -> usize {
    DEFAULT_MAX_META_BATCHES
}

fn default_seed() -> u64 {
    42
}

fn default_model_name() -> String {
    "model".to_string()
}

fn default_input_shape() -> Vec<usize> {
    vec![28, 28]
}

fn default_layers() -> Vec<LayerSpec> {
    vec![LayerSpec::Dense(64), LayerSpec::Relu, LayerSpec::Dense(10)]
}

fn default_learning_rate() -> f32 {
    0.001
}

fn default_momentum() -> f32 {
    0.9
}

fn default_model_seed() -> u64 {
    7
}
