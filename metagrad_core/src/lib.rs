//! # Metagrad Core
//!
//! Episodic few-shot data sampling and a small model wrapper for
//! gradient-based meta-learning on digit-style datasets.
//!
//! ## Quick Start
//!
//! ```rust
//! use metagrad_core::{
//!     generate_dataset, split_support_query, synthetic_digits, DatasetPool, SamplerConfig, Split,
//! };
//!
//! let digits = synthetic_digits(40, 6, 6, 3);
//! let config = SamplerConfig {
//!     batch_size: 4,
//!     meta_batch_size: 3,
//!     ..SamplerConfig::default()
//! };
//! let pool = DatasetPool::from_digits(&digits, &config).unwrap();
//! let dataset = generate_dataset(&pool, &config, Split::Train).unwrap();
//!
//! let batch = dataset.meta_batch(0).unwrap();
//! assert_eq!(batch.inputs.shape(), &[3, 8, 6, 6]);
//!
//! let halves = split_support_query(&batch, 4, 2, false).unwrap();
//! assert_eq!(halves.input_a.shape(), &[3, 4, 6, 6]);
//! ```
//!
//! ## Core Modules
//!
//! - [`config`] - Sampler and model configuration via TOML
//! - [`sampler`] - Label pools, task permutations and meta-batch assembly
//! - [`model`] - Compiled layer graph, parameter registry and optimizers
//! - [`data`] - IDX digit loading and a synthetic stand-in
//! - [`logging`] - JSON line-delimited generation and training logs
//! - [`checkpoint`] - Versioned binary persistence

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod model;
pub mod sampler;

pub use checkpoint::{CheckpointError, Checkpointable};
pub use config::{HarnessConfig, ModelConfig, SamplerConfig};
pub use data::{load_mnist, synthetic_digits, DigitSet};
pub use error::{ErrorKind, MetaError, MetaResult};
pub use logging::{
    log_generation, log_training_step, GenerationLogEntry, TrainingLogEntry, GENERATION_LOG,
    RUN_LOG,
};
pub use model::{adapt, compile, CompiledGraph, LayerSpec, LossFn, Model, OptimizerKind, ParamMap};
pub use sampler::{
    build_pool, generate_dataset, generate_dataset_with_cursors, one_hot, split_support_query,
    CursorMap, DatasetPool, Labels, MaterializedDataset, MetaBatch, Split, SupportQuery, Task,
};
