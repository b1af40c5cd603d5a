//! Model wrapper for gradient-based meta-learning.
//!
//! A [`ModelConfig`](crate::config::ModelConfig) is compiled into an immutable
//! [`CompiledGraph`]; the [`Model`] owns the parameter registry and optimizer
//! and exposes forward passes, gradients (optionally at fast weights),
//! optimizer steps and checkpointing.

pub mod graph;
pub mod layer;
pub mod loss;
pub mod network;
pub mod optimizer;
pub mod param;

pub use graph::{compile, Bindings, CompiledGraph, CompiledLayer, ForwardTrace, ParamSlot};
pub use layer::LayerSpec;
pub use loss::{compute_accuracy, LossFn};
pub use network::Model;
pub use optimizer::{
    AdamOptimizer, Optimizer, OptimizerKind, OptimizerStateSnapshot, SgdOptimizer,
};
pub use param::{adapt, ParamId, ParamKind, ParamMap, ParamRegistry, Parameter};
