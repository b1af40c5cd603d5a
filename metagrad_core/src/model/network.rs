//! The model wrapper: build, forward, gradients, updates and persistence.

use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewD};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{CheckpointError, Checkpointable};
use crate::config::ModelConfig;
use crate::error::{MetaError, MetaResult};
use crate::model::graph::{compile, Bindings, CompiledGraph, CompiledLayer};
use crate::model::layer::init_dense;
use crate::model::loss;
use crate::model::optimizer::{Optimizer, OptimizerStateSnapshot};
use crate::model::param::{ParamMap, ParamRegistry, Parameter};

const MODEL_CHECKPOINT_VERSION: u32 = 1;

/// `chrono` format of the per-save directory suffix.
const TIMESTAMP_FORMAT: &str = "%H_%M_%m_%d_%y";

#[derive(Serialize, Deserialize)]
struct ModelCheckpoint {
    version: u32,
    name: String,
    params: Vec<Parameter>,
    #[serde(default)]
    optimizer_state: Option<OptimizerStateSnapshot>,
    #[serde(default)]
    steps: u64,
}

#[derive(Debug, Clone)]
struct BuiltState {
    graph: CompiledGraph,
    registry: ParamRegistry,
    optimizer: Optimizer,
    steps: u64,
}

/// A feed-forward network driven by a [`ModelConfig`].
///
/// Starts unbuilt; every graph-dependent call before [`Model::build`] returns
/// [`MetaError::State`].
#[derive(Debug, Clone)]
pub struct Model {
    config: ModelConfig,
    built: Option<BuiltState>,
}

impl Model {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            built: None,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    /// Compile the graph and initialize parameters from `config.seed`.
    ///
    /// Building again discards trained values and optimizer state.
    pub fn build(&mut self) -> MetaResult<()> {
        let graph = compile(&self.config)?;
        let mut registry = ParamRegistry::new();

        for layer in graph.layers() {
            if let CompiledLayer::Dense {
                index,
                input_dim,
                output_dim,
                kernel,
                bias,
            } = layer
            {
                let seed = self.config.seed.wrapping_add(*index as u64);
                let (kernel_value, bias_value) = init_dense(*input_dim, *output_dim, seed);
                registry.register(kernel.id, kernel.name.clone(), kernel_value.into_dyn())?;
                registry.register(bias.id, bias.name.clone(), bias_value.into_dyn())?;
            }
        }

        info!(
            model = %self.config.name,
            layers = graph.layers().len(),
            params = registry.num_scalars(),
            "model built"
        );

        self.built = Some(BuiltState {
            graph,
            registry,
            optimizer: Optimizer::from_config(&self.config),
            steps: 0,
        });
        Ok(())
    }

    fn state(&self, operation: &str) -> MetaResult<&BuiltState> {
        self.built
            .as_ref()
            .ok_or_else(|| MetaError::state(format!("{operation} before build")))
    }

    fn state_mut(&mut self, operation: &str) -> MetaResult<&mut BuiltState> {
        self.built
            .as_mut()
            .ok_or_else(|| MetaError::state(format!("{operation} before build")))
    }

    pub fn graph(&self) -> MetaResult<&CompiledGraph> {
        Ok(&self.state("graph")?.graph)
    }

    /// Number of optimizer steps applied since the last build or restore.
    pub fn steps(&self) -> MetaResult<u64> {
        Ok(self.state("steps")?.steps)
    }

    /// Logits `[batch, output_dim]` for `[batch, ...input_shape]` inputs.
    pub fn forward(&self, inputs: ArrayViewD<'_, f32>) -> MetaResult<Array2<f32>> {
        self.forward_with(inputs, None)
    }

    /// Forward pass using `fast_params` where supplied, base values otherwise.
    pub fn forward_with(
        &self,
        inputs: ArrayViewD<'_, f32>,
        fast_params: Option<&ParamMap>,
    ) -> MetaResult<Array2<f32>> {
        let state = self.state("forward")?;
        let bindings = Bindings::new(&state.registry, fast_params);
        let input = state.graph.flatten_inputs(inputs)?;
        let mut trace = state.graph.forward(&bindings, input)?;
        trace
            .activations
            .pop()
            .ok_or_else(|| MetaError::state("forward produced no output"))
    }

    pub fn loss(
        &self,
        inputs: ArrayViewD<'_, f32>,
        targets: ArrayViewD<'_, f32>,
    ) -> MetaResult<f32> {
        self.loss_with(inputs, targets, None)
    }

    pub fn loss_with(
        &self,
        inputs: ArrayViewD<'_, f32>,
        targets: ArrayViewD<'_, f32>,
        fast_params: Option<&ParamMap>,
    ) -> MetaResult<f32> {
        let state = self.state("loss")?;
        let logits = self.forward_with(inputs, fast_params)?;
        let targets = state.graph.flatten_targets(targets)?;
        Ok(self.config.loss.compute(&logits, &targets)?.0)
    }

    /// Gradients of the loss w.r.t. parameters.
    ///
    /// Without `fast_params` every registered parameter gets a gradient. With
    /// `fast_params` the forward pass uses the supplied values and only the
    /// supplied (registered) names are returned.
    pub fn compute_gradients(
        &self,
        inputs: ArrayViewD<'_, f32>,
        targets: ArrayViewD<'_, f32>,
        fast_params: Option<&ParamMap>,
    ) -> MetaResult<ParamMap> {
        Ok(self.loss_and_gradients(inputs, targets, fast_params)?.1)
    }

    pub fn loss_and_gradients(
        &self,
        inputs: ArrayViewD<'_, f32>,
        targets: ArrayViewD<'_, f32>,
        fast_params: Option<&ParamMap>,
    ) -> MetaResult<(f32, ParamMap)> {
        let state = self.state("compute_gradients")?;
        let bindings = Bindings::new(&state.registry, fast_params);

        let input = state.graph.flatten_inputs(inputs)?;
        let targets = state.graph.flatten_targets(targets)?;
        let trace = state.graph.forward(&bindings, input)?;
        let logits = trace
            .output()
            .ok_or_else(|| MetaError::state("forward produced no output"))?;

        let (loss, grad_output) = self.config.loss.compute(logits, &targets)?;
        let grads = state.graph.backward(&bindings, &trace, grad_output)?;
        Ok((loss, grads))
    }

    /// One optimizer step on the base parameters; returns the pre-step loss.
    pub fn optimize(
        &mut self,
        inputs: ArrayViewD<'_, f32>,
        targets: ArrayViewD<'_, f32>,
    ) -> MetaResult<f32> {
        let (loss, grads) = self.loss_and_gradients(inputs, targets, None)?;
        self.apply_gradients(&grads)?;
        Ok(loss)
    }

    /// Apply externally computed gradients (for example query-set gradients
    /// taken at fast weights) as one optimizer step.
    pub fn apply_gradients(&mut self, grads: &ParamMap) -> MetaResult<usize> {
        let state = self.state_mut("optimize")?;
        let updated = state.optimizer.apply(&mut state.registry, grads)?;
        state.steps += 1;
        debug!(step = state.steps, updated, "optimizer step");
        Ok(updated)
    }

    /// Mean of `argmax(logits) == label` over the batch.
    pub fn compute_accuracy(
        labels: ArrayView1<'_, usize>,
        logits: ArrayView2<'_, f32>,
    ) -> MetaResult<f32> {
        loss::compute_accuracy(labels, logits)
    }

    pub fn accuracy(
        &self,
        inputs: ArrayViewD<'_, f32>,
        labels: ArrayView1<'_, usize>,
    ) -> MetaResult<f32> {
        self.accuracy_with(inputs, labels, None)
    }

    pub fn accuracy_with(
        &self,
        inputs: ArrayViewD<'_, f32>,
        labels: ArrayView1<'_, usize>,
        fast_params: Option<&ParamMap>,
    ) -> MetaResult<f32> {
        let logits = self.forward_with(inputs, fast_params)?;
        loss::compute_accuracy(labels, logits.view())
    }

    /// Overwrite matching parameters; see [`ParamRegistry::assign`].
    pub fn assign_params(&mut self, values: &ParamMap) -> MetaResult<usize> {
        let state = self.state_mut("assign_params")?;
        state.registry.assign(values)
    }

    pub fn params(&self) -> MetaResult<ParamMap> {
        Ok(self.state("params")?.registry.to_map())
    }

    pub fn registry(&self) -> MetaResult<&ParamRegistry> {
        Ok(&self.state("registry")?.registry)
    }

    pub fn optimizer(&self) -> MetaResult<&Optimizer> {
        Ok(&self.state("optimizer")?.optimizer)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> MetaResult<()> {
        self.state("save")?;
        self.save_checkpoint(&path)?;
        info!(path = %path.as_ref().display(), "checkpoint saved");
        Ok(())
    }

    pub fn restore<P: AsRef<Path>>(&mut self, path: P) -> MetaResult<()> {
        self.state("restore")?;
        self.load_checkpoint(&path)?;
        info!(path = %path.as_ref().display(), "checkpoint restored");
        Ok(())
    }

    /// Save to `dir/<name>_<%H_%M_%m_%d_%y>/<name>.ckpt` and return that path.
    pub fn save_timestamped<P: AsRef<Path>>(&self, dir: P) -> MetaResult<PathBuf> {
        let stamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
        let path = dir
            .as_ref()
            .join(format!("{}_{stamp}", self.config.name))
            .join(format!("{}.ckpt", self.config.name));
        self.save(&path)?;
        Ok(path)
    }
}

impl Checkpointable for Model {
    fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        let state = self
            .built
            .as_ref()
            .ok_or_else(|| CheckpointError::InvalidFormat("model is not built".to_string()))?;

        let snapshot = ModelCheckpoint {
            version: MODEL_CHECKPOINT_VERSION,
            name: self.config.name.clone(),
            params: state.registry.iter().cloned().collect(),
            optimizer_state: Some(state.optimizer.snapshot()),
            steps: state.steps,
        };
        Self::write_snapshot(&snapshot, path)
    }

    fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<(), CheckpointError> {
        let snapshot: ModelCheckpoint = Self::read_snapshot(path)?;
        if snapshot.version != MODEL_CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: MODEL_CHECKPOINT_VERSION,
                found: snapshot.version,
            });
        }

        let state = self
            .built
            .as_mut()
            .ok_or_else(|| CheckpointError::InvalidFormat("model is not built".to_string()))?;

        if snapshot.params.len() != state.registry.len() {
            return Err(CheckpointError::InvalidFormat(format!(
                "parameter count mismatch: expected {}, found {}",
                state.registry.len(),
                snapshot.params.len()
            )));
        }
        for param in &snapshot.params {
            let registered = state.registry.get(&param.name).ok_or_else(|| {
                CheckpointError::InvalidFormat(format!("unknown parameter '{}'", param.name))
            })?;
            if registered.id != param.id || registered.value.shape() != param.value.shape() {
                return Err(CheckpointError::InvalidFormat(format!(
                    "parameter '{}' mismatch: expected {:?} {:?}, found {:?} {:?}",
                    param.name,
                    registered.id,
                    registered.value.shape(),
                    param.id,
                    param.value.shape()
                )));
            }
        }

        let mut optimizer = state.optimizer.clone();
        if let Some(optimizer_state) = snapshot.optimizer_state {
            optimizer.restore(optimizer_state)?;
        }

        let values: ParamMap = snapshot
            .params
            .into_iter()
            .map(|param| (param.name, param.value))
            .collect();
        state
            .registry
            .assign(&values)
            .map_err(|err| CheckpointError::InvalidFormat(err.to_string()))?;
        state.optimizer = optimizer;
        state.steps = snapshot.steps;
        Ok(())
    }
}
