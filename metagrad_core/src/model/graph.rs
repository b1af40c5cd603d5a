//! Compilation of a [`ModelConfig`] into an immutable layer graph.
//!
//! [`compile`] is pure: it resolves every layer's dimensions and parameter
//! slots up front, so forward and backward passes only look values up by
//! name in a [`Bindings`] view over the model's registry.

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewD, Ix1, Ix2};

use crate::config::ModelConfig;
use crate::error::{MetaError, MetaResult};
use crate::model::layer::{self, LayerSpec};
use crate::model::param::{ParamId, ParamKind, ParamMap, ParamRegistry};

/// Name, identity and shape of one trainable tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSlot {
    pub id: ParamId,
    pub name: String,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledLayer {
    Dense {
        index: usize,
        input_dim: usize,
        output_dim: usize,
        kernel: ParamSlot,
        bias: ParamSlot,
    },
    Activation {
        index: usize,
        spec: LayerSpec,
        dim: usize,
    },
}

impl CompiledLayer {
    pub fn index(&self) -> usize {
        match self {
            CompiledLayer::Dense { index, .. } | CompiledLayer::Activation { index, .. } => {
                *index
            }
        }
    }

    pub fn slots(&self) -> Vec<&ParamSlot> {
        match self {
            CompiledLayer::Dense { kernel, bias, .. } => vec![kernel, bias],
            CompiledLayer::Activation { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledGraph {
    name: String,
    input_shape: Vec<usize>,
    input_dim: usize,
    output_dim: usize,
    layers: Vec<CompiledLayer>,
}

/// Activations cached by a forward pass: `activations[i]` feeds layer `i`,
/// the last entry is the network output.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    pub activations: Vec<Array2<f32>>,
}

impl ForwardTrace {
    pub fn output(&self) -> Option<&Array2<f32>> {
        self.activations.last()
    }
}

/// Parameter values for one pass: fast weights where supplied, base values
/// from the registry otherwise.
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    base: &'a ParamRegistry,
    overrides: Option<&'a ParamMap>,
}

impl<'a> Bindings<'a> {
    pub fn new(base: &'a ParamRegistry, overrides: Option<&'a ParamMap>) -> Self {
        Self { base, overrides }
    }

    /// Whether gradients for `name` should be reported.
    pub fn wants(&self, name: &str) -> bool {
        match self.overrides {
            Some(overrides) => overrides.contains_key(name),
            None => true,
        }
    }

    fn lookup(&self, slot: &ParamSlot) -> MetaResult<ArrayViewD<'a, f32>> {
        let value = self
            .overrides
            .and_then(|overrides| overrides.get(&slot.name))
            .or_else(|| self.base.get(&slot.name).map(|param| &param.value))
            .ok_or_else(|| MetaError::state(format!("lookup of unregistered '{}'", slot.name)))?;
        if value.shape() != slot.shape.as_slice() {
            return Err(MetaError::shape(
                format!("parameter '{}'", slot.name),
                &slot.shape,
                value.shape(),
            ));
        }
        Ok(value.view())
    }

    fn matrix(&self, slot: &ParamSlot) -> MetaResult<ArrayView2<'a, f32>> {
        self.lookup(slot)?
            .into_dimensionality::<Ix2>()
            .map_err(|_| MetaError::shape(format!("kernel '{}'", slot.name), &slot.shape, &[]))
    }

    fn vector(&self, slot: &ParamSlot) -> MetaResult<ArrayView1<'a, f32>> {
        self.lookup(slot)?
            .into_dimensionality::<Ix1>()
            .map_err(|_| MetaError::shape(format!("bias '{}'", slot.name), &slot.shape, &[]))
    }
}

pub fn param_name(model: &str, layer: usize, kind: ParamKind) -> String {
    format!("{model}/layer{layer}/{}", kind.suffix())
}

/// Resolve dimensions and parameter slots for `config`.
pub fn compile(config: &ModelConfig) -> MetaResult<CompiledGraph> {
    config.validate()?;

    let input_dim: usize = config.input_shape.iter().product();
    let mut dim = input_dim;
    let mut layers = Vec::with_capacity(config.layers.len());

    for (index, spec) in config.layers.iter().enumerate() {
        match *spec {
            LayerSpec::Dense(0) => {
                return Err(MetaError::config(
                    format!("model.layers[{index}]"),
                    "dense layer needs at least one unit",
                ));
            }
            LayerSpec::Dense(units) => {
                let slot = |kind: ParamKind, shape: Vec<usize>| ParamSlot {
                    id: ParamId { layer: index, kind },
                    name: param_name(&config.name, index, kind),
                    shape,
                };
                layers.push(CompiledLayer::Dense {
                    index,
                    input_dim: dim,
                    output_dim: units,
                    kernel: slot(ParamKind::Weight, vec![dim, units]),
                    bias: slot(ParamKind::Bias, vec![units]),
                });
            }
            activation => layers.push(CompiledLayer::Activation {
                index,
                spec: activation,
                dim,
            }),
        }
        dim = spec.output_dim(dim);
    }

    Ok(CompiledGraph {
        name: config.name.clone(),
        input_shape: config.input_shape.clone(),
        input_dim,
        output_dim: dim,
        layers,
    })
}

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn layers(&self) -> &[CompiledLayer] {
        &self.layers
    }

    pub fn slots(&self) -> impl Iterator<Item = &ParamSlot> + '_ {
        self.layers.iter().flat_map(|layer| layer.slots())
    }

    /// Reshape `[batch, ...input_shape]` (or any trailing layout with the same
    /// element count) into `[batch, input_dim]`.
    pub fn flatten_inputs(&self, inputs: ArrayViewD<'_, f32>) -> MetaResult<Array2<f32>> {
        flatten(inputs, self.input_dim, "model inputs")
    }

    /// Reshape targets into `[batch, output_dim]`.
    pub fn flatten_targets(&self, targets: ArrayViewD<'_, f32>) -> MetaResult<Array2<f32>> {
        flatten(targets, self.output_dim, "model targets")
    }

    pub fn forward(&self, bindings: &Bindings<'_>, input: Array2<f32>) -> MetaResult<ForwardTrace> {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(input);

        for compiled in &self.layers {
            let current = activations
                .last()
                .ok_or_else(|| MetaError::state("forward without input"))?;
            let next = match compiled {
                CompiledLayer::Dense { kernel, bias, .. } => {
                    layer::dense_forward(current, bindings.matrix(kernel)?, bindings.vector(bias)?)
                }
                CompiledLayer::Activation { spec, .. } => layer::activate(*spec, current),
            };
            activations.push(next);
        }

        Ok(ForwardTrace { activations })
    }

    /// Backpropagate `grad_output` through `trace`, keeping gradients only for
    /// the parameters `bindings` reports as wanted.
    pub fn backward(
        &self,
        bindings: &Bindings<'_>,
        trace: &ForwardTrace,
        grad_output: Array2<f32>,
    ) -> MetaResult<ParamMap> {
        if trace.activations.len() != self.layers.len() + 1 {
            return Err(MetaError::state("backward with a trace from another graph"));
        }

        let mut grads = ParamMap::new();
        let mut grad = grad_output;

        for (position, compiled) in self.layers.iter().enumerate().rev() {
            let input = &trace.activations[position];
            let output = &trace.activations[position + 1];
            grad = match compiled {
                CompiledLayer::Dense { kernel, bias, .. } => {
                    let (grad_input, grad_kernel, grad_bias) =
                        layer::dense_backward(input, bindings.matrix(kernel)?, &grad);
                    if bindings.wants(&kernel.name) {
                        grads.insert(kernel.name.clone(), grad_kernel.into_dyn());
                    }
                    if bindings.wants(&bias.name) {
                        grads.insert(bias.name.clone(), grad_bias.into_dyn());
                    }
                    grad_input
                }
                CompiledLayer::Activation { spec, .. } => {
                    layer::activation_backward(*spec, input, output, &grad)
                }
            };
        }

        Ok(grads)
    }
}

fn flatten(values: ArrayViewD<'_, f32>, features: usize, context: &str) -> MetaResult<Array2<f32>> {
    let shape = values.shape();
    let trailing: usize = shape.iter().skip(1).product();
    if shape.len() < 2 || trailing != features {
        return Err(MetaError::shape(
            context,
            &[shape.first().copied().unwrap_or(0), features],
            shape,
        ));
    }
    let rows = shape[0];
    values
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, features))
        .map_err(|_| MetaError::shape(context, &[rows, features], values.shape()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn config() -> ModelConfig {
        ModelConfig {
            name: "net".into(),
            input_shape: vec![2, 3],
            layers: vec![LayerSpec::Dense(4), LayerSpec::Relu, LayerSpec::Dense(2)],
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_compile_resolves_slots() {
        let graph = compile(&config()).unwrap();
        assert_eq!(graph.input_dim(), 6);
        assert_eq!(graph.output_dim(), 2);

        let slots: Vec<_> = graph.slots().map(|s| (s.name.clone(), s.shape.clone())).collect();
        assert_eq!(
            slots,
            vec![
                ("net/layer0/kernel".to_string(), vec![6, 4]),
                ("net/layer0/bias".to_string(), vec![4]),
                ("net/layer2/kernel".to_string(), vec![4, 2]),
                ("net/layer2/bias".to_string(), vec![2]),
            ]
        );
    }

    #[test]
    fn test_compile_rejects_empty_dense() {
        let mut config = config();
        config.layers[2] = LayerSpec::Dense(0);
        assert!(matches!(compile(&config), Err(MetaError::Config { .. })));
    }

    #[test]
    fn test_flatten_checks_trailing_extent() {
        let graph = compile(&config()).unwrap();
        let good = Array::<f32, _>::zeros(IxDyn(&[5, 2, 3]));
        assert_eq!(graph.flatten_inputs(good.view()).unwrap().dim(), (5, 6));

        let bad = Array::<f32, _>::zeros(IxDyn(&[5, 7]));
        assert!(matches!(
            graph.flatten_inputs(bad.view()),
            Err(MetaError::Shape { .. })
        ));
    }
}
