//! Typed parameter records and the model-owned registry.

use std::collections::{BTreeMap, HashMap};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, MetaResult};

/// Role of a trainable tensor inside its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParamKind {
    Weight,
    Bias,
}

impl ParamKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            ParamKind::Weight => "kernel",
            ParamKind::Bias => "bias",
        }
    }
}

/// Owning layer plus role; stable across builds of the same config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId {
    pub layer: usize,
    pub kind: ParamKind,
}

/// A registered trainable tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: ParamId,
    pub name: String,
    pub value: ArrayD<f32>,
}

/// Name → value mapping used for fast weights, gradients and checkpoints.
pub type ParamMap = BTreeMap<String, ArrayD<f32>>;

/// Ordered registry of every trainable parameter of a built model.
#[derive(Debug, Clone, Default)]
pub struct ParamRegistry {
    params: Vec<Parameter>,
    by_name: HashMap<String, usize>,
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: ParamId, name: String, value: ArrayD<f32>) -> MetaResult<()> {
        if self.by_name.contains_key(&name) {
            return Err(MetaError::config(
                "parameters",
                format!("parameter '{name}' registered twice"),
            ));
        }
        self.by_name.insert(name.clone(), self.params.len());
        self.params.push(Parameter { id, name, value });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.by_name.get(name).map(|&index| &self.params[index])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        let index = *self.by_name.get(name)?;
        self.params.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.params.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of scalar values across all parameters.
    pub fn num_scalars(&self) -> usize {
        self.params.iter().map(|p| p.value.len()).sum()
    }

    pub fn to_map(&self) -> ParamMap {
        self.params
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }

    /// Overwrite every parameter named in `values`; unknown names are ignored.
    ///
    /// Shapes are checked before anything is written, so a mismatch leaves the
    /// registry untouched. Returns the number of parameters overwritten.
    pub fn assign(&mut self, values: &ParamMap) -> MetaResult<usize> {
        for (name, value) in values {
            if let Some(param) = self.get(name) {
                if param.value.shape() != value.shape() {
                    return Err(MetaError::shape(
                        format!("assign '{name}'"),
                        param.value.shape(),
                        value.shape(),
                    ));
                }
            }
        }

        let mut assigned = 0;
        for (name, value) in values {
            if let Some(param) = self.get_mut(name) {
                param.value.assign(value);
                assigned += 1;
            }
        }
        Ok(assigned)
    }
}

/// One inner-loop step: `θ' = θ − inner_lr · ∇θ` for names present in both maps.
///
/// Parameters without a gradient are copied through unchanged.
pub fn adapt(params: &ParamMap, grads: &ParamMap, inner_lr: f32) -> ParamMap {
    params
        .iter()
        .map(|(name, value)| {
            let updated = match grads.get(name) {
                Some(grad) if grad.shape() == value.shape() => value - &(grad * inner_lr),
                _ => value.clone(),
            };
            (name.clone(), updated)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn registry() -> ParamRegistry {
        let mut registry = ParamRegistry::new();
        registry
            .register(
                ParamId { layer: 0, kind: ParamKind::Weight },
                "m/layer0/kernel".into(),
                arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn(),
            )
            .unwrap();
        registry
            .register(
                ParamId { layer: 0, kind: ParamKind::Bias },
                "m/layer0/bias".into(),
                arr1(&[0.5, 0.5]).into_dyn(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = registry();
        let err = registry
            .register(
                ParamId { layer: 1, kind: ParamKind::Bias },
                "m/layer0/bias".into(),
                arr1(&[0.0]).into_dyn(),
            )
            .unwrap_err();
        assert!(matches!(err, MetaError::Config { .. }));
        assert_eq!(registry.num_scalars(), 6);
    }

    #[test]
    fn test_assign_ignores_unknown_names() {
        let mut registry = registry();
        let mut values = ParamMap::new();
        values.insert("m/layer0/bias".into(), arr1(&[9.0, 8.0]).into_dyn());
        values.insert("other/bias".into(), arr1(&[1.0]).into_dyn());

        assert_eq!(registry.assign(&values).unwrap(), 1);
        assert_eq!(registry.get("m/layer0/bias").unwrap().value, arr1(&[9.0, 8.0]).into_dyn());
        assert_eq!(
            registry.get("m/layer0/kernel").unwrap().value,
            arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn()
        );
    }

    #[test]
    fn test_assign_shape_mismatch_leaves_registry_untouched() {
        let mut registry = registry();
        let mut values = ParamMap::new();
        values.insert("m/layer0/bias".into(), arr1(&[9.0, 8.0]).into_dyn());
        values.insert("m/layer0/kernel".into(), arr1(&[1.0]).into_dyn());

        assert!(registry.assign(&values).is_err());
        assert_eq!(registry.get("m/layer0/bias").unwrap().value, arr1(&[0.5, 0.5]).into_dyn());
    }

    #[test]
    fn test_adapt_steps_against_gradient() {
        let params = registry().to_map();
        let mut grads = ParamMap::new();
        grads.insert("m/layer0/bias".into(), arr1(&[1.0, -1.0]).into_dyn());

        let fast = adapt(&params, &grads, 0.1);
        assert_eq!(fast["m/layer0/bias"], arr1(&[0.4, 0.6]).into_dyn());
        assert_eq!(fast["m/layer0/kernel"], params["m/layer0/kernel"]);
    }
}
