//! Optimizers for the outer-loop update of base parameters.

use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointError;
use crate::config::ModelConfig;
use crate::error::{MetaError, MetaResult};
use crate::model::param::{ParamMap, ParamRegistry};

/// Optimizer selection in `ModelConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    #[default]
    Adam,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdOptimizerState {
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub velocities: ParamMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamOptimizerState {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    pub first_moments: ParamMap,
    pub second_moments: ParamMap,
    pub t: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerStateSnapshot {
    Sgd(SgdOptimizerState),
    Adam(AdamOptimizerState),
}

/// Stochastic gradient descent with momentum.
///
/// ```text
/// velocity = momentum * velocity + learning_rate * gradient
/// parameter = parameter - velocity
/// ```
#[derive(Debug, Clone)]
pub struct SgdOptimizer {
    pub learning_rate: f32,
    /// Momentum coefficient (0.0 = plain SGD)
    pub momentum: f32,
    /// L2 regularization strength
    pub weight_decay: f32,
    velocities: ParamMap,
}

impl SgdOptimizer {
    pub fn new(learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocities: ParamMap::new(),
        }
    }

    pub fn to_state(&self) -> SgdOptimizerState {
        SgdOptimizerState {
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            velocities: self.velocities.clone(),
        }
    }

    pub fn apply_state(&mut self, state: SgdOptimizerState) {
        self.learning_rate = state.learning_rate;
        self.momentum = state.momentum;
        self.weight_decay = state.weight_decay;
        self.velocities = state.velocities;
    }

    /// Update `param` in place from `gradient`.
    pub fn step(
        &mut self,
        param_name: &str,
        param: &mut ArrayD<f32>,
        gradient: &ArrayD<f32>,
    ) -> MetaResult<()> {
        check_shapes(param_name, param, gradient)?;
        let velocity = state_slot(&mut self.velocities, param_name, param);

        let (lr, momentum, decay) = (self.learning_rate, self.momentum, self.weight_decay);
        Zip::from(param)
            .and(velocity)
            .and(gradient)
            .for_each(|p, v, &g| {
                let g = g + decay * *p;
                *v = momentum * *v + lr * g;
                *p -= *v;
            });
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.velocities.clear();
    }
}

/// Adam (adaptive moment estimation).
///
/// The time step advances once per [`Optimizer::apply`] call, so every
/// parameter of one update shares the same bias correction.
#[derive(Debug, Clone)]
pub struct AdamOptimizer {
    pub learning_rate: f32,
    /// Decay rate for the first moment (typically 0.9)
    pub beta1: f32,
    /// Decay rate for the second moment (typically 0.999)
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    first_moments: ParamMap,
    second_moments: ParamMap,
    t: usize,
}

impl AdamOptimizer {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            first_moments: ParamMap::new(),
            second_moments: ParamMap::new(),
            t: 0,
        }
    }

    pub fn to_state(&self) -> AdamOptimizerState {
        AdamOptimizerState {
            learning_rate: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            weight_decay: self.weight_decay,
            first_moments: self.first_moments.clone(),
            second_moments: self.second_moments.clone(),
            t: self.t,
        }
    }

    pub fn apply_state(&mut self, state: AdamOptimizerState) {
        self.learning_rate = state.learning_rate;
        self.beta1 = state.beta1;
        self.beta2 = state.beta2;
        self.epsilon = state.epsilon;
        self.weight_decay = state.weight_decay;
        self.first_moments = state.first_moments;
        self.second_moments = state.second_moments;
        self.t = state.t;
    }

    pub fn time_step(&self) -> usize {
        self.t
    }

    /// Start a new update; subsequent `step` calls use the advanced time step.
    pub fn advance(&mut self) {
        self.t += 1;
    }

    pub fn step(
        &mut self,
        param_name: &str,
        param: &mut ArrayD<f32>,
        gradient: &ArrayD<f32>,
    ) -> MetaResult<()> {
        check_shapes(param_name, param, gradient)?;
        let t = self.t.max(1) as i32;
        let m = state_slot(&mut self.first_moments, param_name, param);
        let v = state_slot(&mut self.second_moments, param_name, param);

        let (lr, beta1, beta2, eps, decay) = (
            self.learning_rate,
            self.beta1,
            self.beta2,
            self.epsilon,
            self.weight_decay,
        );
        let m_correction = 1.0 / (1.0 - beta1.powi(t));
        let v_correction = 1.0 / (1.0 - beta2.powi(t));

        Zip::from(param)
            .and(m)
            .and(v)
            .and(gradient)
            .for_each(|p, m, v, &g| {
                let g = g + decay * *p;
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m * m_correction;
                let v_hat = *v * v_correction;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.first_moments.clear();
        self.second_moments.clear();
        self.t = 0;
    }
}

/// The optimizer a built model owns.
#[derive(Debug, Clone)]
pub enum Optimizer {
    Sgd(SgdOptimizer),
    Adam(AdamOptimizer),
}

impl Optimizer {
    pub fn from_config(config: &ModelConfig) -> Self {
        match config.optimizer {
            OptimizerKind::Sgd => Optimizer::Sgd(SgdOptimizer::new(
                config.learning_rate,
                config.momentum,
                config.weight_decay,
            )),
            OptimizerKind::Adam => {
                Optimizer::Adam(AdamOptimizer::new(config.learning_rate, config.weight_decay))
            }
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        match self {
            Optimizer::Sgd(_) => OptimizerKind::Sgd,
            Optimizer::Adam(_) => OptimizerKind::Adam,
        }
    }

    /// Apply one update to every registered parameter that has a gradient.
    ///
    /// All gradient shapes are checked first; on error nothing is modified.
    /// Returns the number of parameters updated.
    pub fn apply(&mut self, registry: &mut ParamRegistry, grads: &ParamMap) -> MetaResult<usize> {
        for (name, grad) in grads {
            if let Some(param) = registry.get(name) {
                check_shapes(name, &param.value, grad)?;
            }
        }

        if let Optimizer::Adam(adam) = self {
            adam.advance();
        }

        let mut updated = 0;
        for param in registry.iter_mut() {
            let Some(grad) = grads.get(&param.name) else {
                continue;
            };
            match self {
                Optimizer::Sgd(sgd) => sgd.step(&param.name, &mut param.value, grad)?,
                Optimizer::Adam(adam) => adam.step(&param.name, &mut param.value, grad)?,
            }
            updated += 1;
        }
        Ok(updated)
    }

    pub fn snapshot(&self) -> OptimizerStateSnapshot {
        match self {
            Optimizer::Sgd(sgd) => OptimizerStateSnapshot::Sgd(sgd.to_state()),
            Optimizer::Adam(adam) => OptimizerStateSnapshot::Adam(adam.to_state()),
        }
    }

    /// Restore state captured by [`Optimizer::snapshot`] of the same kind.
    pub fn restore(&mut self, snapshot: OptimizerStateSnapshot) -> Result<(), CheckpointError> {
        match (self, snapshot) {
            (Optimizer::Sgd(sgd), OptimizerStateSnapshot::Sgd(state)) => sgd.apply_state(state),
            (Optimizer::Adam(adam), OptimizerStateSnapshot::Adam(state)) => {
                adam.apply_state(state)
            }
            (optimizer, snapshot) => {
                return Err(CheckpointError::InvalidFormat(format!(
                    "optimizer mismatch: model uses {:?}, checkpoint holds {}",
                    optimizer.kind(),
                    match snapshot {
                        OptimizerStateSnapshot::Sgd(_) => "Sgd",
                        OptimizerStateSnapshot::Adam(_) => "Adam",
                    }
                )))
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        match self {
            Optimizer::Sgd(sgd) => sgd.zero_grad(),
            Optimizer::Adam(adam) => adam.zero_grad(),
        }
    }
}

fn check_shapes(name: &str, param: &ArrayD<f32>, gradient: &ArrayD<f32>) -> MetaResult<()> {
    if param.shape() != gradient.shape() {
        return Err(MetaError::shape(
            format!("gradient for '{name}'"),
            param.shape(),
            gradient.shape(),
        ));
    }
    Ok(())
}

/// Per-parameter accumulator, reset to zeros if its shape no longer matches.
fn state_slot<'a>(
    slots: &'a mut ParamMap,
    name: &str,
    param: &ArrayD<f32>,
) -> &'a mut ArrayD<f32> {
    let slot = slots
        .entry(name.to_string())
        .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
    if slot.shape() != param.shape() {
        *slot = ArrayD::zeros(param.raw_dim());
    }
    slot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::param::{ParamId, ParamKind};
    use ndarray::arr1;

    fn registry(value: f32) -> ParamRegistry {
        let mut registry = ParamRegistry::new();
        registry
            .register(
                ParamId { layer: 0, kind: ParamKind::Bias },
                "m/layer0/bias".into(),
                arr1(&[value, value]).into_dyn(),
            )
            .unwrap();
        registry
    }

    fn grads(value: f32) -> ParamMap {
        let mut grads = ParamMap::new();
        grads.insert("m/layer0/bias".into(), arr1(&[value, -value]).into_dyn());
        grads
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut optimizer = Optimizer::Sgd(SgdOptimizer::new(0.1, 0.5, 0.0));
        let mut registry = registry(1.0);

        optimizer.apply(&mut registry, &grads(1.0)).unwrap();
        let first = registry.get("m/layer0/bias").unwrap().value.clone();
        assert!((first[0] - 0.9).abs() < 1e-6);

        optimizer.apply(&mut registry, &grads(1.0)).unwrap();
        let second = &registry.get("m/layer0/bias").unwrap().value;
        // velocity = 0.5 * 0.1 + 0.1
        assert!((second[0] - 0.75).abs() < 1e-6);
        assert!((second[1] - 1.25).abs() < 1e-6);
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let mut optimizer = Optimizer::Adam(AdamOptimizer::new(0.01, 0.0));
        let mut registry = registry(0.0);
        optimizer.apply(&mut registry, &grads(3.0)).unwrap();

        let value = &registry.get("m/layer0/bias").unwrap().value;
        assert!((value[0] + 0.01).abs() < 1e-5);
        assert!((value[1] - 0.01).abs() < 1e-5);
        match optimizer.snapshot() {
            OptimizerStateSnapshot::Adam(state) => assert_eq!(state.t, 1),
            other => panic!("unexpected snapshot: {other:?}"),
        }
    }

    #[test]
    fn test_shape_mismatch_updates_nothing() {
        let mut optimizer = Optimizer::Sgd(SgdOptimizer::new(0.1, 0.0, 0.0));
        let mut registry = registry(1.0);
        let mut bad = ParamMap::new();
        bad.insert("m/layer0/bias".into(), arr1(&[1.0]).into_dyn());

        assert!(optimizer.apply(&mut registry, &bad).is_err());
        assert_eq!(registry.get("m/layer0/bias").unwrap().value, arr1(&[1.0, 1.0]).into_dyn());
    }

    #[test]
    fn test_restore_rejects_other_kind() {
        let mut adam = Optimizer::Adam(AdamOptimizer::new(0.01, 0.0));
        let sgd = Optimizer::Sgd(SgdOptimizer::new(0.1, 0.9, 0.0));
        assert!(adam.restore(sgd.snapshot()).is_err());
        assert!(adam.restore(adam.snapshot()).is_ok());
    }
}
