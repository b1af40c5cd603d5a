//! Layer specifications and the per-layer forward/backward math.
//!
//! Dense layers store their kernel as `[input_dim, output_dim]`, so the
//! forward pass is `y = x·W + b` on row-major `[batch, features]` activations.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// One entry of `ModelConfig::layers`.
///
/// In TOML a dense layer is written `{ dense = 64 }` and activations as bare
/// strings (`"relu"`, `"tanh"`, `"sigmoid"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSpec {
    Dense(usize),
    Relu,
    Tanh,
    Sigmoid,
}

impl LayerSpec {
    pub fn output_dim(&self, input_dim: usize) -> usize {
        match self {
            LayerSpec::Dense(units) => *units,
            _ => input_dim,
        }
    }

    pub fn is_trainable(&self) -> bool {
        matches!(self, LayerSpec::Dense(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            LayerSpec::Dense(_) => "dense",
            LayerSpec::Relu => "relu",
            LayerSpec::Tanh => "tanh",
            LayerSpec::Sigmoid => "sigmoid",
        }
    }
}

/// Glorot-uniform kernel and zero bias, reproducible from `seed`.
pub fn init_dense(input_dim: usize, output_dim: usize, seed: u64) -> (Array2<f32>, Array1<f32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let limit = (6.0 / (input_dim + output_dim).max(1) as f32).sqrt();
    let kernel = Array2::from_shape_fn((input_dim, output_dim), |_| rng.gen_range(-limit..=limit));
    (kernel, Array1::zeros(output_dim))
}

pub fn dense_forward(
    input: &Array2<f32>,
    kernel: ArrayView2<'_, f32>,
    bias: ArrayView1<'_, f32>,
) -> Array2<f32> {
    input.dot(&kernel) + &bias
}

/// Gradients of a dense layer: `(d_input, d_kernel, d_bias)`.
pub fn dense_backward(
    input: &Array2<f32>,
    kernel: ArrayView2<'_, f32>,
    grad_output: &Array2<f32>,
) -> (Array2<f32>, Array2<f32>, Array1<f32>) {
    let grad_kernel = input.t().dot(grad_output);
    let grad_bias = grad_output.sum_axis(Axis(0));
    let grad_input = grad_output.dot(&kernel.t());
    (grad_input, grad_kernel, grad_bias)
}

/// Element-wise activation; identity for dense specs.
pub fn activate(spec: LayerSpec, input: &Array2<f32>) -> Array2<f32> {
    match spec {
        LayerSpec::Relu => input.mapv(|x| x.max(0.0)),
        LayerSpec::Tanh => input.mapv(f32::tanh),
        LayerSpec::Sigmoid => input.mapv(sigmoid),
        LayerSpec::Dense(_) => input.clone(),
    }
}

/// Chain rule through an activation given its cached input and output.
pub fn activation_backward(
    spec: LayerSpec,
    input: &Array2<f32>,
    output: &Array2<f32>,
    grad_output: &Array2<f32>,
) -> Array2<f32> {
    let mut grad = grad_output.clone();
    match spec {
        LayerSpec::Relu => {
            grad.zip_mut_with(input, |g, &x| {
                if x <= 0.0 {
                    *g = 0.0;
                }
            });
        }
        LayerSpec::Tanh => grad.zip_mut_with(output, |g, &y| *g *= 1.0 - y * y),
        LayerSpec::Sigmoid => grad.zip_mut_with(output, |g, &y| *g *= y * (1.0 - y)),
        LayerSpec::Dense(_) => {}
    }
    grad
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_init_is_seeded_and_bounded() {
        let (a, bias) = init_dense(8, 4, 3);
        let (b, _) = init_dense(8, 4, 3);
        assert_eq!(a, b);
        assert_eq!(a.dim(), (8, 4));
        assert!(bias.iter().all(|&v| v == 0.0));
        let limit = (6.0f32 / 12.0).sqrt();
        assert!(a.iter().all(|v| v.abs() <= limit));
    }

    #[test]
    fn test_dense_forward_and_backward() {
        let x = arr2(&[[1.0, 2.0]]);
        let w = arr2(&[[1.0, 0.0, -1.0], [0.5, 1.0, 2.0]]);
        let b = arr1(&[0.0, 1.0, 0.0]);

        let y = dense_forward(&x, w.view(), b.view());
        assert_eq!(y, arr2(&[[2.0, 3.0, 3.0]]));

        let g = arr2(&[[1.0, 0.0, 1.0]]);
        let (dx, dw, db) = dense_backward(&x, w.view(), &g);
        assert_eq!(dx, arr2(&[[0.0, 2.5]]));
        assert_eq!(dw, arr2(&[[1.0, 0.0, 1.0], [2.0, 0.0, 2.0]]));
        assert_eq!(db, arr1(&[1.0, 0.0, 1.0]));
    }

    #[test]
    fn test_relu_masks_negative_inputs() {
        let x = arr2(&[[-1.0, 2.0]]);
        let y = activate(LayerSpec::Relu, &x);
        assert_eq!(y, arr2(&[[0.0, 2.0]]));
        let g = activation_backward(LayerSpec::Relu, &x, &y, &arr2(&[[5.0, 5.0]]));
        assert_eq!(g, arr2(&[[0.0, 5.0]]));
    }

    #[test]
    fn test_sigmoid_gradient_at_zero() {
        let x = arr2(&[[0.0]]);
        let y = activate(LayerSpec::Sigmoid, &x);
        let g = activation_backward(LayerSpec::Sigmoid, &x, &y, &arr2(&[[1.0]]));
        assert!((g[[0, 0]] - 0.25).abs() < 1e-6);
    }
}
