//! Support/query split of a meta-batch for gradient-based meta-learning.

use ndarray::{ArrayD, Axis, IxDyn, Slice};

use crate::error::{MetaError, MetaResult};
use crate::sampler::episode::{Labels, MetaBatch};

/// Adaptation ("a") and evaluation ("b") halves of every task block.
#[derive(Debug, Clone, PartialEq)]
pub struct SupportQuery {
    pub input_a: ArrayD<f32>,
    pub label_a: Labels,
    pub input_b: ArrayD<f32>,
    pub label_b: Labels,
}

/// Split every task block of `batch` at `(batch_size / 2) * num_classes_per_batch`.
///
/// An odd `batch_size` leaves the extra example of each class in the query half.
///
/// With `same_input_and_label` the labels are the inputs themselves, reshaped
/// with a trailing singleton axis.
pub fn split_support_query(
    batch: &MetaBatch,
    batch_size: usize,
    num_classes_per_batch: usize,
    same_input_and_label: bool,
) -> MetaResult<SupportQuery> {
    if batch_size == 0 {
        return Err(MetaError::config("batch_size", "must be non-zero"));
    }

    let task_examples = batch_size * num_classes_per_batch;
    let shape = batch.inputs.shape();
    if shape.len() < 2 || shape[1] != task_examples {
        let mut expected = shape.to_vec();
        if expected.len() >= 2 {
            expected[1] = task_examples;
        }
        return Err(MetaError::shape("support/query inputs", &expected, shape));
    }
    if batch.labels.shape().get(..2) != shape.get(..2) {
        return Err(MetaError::shape(
            "support/query labels",
            &shape[..2],
            batch.labels.shape(),
        ));
    }

    let slice_size = (batch_size / 2) * num_classes_per_batch;
    let input_a = batch
        .inputs
        .slice_axis(Axis(1), Slice::from(..slice_size))
        .to_owned();
    let input_b = batch
        .inputs
        .slice_axis(Axis(1), Slice::from(slice_size..))
        .to_owned();

    let (label_a, label_b) = if same_input_and_label {
        (
            Labels::Reconstruction(with_trailing_axis(&input_a)?),
            Labels::Reconstruction(with_trailing_axis(&input_b)?),
        )
    } else {
        (
            batch.labels.slice_examples(0..slice_size),
            batch.labels.slice_examples(slice_size..task_examples),
        )
    };

    Ok(SupportQuery {
        input_a,
        label_a,
        input_b,
        label_b,
    })
}

fn with_trailing_axis(inputs: &ArrayD<f32>) -> MetaResult<ArrayD<f32>> {
    let mut shape = inputs.shape().to_vec();
    shape.push(1);
    inputs
        .clone()
        .into_shape(IxDyn(&shape))
        .map_err(|_| MetaError::shape("reconstruction labels", &shape, inputs.shape()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn batch(tasks: usize, examples: usize) -> MetaBatch {
        let inputs = Array::from_shape_fn(IxDyn(&[tasks, examples, 2, 2]), |ix| {
            (ix[0] * 100 + ix[1]) as f32
        });
        let labels = Array::from_shape_fn(IxDyn(&[tasks, examples]), |ix| ix[1] % 3);
        MetaBatch {
            inputs,
            labels: Labels::Index(labels),
        }
    }

    #[test]
    fn test_split_sizes() {
        let split = split_support_query(&batch(2, 12), 4, 3, false).unwrap();
        assert_eq!(split.input_a.shape(), &[2, 6, 2, 2]);
        assert_eq!(split.input_b.shape(), &[2, 6, 2, 2]);
        assert_eq!(split.label_a.shape(), &[2, 6]);
        assert_eq!(split.input_b[[1, 0, 0, 0]], 106.0);
    }

    #[test]
    fn test_same_input_and_label_adds_trailing_axis() {
        let split = split_support_query(&batch(1, 8), 4, 2, true).unwrap();
        match &split.label_b {
            Labels::Reconstruction(targets) => {
                assert_eq!(targets.shape(), &[1, 4, 2, 2, 1]);
                assert_eq!(targets[[0, 0, 1, 1, 0]], split.input_b[[0, 0, 1, 1]]);
            }
            other => panic!("unexpected labels: {other:?}"),
        }
    }

    #[test]
    fn test_odd_batch_size_floors_support_half() {
        let split = split_support_query(&batch(1, 10), 5, 2, false).unwrap();
        assert_eq!(split.input_a.shape(), &[1, 4, 2, 2]);
        assert_eq!(split.input_b.shape(), &[1, 6, 2, 2]);
        assert_eq!(split.label_b.shape(), &[1, 6]);
    }

    #[test]
    fn test_zero_batch_size_is_config_error() {
        let err = split_support_query(&batch(1, 0), 0, 2, false).unwrap_err();
        assert!(matches!(err, MetaError::Config { .. }));
    }

    #[test]
    fn test_wrong_example_axis_is_shape_error() {
        let err = split_support_query(&batch(1, 10), 4, 2, false).unwrap_err();
        assert!(matches!(err, MetaError::Shape { .. }));
    }
}
