//! Dataset pool: normalized examples indexed by label.

use std::collections::{BTreeMap, BTreeSet};

use ndarray::{ArrayD, ArrayViewD, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::SamplerConfig;
use crate::data::DigitSet;
use crate::error::{MetaError, MetaResult};
use crate::sampler::Split;

/// Labels eligible for one split and the example indices available for each.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelPool {
    labels: Vec<usize>,
    examples_by_label: BTreeMap<usize, Vec<usize>>,
}

impl LabelPool {
    /// Labels in the order they were supplied (duplicates removed).
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn examples(&self, label: usize) -> Option<&[usize]> {
        self.examples_by_label.get(&label).map(Vec::as_slice)
    }

    /// Total number of examples across every label of this pool.
    pub fn num_examples(&self) -> usize {
        self.examples_by_label.values().map(Vec::len).sum()
    }

    pub fn contains(&self, label: usize) -> bool {
        self.examples_by_label.contains_key(&label)
    }
}

/// Normalized examples plus the train and eval label partitions.
///
/// Built once by [`build_pool`] and never mutated afterwards; evaluation
/// cursors live outside the pool in a [`crate::sampler::CursorMap`].
#[derive(Debug, Clone)]
pub struct DatasetPool {
    inputs: ArrayD<f32>,
    train: LabelPool,
    eval: LabelPool,
    label_depth: usize,
}

impl DatasetPool {
    /// Build a pool from a digit set using the label sets named in `config`.
    pub fn from_digits(digits: &DigitSet, config: &SamplerConfig) -> MetaResult<Self> {
        build_pool(
            digits.images.view().into_dyn(),
            &digits.labels,
            &config.train_digits,
            &config.test_digits,
            config,
        )
    }

    /// All examples, shape `[n, ...example_shape]`, values in `[0, 1]`.
    pub fn inputs(&self) -> &ArrayD<f32> {
        &self.inputs
    }

    pub fn example(&self, index: usize) -> ArrayViewD<'_, f32> {
        self.inputs.index_axis(Axis(0), index)
    }

    /// Shape of a single example, without the leading sample axis.
    pub fn example_shape(&self) -> &[usize] {
        &self.inputs.shape()[1..]
    }

    pub fn len(&self) -> usize {
        self.inputs.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn label_depth(&self) -> usize {
        self.label_depth
    }

    pub fn labels_for(&self, split: Split) -> &LabelPool {
        match split {
            Split::Train => &self.train,
            Split::Eval => &self.eval,
        }
    }
}

/// Normalize raw pixels to `[0, 1]` and index examples by label.
///
/// Training label lists are shuffled with `config.seed`; evaluation lists keep
/// ascending dataset order so cursor-based draws are reproducible.
pub fn build_pool(
    raw_examples: ArrayViewD<'_, u8>,
    raw_labels: &[usize],
    train_label_set: &[usize],
    test_label_set: &[usize],
    config: &SamplerConfig,
) -> MetaResult<DatasetPool> {
    if raw_examples.ndim() == 0 || raw_examples.shape()[0] != raw_labels.len() {
        return Err(MetaError::shape(
            "raw examples vs labels",
            &[raw_labels.len()],
            raw_examples.shape().get(..1).unwrap_or(&[]),
        ));
    }
    if config.label_depth == 0 {
        return Err(MetaError::config("label_depth", "must be non-zero"));
    }

    let train_labels = dedup_labels("train_digits", train_label_set, config.label_depth)?;
    let test_labels = dedup_labels("test_digits", test_label_set, config.label_depth)?;

    let train_set: BTreeSet<usize> = train_labels.iter().copied().collect();
    if let Some(shared) = test_labels.iter().find(|label| train_set.contains(label)) {
        return Err(MetaError::config(
            "test_digits",
            format!("label {shared} also appears in train_digits"),
        ));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let train = index_labels(raw_labels, train_labels, Some(&mut rng))?;
    let eval = index_labels(raw_labels, test_labels, None)?;

    let inputs = raw_examples.mapv(|pixel| pixel as f32 / 255.0);

    tracing::debug!(
        examples = raw_labels.len(),
        train_examples = train.num_examples(),
        eval_examples = eval.num_examples(),
        "built dataset pool"
    );

    Ok(DatasetPool {
        inputs,
        train,
        eval,
        label_depth: config.label_depth,
    })
}

fn dedup_labels(parameter: &str, labels: &[usize], depth: usize) -> MetaResult<Vec<usize>> {
    if labels.is_empty() {
        return Err(MetaError::config(parameter, "label set must not be empty"));
    }

    let mut seen = BTreeSet::new();
    let mut unique = Vec::with_capacity(labels.len());
    for &label in labels {
        if label >= depth {
            return Err(MetaError::config(
                parameter,
                format!("label {label} outside valid range 0..{depth}"),
            ));
        }
        if seen.insert(label) {
            unique.push(label);
        }
    }
    Ok(unique)
}

fn index_labels(
    raw_labels: &[usize],
    labels: Vec<usize>,
    mut shuffle: Option<&mut StdRng>,
) -> MetaResult<LabelPool> {
    let mut examples_by_label: BTreeMap<usize, Vec<usize>> =
        labels.iter().map(|&label| (label, Vec::new())).collect();

    for (index, label) in raw_labels.iter().enumerate() {
        if let Some(ids) = examples_by_label.get_mut(label) {
            ids.push(index);
        }
    }

    // Shuffle in label order so the result depends only on the seed.
    for (&label, ids) in examples_by_label.iter_mut() {
        if ids.is_empty() {
            return Err(MetaError::config(
                "labels",
                format!("label {label} has no examples in the dataset"),
            ));
        }
        if let Some(rng) = shuffle.as_deref_mut() {
            ids.shuffle(rng);
        }
    }

    Ok(LabelPool {
        labels,
        examples_by_label,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn tiny_dataset() -> (Array3<u8>, Vec<usize>) {
        let labels = vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 3];
        let images = Array3::from_shape_fn((labels.len(), 2, 2), |(i, r, c)| {
            (i * 20 + r * 2 + c) as u8
        });
        (images, labels)
    }

    fn config() -> SamplerConfig {
        SamplerConfig {
            label_depth: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_pool_normalizes_and_indexes() {
        let (images, labels) = tiny_dataset();
        let pool = build_pool(images.view().into_dyn(), &labels, &[0, 1], &[2], &config()).unwrap();

        assert_eq!(pool.len(), 10);
        assert_eq!(pool.example_shape(), &[2, 2]);
        assert!(pool.inputs().iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!((pool.example(9)[[1, 1]] - 183.0 / 255.0).abs() < 1e-6);

        let eval = pool.labels_for(Split::Eval);
        assert_eq!(eval.labels(), &[2]);
        assert_eq!(eval.examples(2), Some(&[2, 5, 8][..]));

        let train = pool.labels_for(Split::Train);
        let mut zeros = train.examples(0).unwrap().to_vec();
        zeros.sort_unstable();
        assert_eq!(zeros, vec![0, 3, 6]);
        assert_eq!(train.num_examples(), 6);
    }

    #[test]
    fn test_pool_dedups_label_sets() {
        let (images, labels) = tiny_dataset();
        let pool =
            build_pool(images.view().into_dyn(), &labels, &[1, 0, 1], &[2], &config()).unwrap();
        assert_eq!(pool.labels_for(Split::Train).labels(), &[1, 0]);
    }

    #[test]
    fn test_pool_rejects_invalid_label_sets() {
        let (images, labels) = tiny_dataset();
        let view = images.view().into_dyn();

        let err = build_pool(view.clone(), &labels, &[], &[2], &config()).unwrap_err();
        assert!(matches!(err, MetaError::Config { .. }));

        let err = build_pool(view.clone(), &labels, &[0, 7], &[2], &config()).unwrap_err();
        assert!(matches!(err, MetaError::Config { .. }));

        let err = build_pool(view.clone(), &labels, &[0, 2], &[2], &config()).unwrap_err();
        assert!(err.to_string().contains("also appears"));

        let err = build_pool(view, &labels[..5], &[0], &[2], &config()).unwrap_err();
        assert!(matches!(err, MetaError::Shape { .. }));
    }

    #[test]
    fn test_pool_rejects_label_without_examples() {
        let (images, labels) = tiny_dataset();
        let cfg = SamplerConfig {
            label_depth: 10,
            ..Default::default()
        };
        let err = build_pool(images.view().into_dyn(), &labels, &[0], &[9], &cfg).unwrap_err();
        assert!(err.to_string().contains("no examples"));
    }

    #[test]
    fn test_train_shuffle_depends_only_on_seed() {
        let (images, labels) = tiny_dataset();
        let a = build_pool(images.view().into_dyn(), &labels, &[0, 1], &[2], &config()).unwrap();
        let b = build_pool(images.view().into_dyn(), &labels, &[0, 1], &[2], &config()).unwrap();
        assert_eq!(a.labels_for(Split::Train), b.labels_for(Split::Train));
    }
}
