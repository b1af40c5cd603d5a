//! Meta-batch generation and the materialized dataset handed to training.
//!
//! A generation pass is a pure function of (pool, config, split): training
//! draws come from an RNG seeded with `config.seed`, evaluation draws from a
//! cursor map that starts empty unless the caller supplies one.
//!
//! Layout of one task block (`K * batch_size` examples):
//!
//! ```text
//! [ pos 0: first half | pos 1: first half | ... | pos 0: rest | pos 1: rest | ... ]
//!   \______________ support (a) ______________/   \________ query (b) ________/
//! ```

use ndarray::{Array2, ArrayD, ArrayViewD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::SamplerConfig;
use crate::error::{MetaError, MetaResult};
use crate::logging::GenerationLogEntry;
use crate::sampler::draw::{draw_cyclic, draw_with_replacement, CursorMap};
use crate::sampler::pool::DatasetPool;
use crate::sampler::task::{build_tasks, Task};

/// Which label partition a generation pass draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Eval,
}

/// Labels attached to a meta-batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Labels {
    /// Task-local class indices, shape `[tasks, examples]`
    Index(ArrayD<usize>),
    /// One-hot rows, shape `[tasks, examples, depth]`
    OneHot(ArrayD<f32>),
    /// Inputs reused as targets with a trailing singleton axis
    Reconstruction(ArrayD<f32>),
}

impl Labels {
    pub fn shape(&self) -> &[usize] {
        match self {
            Labels::Index(a) => a.shape(),
            Labels::OneHot(a) | Labels::Reconstruction(a) => a.shape(),
        }
    }

    /// Task-local class index per example, recovering it from one-hot rows if needed.
    pub fn class_indices(&self) -> Option<ArrayD<usize>> {
        match self {
            Labels::Index(a) => Some(a.clone()),
            Labels::OneHot(a) => {
                let last = Axis(a.ndim() - 1);
                Some(a.map_axis(last, |row| argmax(row.iter().copied())))
            }
            Labels::Reconstruction(_) => None,
        }
    }

    /// Float view usable as model targets (index labels are cast).
    pub fn to_targets(&self) -> ArrayD<f32> {
        match self {
            Labels::Index(a) => a.mapv(|v| v as f32),
            Labels::OneHot(a) | Labels::Reconstruction(a) => a.clone(),
        }
    }

    pub(crate) fn slice_examples(&self, range: std::ops::Range<usize>) -> Labels {
        let slice = ndarray::Slice::from(range);
        match self {
            Labels::Index(a) => Labels::Index(a.slice_axis(Axis(1), slice).to_owned()),
            Labels::OneHot(a) => Labels::OneHot(a.slice_axis(Axis(1), slice).to_owned()),
            Labels::Reconstruction(a) => {
                Labels::Reconstruction(a.slice_axis(Axis(1), slice).to_owned())
            }
        }
    }
}

/// One meta-batch: `meta_batch_size` task blocks of `K * batch_size` examples.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaBatch {
    /// Shape `[meta_batch_size, K * batch_size, ...example_shape]`
    pub inputs: ArrayD<f32>,
    pub labels: Labels,
}

impl MetaBatch {
    pub fn num_tasks(&self) -> usize {
        self.inputs.shape()[0]
    }

    pub fn examples_per_task(&self) -> usize {
        self.inputs.shape()[1]
    }
}

/// Dense result of a generation pass.
#[derive(Debug, Clone)]
pub struct MaterializedDataset {
    split: Split,
    tasks: Vec<Task>,
    ids: Array2<usize>,
    labels: Array2<usize>,
    inputs: ArrayD<f32>,
    config: SamplerConfig,
}

impl MaterializedDataset {
    pub fn split(&self) -> Split {
        self.split
    }

    /// The task tuple reused by every meta-batch of this pass.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Example indices, shape `[num_meta_batches, meta_batch_size * K * batch_size]`.
    pub fn ids(&self) -> &Array2<usize> {
        &self.ids
    }

    /// Task-local labels, same shape as [`Self::ids`].
    pub fn labels(&self) -> &Array2<usize> {
        &self.labels
    }

    /// Gathered examples, shape `[num_meta_batches, meta_batch_size, K * batch_size, ...]`.
    pub fn inputs(&self) -> &ArrayD<f32> {
        &self.inputs
    }

    pub fn len(&self) -> usize {
        self.ids.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sampler settings this pass was generated with.
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Meta-batch `index` in generation order.
    pub fn meta_batch(&self, index: usize) -> Option<MetaBatch> {
        if index >= self.len() {
            return None;
        }

        let inputs = self.inputs.index_axis(Axis(0), index).to_owned();
        let labels = self
            .labels
            .row(index)
            .to_owned()
            .into_shape(IxDyn(&[self.config.meta_batch_size, self.config.task_examples()]))
            .ok()?;

        let labels = if self.config.one_hot_labels {
            Labels::OneHot(one_hot(labels.view(), self.config.label_depth))
        } else {
            Labels::Index(labels)
        };

        Some(MetaBatch { inputs, labels })
    }

    /// Meta-batches in a seeded random order.
    pub fn iter(&self, seed: u64) -> MetaBatchIter<'_> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        MetaBatchIter {
            dataset: self,
            order,
            position: 0,
        }
    }

    /// Meta-batches in generation order.
    pub fn iter_ordered(&self) -> MetaBatchIter<'_> {
        MetaBatchIter {
            dataset: self,
            order: (0..self.len()).collect(),
            position: 0,
        }
    }

    pub fn log_entry(&self) -> GenerationLogEntry {
        GenerationLogEntry::new(self.split, self.len(), &self.config, self.tasks.len())
    }
}

/// Iterator handle over the meta-batches of a [`MaterializedDataset`].
pub struct MetaBatchIter<'a> {
    dataset: &'a MaterializedDataset,
    order: Vec<usize>,
    position: usize,
}

impl Iterator for MetaBatchIter<'_> {
    type Item = MetaBatch;

    fn next(&mut self) -> Option<MetaBatch> {
        let index = *self.order.get(self.position)?;
        self.position += 1;
        self.dataset.meta_batch(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.order.len() - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for MetaBatchIter<'_> {}

/// One-hot encode along a new trailing axis of length `depth`.
///
/// Values `>= depth` produce an all-zero row.
pub fn one_hot(labels: ArrayViewD<'_, usize>, depth: usize) -> ArrayD<f32> {
    let mut shape = labels.shape().to_vec();
    shape.push(depth);
    let mut encoded = ArrayD::<f32>::zeros(IxDyn(&shape));
    for (mut row, &label) in encoded
        .lanes_mut(Axis(shape.len() - 1))
        .into_iter()
        .zip(labels.iter())
    {
        if label < depth {
            row[label] = 1.0;
        }
    }
    encoded
}

fn argmax<I: Iterator<Item = f32>>(values: I) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (index, value) in values.enumerate() {
        if value > best_value {
            best = index;
            best_value = value;
        }
    }
    best
}

/// Generate a full pass for `split`.
///
/// Evaluation passes always start from an empty cursor map, so repeated
/// calls on the same pool and config return identical arrays.
pub fn generate_dataset(
    pool: &DatasetPool,
    config: &SamplerConfig,
    split: Split,
) -> MetaResult<MaterializedDataset> {
    match split {
        Split::Train => {
            let mut rng = StdRng::seed_from_u64(config.seed);
            assemble(pool, config, Split::Train, |label, examples, count| {
                draw_with_replacement(label, examples, count, &mut rng)
            })
        }
        Split::Eval => generate_dataset_with_cursors(pool, config, CursorMap::new())
            .map(|(dataset, _)| dataset),
    }
}

/// Evaluation pass resuming from `cursors`; returns the advanced cursor map.
pub fn generate_dataset_with_cursors(
    pool: &DatasetPool,
    config: &SamplerConfig,
    cursors: CursorMap,
) -> MetaResult<(MaterializedDataset, CursorMap)> {
    let mut cursors = Some(cursors);
    let dataset = assemble(pool, config, Split::Eval, |label, examples, count| {
        let current = cursors.take().unwrap_or_default();
        let (ids, advanced) = draw_cyclic(label, examples, count, current)?;
        cursors = Some(advanced);
        Ok(ids)
    })?;
    Ok((dataset, cursors.unwrap_or_default()))
}

fn assemble<F>(
    pool: &DatasetPool,
    config: &SamplerConfig,
    split: Split,
    mut draw: F,
) -> MetaResult<MaterializedDataset>
where
    F: FnMut(usize, &[usize], usize) -> MetaResult<Vec<usize>>,
{
    config.validate()?;
    if config.one_hot_labels && config.num_classes_per_batch > config.label_depth {
        return Err(MetaError::config(
            "num_classes_per_batch",
            format!(
                "{} classes do not fit one-hot depth {}",
                config.num_classes_per_batch, config.label_depth
            ),
        ));
    }

    let label_pool = pool.labels_for(split);
    let tasks = build_tasks(
        label_pool.labels(),
        config.num_classes_per_batch,
        config.meta_batch_size,
    )?;

    let per_meta_batch = config.meta_batch_examples();
    let num_meta_batches = (label_pool.num_examples() / per_meta_batch).min(config.max_meta_batches);
    if num_meta_batches == 0 {
        return Err(MetaError::config(
            "batch_size",
            format!(
                "{} examples cannot fill one meta-batch of {}",
                label_pool.num_examples(),
                per_meta_batch
            ),
        ));
    }

    let half = config.batch_size / 2;
    let mut ids = Vec::with_capacity(num_meta_batches * per_meta_batch);
    let mut labels = Vec::with_capacity(num_meta_batches * per_meta_batch);

    for _ in 0..num_meta_batches {
        for task in &tasks {
            let mut drawn = Vec::with_capacity(task.len());
            for &label in task {
                let examples = label_pool.examples(label).ok_or_else(|| {
                    MetaError::config("labels", format!("label {label} is not in the {split:?} pool"))
                })?;
                drawn.push(draw(label, examples, config.batch_size)?);
            }

            for (position, batch) in drawn.iter().enumerate() {
                ids.extend_from_slice(&batch[..half]);
                labels.extend(std::iter::repeat(position).take(half));
            }
            for (position, batch) in drawn.iter().enumerate() {
                ids.extend_from_slice(&batch[half..]);
                labels.extend(std::iter::repeat(position).take(batch.len() - half));
            }
        }
    }

    let inputs = gather(pool, &ids, num_meta_batches, config)?;
    let ids = Array2::from_shape_vec((num_meta_batches, per_meta_batch), ids)
        .map_err(|err| MetaError::config("ids", err.to_string()))?;
    let labels = Array2::from_shape_vec((num_meta_batches, per_meta_batch), labels)
        .map_err(|err| MetaError::config("labels", err.to_string()))?;

    tracing::info!(
        split = ?split,
        num_meta_batches,
        meta_batch_size = config.meta_batch_size,
        num_classes_per_batch = config.num_classes_per_batch,
        batch_size = config.batch_size,
        "generated meta-batches"
    );

    Ok(MaterializedDataset {
        split,
        tasks,
        ids,
        labels,
        inputs,
        config: config.clone(),
    })
}

/// Gather example tensors through the id array; row order follows `ids`.
fn gather(
    pool: &DatasetPool,
    ids: &[usize],
    num_meta_batches: usize,
    config: &SamplerConfig,
) -> MetaResult<ArrayD<f32>> {
    let data: Vec<f32> = ids
        .par_iter()
        .flat_map_iter(|&id| pool.example(id).into_iter().copied())
        .collect();

    let mut shape = vec![num_meta_batches, config.meta_batch_size, config.task_examples()];
    shape.extend_from_slice(pool.example_shape());
    ArrayD::from_shape_vec(IxDyn(&shape), data)
        .map_err(|err| MetaError::shape(format!("gather: {err}"), &shape, &[ids.len()]))
}
