//! First-order meta-training on episodic digit tasks.
//!
//! Usage: `cargo run --example episodic_digits -- [harness.toml] [mnist_dir]`
//!
//! Without a dataset directory a synthetic digit set stands in for MNIST.

use std::path::PathBuf;

use anyhow::{Context, Result};
use metagrad_core::{
    adapt, generate_dataset, load_mnist, log_generation, log_training_step, split_support_query,
    synthetic_digits, DatasetPool, HarnessConfig, MaterializedDataset, Model, ParamMap, Split,
    SupportQuery, TrainingLogEntry,
};
use ndarray::{Axis, Ix1};

const META_STEPS: usize = 20;
const INNER_LR: f32 = 0.1;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => HarnessConfig::load_from_file(&path)
            .with_context(|| format!("loading harness config {path}"))?,
        None => HarnessConfig::default(),
    };
    let sampler = &config.sampler;

    let digits = match args.next() {
        Some(dir) => load_mnist(&dir).with_context(|| format!("loading MNIST from {dir}"))?,
        None => {
            let (rows, cols) = match config.model.input_shape.as_slice() {
                [rows, cols] => (*rows, *cols),
                other => anyhow::bail!("synthetic digits need a 2-D input shape, got {other:?}"),
            };
            synthetic_digits(200, rows, cols, sampler.seed)
        }
    };

    let log_dir = std::env::temp_dir().join("metagrad_runs");
    std::fs::create_dir_all(&log_dir)?;

    let pool = DatasetPool::from_digits(&digits, sampler)?;
    let train = generate_dataset(&pool, sampler, Split::Train)?;
    let eval = generate_dataset(&pool, sampler, Split::Eval)?;
    log_generation(&log_dir, &train.log_entry())?;
    log_generation(&log_dir, &eval.log_entry())?;

    let mut model = Model::new(config.model.clone());
    model.build()?;

    for (step, batch) in train.iter(sampler.seed).take(META_STEPS).enumerate() {
        let halves = split_support_query(
            &batch,
            sampler.batch_size,
            sampler.num_classes_per_batch,
            sampler.same_input_and_label,
        )?;
        let (loss, accuracy, grads) = meta_step(&model, &halves)?;
        model.apply_gradients(&grads)?;

        log_training_step(
            &log_dir,
            &TrainingLogEntry::new(step, Split::Train, loss, accuracy),
        )?;
        println!("step {step:>3}  query loss {loss:.4}  accuracy {accuracy:?}");
    }

    let (loss, accuracy) = evaluate(&model, &eval)?;
    log_training_step(
        &log_dir,
        &TrainingLogEntry::new(META_STEPS, Split::Eval, loss, accuracy),
    )?;
    println!("eval      query loss {loss:.4}  accuracy {accuracy:?}");

    let checkpoint: PathBuf = model.save_timestamped(&log_dir)?;
    println!("checkpoint written to {}", checkpoint.display());
    Ok(())
}

/// Adapt on each task's support half and measure the query half at the fast
/// weights. Returns mean query loss, mean query accuracy and summed query
/// gradients.
fn meta_step(model: &Model, halves: &SupportQuery) -> Result<(f32, Option<f32>, ParamMap)> {
    let base = model.params()?;
    let targets_a = halves.label_a.to_targets();
    let targets_b = halves.label_b.to_targets();
    let classes_b = halves.label_b.class_indices();
    let tasks = halves.input_a.len_of(Axis(0));

    let mut total_loss = 0.0;
    let mut total_accuracy = 0.0;
    let mut meta_grads = ParamMap::new();

    for task in 0..tasks {
        let input_a = halves.input_a.index_axis(Axis(0), task);
        let input_b = halves.input_b.index_axis(Axis(0), task);

        let support = model.compute_gradients(input_a, targets_a.index_axis(Axis(0), task), None)?;
        let fast = adapt(&base, &support, INNER_LR);
        let (loss, query) = model.loss_and_gradients(
            input_b.clone(),
            targets_b.index_axis(Axis(0), task),
            Some(&fast),
        )?;
        total_loss += loss;

        if let Some(classes) = &classes_b {
            let labels = classes.index_axis(Axis(0), task).into_dimensionality::<Ix1>()?;
            total_accuracy += model.accuracy_with(input_b, labels, Some(&fast))?;
        }

        for (name, grad) in query {
            let grad = grad / tasks as f32;
            match meta_grads.get_mut(&name) {
                Some(sum) => *sum += &grad,
                None => {
                    meta_grads.insert(name, grad);
                }
            }
        }
    }

    let n = tasks.max(1) as f32;
    let accuracy = classes_b.as_ref().map(|_| total_accuracy / n);
    Ok((total_loss / n, accuracy, meta_grads))
}

fn evaluate(model: &Model, eval: &MaterializedDataset) -> Result<(f32, Option<f32>)> {
    let config = eval.config();
    let mut losses = Vec::new();
    let mut accuracies = Vec::new();

    for batch in eval.iter_ordered() {
        let halves = split_support_query(
            &batch,
            config.batch_size,
            config.num_classes_per_batch,
            config.same_input_and_label,
        )?;
        let (loss, accuracy, _) = meta_step(model, &halves)?;
        losses.push(loss);
        accuracies.extend(accuracy);
    }

    let mean = |values: &[f32]| values.iter().sum::<f32>() / values.len().max(1) as f32;
    let accuracy = (!accuracies.is_empty()).then(|| mean(&accuracies));
    Ok((mean(&losses), accuracy))
}
