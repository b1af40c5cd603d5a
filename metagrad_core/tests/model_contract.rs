use metagrad_core::model::Optimizer;
use metagrad_core::{
    adapt, generate_dataset, split_support_query, synthetic_digits, DatasetPool, ErrorKind,
    LayerSpec, LossFn, MetaError, Model, ModelConfig, OptimizerKind, ParamMap, SamplerConfig,
    Split,
};
use ndarray::{Array, ArrayD, Axis, IxDyn};

fn model_config(optimizer: OptimizerKind) -> ModelConfig {
    ModelConfig {
        name: "contract".into(),
        input_shape: vec![4, 4],
        layers: vec![LayerSpec::Dense(8), LayerSpec::Relu, LayerSpec::Dense(10)],
        loss: LossFn::SoftmaxCrossEntropy,
        optimizer,
        learning_rate: 0.05,
        ..ModelConfig::default()
    }
}

fn built(optimizer: OptimizerKind) -> Model {
    let mut model = Model::new(model_config(optimizer));
    model.build().unwrap();
    model
}

fn toy_batch() -> (ArrayD<f32>, ArrayD<f32>) {
    let inputs = Array::from_shape_fn(IxDyn(&[6, 4, 4]), |ix| {
        ((ix[0] * 7 + ix[1] * 3 + ix[2]) % 5) as f32 / 5.0
    });
    let targets = Array::from_shape_fn(IxDyn(&[6, 10]), |ix| (ix[1] == ix[0] % 3) as u8 as f32);
    (inputs, targets)
}

#[test]
fn operations_before_build_are_state_errors() {
    let mut model = Model::new(model_config(OptimizerKind::Adam));
    let (inputs, targets) = toy_batch();

    let results = [
        model.forward(inputs.view()).map(|_| ()),
        model.loss(inputs.view(), targets.view()).map(|_| ()),
        model.params().map(|_| ()),
        model.assign_params(&ParamMap::new()).map(|_| ()),
        model.optimize(inputs.view(), targets.view()).map(|_| ()),
    ];
    for result in results {
        assert_eq!(result.unwrap_err().kind(), ErrorKind::State);
    }
    assert!(!model.is_built());
}

#[test]
fn assign_params_round_trip_leaves_absent_keys_unchanged() {
    let mut model = built(OptimizerKind::Adam);
    let original = model.params().unwrap();

    let mut update = ParamMap::new();
    let bias = original["contract/layer2/bias"].mapv(|v| v + 1.5);
    update.insert("contract/layer2/bias".into(), bias.clone());
    update.insert("unrelated/param".into(), ArrayD::zeros(IxDyn(&[3])));

    assert_eq!(model.assign_params(&update).unwrap(), 1);
    let after = model.params().unwrap();
    assert_eq!(after["contract/layer2/bias"], bias);
    for (name, value) in &original {
        if name != "contract/layer2/bias" {
            assert_eq!(&after[name], value);
        }
    }
    assert!(!after.contains_key("unrelated/param"));

    assert_eq!(model.assign_params(&original).unwrap(), original.len());
    assert_eq!(model.params().unwrap(), original);
}

#[test]
fn assign_params_shape_mismatch_is_shape_error() {
    let mut model = built(OptimizerKind::Sgd);
    let mut update = ParamMap::new();
    update.insert("contract/layer0/kernel".into(), ArrayD::zeros(IxDyn(&[8, 16])));
    let err = model.assign_params(&update).unwrap_err();
    assert!(matches!(err, MetaError::Shape { .. }));
}

#[test]
fn optimize_reduces_training_loss() {
    for kind in [OptimizerKind::Sgd, OptimizerKind::Adam] {
        let mut model = built(kind);
        let (inputs, targets) = toy_batch();
        let initial = model.loss(inputs.view(), targets.view()).unwrap();
        for _ in 0..30 {
            model.optimize(inputs.view(), targets.view()).unwrap();
        }
        let trained = model.loss(inputs.view(), targets.view()).unwrap();
        assert!(trained < initial, "{kind:?}: {trained} !< {initial}");
        assert_eq!(model.steps().unwrap(), 30);
    }
}

#[test]
fn adam_time_step_counts_updates_not_parameters() {
    let mut model = built(OptimizerKind::Adam);
    let (inputs, targets) = toy_batch();
    model.optimize(inputs.view(), targets.view()).unwrap();
    model.optimize(inputs.view(), targets.view()).unwrap();
    match model.optimizer().unwrap() {
        Optimizer::Adam(adam) => assert_eq!(adam.time_step(), 2),
        other => panic!("unexpected optimizer {:?}", other.kind()),
    }
}

#[test]
fn accuracy_checks_batch_size() {
    let model = built(OptimizerKind::Adam);
    let (inputs, _) = toy_batch();
    let labels = ndarray::arr1(&[0usize, 1, 2]);
    let err = model.accuracy(inputs.view(), labels.view()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Shape);

    let logits = model.forward(inputs.view()).unwrap();
    let labels = ndarray::Array1::from_vec(vec![0usize; 6]);
    let acc = Model::compute_accuracy(labels.view(), logits.view()).unwrap();
    assert!((0.0..=1.0).contains(&acc));
}

#[test]
fn meta_step_on_sampled_episodes() {
    let sampler = SamplerConfig {
        batch_size: 4,
        meta_batch_size: 3,
        num_classes_per_batch: 2,
        ..SamplerConfig::default()
    };
    let digits = synthetic_digits(30, 4, 4, 2);
    let pool = DatasetPool::from_digits(&digits, &sampler).unwrap();
    let dataset = generate_dataset(&pool, &sampler, Split::Train).unwrap();
    let batch = dataset.meta_batch(0).unwrap();
    let halves = split_support_query(&batch, sampler.batch_size, 2, false).unwrap();

    let mut model = built(OptimizerKind::Adam);
    let base = model.params().unwrap();
    let label_a = halves.label_a.to_targets();
    let label_b = halves.label_b.to_targets();

    let mut meta_grads = ParamMap::new();
    for task in 0..batch.num_tasks() {
        let input_a = halves.input_a.index_axis(Axis(0), task);
        let target_a = label_a.index_axis(Axis(0), task);
        let input_b = halves.input_b.index_axis(Axis(0), task);
        let target_b = label_b.index_axis(Axis(0), task);

        let support = model
            .compute_gradients(input_a, target_a, None)
            .unwrap();
        let fast = adapt(&base, &support, 0.1);
        let query = model
            .compute_gradients(input_b, target_b, Some(&fast))
            .unwrap();
        assert_eq!(query.len(), base.len());
        for (name, grad) in query {
            meta_grads
                .entry(name)
                .and_modify(|sum| *sum += &grad)
                .or_insert(grad);
        }
    }

    assert_eq!(model.apply_gradients(&meta_grads).unwrap(), base.len());
    assert_ne!(model.params().unwrap(), base);
}

#[test]
fn checkpoint_restores_params_and_optimizer_state() {
    let mut model = built(OptimizerKind::Adam);
    let (inputs, targets) = toy_batch();
    model.optimize(inputs.view(), targets.view()).unwrap();

    let dir = std::env::temp_dir().join(format!("metagrad_contract_{}", uuid::Uuid::new_v4()));
    let path = model.save_timestamped(&dir).unwrap();

    let mut restored = built(OptimizerKind::Adam);
    restored.restore(&path).unwrap();
    std::fs::remove_dir_all(&dir).ok();

    assert_eq!(restored.params().unwrap(), model.params().unwrap());

    // Both continue identically from the restored optimizer moments.
    model.optimize(inputs.view(), targets.view()).unwrap();
    restored.optimize(inputs.view(), targets.view()).unwrap();
    assert_eq!(restored.params().unwrap(), model.params().unwrap());
}

#[test]
fn restore_of_missing_file_is_io_class() {
    let mut model = built(OptimizerKind::Sgd);
    let path = std::env::temp_dir().join(format!("metagrad_missing_{}.ckpt", uuid::Uuid::new_v4()));
    let err = model.restore(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn restore_of_corrupt_file_is_io_class() {
    let mut model = built(OptimizerKind::Adam);
    let before = model.params().unwrap();
    let path = std::env::temp_dir().join(format!("metagrad_corrupt_{}.ckpt", uuid::Uuid::new_v4()));
    std::fs::write(&path, [0xFF_u8; 64]).unwrap();

    let err = model.restore(&path).unwrap_err();
    std::fs::remove_file(&path).ok();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(model.params().unwrap(), before);
}
