//! ONNX出力の検証（tract で読み込んで Burn の出力と比較）

use std::path::PathBuf;

use burn::module::{Param, RunningState};
use burn::tensor::{backend::Backend, Distribution, Tensor};
use burn_ndarray::NdArray;
use tile_classifier_lib::labels::{LabelMap, NUM_CLASSES};
use tile_classifier_lib::ml::training::EpochMetrics;
use tile_classifier_lib::ml::{ModelConfig, TileClassifier};
use tile_classifier_lib::model::{export_checkpoint, export_onnx, load_checkpoint, CheckpointStore};
use tract_onnx::prelude::*;

type TestBackend = NdArray<f32>;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tile_onnx_{}_{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// BatchNorm の4つの値をすべて恒等でない値にしたモデル
fn model_with_running_stats(device: &<TestBackend as Backend>::Device) -> TileClassifier<TestBackend> {
    let mut model = ModelConfig::new().init::<TestBackend>(device);
    for block in model.features.iter_mut() {
        let [channels] = block.norm.gamma.val().dims();
        let random = |low: f64, high: f64| {
            Tensor::<TestBackend, 1>::random([channels], Distribution::Uniform(low, high), device)
        };
        block.norm.gamma = Param::from_tensor(random(0.5, 1.5));
        block.norm.beta = Param::from_tensor(random(-0.5, 0.5));
        block.norm.running_mean = RunningState::new(random(-0.3, 0.3));
        block.norm.running_var = RunningState::new(random(0.5, 2.0));
    }
    model
}

fn run_onnx(path: &std::path::Path, batch: usize, input: Vec<f32>) -> Vec<f32> {
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .unwrap()
        .with_input_fact(0, f32::fact([batch, 1, 32, 32]).into())
        .unwrap()
        .into_optimized()
        .unwrap()
        .into_runnable()
        .unwrap();

    let input: tract_onnx::prelude::Tensor =
        tract_ndarray::Array4::from_shape_vec((batch, 1, 32, 32), input).unwrap().into();
    let result = model.run(tvec!(input.into())).unwrap();
    result[0].to_array_view::<f32>().unwrap().iter().copied().collect()
}

fn assert_close(expected: &[f32], actual: &[f32]) {
    assert_eq!(expected.len(), actual.len());
    for (e, a) in expected.iter().zip(actual) {
        assert!((e - a).abs() < 1e-4, "expected {e}, got {a}");
    }
}

#[test]
fn exported_graph_reproduces_logits() {
    let device = Default::default();
    let model = model_with_running_stats(&device);
    let path = temp_dir("logits").join("model.onnx");
    export_onnx(&model, &path).unwrap();

    let input = Tensor::<TestBackend, 4>::random([1, 1, 32, 32], Distribution::Default, &device);
    let pixels = input.clone().into_data().to_vec::<f32>().unwrap();
    let expected = model.forward(input).into_data().to_vec::<f32>().unwrap();

    let actual = run_onnx(&path, 1, pixels);
    assert_eq!(actual.len(), NUM_CLASSES);
    assert_close(&expected, &actual);
}

#[test]
fn exported_graph_accepts_any_batch_size() {
    let device = Default::default();
    let model = model_with_running_stats(&device);
    let path = temp_dir("batch").join("model.onnx");
    export_onnx(&model, &path).unwrap();

    let input = Tensor::<TestBackend, 4>::random([3, 1, 32, 32], Distribution::Default, &device);
    let pixels = input.clone().into_data().to_vec::<f32>().unwrap();
    let expected = model.forward(input).into_data().to_vec::<f32>().unwrap();

    let actual = run_onnx(&path, 3, pixels);
    assert_eq!(actual.len(), 3 * NUM_CLASSES);
    assert_close(&expected, &actual);
}

#[test]
fn checkpoint_export_matches_restored_model() {
    let device = Default::default();
    let dir = temp_dir("checkpoint");
    let model = model_with_running_stats(&device);
    let store = CheckpointStore::new(&dir, LabelMap::standard()).unwrap();
    let metrics = EpochMetrics {
        epoch: 1,
        train_loss: 2.5,
        avg_train_loss: 2.5,
        val_loss: 2.4,
        avg_val_loss: 2.4,
        accuracy: 0.75,
    };
    let checkpoint = store.save(&model, &metrics, 0.01).unwrap();

    let output = dir.join("exported.onnx");
    export_checkpoint(&checkpoint, &output).unwrap();

    let restored = load_checkpoint::<TestBackend>(&checkpoint, NUM_CLASSES, &device).unwrap();
    let input = Tensor::<TestBackend, 4>::random([1, 1, 32, 32], Distribution::Default, &device);
    let pixels = input.clone().into_data().to_vec::<f32>().unwrap();
    let expected = restored.forward(input).into_data().to_vec::<f32>().unwrap();

    assert_close(&expected, &run_onnx(&output, 1, pixels));
}

#[test]
fn incompatible_checkpoint_is_not_exported() {
    let device = Default::default();
    let dir = temp_dir("incompatible");
    let model = ModelConfig::new().with_num_classes(3).init::<TestBackend>(&device);
    let store = CheckpointStore::new(&dir, LabelMap::standard()).unwrap();
    let metrics = EpochMetrics {
        epoch: 3,
        train_loss: 1.0,
        avg_train_loss: 1.0,
        val_loss: 1.0,
        avg_val_loss: 1.0,
        accuracy: 0.8,
    };
    let checkpoint = store.save(&model, &metrics, 0.01).unwrap();

    let output = dir.join("never.onnx");
    assert!(export_checkpoint(&checkpoint, &output).is_err());
    assert!(!output.exists());
}
