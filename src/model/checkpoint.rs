//! チェックポイントの永続化
//!
//! モデルの重みは Burn の NamedMpk 形式（f32精度）で保存し、
//! ファイル名に精度・エポック・損失を埋め込みます。
//!
//! ファイル構成:
//! - model_a{精度}_e{エポック}_l{学習損失}_avl{検証損失}.mpk  - モデルの重み
//! - 同名の .json                                             - メタデータ

use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::Backend,
};

use crate::error::{Result, TileError};
use crate::labels::LabelMap;
use crate::ml::ml_model::{ModelConfig, TileClassifier, IMAGE_SIZE};
use crate::ml::training::EpochMetrics;
use crate::model::model_metadata::CheckpointMetadata;

/// チェックポイントの保存形式（CompactRecorderはf16で保存してしまうため使わない）
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

type ClassifierRecord<B> = <TileClassifier<B> as Module<B>>::Record;

/// 指標を埋め込んだチェックポイントのファイル名
pub fn checkpoint_file_name(metrics: &EpochMetrics) -> String {
    format!(
        "model_a{:.5}_e{}_l{:.2}_avl{:.2}.mpk",
        metrics.accuracy, metrics.epoch, metrics.train_loss, metrics.avg_val_loss
    )
}

/// メタデータファイルのパス
pub fn metadata_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension("json")
}

/// チェックポイントの保存先
pub struct CheckpointStore {
    dir: PathBuf,
    labels: LabelMap,
}

impl CheckpointStore {
    /// 保存先ディレクトリが存在しない場合は作成
    pub fn new(dir: impl Into<PathBuf>, labels: LabelMap) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, labels })
    }

    /// モデルの重みとメタデータを保存
    pub fn save<B: Backend>(
        &self,
        model: &TileClassifier<B>,
        metrics: &EpochMetrics,
        learning_rate: f64,
    ) -> anyhow::Result<PathBuf> {
        let path = self.dir.join(checkpoint_file_name(metrics));

        model
            .clone()
            .save_file(&path, &CheckpointRecorder::new())
            .map_err(TileError::from)
            .with_context(|| format!("Failed to save checkpoint: {}", path.display()))?;

        let metadata = CheckpointMetadata::new(
            self.labels.names().iter().map(|s| s.to_string()).collect(),
            metrics.epoch,
            metrics.accuracy,
            metrics.train_loss,
            metrics.avg_val_loss,
            learning_rate,
            IMAGE_SIZE,
        );
        let json_path = metadata_path(&path);
        fs::write(&json_path, metadata.to_json_string()?)
            .with_context(|| format!("Failed to write checkpoint metadata: {}", json_path.display()))?;

        Ok(path)
    }
}

/// チェックポイントを新しく構築したモデルに読み込む
///
/// 保存された重みの形状がネットワーク構造と一致しない場合は
/// `CheckpointShapeMismatch` を返します。
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    num_classes: usize,
    device: &B::Device,
) -> Result<TileClassifier<B>> {
    if !path.is_file() {
        return Err(TileError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("checkpoint not found: {}", path.display()),
        )));
    }

    let model = ModelConfig::new()
        .with_num_classes(num_classes)
        .init::<B>(device);

    let record: ClassifierRecord<B> = Recorder::<B>::load(&CheckpointRecorder::new(), path.to_path_buf(), device)
        .map_err(|e| TileError::CheckpointShapeMismatch {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if let Some(reason) = shape_mismatch(&model, &record) {
        return Err(TileError::CheckpointShapeMismatch {
            path: path.to_path_buf(),
            reason,
        });
    }

    if let Ok(Some(metadata)) = load_metadata(path) {
        if metadata.labels.len() != num_classes {
            log::warn!(
                "メタデータのラベル数 ({}) がモデルのクラス数 ({}) と一致しません: {}",
                metadata.labels.len(),
                num_classes,
                path.display()
            );
        }
    }

    Ok(model.load_record(record))
}

/// 重みの形状を比較し、最初の不一致を返す
fn shape_mismatch<B: Backend>(model: &TileClassifier<B>, record: &ClassifierRecord<B>) -> Option<String> {
    if model.features.len() != record.features.len() {
        return Some(format!(
            "expected {} conv blocks, found {}",
            model.features.len(),
            record.features.len()
        ));
    }

    let mut pairs = Vec::new();
    for (i, (block, saved)) in model.features.iter().zip(&record.features).enumerate() {
        pairs.push((format!("features.{i}.conv.weight"), block.conv.weight.val().dims().to_vec(), saved.conv.weight.val().dims().to_vec()));
        pairs.push((format!("features.{i}.norm.gamma"), block.norm.gamma.val().dims().to_vec(), saved.norm.gamma.val().dims().to_vec()));
    }
    pairs.push(("fc1.weight".to_string(), model.fc1.weight.val().dims().to_vec(), record.fc1.weight.val().dims().to_vec()));
    pairs.push(("fc2.weight".to_string(), model.fc2.weight.val().dims().to_vec(), record.fc2.weight.val().dims().to_vec()));

    pairs
        .into_iter()
        .find(|(_, expected, found)| expected != found)
        .map(|(name, expected, found)| format!("{name}: expected shape {expected:?}, found {found:?}"))
}

/// メタデータを読み込む（存在しない場合は None）
pub fn load_metadata(checkpoint: &Path) -> anyhow::Result<Option<CheckpointMetadata>> {
    let path = metadata_path(checkpoint);
    if !path.is_file() {
        return Ok(None);
    }

    let json = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read checkpoint metadata: {}", path.display()))?;
    CheckpointMetadata::from_json_string(&json).map(Some)
}

/// メタデータをログに出力
pub fn log_metadata_info(metadata: &CheckpointMetadata) {
    log::info!("=== チェックポイント情報 ===");
    log::info!("ラベル: {}", metadata.labels.join(", "));
    log::info!("エポック: {}", metadata.epoch);
    log::info!("検証精度: {:.5}", metadata.accuracy);
    log::info!("学習損失: {:.2}, 検証損失(平均): {:.2}", metadata.train_loss, metadata.avg_val_loss);
    log::info!("学習率: {}", metadata.learning_rate);
    log::info!("モデル入力サイズ: {}x{}", metadata.input_size, metadata.input_size);
    log::info!("保存日時: {}", metadata.saved_at);
}
