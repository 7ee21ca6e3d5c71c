//! モデル学習ループ
//!
//! 1エポックごとに 学習 → 検証 → チェックポイント判定 → 学習率調整 を行います。
//! `max_epochs` が未指定の場合はプロセスが停止されるまで学習を続けます。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    module::{AutodiffModule, Module},
    optim::{GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use rand::{rngs::StdRng, SeedableRng};

use crate::ml::batcher::{BatchLoader, TileBatcher};
use crate::ml::dataset::TileDataset;
use crate::ml::ml_model::{ModelConfig, TileClassifier};
use crate::ml::scheduler::PlateauScheduler;
use crate::ml::transform::TilePipeline;
use crate::model::checkpoint::CheckpointStore;
use crate::model::config::{CheckpointSettings, TrainerConfig};

/// エポックをまたいで引き継ぐ学習状態
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    /// 完了したエポック数
    pub epoch: usize,
    /// 保存判定の基準精度
    pub max_accuracy_threshold: f64,
    /// 基準精度を据え置く残りエポック数
    pub cooldown: usize,
}

/// チェックポイント保存の判定
///
/// 保存すると基準精度をその精度まで引き上げ、`cooldown_epochs` の間は据え置きます。
/// クールダウンが切れると基準精度は `base_threshold` に戻ります。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointPolicy {
    pub base_threshold: f64,
    pub cooldown_epochs: usize,
}

impl CheckpointPolicy {
    pub fn new(base_threshold: f64, cooldown_epochs: usize) -> Self {
        Self {
            base_threshold,
            cooldown_epochs,
        }
    }

    pub fn initial_state(&self) -> TrainingState {
        TrainingState {
            epoch: 0,
            max_accuracy_threshold: self.base_threshold,
            cooldown: 0,
        }
    }

    /// 1エポック分の検証精度を反映し、(次の状態, 保存するか) を返す
    pub fn advance(&self, state: TrainingState, accuracy: f64) -> (TrainingState, bool) {
        let mut next = TrainingState {
            epoch: state.epoch + 1,
            ..state
        };

        if next.cooldown > 0 {
            next.cooldown -= 1;
        } else {
            next.max_accuracy_threshold = self.base_threshold;
        }

        if accuracy > next.max_accuracy_threshold {
            next.max_accuracy_threshold = accuracy;
            next.cooldown = self.cooldown_epochs;
            (next, true)
        } else {
            (next, false)
        }
    }
}

impl From<&CheckpointSettings> for CheckpointPolicy {
    fn from(settings: &CheckpointSettings) -> Self {
        Self::new(settings.base_threshold, settings.cooldown_epochs)
    }
}

/// 1エポック分の指標
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    /// エポック番号（1始まり）
    pub epoch: usize,
    /// 学習損失の合計
    pub train_loss: f64,
    pub avg_train_loss: f64,
    /// 検証損失の合計（学習率調整に使用）
    pub val_loss: f64,
    pub avg_val_loss: f64,
    pub accuracy: f64,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub checkpoints: Vec<PathBuf>,
    pub final_learning_rate: f64,
    pub last_epoch: Option<EpochMetrics>,
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// モデル学習を実行
pub fn train_model<B: AutodiffBackend>(
    config: &TrainerConfig,
    device: &B::Device,
) -> Result<TrainingSummary> {
    let settings = &config.training;
    let data_dir = Path::new(&config.data_dir);

    let pipeline = TilePipeline::training(settings.seed);
    let dataset = TileDataset::from_directory(data_dir, pipeline)
        .with_context(|| format!("Failed to load training data from {}", data_dir.display()))?;
    let labels = *dataset.labels();
    log::info!("{} 枚のタイルを読み込みました ({} クラス)", dataset.len(), labels.len());

    // 検証データにも学習用の前処理が適用される
    let dataset = Arc::new(dataset);
    let (train_subset, val_subset) = Arc::clone(&dataset).split(settings.train_ratio, settings.seed);
    if train_subset.is_empty() || val_subset.is_empty() {
        anyhow::bail!(
            "学習データまたは検証データが空です (学習: {}, 検証: {})",
            train_subset.len(),
            val_subset.len()
        );
    }
    log::info!("学習データ: {} 枚, 検証データ: {} 枚", train_subset.len(), val_subset.len());

    let train_loader = BatchLoader::<B>::new(
        train_subset,
        TileBatcher::new(device.clone()),
        settings.batch_size,
    );
    let val_loader = BatchLoader::<B::InnerBackend>::new(
        val_subset,
        TileBatcher::new(device.clone()),
        settings.batch_size,
    );

    let mut model: TileClassifier<B> = ModelConfig::new()
        .with_num_classes(labels.len())
        .init(device);
    log::info!("モデルのパラメータ数: {}", model.num_params());

    let mut optim = settings.optimizer().init();
    let mut scheduler = PlateauScheduler::new(settings.learning_rate, &config.scheduler);
    let policy = CheckpointPolicy::from(&config.checkpoint);
    let store = CheckpointStore::new(&config.checkpoint.dir, labels)
        .with_context(|| format!("Failed to create checkpoint directory: {}", config.checkpoint.dir))?;

    let mut rng = make_rng(settings.seed.map(|seed| seed.wrapping_add(1)));
    let mut state = policy.initial_state();
    let mut checkpoints = Vec::new();
    let mut last_epoch = None;

    loop {
        if settings.max_epochs.is_some_and(|max| state.epoch >= max) {
            break;
        }
        let epoch = state.epoch + 1;
        let learning_rate = scheduler.learning_rate();

        // 学習
        let mut train_loss = 0.0;
        let mut train_batches = 0usize;
        for positions in train_loader.epoch_plan(Some(&mut rng)) {
            let batch = train_loader
                .load(&positions)
                .with_context(|| format!("Failed to load training batch in epoch {epoch}"))?;

            let output = model.forward_classification(batch.images, batch.targets);
            train_loss += output.loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(output.loss.backward(), &model);
            model = optim.step(learning_rate, model, grads);
            train_batches += 1;
        }

        // 検証（ドロップアウト無効、勾配なし）
        let valid_model = model.valid();
        let (val_loss, val_batches, correct, total) = validate(&valid_model, &val_loader)
            .with_context(|| format!("Failed to load validation batch in epoch {epoch}"))?;

        let metrics = EpochMetrics {
            epoch,
            train_loss,
            avg_train_loss: train_loss / train_batches.max(1) as f64,
            val_loss,
            avg_val_loss: val_loss / val_batches.max(1) as f64,
            accuracy: correct as f64 / total.max(1) as f64,
        };
        log::info!(
            "Epoch {}, Loss: {:.4}  Train Loss: {:.4}  Val Loss: {:.4} Accuracy: {:.2}%",
            metrics.epoch,
            metrics.train_loss,
            metrics.avg_train_loss,
            metrics.avg_val_loss,
            metrics.accuracy * 100.0
        );

        let (next, save) = policy.advance(state, metrics.accuracy);
        state = next;
        if save {
            let path = store.save(&valid_model, &metrics, learning_rate)?;
            log::info!("チェックポイントを保存しました: {}", path.display());
            checkpoints.push(path);
        }

        scheduler.step(metrics.val_loss);
        dataset.advance_epoch();
        last_epoch = Some(metrics);
    }

    Ok(TrainingSummary {
        epochs: state.epoch,
        checkpoints,
        final_learning_rate: scheduler.learning_rate(),
        last_epoch,
    })
}

/// 検証データ全体を評価し、(損失合計, バッチ数, 正解数, 総数) を返す
fn validate<B: Backend>(
    model: &TileClassifier<B>,
    loader: &BatchLoader<B>,
) -> crate::error::Result<(f64, usize, usize, usize)> {
    let mut loss = 0.0;
    let mut batches = 0;
    let mut correct = 0;
    let mut total = 0;

    for positions in loader.epoch_plan(None) {
        let batch = loader.load(&positions)?;
        total += batch.targets.dims()[0];

        let output = model.forward_classification(batch.images, batch.targets);
        loss += output.loss.into_scalar().elem::<f64>();

        let predictions = output.output.argmax(1).flatten::<1>(0, 1);
        let hits = predictions
            .equal(output.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        correct += hits as usize;
        batches += 1;
    }

    Ok((loss, batches, correct, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(policy: &CheckpointPolicy, accuracies: &[f64]) -> Vec<usize> {
        let mut state = policy.initial_state();
        let mut saved = Vec::new();
        for &accuracy in accuracies {
            let (next, save) = policy.advance(state, accuracy);
            state = next;
            if save {
                saved.push(state.epoch);
            }
        }
        saved
    }

    #[test]
    fn saves_only_on_new_best_within_cooldown() {
        let policy = CheckpointPolicy::new(0.7, 100);
        assert_eq!(run(&policy, &[0.71, 0.72, 0.705, 0.75]), vec![1, 2, 4]);
    }

    #[test]
    fn nothing_saved_below_base_threshold() {
        let policy = CheckpointPolicy::new(0.7, 100);
        assert!(run(&policy, &[0.1, 0.5, 0.7]).is_empty());
    }

    #[test]
    fn threshold_resets_after_cooldown_expires() {
        let policy = CheckpointPolicy::new(0.7, 2);
        // 0.8 で保存後、2エポック据え置き、その次で基準が 0.7 に戻る
        assert_eq!(run(&policy, &[0.8, 0.75, 0.75, 0.75]), vec![1, 4]);
    }

    #[test]
    fn state_counts_epochs_from_one() {
        let policy = CheckpointPolicy::new(0.7, 100);
        let (state, save) = policy.advance(policy.initial_state(), 0.9);
        assert!(save);
        assert_eq!(state.epoch, 1);
        assert_eq!(state.max_accuracy_threshold, 0.9);
        assert_eq!(state.cooldown, 100);
    }
}
