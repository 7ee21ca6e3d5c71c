//! 学習済みモデルによるタイル分類

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::tensor::backend::Backend;

use crate::error::{Result, TileError};
use crate::labels::LabelMap;
use crate::ml::batcher::{BatchLoader, TileBatch, TileBatcher};
use crate::ml::dataset::{TileDataset, TileSubset};
use crate::ml::ml_model::TileClassifier;
use crate::model::checkpoint::load_checkpoint;

/// 1枚分の分類結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub path: PathBuf,
    pub predicted: usize,
    pub actual: usize,
}

impl Prediction {
    pub fn is_correct(&self) -> bool {
        self.predicted == self.actual
    }

    /// 評価結果の1行（クラスIDで表示）
    pub fn report_line(&self) -> String {
        format!("Pred: {} True: {} Image: {}", self.predicted, self.actual, self.path.display())
    }
}

/// データセット全体の評価結果
#[derive(Debug, Clone, Default)]
pub struct EvaluationReport {
    pub predictions: Vec<Prediction>,
}

impl EvaluationReport {
    pub fn correct(&self) -> usize {
        self.predictions.iter().filter(|p| p.is_correct()).count()
    }

    pub fn total(&self) -> usize {
        self.predictions.len()
    }

    pub fn accuracy(&self) -> f64 {
        if self.predictions.is_empty() {
            return 0.0;
        }
        self.correct() as f64 / self.total() as f64
    }
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: TileClassifier<B>,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// チェックポイントを読み込んで推論エンジンを初期化
    pub fn load(model_path: &Path, labels: &LabelMap, device: B::Device) -> Result<Self> {
        let model = load_checkpoint::<B>(model_path, labels.len(), &device)?;
        Ok(Self::new(model, device))
    }

    pub fn new(model: TileClassifier<B>, device: B::Device) -> Self {
        Self { model, device }
    }

    /// バッチを分類してクラスIDを返す
    pub fn classify_batch(&self, batch: TileBatch<B>) -> Result<Vec<usize>> {
        TileClassifier::<B>::check_input(batch.images.dims())?;

        let (predictions, _) = self.model.predict(batch.images);
        let ids = predictions
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| TileError::TensorData(format!("{e:?}")))?;

        Ok(ids.into_iter().map(|id| id as usize).collect())
    }

    /// データセット全体を分類
    pub fn evaluate(&self, dataset: Arc<TileDataset>, batch_size: usize) -> Result<EvaluationReport> {
        let loader = BatchLoader::new(
            TileSubset::full(Arc::clone(&dataset)),
            TileBatcher::<B>::new(self.device.clone()),
            batch_size,
        );

        let mut report = EvaluationReport::default();
        for positions in loader.epoch_plan(None) {
            let batch = loader.load(&positions)?;
            let predicted = self.classify_batch(batch)?;

            for (&position, predicted) in positions.iter().zip(predicted) {
                let record = &dataset.records()[position];
                report.predictions.push(Prediction {
                    path: record.path.clone(),
                    predicted,
                    actual: record.class_id,
                });
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::tests::fixture_dir;
    use crate::ml::ml_model::ModelConfig;
    use crate::ml::transform::TilePipeline;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn engine() -> InferenceEngine<TestBackend> {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        InferenceEngine::new(model, device)
    }

    #[test]
    fn evaluates_every_tile_at_model_size() {
        let dir = fixture_dir("inference", 5);
        let dataset = TileDataset::from_directory(&dir, TilePipeline::evaluation_with_size(32)).unwrap();

        let report = engine().evaluate(Arc::new(dataset), 2).unwrap();
        assert_eq!(report.total(), 5);
        assert!(report.predictions.iter().all(|p| p.predicted < 12));
        assert_eq!(report.predictions[1].actual, 1);
        assert!((0.0..=1.0).contains(&report.accuracy()));
    }

    #[test]
    fn report_line_shows_class_ids() {
        let prediction = Prediction {
            path: PathBuf::from("image_data/7/a.png"),
            predicted: 9,
            actual: 10,
        };
        assert_eq!(prediction.report_line(), "Pred: 9 True: 10 Image: image_data/7/a.png");
        assert!(!prediction.is_correct());
    }

    #[test]
    fn small_evaluation_tiles_are_rejected() {
        let dir = fixture_dir("inference_small", 2);
        let dataset = TileDataset::from_directory(&dir, TilePipeline::evaluation()).unwrap();

        let err = engine().evaluate(Arc::new(dataset), 2).unwrap_err();
        assert!(matches!(err, TileError::InputShapeMismatch { expected: 32, .. }));
    }
}
