pub mod batcher;
pub mod dataset;
pub mod inference;
pub mod ml_model;
pub mod scheduler;
pub mod training;
pub mod transform;

pub use batcher::{BatchLoader, TileBatch, TileBatcher};
pub use dataset::{TileDataset, TileSample, TileSubset};
pub use inference::{EvaluationReport, InferenceEngine, Prediction};
pub use ml_model::{ModelConfig, TileClassifier, IMAGE_SIZE};
pub use scheduler::PlateauScheduler;
pub use training::{train_model, CheckpointPolicy, EpochMetrics, TrainingState, TrainingSummary};
pub use transform::{TilePipeline, EVAL_IMAGE_SIZE, TRAIN_IMAGE_SIZE};
