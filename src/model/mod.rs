pub mod checkpoint;
pub mod config;
pub mod model_metadata;
pub mod onnx;
pub mod onnx_proto;

pub use checkpoint::{
    checkpoint_file_name, load_checkpoint, load_metadata, log_metadata_info, CheckpointStore,
};
pub use config::{CheckpointSettings, DeviceType, SchedulerSettings, TrainerConfig, TrainingSettings};
pub use model_metadata::CheckpointMetadata;
pub use onnx::{export_checkpoint, export_onnx};
