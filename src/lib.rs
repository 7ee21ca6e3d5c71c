//! マインスイーパーのタイル画像分類器
//!
//! - `images.csv` からのデータセット構築と前処理
//! - CNN の学習とチェックポイント保存
//! - ONNX 形式への出力

pub mod csv_loader;
pub mod error;
pub mod labels;
pub mod ml;
pub mod model;

pub use error::{Result, TileError};
pub use labels::{LabelMap, NUM_CLASSES, TILE_LABELS};
