//! タイル分類器のエラー定義

use std::path::PathBuf;

use thiserror::Error;

/// ライブラリ共通のエラー
///
/// いずれも回復不能として扱い、呼び出し側でそのまま中断させます。
#[derive(Debug, Error)]
pub enum TileError {
    /// マニフェストの行が `path,category` の形式になっていない
    #[error("malformed manifest row at {path}:{line}: expected `path,category`")]
    ManifestFormat { path: PathBuf, line: u64 },

    /// ラベル一覧に存在しないカテゴリ名
    #[error("unknown tile label `{0}`")]
    UnknownLabel(String),

    #[error("index {index} is out of range for a dataset of {len} tiles")]
    IndexOutOfRange { index: usize, len: usize },

    /// チェックポイントとネットワーク構造の不一致
    #[error("checkpoint {path} does not match the classifier architecture: {reason}")]
    CheckpointShapeMismatch { path: PathBuf, reason: String },

    #[error("failed to decode image {path}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// 入力テンソルのサイズが 32x32 ではない
    #[error("classifier expects input of shape [_, 1, {expected}, {expected}], got {actual:?}")]
    InputShapeMismatch { expected: usize, actual: [usize; 4] },

    #[error("failed to read tensor data: {0}")]
    TensorData(String),

    #[error("ONNX export failed: {0}")]
    Export(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Recorder(#[from] burn::record::RecorderError),
}

pub type Result<T> = std::result::Result<T, TileError>;
