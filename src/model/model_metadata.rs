//! チェックポイントのメタデータ定義
//!
//! チェックポイント本体（`.mpk`）はモデルの重みのみを保持します。
//! 学習時の指標などはこのメタデータとして同名の `.json` に保存します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// チェックポイントのメタデータ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMetadata {
    /// クラスラベル（インデックスがクラスID）
    pub labels: Vec<String>,

    /// 保存時のエポック（1始まり）
    pub epoch: usize,

    /// 検証精度
    pub accuracy: f64,

    /// 学習損失の合計
    pub train_loss: f64,

    /// 検証損失の平均
    pub avg_val_loss: f64,

    /// 保存時の学習率
    pub learning_rate: f64,

    /// モデル入力サイズ（通常32x32）
    pub input_size: usize,

    /// 保存時刻（ISO8601形式）
    pub saved_at: String,
}

impl CheckpointMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        labels: Vec<String>,
        epoch: usize,
        accuracy: f64,
        train_loss: f64,
        avg_val_loss: f64,
        learning_rate: f64,
        input_size: usize,
    ) -> Self {
        let saved_at = chrono::Local::now().to_rfc3339();

        Self {
            labels,
            epoch,
            accuracy,
            train_loss,
            avg_val_loss,
            learning_rate,
            input_size,
            saved_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize checkpoint metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize checkpoint metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_keeps_metrics() {
        let metadata = CheckpointMetadata::new(vec!["unknown".into(), "mine".into()], 7, 0.75, 12.5, 0.9, 0.01, 32);
        let json = metadata.to_json_string().unwrap();
        let restored = CheckpointMetadata::from_json_string(&json).unwrap();

        assert_eq!(restored, metadata);
        assert!(chrono::DateTime::parse_from_rfc3339(&restored.saved_at).is_ok());
    }
}
