//! 学習設定管理モジュール
//!
//! 計算デバイスや学習パラメータなどをJSON形式で保存・読み込みします。

use burn::optim::{decay::WeightDecayConfig, momentum::MomentumConfig, SgdConfig};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率の初期値
    pub learning_rate: f64,
    /// モーメンタム係数
    pub momentum: f64,
    /// Nesterov加速を使うか
    pub nesterov: bool,
    /// 重み減衰
    pub weight_decay: f32,
    /// ランダムシード（未指定なら毎回異なる分割・順序）
    pub seed: Option<u64>,
    /// トレーニングデータの割合
    pub train_ratio: f32,
    /// 最大エポック数（未指定なら外部から停止するまで学習を続ける）
    #[serde(default)]
    pub max_epochs: Option<usize>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            learning_rate: 0.01,
            momentum: 0.9,
            nesterov: true,
            weight_decay: 1e-5,
            seed: None,
            train_ratio: 0.8,
            max_epochs: None,
        }
    }
}

impl TrainingSettings {
    /// SGD（モーメンタム + 重み減衰）の設定
    pub fn optimizer(&self) -> SgdConfig {
        SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(self.momentum)
                    .with_dampening(0.0)
                    .with_nesterov(self.nesterov),
            ))
            .with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay)))
    }
}

/// チェックポイント保存の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    /// 保存先ディレクトリ
    pub dir: String,
    /// 保存判定の基準精度（クールダウン終了時にここへ戻る）
    pub base_threshold: f64,
    /// 保存後に基準精度を据え置くエポック数
    pub cooldown_epochs: usize,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            dir: "pth".to_string(),
            base_threshold: 0.7,
            cooldown_epochs: 100,
        }
    }
}

/// 学習率スケジューラ（検証損失の停滞で減衰）の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// 減衰率
    pub factor: f64,
    /// 改善なしを許容するエポック数
    pub patience: usize,
    /// 改善とみなす相対閾値
    pub threshold: f64,
    /// 学習率の下限
    pub min_lr: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            factor: 31.0 / 32.0,
            patience: 3,
            threshold: 1e-4,
            min_lr: 0.0,
        }
    }
}

/// 学習設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// 学習データのディレクトリ（images.csv を含む）
    pub data_dir: String,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// チェックポイント設定
    pub checkpoint: CheckpointSettings,
    /// スケジューラ設定
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            data_dir: "image_data".to_string(),
            training: TrainingSettings::default(),
            checkpoint: CheckpointSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl TrainerConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("trainer.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: TrainerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合はデフォルト設定を返す
    ///
    /// ファイルが存在して読み込めない場合はエラーです。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::load(path)?;
            log::info!("設定ファイルを読み込みました: {}", path.display());
            Ok(config)
        } else {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Ok(Self::default())
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        log::info!("=== 学習設定 ===");
        log::info!("計算デバイス: {}", self.device_type);
        log::info!("データディレクトリ: {}", self.data_dir);
        log::info!(
            "バッチサイズ: {}, 学習率: {}, モーメンタム: {} (nesterov={}), 重み減衰: {}",
            self.training.batch_size,
            self.training.learning_rate,
            self.training.momentum,
            self.training.nesterov,
            self.training.weight_decay
        );
        log::info!("シード: {:?}, 学習データの割合: {}", self.training.seed, self.training.train_ratio);
        match self.training.max_epochs {
            Some(max) => log::info!("最大エポック数: {}", max),
            None => log::info!("最大エポック数: なし（停止するまで継続）"),
        }
        log::info!(
            "チェックポイント: {} (基準精度 {}, クールダウン {} エポック)",
            self.checkpoint.dir,
            self.checkpoint.base_threshold,
            self.checkpoint.cooldown_epochs
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrainerConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.training.learning_rate, 0.01);
        assert_eq!(config.checkpoint.base_threshold, 0.7);
        assert_eq!(config.checkpoint.cooldown_epochs, 100);
        assert_eq!(config.scheduler.factor, 31.0 / 32.0);
        assert!(config.training.max_epochs.is_none());
    }

    #[test]
    fn test_serialize_deserialize() {
        let mut config = TrainerConfig::default();
        config.device_type = DeviceType::Cpu;
        config.training.seed = Some(42);

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: TrainerConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(deserialized.training.seed, Some(42));
        assert_eq!(config.data_dir, deserialized.data_dir);
    }

    #[test]
    fn test_missing_scheduler_section_uses_defaults() {
        let mut value = serde_json::to_value(TrainerConfig::default()).unwrap();
        value.as_object_mut().unwrap().remove("scheduler");

        let config: TrainerConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.scheduler.patience, 3);
    }

    fn temp_config(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tile_config_{}_{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join("trainer.json")
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_config("round_trip");
        let mut config = TrainerConfig::default();
        config.device_type = DeviceType::Cpu;
        config.checkpoint.dir = "checkpoints".to_string();
        config.training.max_epochs = Some(5);
        config.save(&path).unwrap();

        let loaded = TrainerConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.device_type, DeviceType::Cpu);
        assert_eq!(loaded.checkpoint.dir, "checkpoints");
        assert_eq!(loaded.training.max_epochs, Some(5));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = temp_config("missing").with_file_name("absent.json");
        let config = TrainerConfig::load_or_default(&path).unwrap();
        assert_eq!(config.checkpoint.dir, "pth");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let path = temp_config("malformed");
        fs::write(&path, "{ \"device_type\": ").unwrap();
        assert!(TrainerConfig::load_or_default(&path).is_err());
    }

    #[test]
    fn test_default_path() {
        assert_eq!(TrainerConfig::default_path(), PathBuf::from("trainer.json"));
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
