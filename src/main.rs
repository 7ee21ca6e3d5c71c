//! タイル分類器の学習

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use tile_classifier_lib::ml::train_model;
use tile_classifier_lib::model::{DeviceType, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "tile_classifier", about = "Train the Minesweeper tile classifier")]
struct Cli {
    /// 学習設定ファイル（存在しなければデフォルト設定）
    #[arg(long, default_value_os_t = TrainerConfig::default_path())]
    config: PathBuf,

    /// images.csv を含む学習データのディレクトリ
    #[arg(long)]
    data_dir: Option<String>,

    /// チェックポイントの保存先
    #[arg(long)]
    checkpoint_dir: Option<String>,

    /// 最大エポック数
    #[arg(long)]
    max_epochs: Option<usize>,

    /// 引数を反映した設定を --config に書き出して終了
    #[arg(long)]
    save_config: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = TrainerConfig::load_or_default(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(dir) = cli.checkpoint_dir {
        config.checkpoint.dir = dir;
    }
    if cli.max_epochs.is_some() {
        config.training.max_epochs = cli.max_epochs;
    }
    if cli.save_config {
        config.save(&cli.config)?;
        log::info!("設定を保存しました: {}", cli.config.display());
        return Ok(());
    }
    config.display();

    let summary = match config.device_type {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            let device = burn_wgpu::WgpuDevice::default();
            log::info!("使用デバイス: {:?}", device);
            train_model::<Autodiff<burn::backend::Wgpu>>(&config, &device)?
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            log::warn!("wgpu 機能が無効のため CPU で学習します");
            train_model::<Autodiff<NdArray<f32>>>(&config, &Default::default())?
        }
        DeviceType::Cpu => train_model::<Autodiff<NdArray<f32>>>(&config, &Default::default())?,
    };

    log::info!(
        "学習終了: {} エポック, 保存したチェックポイント {} 件, 最終学習率 {:.6e}",
        summary.epochs,
        summary.checkpoints.len(),
        summary.final_learning_rate
    );
    Ok(())
}
