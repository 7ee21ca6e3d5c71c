//! 学習済みチェックポイントでデータセット全体を分類し、精度を表示

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use burn_ndarray::NdArray;
use tile_classifier_lib::labels::LabelMap;
use tile_classifier_lib::ml::transform::EVAL_IMAGE_SIZE;
use tile_classifier_lib::ml::{InferenceEngine, TileDataset, TilePipeline};

#[derive(Parser, Debug)]
#[command(name = "evaluate_tiles", about = "Classify every tile in a dataset with a checkpoint")]
struct Cli {
    /// 学習済みチェックポイント（.mpk）
    #[arg(long)]
    model: PathBuf,

    /// images.csv を含むディレクトリ
    #[arg(long, default_value = "image_data")]
    data_dir: PathBuf,

    /// 評価時のリサイズ後のサイズ
    #[arg(long, default_value_t = EVAL_IMAGE_SIZE)]
    input_size: usize,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let labels = LabelMap::standard();
    let device = Default::default();

    let engine = InferenceEngine::<NdArray<f32>>::load(&cli.model, &labels, device)
        .with_context(|| format!("Failed to load checkpoint: {}", cli.model.display()))?;
    let dataset = TileDataset::from_directory(
        &cli.data_dir,
        TilePipeline::evaluation_with_size(cli.input_size),
    )
    .with_context(|| format!("Failed to load dataset: {}", cli.data_dir.display()))?;

    let report = engine.evaluate(Arc::new(dataset), cli.batch_size)?;
    for prediction in &report.predictions {
        println!("{}", prediction.report_line());
    }
    println!(
        "Accuracy: {:.2}% ({}/{})",
        report.accuracy() * 100.0,
        report.correct(),
        report.total()
    );
    Ok(())
}
