//! チェックポイントを ONNX 形式に変換

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tile_classifier_lib::model::export_checkpoint;

#[derive(Parser, Debug)]
#[command(name = "export_onnx", about = "Export a tile classifier checkpoint to ONNX")]
struct Cli {
    /// 学習済みチェックポイント（.mpk）
    #[arg(long)]
    model: PathBuf,

    /// 出力先
    #[arg(long, default_value = "model.onnx")]
    output: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    export_checkpoint(&cli.model, &cli.output).with_context(|| {
        format!(
            "Failed to export {} to {}",
            cli.model.display(),
            cli.output.display()
        )
    })?;

    println!("Model exported to {}", cli.output.display());
    Ok(())
}
