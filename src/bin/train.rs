//! モデル学習用バイナリ
//!
//! `freshx-train [MODEL_NAME]` で `{name}_model.tar.gz`, `{name}_class_indices.json`,
//! `{name}_history.csv` を書き出します。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;

use freshx::backend::{cpu_device, describe, gpu_device, CpuTrainBackend, GpuTrainBackend};
use freshx::ml::{train_model, AugmentationPreset, TrainingOptions, TrainingReport};
use freshx::model::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "freshx-train", version, about = "Train the produce freshness classifier")]
struct Cli {
    /// モデル名（成果物ファイル名の接頭辞）
    model_name: Option<String>,

    /// 設定ファイル
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// データセットのルート（train/, valid/, test/ を含む）
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// 成果物の出力先
    #[arg(long)]
    output_dir: Option<String>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    patience: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// 弱いデータ拡張（既定は robust）
    #[arg(long)]
    standard_augmentation: bool,

    /// 計算デバイスを CPU に固定
    #[arg(long)]
    cpu: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn train<B: AutodiffBackend>(
    dataset: &Path,
    options: &TrainingOptions,
    device: B::Device,
) -> Result<TrainingReport> {
    train_model::<B>(dataset, options, &device)
        .with_context(|| format!("training failed for dataset {}", dataset.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    freshx::logging::init(cli.verbose);

    let mut config = AppConfig::load_or_default(&cli.config);
    if let Some(name) = cli.model_name {
        config.set_model_name(name);
    }
    if let Some(dir) = cli.output_dir {
        config.model.model_dir = dir;
    }
    if let Some(epochs) = cli.epochs {
        config.training.max_epochs = epochs;
    }
    if let Some(batch_size) = cli.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(patience) = cli.patience {
        config.training.patience = patience;
    }
    if let Some(seed) = cli.seed {
        config.training.seed = seed;
    }
    if cli.standard_augmentation {
        config.training.augmentation = AugmentationPreset::Standard;
    }
    if cli.cpu {
        config.device_type = DeviceType::Cpu;
    }
    config.display();

    let dataset = cli
        .dataset
        .unwrap_or_else(|| PathBuf::from(&config.dataset_dir));
    let options = TrainingOptions::from_config(&config);

    tracing::info!("デバイス: {}", describe(&config.device_type));
    let report = match config.device_type {
        DeviceType::Wgpu => train::<GpuTrainBackend>(&dataset, &options, gpu_device())?,
        DeviceType::Cpu => train::<CpuTrainBackend>(&dataset, &options, cpu_device())?,
    };

    report.metadata.print_info();
    tracing::info!("クラスインデックス: {}", report.class_indices_path.display());
    tracing::info!("学習履歴: {}", report.history_path.display());
    tracing::info!("モデル: {}", report.model_path.display());
    Ok(())
}
