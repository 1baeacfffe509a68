//! 保存済みモデルをテスト分割で評価

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::Parser;

use freshx::backend::{cpu_device, describe, gpu_device, CpuBackend, GpuBackend};
use freshx::ml::{evaluate_saved_model, EvaluationReport};
use freshx::model::{AppConfig, ClassIndexMapping, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "freshx-evaluate", version, about = "Evaluate a trained model on the test split")]
struct Cli {
    /// モデル名
    model_name: Option<String>,

    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// テストディレクトリ（既定は `{dataset_dir}/test`）
    #[arg(long)]
    test_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    /// 誤分類したファイルを一覧表示
    #[arg(long)]
    show_errors: bool,

    #[arg(long)]
    cpu: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn evaluate<B: Backend>(
    config: &AppConfig,
    test_dir: &Path,
    batch_size: usize,
    device: B::Device,
) -> Result<(EvaluationReport, ClassIndexMapping)> {
    evaluate_saved_model::<B>(
        &config.model_dir(),
        &config.model.model_name,
        test_dir,
        batch_size,
        &device,
    )
    .with_context(|| format!("evaluation of model '{}' failed", config.model.model_name))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    freshx::logging::init(cli.verbose);

    let mut config = AppConfig::load_or_default(&cli.config);
    if let Some(name) = cli.model_name {
        config.set_model_name(name);
    }
    if cli.cpu {
        config.device_type = DeviceType::Cpu;
    }
    let test_dir = cli
        .test_dir
        .unwrap_or_else(|| PathBuf::from(&config.dataset_dir).join("test"));

    tracing::info!("デバイス: {}", describe(&config.device_type));
    let (report, mapping) = match config.device_type {
        DeviceType::Wgpu => evaluate::<GpuBackend>(&config, &test_dir, cli.batch_size, gpu_device())?,
        DeviceType::Cpu => evaluate::<CpuBackend>(&config, &test_dir, cli.batch_size, cpu_device())?,
    };

    if cli.show_errors {
        for sample in report.misclassified() {
            tracing::info!(
                "{}: {} -> {} ({:.1}%)",
                sample.path.display(),
                mapping.name_of(sample.true_index).unwrap_or("?"),
                mapping.name_of(sample.predicted_index).unwrap_or("?"),
                sample.confidence * 100.0
            );
        }
    }

    println!("\n{}", report.summary(&config.model.model_name));
    Ok(())
}
