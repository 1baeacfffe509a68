//! 推論APIサーバ

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::Parser;

use freshx::api::{router, serve, ApiState};
use freshx::backend::{cpu_device, describe, gpu_device, CpuBackend, GpuBackend};
use freshx::history::JsonFileHistoryStore;
use freshx::ml::InferenceService;
use freshx::model::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "freshx", version, about = "Produce freshness inference server")]
struct Cli {
    /// 設定ファイル
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// モデル名（`{name}_model.tar.gz` を読み込む）
    #[arg(long)]
    model: Option<String>,

    /// 待ち受けポート
    #[arg(short, long)]
    port: Option<u16>,

    /// 待ち受けアドレス
    #[arg(long)]
    host: Option<String>,

    /// 計算デバイスを CPU に固定
    #[arg(long)]
    cpu: bool,

    /// 現在の設定を書き出して終了
    #[arg(long)]
    write_config: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn run<B: Backend>(config: &AppConfig, device: B::Device, addr: SocketAddr) -> Result<()> {
    let inference =
        InferenceService::<B>::start(&config.model_dir(), &config.model.model_name, &device);
    let history = Arc::new(JsonFileHistoryStore::new(&config.history_path));
    let app = router(ApiState::new(inference, history));

    let runtime = tokio::runtime::Runtime::new().context("tokio runtime")?;
    runtime.block_on(serve(app, addr))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    freshx::logging::init(cli.verbose);

    let mut config = AppConfig::load_or_default(&cli.config);
    if let Some(name) = cli.model {
        config.set_model_name(name);
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if cli.cpu {
        config.device_type = DeviceType::Cpu;
    }

    if cli.write_config {
        config.save(&cli.config)?;
        tracing::info!("設定を保存しました: {}", cli.config.display());
        return Ok(());
    }
    config.display();

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.server.host, config.server.port))?;

    tracing::info!("デバイス: {}", describe(&config.device_type));
    match config.device_type {
        DeviceType::Wgpu => run::<GpuBackend>(&config, gpu_device(), addr),
        DeviceType::Cpu => run::<CpuBackend>(&config, cpu_device(), addr),
    }
}
