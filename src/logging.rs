//! tracingサブスクライバの初期化

use tracing_subscriber::EnvFilter;

/// ログ出力を初期化
///
/// `RUST_LOG` が設定されていればそれを優先します。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // 二重初期化（テスト等）は無視
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
