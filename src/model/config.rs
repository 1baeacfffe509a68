//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデル名、学習パラメータ、サーバ設定などをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::augmentation::AugmentationPreset;

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
        DeviceType::Cpu
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

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// モデル名（成果物ファイル名の接頭辞）
    pub model_name: String,
    /// 成果物を置くディレクトリ
    pub model_dir: String,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_name: "fruit".to_string(),
            model_dir: ".".to_string(),
            dropout: 0.5,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// 最大エポック数（早期終了が主な終了条件）
    pub max_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 早期終了の猶予エポック数
    pub patience: usize,
    /// データ拡張の強さ
    #[serde(default)]
    pub augmentation: AugmentationPreset,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            max_epochs: 50,
            batch_size: 16,
            learning_rate: 1e-3,
            seed: 42,
            patience: 10,
            augmentation: AugmentationPreset::default(),
        }
    }
}

/// APIサーバ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データセットのルート（train / valid / test を含む）
    pub dataset_dir: String,
    /// サーバ設定
    #[serde(default)]
    pub server: ServerSettings,
    /// 予測履歴の保存先
    #[serde(default = "default_history_path")]
    pub history_path: String,
}

fn default_history_path() -> String {
    "history.json".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            model: ModelSettings::default(),
            training: TrainingSettings::default(),
            dataset_dir: "./Fruit Freshness/dataset".to_string(),
            server: ServerSettings::default(),
            history_path: default_history_path(),
        }
    }
}

impl AppConfig {
    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    ///
    /// 読み込み後に環境変数の上書きを適用します。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let mut config = if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// 環境変数による上書き（MODEL_NAME, PORT, FRESHX_HISTORY_PATH）
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("MODEL_NAME").filter(|s| !s.is_empty()) {
            self.model.model_name = name;
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("PORT の値が不正です: {}", port),
            }
        }
        if let Some(path) = lookup("FRESHX_HISTORY_PATH").filter(|s| !s.is_empty()) {
            self.history_path = path;
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// モデル名を設定
    pub fn set_model_name(&mut self, name: String) {
        self.model.model_name = name;
    }

    /// 成果物ディレクトリ
    pub fn model_dir(&self) -> PathBuf {
        PathBuf::from(&self.model.model_dir)
    }

    /// 設定情報をログ出力
    pub fn display(&self) {
        tracing::info!("=== アプリケーション設定 ===");
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!("モデル名: {}", self.model.model_name);
        tracing::info!("成果物ディレクトリ: {}", self.model.model_dir);
        tracing::info!("データセット: {}", self.dataset_dir);
        tracing::info!(
            "学習: 最大{}エポック, バッチ{}, 学習率{}, patience {}, 拡張 {:?}",
            self.training.max_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.patience,
            self.training.augmentation
        );
        tracing::info!("サーバ: {}:{}", self.server.host, self.server.port);
    }
}
