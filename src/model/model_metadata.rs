//! モデルメタデータの定義
//!
//! モデル成果物（tar.gz）に `metadata.json` として同梱され、
//! 推論開始時にクラスインデックスとの整合性確認に使われます。

use serde::{Deserialize, Serialize};

use crate::error::{FreshError, Result};
use crate::model::class_indices::ClassIndexMapping;

/// 学習の終了理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// 検証損失が patience エポック改善しなかった
    EarlyStopped,
    /// 最大エポック数に到達
    MaxEpochsReached,
}

/// モデルメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// モデル名（成果物ファイル名の接頭辞）
    pub model_name: String,

    /// 出力層の幅（= クラス数）
    pub num_classes: usize,

    /// 学習時に保存したクラスインデックスのチェックサム
    pub class_indices_checksum: String,

    /// モデル入力サイズ（正方形）
    pub image_size: usize,

    /// 実際に回したエポック数
    pub epochs_run: usize,

    /// 保存した重みのエポック（1始まり）
    pub best_epoch: usize,

    /// そのエポックの検証損失
    pub best_val_loss: f64,

    pub stop_reason: StopReason,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        model_name: &str,
        mapping: &ClassIndexMapping,
        image_size: usize,
        epochs_run: usize,
        best_epoch: usize,
        best_val_loss: f64,
        stop_reason: StopReason,
    ) -> Self {
        Self {
            model_name: model_name.to_string(),
            num_classes: mapping.num_classes(),
            class_indices_checksum: mapping.checksum(),
            image_size,
            epochs_run,
            best_epoch,
            best_val_loss,
            stop_reason,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// 読み込んだクラスインデックスがこのモデルと対応しているか確認
    pub fn verify_mapping(&self, mapping: &ClassIndexMapping) -> Result<()> {
        if self.num_classes != mapping.num_classes() {
            return Err(FreshError::ArtifactMismatch(format!(
                "model '{}' has {} output classes but class indices define {}",
                self.model_name,
                self.num_classes,
                mapping.num_classes()
            )));
        }
        if self.class_indices_checksum != mapping.checksum() {
            return Err(FreshError::ArtifactMismatch(format!(
                "class indices checksum does not match model '{}'",
                self.model_name
            )));
        }
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// メタデータをログ出力
    pub fn print_info(&self) {
        tracing::info!("=== モデルメタデータ ===");
        tracing::info!("モデル名: {}", self.model_name);
        tracing::info!("クラス数: {}", self.num_classes);
        tracing::info!("入力サイズ: {}x{}", self.image_size, self.image_size);
        tracing::info!(
            "エポック: {} 回実行, 最良 {} (val_loss {:.4}), 終了理由 {:?}",
            self.epochs_run,
            self.best_epoch,
            self.best_val_loss,
            self.stop_reason
        );
        tracing::info!("学習日時: {}", self.trained_at);
    }
}
