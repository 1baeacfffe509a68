//! エラー型の定義
//!
//! 学習時の設定エラー、推論時の入力エラー、サービス停止状態、
//! 履歴ストアの一時障害を区別して扱います。

use thiserror::Error;

/// エラーの分類（API境界でのステータス決定に使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// クライアント入力の問題（4xx相当）
    Client,
    /// サービスが利用不可（再起動まで継続）
    Service,
    /// 学習を中断する致命的エラー
    Fatal,
    /// 縮退動作（呼び出し元には伝播しない）
    Degraded,
}

#[derive(Error, Debug)]
pub enum FreshError {
    /// データディレクトリの欠落・空、クラス数不一致など
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 画像バイト列をデコードできない
    #[error("Decode error: {0}")]
    Decode(String),

    /// モデルまたはクラスインデックスが読み込まれていない
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// 履歴ストアに到達できない
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// モデル成果物とクラスインデックスが対応していない
    #[error("Artifact mismatch: {0}")]
    ArtifactMismatch(String),

    /// 学習中の数値発散など
    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// burnのレコード保存・復元エラー
    #[error("Record error: {0}")]
    Record(String),
}

impl FreshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FreshError::Decode(_) => ErrorKind::Client,
            FreshError::ModelUnavailable(_) | FreshError::ArtifactMismatch(_) => ErrorKind::Service,
            FreshError::PersistenceUnavailable(_) => ErrorKind::Degraded,
            FreshError::Configuration(_)
            | FreshError::Training(_)
            | FreshError::Io(_)
            | FreshError::Image(_)
            | FreshError::Serialization(_)
            | FreshError::Record(_) => ErrorKind::Fatal,
        }
    }
}

impl From<serde_json::Error> for FreshError {
    fn from(err: serde_json::Error) -> Self {
        FreshError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for FreshError {
    fn from(err: csv::Error) -> Self {
        FreshError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for FreshError {
    fn from(err: image::ImageError) -> Self {
        FreshError::Image(err.to_string())
    }
}

impl From<burn::record::RecorderError> for FreshError {
    fn from(err: burn::record::RecorderError) -> Self {
        FreshError::Record(format!("{:?}", err))
    }
}

pub type Result<T> = std::result::Result<T, FreshError>;
