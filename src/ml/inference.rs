//! モデル推論機能
//!
//! 起動時に一度だけモデルとクラスインデックスを読み込み、
//! 以後はその推論コンテキストを共有して予測します。

use std::path::Path;
use std::sync::Mutex;

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::{FreshError, Result};
use crate::ml::ml_model::{FreshnessClassifier, ModelConfig};
use crate::ml::preprocess::{decode_image, prepare_image, IMAGE_SIZE};
use crate::model::class_indices::{
    class_indices_path, format_label, is_fresh_label, ClassIndexMapping, UNKNOWN_LABEL,
};
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::{load_model_with_metadata, model_artifact_path};

/// 予測結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// 表示用ラベル（例: "Fresh Bananas"）
    pub label: String,
    /// 最大クラス確率のパーセント表記 [0, 100]
    pub confidence: f32,
    pub is_fresh: bool,
    pub model_used: String,
}

impl Prediction {
    /// 確率ベクトルから予測結果を組み立てる
    ///
    /// 同率の場合は小さいインデックスを採用します。
    /// 対応表に無いインデックスは "Unknown"（is_fresh = false）になります。
    pub fn from_probabilities(
        probabilities: &[f32],
        mapping: &ClassIndexMapping,
        model_name: &str,
    ) -> Result<Self> {
        let (index, max_prob) = top_class(probabilities).ok_or_else(|| {
            FreshError::ModelUnavailable("model produced an empty probability vector".to_string())
        })?;

        let (label, is_fresh) = match mapping.name_of(index) {
            Some(raw) => (format_label(raw), is_fresh_label(raw)),
            None => {
                tracing::warn!("クラスインデックス {} は対応表にありません", index);
                (UNKNOWN_LABEL.to_string(), false)
            }
        };

        Ok(Self {
            label,
            confidence: (max_prob * 100.0).clamp(0.0, 100.0),
            is_fresh,
            model_used: model_name.to_string(),
        })
    }
}

/// 最大値とそのインデックス（同率なら先頭、NaN は無視）
pub fn top_class(values: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best
}

/// テンソルの値を f32 の列として取り出す
pub fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| FreshError::Training(format!("failed to read tensor data: {:?}", e)))
}

/// 読み込み済みのモデル一式
pub struct LoadedClassifier<B: Backend> {
    pub model: FreshnessClassifier<B>,
    pub mapping: ClassIndexMapping,
    pub metadata: ModelMetadata,
}

/// `{name}_model.tar.gz` と `{name}_class_indices.json` を読み込み、整合性を確認する
pub fn load_classifier<B: Backend>(
    model_dir: &Path,
    model_name: &str,
    device: &B::Device,
) -> Result<LoadedClassifier<B>> {
    let mapping = ClassIndexMapping::load(&class_indices_path(model_dir, model_name))?;
    let (metadata, model_binary) =
        load_model_with_metadata(&model_artifact_path(model_dir, model_name))?;

    metadata.verify_mapping(&mapping)?;
    if metadata.image_size != IMAGE_SIZE {
        return Err(FreshError::ArtifactMismatch(format!(
            "model expects {}x{} input but preprocessing produces {}x{}",
            metadata.image_size, metadata.image_size, IMAGE_SIZE, IMAGE_SIZE
        )));
    }

    let model = ModelConfig::for_classes(mapping.num_classes()).init::<B>(device)?;
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = Recorder::<B>::load(&recorder, model_binary, device)?;
    let model = model.load_record(record);

    Ok(LoadedClassifier {
        model,
        mapping,
        metadata,
    })
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: Mutex<FreshnessClassifier<B>>,
    mapping: ClassIndexMapping,
    model_name: String,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load(model_dir: &Path, model_name: &str, device: &B::Device) -> Result<Self> {
        let loaded = load_classifier::<B>(model_dir, model_name, device)?;
        tracing::info!(
            "モデル '{}' を読み込みました ({} クラス: {})",
            model_name,
            loaded.mapping.num_classes(),
            loaded.mapping.names().join(", ")
        );
        Ok(Self::from_parts(loaded.model, loaded.mapping, model_name, device.clone()))
    }

    pub fn from_parts(
        model: FreshnessClassifier<B>,
        mapping: ClassIndexMapping,
        model_name: &str,
        device: B::Device,
    ) -> Self {
        Self {
            model: Mutex::new(model),
            mapping,
            model_name: model_name.to_string(),
            device,
        }
    }

    pub fn mapping(&self) -> &ClassIndexMapping {
        &self.mapping
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// 画像バイト列を分類
    pub fn predict(&self, image_bytes: &[u8]) -> Result<Prediction> {
        let image = decode_image(image_bytes)?;
        self.predict_image(&image)
    }

    /// デコード済み画像を分類
    pub fn predict_image(&self, image: &DynamicImage) -> Result<Prediction> {
        let input = prepare_image(image).to_tensor::<B>(&self.device);
        let probabilities = {
            let model = self
                .model
                .lock()
                .map_err(|_| FreshError::ModelUnavailable("model lock poisoned".to_string()))?;
            model.forward_probabilities(input)
        };
        let probabilities = tensor_values(probabilities)?;
        Prediction::from_probabilities(&probabilities, &self.mapping, &self.model_name)
    }
}

/// 推論サービス
///
/// 起動時の読み込みに失敗した場合は `Unavailable` のまま、
/// すべての予測が即座に `ModelUnavailable` で失敗します。
pub enum InferenceService<B: Backend> {
    Ready(InferenceEngine<B>),
    Unavailable { model_name: String, reason: String },
}

impl<B: Backend> InferenceService<B> {
    pub fn start(model_dir: &Path, model_name: &str, device: &B::Device) -> Self {
        match InferenceEngine::load(model_dir, model_name, device) {
            Ok(engine) => InferenceService::Ready(engine),
            Err(e) => {
                tracing::error!(
                    "モデル '{}' を読み込めません: {}。学習を先に実行してください",
                    model_name,
                    e
                );
                InferenceService::Unavailable {
                    model_name: model_name.to_string(),
                    reason: e.to_string(),
                }
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, InferenceService::Ready(_))
    }

    pub fn model_name(&self) -> &str {
        match self {
            InferenceService::Ready(engine) => engine.model_name(),
            InferenceService::Unavailable { model_name, .. } => model_name,
        }
    }

    pub fn predict(&self, image_bytes: &[u8]) -> Result<Prediction> {
        match self {
            InferenceService::Ready(engine) => engine.predict(image_bytes),
            InferenceService::Unavailable { reason, .. } => {
                Err(FreshError::ModelUnavailable(reason.clone()))
            }
        }
    }
}
