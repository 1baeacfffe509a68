//! 保存済みモデルの評価
//!
//! テスト分割をシャッフルせずディレクトリ順に1回だけ順伝播し、
//! 損失・正解率とサンプルごとの予測を返します。モデルは変更しません。

use std::path::{Path, PathBuf};

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{activation::softmax, backend::Backend},
};

use crate::error::{FreshError, Result};
use crate::ml::dataset::{FreshBatch, FreshBatcher, FreshDataset};
use crate::ml::inference::{load_classifier, tensor_values, top_class};
use crate::ml::ml_model::{per_sample_cross_entropy, FreshnessClassifier};
use crate::model::class_indices::ClassIndexMapping;

/// 1枚分の予測
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePrediction {
    pub path: PathBuf,
    pub true_index: usize,
    pub predicted_index: usize,
    /// 予測クラスの確率 [0, 1]
    pub confidence: f32,
}

impl SamplePrediction {
    pub fn is_correct(&self) -> bool {
        self.true_index == self.predicted_index
    }
}

/// 評価結果
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    /// 重みなしクロスエントロピーのサンプル平均
    pub loss: f64,
    /// argmax が正解と一致した割合
    pub accuracy: f64,
    /// データセット順の予測
    pub samples: Vec<SamplePrediction>,
}

impl EvaluationReport {
    pub fn misclassified(&self) -> impl Iterator<Item = &SamplePrediction> {
        self.samples.iter().filter(|s| !s.is_correct())
    }

    /// 結果ボックス
    pub fn summary(&self, model_name: &str) -> String {
        let rule = "=".repeat(30);
        format!(
            "{rule}\nFINAL TEST RESULTS FOR {}\n{rule}\nLoss:     {:.4}\nAccuracy: {:.2}%\n{rule}",
            model_name.to_uppercase(),
            self.loss,
            self.accuracy * 100.0,
        )
    }
}

/// データセット全体を順番通りに評価
pub fn evaluate_dataset<B: Backend>(
    model: &FreshnessClassifier<B>,
    dataset: &FreshDataset,
    batcher: &FreshBatcher,
    batch_size: usize,
    device: &B::Device,
) -> Result<EvaluationReport> {
    if batch_size == 0 {
        return Err(FreshError::Configuration("batch_size must be positive".to_string()));
    }

    let mut loss_sum = 0.0f64;
    let mut samples = Vec::with_capacity(dataset.samples().len());

    for chunk in dataset.samples().chunks(batch_size) {
        let batch: FreshBatch<B> = batcher.batch(chunk.to_vec(), device);
        let logits = model.forward(batch.images);
        let [_, num_classes] = logits.dims();

        let losses = tensor_values(per_sample_cross_entropy(logits.clone(), batch.targets))?;
        let probabilities = tensor_values(softmax(logits, 1))?;

        for ((item, loss), row) in chunk
            .iter()
            .zip(losses)
            .zip(probabilities.chunks(num_classes))
        {
            if !loss.is_finite() {
                return Err(FreshError::Training(format!(
                    "non-finite loss for {}",
                    item.path.display()
                )));
            }
            loss_sum += loss as f64;
            let (predicted_index, confidence) = top_class(row).ok_or_else(|| {
                FreshError::Training("model produced an empty output row".to_string())
            })?;
            samples.push(SamplePrediction {
                path: item.path.clone(),
                true_index: item.label,
                predicted_index,
                confidence,
            });
        }
    }

    let total = samples.len().max(1) as f64;
    let correct = samples.iter().filter(|s| s.is_correct()).count();
    Ok(EvaluationReport {
        loss: loss_sum / total,
        accuracy: correct as f64 / total,
        samples,
    })
}

/// 保存済みモデルをテストディレクトリで評価
pub fn evaluate_saved_model<B: Backend>(
    model_dir: &Path,
    model_name: &str,
    test_dir: &Path,
    batch_size: usize,
    device: &B::Device,
) -> Result<(EvaluationReport, ClassIndexMapping)> {
    let loaded = load_classifier::<B>(model_dir, model_name, device)?;
    loaded.metadata.print_info();

    let dataset = FreshDataset::from_directory(test_dir, &loaded.mapping)?;
    tracing::info!(
        "評価データ: {} 枚 ({})",
        dataset.samples().len(),
        test_dir.display()
    );

    let report = evaluate_dataset(
        &loaded.model,
        &dataset,
        &FreshBatcher::evaluation(),
        batch_size,
        device,
    )?;
    Ok((report, loaded.mapping))
}
