//! モデル学習
//!
//! 状態遷移:
//! `Initializing → DataLoading → Training(1..E) → EarlyStopped | MaxEpochsReached → Saving → Done`
//!
//! クラスインデックスはエポック開始前に、モデル成果物は最後に書き出します。
//! 途中で失敗した場合はモデル成果物が存在しないため、不完全な組を検出できます。

use std::fmt;
use std::path::{Path, PathBuf};

use burn::{
    data::dataloader::batcher::Batcher,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{FreshError, Result};
use crate::ml::augmentation::{AugmentationConfig, Augmenter};
use crate::ml::class_weights::compute_class_weights;
use crate::ml::dataset::{DatasetSplits, FreshBatch, FreshBatcher, FreshDataset};
use crate::ml::evaluation::evaluate_dataset;
use crate::ml::ml_model::{weighted_cross_entropy, FreshnessClassifier, ModelConfig};
use crate::ml::preprocess::IMAGE_SIZE;
use crate::model::class_indices::{class_indices_path, ClassIndexMapping};
use crate::model::config::AppConfig;
use crate::model::model_metadata::{ModelMetadata, StopReason};
use crate::model::model_storage::{model_artifact_path, save_model_with_metadata, write_atomic};

/// 学習の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Initializing,
    DataLoading,
    Training { epoch: usize },
    EarlyStopped { epoch: usize },
    MaxEpochsReached,
    Saving,
    Done,
}

impl fmt::Display for TrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainerState::Initializing => write!(f, "Initializing"),
            TrainerState::DataLoading => write!(f, "DataLoading"),
            TrainerState::Training { epoch } => write!(f, "Training(epoch={})", epoch),
            TrainerState::EarlyStopped { epoch } => write!(f, "EarlyStopped(epoch={})", epoch),
            TrainerState::MaxEpochsReached => write!(f, "MaxEpochsReached"),
            TrainerState::Saving => write!(f, "Saving"),
            TrainerState::Done => write!(f, "Done"),
        }
    }
}

/// エポック判定の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochVerdict {
    /// 最良の検証損失を更新した
    Improved,
    /// 改善なし（猶予内）
    NoImprovement,
    /// 猶予を使い切った
    Stop,
}

/// 検証損失に基づく早期終了
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best_loss: f64,
    best_epoch: usize,
    counter: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_loss: f64::INFINITY,
            best_epoch: 0,
            counter: 0,
        }
    }

    /// エポック終了時の検証損失を記録
    pub fn observe(&mut self, epoch: usize, val_loss: f64) -> EpochVerdict {
        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            self.best_epoch = epoch;
            self.counter = 0;
            return EpochVerdict::Improved;
        }
        self.counter += 1;
        if self.counter >= self.patience {
            EpochVerdict::Stop
        } else {
            EpochVerdict::NoImprovement
        }
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    /// 最良エポック（1始まり、未観測なら0）
    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

/// エポックループの結果
#[derive(Debug, Clone)]
pub struct EpochOutcome<M> {
    /// 最良エポック終了時点のスナップショット
    pub best: M,
    pub best_epoch: usize,
    pub best_loss: f64,
    pub epochs_run: usize,
    pub stop_reason: StopReason,
}

/// エポックを回し、検証損失が最良だった時点のスナップショットを返す
///
/// `step(epoch, current)` は1エポック分の更新を行い、更新後の状態と検証損失を返します。
pub fn run_epochs<M, F, S>(
    max_epochs: usize,
    stopping: &mut EarlyStopping,
    initial: M,
    mut step: F,
    mut on_state: S,
) -> Result<EpochOutcome<M>>
where
    M: Clone,
    F: FnMut(usize, M) -> Result<(M, f64)>,
    S: FnMut(TrainerState),
{
    if max_epochs == 0 {
        return Err(FreshError::Configuration(
            "max_epochs must be at least 1".to_string(),
        ));
    }

    let mut current = initial;
    let mut best: Option<M> = None;

    for epoch in 1..=max_epochs {
        on_state(TrainerState::Training { epoch });
        let (next, val_loss) = step(epoch, current)?;
        if !val_loss.is_finite() {
            return Err(FreshError::Training(format!(
                "validation loss diverged at epoch {}: {}",
                epoch, val_loss
            )));
        }
        current = next;

        match stopping.observe(epoch, val_loss) {
            EpochVerdict::Improved => {
                tracing::info!("  val_loss 改善: {:.4} (epoch {})", val_loss, epoch);
                best = Some(current.clone());
            }
            EpochVerdict::NoImprovement => {}
            EpochVerdict::Stop => {
                on_state(TrainerState::EarlyStopped { epoch });
                tracing::info!(
                    "早期終了: {} エポック改善なし。epoch {} の重みを復元します",
                    stopping.patience,
                    stopping.best_epoch()
                );
                return Ok(EpochOutcome {
                    best: best.unwrap_or(current),
                    best_epoch: stopping.best_epoch(),
                    best_loss: stopping.best_loss(),
                    epochs_run: epoch,
                    stop_reason: StopReason::EarlyStopped,
                });
            }
        }
    }

    on_state(TrainerState::MaxEpochsReached);
    Ok(EpochOutcome {
        best: best.unwrap_or(current),
        best_epoch: stopping.best_epoch(),
        best_loss: stopping.best_loss(),
        epochs_run: max_epochs,
        stop_reason: StopReason::MaxEpochsReached,
    })
}

/// 1エポック分の学習履歴
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// 学習履歴CSVのパス
pub fn history_path(model_dir: &Path, model_name: &str) -> PathBuf {
    model_dir.join(format!("{}_history.csv", model_name))
}

/// 学習履歴をCSVに書き出す
pub fn write_history_csv(path: &Path, records: &[EpochRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(record)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| FreshError::Serialization(e.to_string()))?;
    write_atomic(path, &bytes)
}

/// 学習パラメータ
#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub model_name: String,
    pub model_dir: PathBuf,
    pub max_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
    pub patience: usize,
    pub dropout: f64,
    pub augmentation: AugmentationConfig,
}

impl TrainingOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model_name: config.model.model_name.clone(),
            model_dir: config.model_dir(),
            max_epochs: config.training.max_epochs,
            batch_size: config.training.batch_size,
            learning_rate: config.training.learning_rate,
            seed: config.training.seed,
            patience: config.training.patience,
            dropout: config.model.dropout,
            augmentation: config.training.augmentation.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(FreshError::Configuration("model name is empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(FreshError::Configuration("batch_size must be positive".to_string()));
        }
        if self.max_epochs == 0 {
            return Err(FreshError::Configuration("max_epochs must be at least 1".to_string()));
        }
        if self.patience == 0 {
            return Err(FreshError::Configuration("patience must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub model_path: PathBuf,
    pub class_indices_path: PathBuf,
    pub history_path: PathBuf,
    pub metadata: ModelMetadata,
    pub history: Vec<EpochRecord>,
}

/// 学習の実行者
pub struct Trainer {
    options: TrainingOptions,
    state: TrainerState,
    trail: Vec<TrainerState>,
}

impl Trainer {
    pub fn new(options: TrainingOptions) -> Self {
        Self {
            options,
            state: TrainerState::Initializing,
            trail: vec![TrainerState::Initializing],
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// これまでに通過した状態
    pub fn trail(&self) -> &[TrainerState] {
        &self.trail
    }

    fn enter(&mut self, state: TrainerState) {
        tracing::debug!("[Trainer] {} -> {}", self.state, state);
        self.state = state;
        self.trail.push(state);
    }

    /// データセットのルート（train/, valid/, test/ を含む）から学習する
    pub fn run<B: AutodiffBackend>(
        &mut self,
        dataset_dir: &Path,
        device: &B::Device,
    ) -> Result<TrainingReport> {
        let options = self.options.clone();
        options.validate()?;

        // === データ読み込み ===
        self.enter(TrainerState::DataLoading);
        let splits = DatasetSplits::discover(dataset_dir)?;
        let mapping = ClassIndexMapping::from_directory(&splits.train)?;
        let train_dataset = FreshDataset::from_directory(&splits.train, &mapping)?;
        train_dataset.require_every_class(&mapping)?;
        let val_dataset = FreshDataset::from_directory(&splits.validation, &mapping)?;

        let class_weights = compute_class_weights(&train_dataset.labels(), mapping.num_classes())?;
        tracing::info!("クラス数: {} ({})", mapping.num_classes(), mapping.names().join(", "));
        tracing::info!(
            "学習: {} 枚 / 検証: {} 枚 ({})",
            train_dataset.samples().len(),
            val_dataset.samples().len(),
            splits.validation.display()
        );
        for (name, (count, weight)) in mapping
            .names()
            .iter()
            .zip(train_dataset.class_counts().iter().zip(&class_weights))
        {
            tracing::info!("  {}: {} 枚, 重み {:.4}", name, count, weight);
        }

        std::fs::create_dir_all(&options.model_dir)?;
        let indices_path = class_indices_path(&options.model_dir, &options.model_name);
        mapping.save(&indices_path)?;

        // === 学習 ===
        let model = ModelConfig::for_classes(mapping.num_classes())
            .with_dropout(options.dropout)
            .init::<B>(device)?;
        let mut optimizer = AdamConfig::new().init::<B, FreshnessClassifier<B>>();
        let weights = Tensor::<B, 1>::from_floats(class_weights.as_slice(), device);
        let augmenter = Augmenter::new(options.augmentation.clone());
        tracing::debug!("データ拡張: {:?}", augmenter.config());
        let train_batcher = FreshBatcher::training(augmenter, options.seed);
        let val_batcher = FreshBatcher::evaluation();
        let mut shuffle_rng = StdRng::seed_from_u64(options.seed);
        let mut history = Vec::new();
        let mut stopping = EarlyStopping::new(options.patience);

        tracing::info!(
            "学習開始: 最大 {} エポック, バッチ {}, 学習率 {}, patience {}",
            options.max_epochs,
            options.batch_size,
            options.learning_rate,
            options.patience
        );

        let mut states = Vec::new();
        let outcome = run_epochs(
            options.max_epochs,
            &mut stopping,
            model,
            |epoch, model| {
                let (model, loss, accuracy) = train_epoch(
                    model,
                    &mut optimizer,
                    &train_dataset,
                    &train_batcher,
                    &weights,
                    &options,
                    &mut shuffle_rng,
                    device,
                )?;
                let valid = evaluate_dataset(
                    &model.valid(),
                    &val_dataset,
                    &val_batcher,
                    options.batch_size,
                    device,
                )?;
                tracing::info!(
                    "Epoch {}/{}: loss {:.4} acc {:.4} | val_loss {:.4} val_acc {:.4}",
                    epoch,
                    options.max_epochs,
                    loss,
                    accuracy,
                    valid.loss,
                    valid.accuracy
                );
                history.push(EpochRecord {
                    epoch,
                    loss,
                    accuracy,
                    val_loss: valid.loss,
                    val_accuracy: valid.accuracy,
                });
                Ok((model, valid.loss))
            },
            |state| states.push(state),
        );
        for state in states {
            self.enter(state);
        }
        let outcome = outcome?;

        // === 保存 ===
        self.enter(TrainerState::Saving);
        let history_file = history_path(&options.model_dir, &options.model_name);
        write_history_csv(&history_file, &history)?;

        let metadata = ModelMetadata::new(
            &options.model_name,
            &mapping,
            IMAGE_SIZE,
            outcome.epochs_run,
            outcome.best_epoch,
            outcome.best_loss,
            outcome.stop_reason,
        );
        let model_bytes = model_to_bytes(outcome.best.valid())?;
        let model_path = model_artifact_path(&options.model_dir, &options.model_name);
        save_model_with_metadata(&model_path, &metadata, &model_bytes)?;

        self.enter(TrainerState::Done);
        Ok(TrainingReport {
            model_path,
            class_indices_path: indices_path,
            history_path: history_file,
            metadata,
            history,
        })
    }
}

/// 設定に従って学習を実行
pub fn train_model<B: AutodiffBackend>(
    dataset_dir: &Path,
    options: &TrainingOptions,
    device: &B::Device,
) -> Result<TrainingReport> {
    Trainer::new(options.clone()).run::<B>(dataset_dir, device)
}

/// 重みをバイト列に変換（f32 のまま保存）
pub fn model_to_bytes<B: burn::tensor::backend::Backend>(
    model: FreshnessClassifier<B>,
) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Ok(Recorder::<B>::record(&recorder, model.into_record(), ())?)
}

/// 1エポック分の学習（シャッフル、データ拡張、クラス重み付き損失）
///
/// 戻り値は (更新後のモデル, 平均損失, 正解率)。
#[allow(clippy::too_many_arguments)]
fn train_epoch<B, O>(
    mut model: FreshnessClassifier<B>,
    optimizer: &mut O,
    dataset: &FreshDataset,
    batcher: &FreshBatcher,
    class_weights: &Tensor<B, 1>,
    options: &TrainingOptions,
    rng: &mut StdRng,
    device: &B::Device,
) -> Result<(FreshnessClassifier<B>, f64, f64)>
where
    B: AutodiffBackend,
    O: Optimizer<FreshnessClassifier<B>, B>,
{
    let mut indices: Vec<usize> = (0..dataset.samples().len()).collect();
    indices.shuffle(rng);

    let mut loss_sum = 0.0f64;
    let mut correct = 0usize;
    let mut seen = 0usize;

    for chunk in indices.chunks(options.batch_size) {
        let items = chunk
            .iter()
            .map(|&i| dataset.samples()[i].clone())
            .collect::<Vec<_>>();
        let batch_len = items.len();
        let batch: FreshBatch<B> = batcher.batch(items, device);

        let logits = model.forward(batch.images);
        let loss = weighted_cross_entropy(logits.clone(), batch.targets.clone(), Some(class_weights));
        let loss_value: f64 = loss.clone().into_scalar().elem();
        if !loss_value.is_finite() {
            return Err(FreshError::Training(format!(
                "training loss diverged: {}",
                loss_value
            )));
        }

        let predictions = logits.argmax(1).reshape([batch_len]);
        let batch_correct: i64 = predictions
            .equal(batch.targets)
            .int()
            .sum()
            .into_scalar()
            .elem();

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optimizer.step(options.learning_rate, model, grads);

        loss_sum += loss_value * batch_len as f64;
        correct += batch_correct as usize;
        seen += batch_len;
    }

    let seen = seen.max(1) as f64;
    Ok((model, loss_sum / seen, correct as f64 / seen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::tests::write_split;
    use crate::model::model_storage::load_metadata;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_early_stopping_counts_patience() {
        let mut stopping = EarlyStopping::new(2);
        assert_eq!(stopping.observe(1, 1.0), EpochVerdict::Improved);
        assert_eq!(stopping.observe(2, 1.0), EpochVerdict::NoImprovement);
        assert_eq!(stopping.observe(3, 0.5), EpochVerdict::Improved);
        assert_eq!(stopping.observe(4, 0.6), EpochVerdict::NoImprovement);
        assert_eq!(stopping.observe(5, 0.7), EpochVerdict::Stop);
        assert_eq!(stopping.best_epoch(), 3);
        assert!((stopping.best_loss() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_restores_best_snapshot_after_patience() {
        // 3エポック改善、その後10エポック悪化
        let losses = [0.9, 0.8, 0.7, 0.75, 0.8, 0.85, 0.9, 0.95, 1.0, 1.05, 1.1, 1.15, 1.2, 1.25];
        let mut stopping = EarlyStopping::new(10);
        let mut states = Vec::new();
        let outcome = run_epochs(
            50,
            &mut stopping,
            0u32,
            |epoch, _| Ok((epoch as u32, losses[epoch - 1])),
            |s| states.push(s),
        )
        .unwrap();

        assert_eq!(outcome.epochs_run, 13);
        assert_eq!(outcome.best, 3);
        assert_eq!(outcome.best_epoch, 3);
        assert_eq!(outcome.stop_reason, StopReason::EarlyStopped);
        assert_eq!(states.last(), Some(&TrainerState::EarlyStopped { epoch: 13 }));
    }

    #[test]
    fn test_max_epochs_keeps_best_not_last() {
        let losses = [0.5, 0.4, 0.45];
        let mut stopping = EarlyStopping::new(10);
        let outcome = run_epochs(
            3,
            &mut stopping,
            0u32,
            |epoch, _| Ok((epoch as u32, losses[epoch - 1])),
            |_| {},
        )
        .unwrap();
        assert_eq!(outcome.best, 2);
        assert_eq!(outcome.epochs_run, 3);
        assert_eq!(outcome.stop_reason, StopReason::MaxEpochsReached);
    }

    #[test]
    fn test_nan_validation_loss_aborts() {
        let mut stopping = EarlyStopping::new(10);
        let result = run_epochs(5, &mut stopping, 0u32, |_, m| Ok((m, f64::NAN)), |_| {});
        assert!(matches!(result, Err(FreshError::Training(_))));
    }

    #[test]
    fn test_history_csv_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = history_path(dir.path(), "fruit");
        write_history_csv(
            &path,
            &[EpochRecord {
                epoch: 1,
                loss: 0.5,
                accuracy: 0.75,
                val_loss: 0.6,
                val_accuracy: 0.7,
            }],
        )
        .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("epoch,loss,accuracy,val_loss,val_accuracy\n1,0.5,0.75,0.6,0.7"));
    }

    fn options(dir: &Path) -> TrainingOptions {
        TrainingOptions {
            model_name: "tiny".to_string(),
            model_dir: dir.join("models"),
            max_epochs: 2,
            batch_size: 2,
            learning_rate: 1e-3,
            seed: 7,
            patience: 10,
            dropout: 0.5,
            augmentation: AugmentationConfig::none(),
        }
    }

    #[test]
    fn test_missing_layout_fails_before_any_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let mut trainer = Trainer::new(opts.clone());
        let err = trainer
            .run::<TestBackend>(&dir.path().join("dataset"), &Default::default())
            .unwrap_err();
        assert!(matches!(err, FreshError::Configuration(_)));
        assert_eq!(trainer.state(), TrainerState::DataLoading);
        assert!(!class_indices_path(&opts.model_dir, "tiny").exists());
    }

    #[test]
    fn test_empty_class_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dataset");
        write_split(&root, "train", &[("fresh_apples", 1, [200, 20, 20])]);
        std::fs::create_dir_all(root.join("train/rotten_apples")).unwrap();
        write_split(&root, "valid", &[("fresh_apples", 1, [200, 20, 20])]);

        let opts = options(dir.path());
        let err = train_model::<TestBackend>(&root, &opts, &Default::default()).unwrap_err();
        assert!(matches!(err, FreshError::Configuration(_)));
        assert!(!class_indices_path(&opts.model_dir, "tiny").exists());
    }

    #[test]
    fn test_end_to_end_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dataset");
        let classes = [("fresh_apples", 1, [220, 30, 30]), ("rotten_apples", 1, [80, 60, 20])];
        write_split(&root, "train", &classes);
        write_split(&root, "valid", &classes);

        let opts = options(dir.path());
        let mut trainer = Trainer::new(opts.clone());
        let report = trainer.run::<TestBackend>(&root, &Default::default()).unwrap();

        assert_eq!(report.history.len(), 2);
        assert_eq!(report.metadata.num_classes, 2);
        assert_eq!(report.metadata.stop_reason, StopReason::MaxEpochsReached);
        assert!(report.history_path.exists());

        let json = std::fs::read_to_string(&report.class_indices_path).unwrap();
        assert_eq!(json, r#"{"fresh_apples":0,"rotten_apples":1}"#);

        let metadata = load_metadata(&report.model_path).unwrap();
        assert_eq!(metadata.best_epoch, report.metadata.best_epoch);
        assert!(metadata.best_epoch >= 1 && metadata.best_epoch <= 2);

        let trail = trainer.trail();
        assert_eq!(
            &trail[..3],
            &[
                TrainerState::Initializing,
                TrainerState::DataLoading,
                TrainerState::Training { epoch: 1 }
            ]
        );
        assert_eq!(
            &trail[trail.len() - 3..],
            &[TrainerState::MaxEpochsReached, TrainerState::Saving, TrainerState::Done]
        );
    }
}
