//! ディレクトリ構成の画像データセット
//!
//! ```text
//! dataset/
//!   train/{class}/*.jpg
//!   valid/{class}/*.jpg   (無ければ validation/、それも無ければ test/)
//!   test/{class}/*.jpg
//! ```

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{FreshError, Result};
use crate::ml::augmentation::Augmenter;
use crate::ml::preprocess::{
    hwc_batch_to_tensor, load_image_file, resize_rgb, rgb_to_unit_floats, CHANNELS, IMAGE_SIZE,
};
use crate::model::class_indices::ClassIndexMapping;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

/// 学習・検証・テストのディレクトリ
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplits {
    pub train: PathBuf,
    pub validation: PathBuf,
    pub test: PathBuf,
}

impl DatasetSplits {
    /// データセットのルートから各分割のディレクトリを決定
    ///
    /// 検証用は `valid` → `validation` → `test` の順に探します。
    pub fn discover(root: &Path) -> Result<Self> {
        let train = root.join("train");
        if !train.is_dir() {
            return Err(FreshError::Configuration(format!(
                "training directory not found: {}",
                train.display()
            )));
        }

        let test = root.join("test");
        let validation = ["valid", "validation"]
            .iter()
            .map(|name| root.join(name))
            .find(|p| p.is_dir());
        let validation = match validation {
            Some(dir) => dir,
            None if test.is_dir() => {
                tracing::warn!(
                    "検証用フォルダが見つかりません ({}/valid)。test を検証に使用します",
                    root.display()
                );
                test.clone()
            }
            None => {
                return Err(FreshError::Configuration(format!(
                    "no validation directory (valid, validation or test) in {}",
                    root.display()
                )))
            }
        };

        Ok(Self {
            train,
            validation,
            test,
        })
    }
}

/// データセットアイテム（画像パスとクラスID）
#[derive(Clone, Debug, PartialEq)]
pub struct ImageSample {
    pub path: PathBuf,
    pub label: usize,
}

/// 学習データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct FreshDataset {
    samples: Vec<ImageSample>,
    num_classes: usize,
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

impl FreshDataset {
    /// クラスインデックスの順序でディレクトリから読み込む
    ///
    /// クラス内のファイルはファイル名順に並べるため、順序は再現可能です。
    /// 対応表に無いサブディレクトリは無視します。
    /// 画像として読めないファイルは警告を出して除外し、件数にも含めません。
    pub fn from_directory(data_dir: &Path, mapping: &ClassIndexMapping) -> Result<Self> {
        if !data_dir.is_dir() {
            return Err(FreshError::Configuration(format!(
                "data directory not found: {}",
                data_dir.display()
            )));
        }

        let mut samples = Vec::new();
        for (class_id, class_name) in mapping.names().iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.is_dir() {
                tracing::warn!(
                    "クラスディレクトリが存在しません: {}",
                    class_dir.display()
                );
                continue;
            }

            let mut paths = Vec::new();
            for entry in std::fs::read_dir(&class_dir)? {
                let path = entry?.path();
                if is_image_file(&path) {
                    paths.push(path);
                }
            }
            paths.sort();
            paths.retain(|path| match load_image_file(path) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("読み込めない画像を除外します {}: {}", path.display(), e);
                    false
                }
            });
            samples.extend(paths.into_iter().map(|path| ImageSample {
                path,
                label: class_id,
            }));
        }

        for entry in std::fs::read_dir(data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && mapping.index_of(&name).is_none() {
                tracing::warn!("未知のクラスディレクトリを無視します: {}", name);
            }
        }

        if samples.is_empty() {
            return Err(FreshError::Configuration(format!(
                "no images found in {}",
                data_dir.display()
            )));
        }

        Ok(Self {
            samples,
            num_classes: mapping.num_classes(),
        })
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// サンプルごとのラベル
    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.label).collect()
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }

    /// 全クラスに1枚以上の画像があることを確認
    pub fn require_every_class(&self, mapping: &ClassIndexMapping) -> Result<()> {
        let empty: Vec<&str> = self
            .class_counts()
            .iter()
            .enumerate()
            .filter(|(_, &n)| n == 0)
            .filter_map(|(i, _)| mapping.name_of(i))
            .collect();
        if empty.is_empty() {
            Ok(())
        } else {
            Err(FreshError::Configuration(format!(
                "class directories without images: {}",
                empty.join(", ")
            )))
        }
    }
}

impl Dataset<ImageSample> for FreshDataset {
    fn get(&self, index: usize) -> Option<ImageSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct FreshBatch<B: Backend> {
    /// [batch_size, 3, IMAGE_SIZE, IMAGE_SIZE]
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// バッチャー
///
/// 拡張器を持つ場合は学習用、持たない場合は検証・評価用（リサイズと 1/255 のみ）。
pub struct FreshBatcher {
    augmenter: Option<Augmenter>,
    rng: Mutex<StdRng>,
}

impl FreshBatcher {
    /// 学習用（データ拡張あり）
    pub fn training(augmenter: Augmenter, seed: u64) -> Self {
        Self {
            augmenter: Some(augmenter),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// 検証・評価用（決定的）
    pub fn evaluation() -> Self {
        Self {
            augmenter: None,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    pub fn is_augmenting(&self) -> bool {
        self.augmenter.is_some()
    }

    /// 1枚を読み込んでHWC順の [0, 1] 値にする
    fn load_sample(&self, path: &Path) -> Result<Vec<f32>> {
        let image = load_image_file(path)?;
        let resized = resize_rgb(&image);
        let resized = match &self.augmenter {
            Some(augmenter) => {
                let mut rng = self
                    .rng
                    .lock()
                    .map_err(|_| FreshError::Training("augmentation rng poisoned".to_string()))?;
                augmenter.augment(&resized, &mut *rng)
            }
            None => resized,
        };
        Ok(rgb_to_unit_floats(&resized))
    }
}

impl<B: Backend> Batcher<B, ImageSample, FreshBatch<B>> for FreshBatcher {
    fn batch(&self, items: Vec<ImageSample>, device: &B::Device) -> FreshBatch<B> {
        let batch_size = items.len();
        let pixels_per_image = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;
        let mut all_pixels = Vec::with_capacity(batch_size * pixels_per_image);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            match self.load_sample(&item.path) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    // 一覧作成後に読めなくなった画像はゼロで埋める
                    tracing::warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    all_pixels.extend(std::iter::repeat(0.0f32).take(pixels_per_image));
                }
            }
            targets_vec.push(item.label as i64);
        }

        let images = hwc_batch_to_tensor(&all_pixels, batch_size, IMAGE_SIZE, device);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), device);

        FreshBatch { images, targets }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ml::augmentation::AugmentationConfig;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    /// `root/{split}/{class}/img_{i}.png` を作成
    pub(crate) fn write_split(root: &Path, split: &str, classes: &[(&str, usize, [u8; 3])]) {
        for (class, count, color) in classes {
            let dir = root.join(split).join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                RgbImage::from_pixel(24, 16, Rgb(*color))
                    .save(dir.join(format!("img_{}.png", i)))
                    .unwrap();
            }
        }
    }

    fn mapping() -> ClassIndexMapping {
        ClassIndexMapping::from_names(vec!["fresh_apples".into(), "rotten_apples".into()]).unwrap()
    }

    #[test]
    fn test_discover_prefers_valid() {
        let dir = tempfile::tempdir().unwrap();
        for split in ["train", "valid", "validation", "test"] {
            std::fs::create_dir_all(dir.path().join(split)).unwrap();
        }
        let splits = DatasetSplits::discover(dir.path()).unwrap();
        assert!(splits.validation.ends_with("valid"));
    }

    #[test]
    fn test_discover_falls_back_to_test() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("train")).unwrap();
        std::fs::create_dir_all(dir.path().join("test")).unwrap();
        let splits = DatasetSplits::discover(dir.path()).unwrap();
        assert_eq!(splits.validation, splits.test);
    }

    #[test]
    fn test_discover_without_train_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            DatasetSplits::discover(dir.path()),
            Err(FreshError::Configuration(_))
        ));
    }

    #[test]
    fn test_from_directory_orders_by_class_then_name() {
        let dir = tempfile::tempdir().unwrap();
        write_split(
            dir.path(),
            "train",
            &[("rotten_apples", 2, [90, 60, 20]), ("fresh_apples", 3, [200, 30, 30])],
        );
        std::fs::write(dir.path().join("train/fresh_apples/notes.txt"), "x").unwrap();

        let dataset = FreshDataset::from_directory(&dir.path().join("train"), &mapping()).unwrap();
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.labels(), vec![0, 0, 0, 1, 1]);
        assert_eq!(dataset.class_counts(), vec![3, 2]);
        assert!(dataset.samples()[0].path.ends_with("fresh_apples/img_0.png"));
        assert!(dataset.require_every_class(&mapping()).is_ok());
    }

    #[test]
    fn test_undecodable_files_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        write_split(
            dir.path(),
            "test",
            &[("fresh_apples", 1, [200, 30, 30]), ("rotten_apples", 1, [90, 60, 20])],
        );
        std::fs::write(dir.path().join("test/fresh_apples/broken.png"), "not a png at all").unwrap();

        let dataset = FreshDataset::from_directory(&dir.path().join("test"), &mapping()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.class_counts(), vec![1, 1]);
        assert!(dataset
            .samples()
            .iter()
            .all(|s| !s.path.ends_with("broken.png")));
    }

    #[test]
    fn test_class_with_only_broken_files_counts_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", &[("fresh_apples", 2, [200, 30, 30])]);
        let rotten = dir.path().join("train/rotten_apples");
        std::fs::create_dir_all(&rotten).unwrap();
        std::fs::write(rotten.join("a.jpg"), [0u8, 1, 2, 3]).unwrap();

        let dataset = FreshDataset::from_directory(&dir.path().join("train"), &mapping()).unwrap();
        assert_eq!(dataset.class_counts(), vec![2, 0]);
        assert!(matches!(
            dataset.require_every_class(&mapping()),
            Err(FreshError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_class_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", &[("fresh_apples", 2, [200, 30, 30])]);
        std::fs::create_dir_all(dir.path().join("train/rotten_apples")).unwrap();

        let dataset = FreshDataset::from_directory(&dir.path().join("train"), &mapping()).unwrap();
        assert!(matches!(
            dataset.require_every_class(&mapping()),
            Err(FreshError::Configuration(_))
        ));
    }

    #[test]
    fn test_evaluation_batch_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write_split(
            dir.path(),
            "valid",
            &[("fresh_apples", 1, [255, 0, 0]), ("rotten_apples", 1, [0, 0, 255])],
        );
        let dataset = FreshDataset::from_directory(&dir.path().join("valid"), &mapping()).unwrap();
        let batcher = FreshBatcher::evaluation();
        assert!(!batcher.is_augmenting());

        let device = Default::default();
        let batch: FreshBatch<NdArray<f32>> = batcher.batch(dataset.samples().to_vec(), &device);
        assert_eq!(batch.images.dims(), [2, 3, 150, 150]);

        let targets: Vec<i64> = batch.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(targets, vec![0, 1]);

        // 1枚目は赤: R チャネル平均 1.0、B チャネル平均 0.0
        let means: Vec<f32> = batch
            .images
            .mean_dim(3)
            .mean_dim(2)
            .into_data()
            .to_vec()
            .unwrap();
        assert!((means[0] - 1.0).abs() < 1e-5);
        assert!(means[2].abs() < 1e-5);
        assert!((means[5] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_training_batch_values_in_range() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", &[("fresh_apples", 2, [120, 200, 40])]);
        let mapping = mapping();
        let dataset = FreshDataset::from_directory(&dir.path().join("train"), &mapping).unwrap();
        let batcher = FreshBatcher::training(Augmenter::new(AugmentationConfig::robust()), 9);

        let batch: FreshBatch<NdArray<f32>> =
            batcher.batch(dataset.samples().to_vec(), &Default::default());
        let values: Vec<f32> = batch.images.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
