//! 機械学習モデルの共通定義
//!
//! 青果の鮮度・種類分類用のCNNモデルと損失関数を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{
        activation::{log_softmax, softmax},
        backend::Backend,
        Int, Tensor,
    },
};

use crate::error::FreshError;
use crate::ml::preprocess::IMAGE_SIZE;

/// 各畳み込みブロックの出力チャネル数
pub const CONV_CHANNELS: [usize; 4] = [32, 64, 128, 128];

/// 全結合中間層の幅
pub const HIDDEN_UNITS: usize = 512;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率（学習時のみ有効）
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 150)]
    pub image_size: usize,
}

impl ModelConfig {
    /// 推論・評価用のデフォルト設定
    pub fn for_classes(num_classes: usize) -> Self {
        Self::new(num_classes).with_image_size(IMAGE_SIZE)
    }

    /// 最後のプーリング後の特徴マップ一辺
    ///
    /// 各ブロック: Conv 3x3 (padding無し) で -2、MaxPool 2x2 (stride 2) で半分（切り捨て）。
    /// 150 → 148 → 74 → 72 → 36 → 34 → 17 → 15 → 7
    pub fn feature_map_size(&self) -> crate::error::Result<usize> {
        let mut size = self.image_size;
        for _ in CONV_CHANNELS {
            if size < 4 {
                return Err(FreshError::Configuration(format!(
                    "input size {} is too small for {} conv blocks",
                    self.image_size,
                    CONV_CHANNELS.len()
                )));
            }
            size = (size - 2) / 2;
        }
        if size == 0 {
            return Err(FreshError::Configuration(format!(
                "input size {} collapses the feature map to zero",
                self.image_size
            )));
        }
        Ok(size)
    }

    /// Flatten後の特徴次元（全結合層の入力幅）
    pub fn flattened_dim(&self) -> crate::error::Result<usize> {
        let size = self.feature_map_size()?;
        Ok(CONV_CHANNELS[CONV_CHANNELS.len() - 1] * size * size)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> crate::error::Result<FreshnessClassifier<B>> {
        if self.num_classes < 2 {
            return Err(FreshError::Configuration(format!(
                "at least 2 classes are required, got {}",
                self.num_classes
            )));
        }
        let d = self.flattened_dim()?;
        tracing::debug!(
            "[Model] 入力 {}x{}, 特徴マップ {}x{}, Flatten {} -> FC {} -> {}",
            self.image_size,
            self.image_size,
            self.feature_map_size()?,
            self.feature_map_size()?,
            d,
            HIDDEN_UNITS,
            self.num_classes
        );

        let [c1, c2, c3, c4] = CONV_CHANNELS;
        Ok(FreshnessClassifier {
            conv1: Conv2dConfig::new([3, c1], [3, 3]).init(device),
            conv2: Conv2dConfig::new([c1, c2], [3, 3]).init(device),
            conv3: Conv2dConfig::new([c2, c3], [3, 3]).init(device),
            conv4: Conv2dConfig::new([c3, c4], [3, 3]).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc1: LinearConfig::new(d, HIDDEN_UNITS).init(device),
            fc2: LinearConfig::new(HIDDEN_UNITS, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 鮮度分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 4 (32, 64, 128, 128 ch)
/// - Flatten
/// - Dropout 0.5（学習時のみ）
/// - FC: d -> 512 + ReLU
/// - FC: 512 -> num_classes
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct FreshnessClassifier<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    conv4: Conv2d<B>,
    pool: MaxPool2d,
    dropout: Dropout,
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> FreshnessClassifier<B> {
    fn block(&self, conv: &Conv2d<B>, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = conv.forward(x);
        let x = self.activation.forward(x);
        self.pool.forward(x)
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.block(&self.conv1, images);
        let x = self.block(&self.conv2, x);
        let x = self.block(&self.conv3, x);
        let x = self.block(&self.conv4, x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.dropout.forward(x);
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]（各行の和は1）
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 出力層の幅
    pub fn num_classes(&self) -> usize {
        self.fc2.weight.dims()[1]
    }
}

/// サンプル単位のクロスエントロピー [batch_size]
pub fn per_sample_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [batch_size, _] = logits.dims();
    log_softmax(logits, 1)
        .gather(1, targets.reshape([batch_size, 1]))
        .reshape([batch_size])
        .neg()
}

/// クラス重み付きクロスエントロピー（バッチ平均）
///
/// `class_weights` は [num_classes]。各サンプルの損失に正解クラスの重みを掛けます。
pub fn weighted_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    class_weights: Option<&Tensor<B, 1>>,
) -> Tensor<B, 1> {
    let losses = per_sample_cross_entropy(logits, targets.clone());
    match class_weights {
        Some(weights) => (losses * weights.clone().select(0, targets)).mean(),
        None => losses.mean(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_flattened_dim_for_150() {
        let config = ModelConfig::for_classes(6);
        assert_eq!(config.feature_map_size().unwrap(), 7);
        assert_eq!(config.flattened_dim().unwrap(), 128 * 7 * 7);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_config.json");
        let config = ModelConfig::for_classes(4).with_dropout(0.3);
        config.save(&path).unwrap();

        let loaded = ModelConfig::load(&path).unwrap();
        assert_eq!(loaded.num_classes, 4);
        assert_eq!(loaded.dropout, 0.3);
        assert_eq!(loaded.image_size, IMAGE_SIZE);
        assert_eq!(loaded.flattened_dim().unwrap(), config.flattened_dim().unwrap());
    }

    #[test]
    fn test_too_small_input_is_rejected() {
        let config = ModelConfig::new(2).with_image_size(20);
        assert!(matches!(
            config.feature_map_size(),
            Err(FreshError::Configuration(_))
        ));
    }

    #[test]
    fn test_single_class_is_rejected() {
        let config = ModelConfig::for_classes(1);
        assert!(config.init::<TestBackend>(&Default::default()).is_err());
    }

    #[test]
    fn test_forward_shapes_and_softmax() {
        let device = Default::default();
        let model = ModelConfig::for_classes(3).init::<TestBackend>(&device).unwrap();
        assert_eq!(model.num_classes(), 3);

        let images = Tensor::<TestBackend, 4>::random(
            [2, 3, 150, 150],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let probs = model.forward_probabilities(images);
        assert_eq!(probs.dims(), [2, 3]);

        let sums: Vec<f32> = probs.sum_dim(1).into_data().to_vec().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_parameter_count() {
        let model = ModelConfig::for_classes(2)
            .init::<TestBackend>(&Default::default())
            .unwrap();
        assert_eq!(model.num_params(), 3_453_634);
    }

    #[test]
    fn test_weighted_cross_entropy() {
        let device = Default::default();
        // 一様なロジット → 各サンプルの損失は ln(2)
        let logits = Tensor::<TestBackend, 2>::zeros([2, 2], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);

        let unweighted: f32 = weighted_cross_entropy(logits.clone(), targets.clone(), None)
            .into_scalar();
        assert!((unweighted - std::f32::consts::LN_2).abs() < 1e-5);

        let weights = Tensor::<TestBackend, 1>::from_floats([0.5, 3.0], &device);
        let weighted: f32 = weighted_cross_entropy(logits, targets, Some(&weights)).into_scalar();
        assert!((weighted - std::f32::consts::LN_2 * 1.75).abs() < 1e-5);
    }
}
