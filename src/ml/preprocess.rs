//! 画像の前処理
//!
//! 学習・検証・評価・推論のすべてがこのモジュールを通ります。
//! 手順（順序固定）:
//! 1. RGB以外（グレースケール、パレット、アルファ付き）をRGBに変換
//! 2. アスペクト比を無視して `IMAGE_SIZE` x `IMAGE_SIZE` にリサイズ
//! 3. 数値配列に変換し、バッチ次元を付けて 1/255 倍

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use image::{imageops::FilterType, DynamicImage, RgbImage};

use crate::error::{FreshError, Result};

/// モデル入力サイズ（正方形）
pub const IMAGE_SIZE: usize = 150;

/// チャネル数（RGB）
pub const CHANNELS: usize = 3;

/// リサイズに使うフィルタ。学習時と推論時で必ず同じものを使う
pub const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// 前処理済みの画像テンソル
///
/// 形状 (1, IMAGE_SIZE, IMAGE_SIZE, 3)、値は [0, 1]、HWC順で平坦化。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
}

impl ImageTensor {
    pub const SHAPE: [usize; 4] = [1, IMAGE_SIZE, IMAGE_SIZE, CHANNELS];

    pub fn shape(&self) -> [usize; 4] {
        Self::SHAPE
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// NCHW形式の4次元テンソルに変換（Conv2dの入力形式）
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        hwc_batch_to_tensor(&self.data, 1, IMAGE_SIZE, device)
    }
}

/// HWC順で連結されたバッチを [batch, 3, size, size] のテンソルにする
pub fn hwc_batch_to_tensor<B: Backend>(
    data: &[f32],
    batch_size: usize,
    image_size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    Tensor::<B, 1>::from_floats(data, device)
        .reshape([batch_size, image_size, image_size, CHANNELS])
        .permute([0, 3, 1, 2])
}

/// 画像バイト列をデコード
///
/// 解釈できないバイト列は `FreshError::Decode`（クライアント入力エラー）になります。
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(FreshError::Decode("empty image data".to_string()));
    }
    let image = image::load_from_memory(bytes).map_err(|e| FreshError::Decode(e.to_string()))?;
    if image.width() == 0 || image.height() == 0 {
        return Err(FreshError::Decode("image has no pixels".to_string()));
    }
    Ok(image)
}

/// 画像ファイルを読み込む（学習・評価用）
pub fn load_image_file(path: &Path) -> Result<DynamicImage> {
    let bytes = std::fs::read(path)?;
    decode_image(&bytes)
}

/// 手順1〜2: RGB化とリサイズ
pub fn resize_rgb(image: &DynamicImage) -> RgbImage {
    let rgb = image.to_rgb8();
    image::imageops::resize(&rgb, IMAGE_SIZE as u32, IMAGE_SIZE as u32, RESIZE_FILTER)
}

/// RGB画像をHWC順の [0, 1] 値に変換
pub fn rgb_to_unit_floats(image: &RgbImage) -> Vec<f32> {
    image.as_raw().iter().map(|&v| v as f32 / 255.0).collect()
}

/// 手順1〜3をまとめて実行
pub fn prepare_image(image: &DynamicImage) -> ImageTensor {
    let resized = resize_rgb(image);
    ImageTensor {
        data: rgb_to_unit_floats(&resized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{GrayImage, ImageBuffer, Luma, Rgb, Rgba, RgbaImage};

    fn encode_png(image: &DynamicImage) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        image.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn assert_valid(tensor: &ImageTensor) {
        assert_eq!(tensor.shape(), [1, 150, 150, 3]);
        assert_eq!(tensor.as_slice().len(), 150 * 150 * 3);
        assert!(tensor.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_prepare_any_size_and_mode() {
        let inputs = vec![
            DynamicImage::ImageRgb8(ImageBuffer::from_pixel(640, 480, Rgb([255u8, 10, 0]))),
            DynamicImage::ImageLuma8(GrayImage::from_pixel(20, 300, Luma([128u8]))),
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(33, 33, Rgba([0u8, 255, 0, 0]))),
            DynamicImage::ImageRgb8(ImageBuffer::from_pixel(1, 1, Rgb([7u8, 8, 9]))),
        ];
        for input in &inputs {
            assert_valid(&prepare_image(input));
        }
    }

    #[test]
    fn test_alpha_is_dropped() {
        let input = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([255u8, 0, 0, 0])));
        let tensor = prepare_image(&input);
        assert_eq!(&tensor.as_slice()[..3], &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_decode_roundtrip_png() {
        let input = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 5, Luma([255u8])));
        let decoded = decode_image(&encode_png(&input)).unwrap();
        let tensor = prepare_image(&decoded);
        assert_valid(&tensor);
        assert!(tensor.as_slice().iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        assert!(matches!(
            decode_image(b"definitely not an image"),
            Err(FreshError::Decode(_))
        ));
        assert!(matches!(decode_image(&[]), Err(FreshError::Decode(_))));
    }

    #[test]
    fn test_to_tensor_is_nchw() {
        let input = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(8, 8, Rgb([255u8, 0, 51])));
        let tensor = prepare_image(&input).to_tensor::<NdArray<f32>>(&Default::default());
        assert_eq!(tensor.dims(), [1, 3, 150, 150]);

        let channels: Vec<f32> = tensor
            .mean_dim(3)
            .mean_dim(2)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!((channels[0] - 1.0).abs() < 1e-5);
        assert!(channels[1].abs() < 1e-5);
        assert!((channels[2] - 0.2).abs() < 1e-5);
    }
}
