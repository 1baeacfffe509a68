//! 学習用データ拡張
//!
//! 学習画像にのみ適用する確率的な変換です。検証・テスト画像には決して適用しません。
//! 幾何変換（回転・平行移動・せん断・ズーム）は1つのアフィン行列にまとめ、
//! 出力画素から入力座標を逆算して双線形補間します。
//! 画像外を参照した画素は最も近い端の画素で埋めます。

use image::{Rgb, Rgb32FImage, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// 拡張の強さのプリセット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AugmentationPreset {
    /// 幾何変換と左右反転のみ
    Standard,
    /// Standard + 明るさ・チャネルシフト
    #[default]
    Robust,
}

/// データ拡張の設定
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationConfig {
    /// 回転角の範囲（度、±）
    pub rotation_range: f32,
    /// 横方向シフト（幅に対する割合、±）
    pub width_shift_range: f32,
    /// 縦方向シフト（高さに対する割合、±）
    pub height_shift_range: f32,
    /// せん断係数（±）
    pub shear_range: f32,
    /// ズーム倍率の範囲
    pub zoom_range: (f32, f32),
    pub horizontal_flip: bool,
    /// 明るさ倍率の範囲（None で無効）
    pub brightness_range: Option<(f32, f32)>,
    /// 全チャネル共通の加算シフト（画素値、±）
    pub channel_shift_range: f32,
}

impl AugmentationConfig {
    pub fn standard() -> Self {
        Self {
            rotation_range: 30.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: (0.8, 1.2),
            horizontal_flip: true,
            brightness_range: None,
            channel_shift_range: 0.0,
        }
    }

    pub fn robust() -> Self {
        Self {
            brightness_range: Some((0.6, 1.4)),
            channel_shift_range: 30.0,
            ..Self::standard()
        }
    }

    /// 何もしない設定
    pub fn none() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: (1.0, 1.0),
            horizontal_flip: false,
            brightness_range: None,
            channel_shift_range: 0.0,
        }
    }
}

impl From<AugmentationPreset> for AugmentationConfig {
    fn from(preset: AugmentationPreset) -> Self {
        match preset {
            AugmentationPreset::Standard => Self::standard(),
            AugmentationPreset::Robust => Self::robust(),
        }
    }
}

/// 1枚分の乱数で決まった変換パラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct TransformParams {
    pub rotation_deg: f32,
    /// ピクセル単位
    pub shift_x: f32,
    pub shift_y: f32,
    pub shear: f32,
    pub zoom_x: f32,
    pub zoom_y: f32,
    pub flip: bool,
    pub brightness: f32,
    /// 3チャネルに同じ値を加算
    pub channel_shift: f32,
}

impl TransformParams {
    pub fn identity() -> Self {
        Self {
            rotation_deg: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            shear: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip: false,
            brightness: 1.0,
            channel_shift: 0.0,
        }
    }
}

fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

fn within<R: Rng>(rng: &mut R, (lo, hi): (f32, f32)) -> f32 {
    if hi > lo {
        rng.gen_range(lo..=hi)
    } else {
        lo
    }
}

/// データ拡張パイプライン
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// 画像サイズに合わせて変換パラメータを抽選
    pub fn sample_params<R: Rng>(&self, rng: &mut R, width: u32, height: u32) -> TransformParams {
        let c = &self.config;
        TransformParams {
            rotation_deg: symmetric(rng, c.rotation_range),
            shift_x: symmetric(rng, c.width_shift_range) * width as f32,
            shift_y: symmetric(rng, c.height_shift_range) * height as f32,
            shear: symmetric(rng, c.shear_range),
            zoom_x: within(rng, c.zoom_range),
            zoom_y: within(rng, c.zoom_range),
            flip: c.horizontal_flip && rng.gen_bool(0.5),
            brightness: c.brightness_range.map(|r| within(rng, r)).unwrap_or(1.0),
            channel_shift: symmetric(rng, c.channel_shift_range),
        }
    }

    /// ランダムな拡張を適用
    pub fn augment<R: Rng>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        let params = self.sample_params(rng, image.width(), image.height());
        apply_transform(image, &params)
    }
}

/// 変換パラメータを画像に適用
///
/// チャネルシフトは変形後の画像全体の最小値・最大値の範囲に収め、その後に明るさを掛けます。
pub fn apply_transform(image: &RgbImage, params: &TransformParams) -> RgbImage {
    let (width, height) = image.dimensions();
    let source = to_float_image(image);
    let mut warped = warp_affine(&source, params);

    if params.flip {
        warped = image::imageops::flip_horizontal(&warped);
    }

    let (lo, hi) = value_range(&warped);
    RgbImage::from_fn(width, height, |x, y| {
        let p = warped.get_pixel(x, y);
        let mut rgb = [0u8; 3];
        for c in 0..3 {
            let shifted = if params.channel_shift != 0.0 {
                (p[c] + params.channel_shift).clamp(lo, hi)
            } else {
                p[c]
            };
            rgb[c] = (shifted * params.brightness).round().clamp(0.0, 255.0) as u8;
        }
        Rgb(rgb)
    })
}

/// 全チャネルを通した最小値と最大値
fn value_range(image: &Rgb32FImage) -> (f32, f32) {
    image
        .pixels()
        .flat_map(|p| p.0)
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        })
}

fn to_float_image(image: &RgbImage) -> Rgb32FImage {
    Rgb32FImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        Rgb([p[0] as f32, p[1] as f32, p[2] as f32])
    })
}

/// 出力座標 → 入力座標のアフィン写像（画像中心基準）
///
/// src = R(θ) · S(shear) · Z(zx, zy) · (dst - center) + center - shift
fn inverse_map(params: &TransformParams, cx: f32, cy: f32) -> impl Fn(f32, f32) -> (f32, f32) {
    let theta = params.rotation_deg.to_radians();
    let (sin, cos) = theta.sin_cos();
    let (zx, zy, sh) = (params.zoom_x, params.zoom_y, params.shear);
    // R · S · Z
    let a = cos * zx;
    let b = (cos * sh - sin) * zy;
    let c = sin * zx;
    let d = (sin * sh + cos) * zy;
    let (tx, ty) = (params.shift_x, params.shift_y);
    move |x, y| {
        let u = x - cx;
        let v = y - cy;
        (a * u + b * v + cx - tx, c * u + d * v + cy - ty)
    }
}

fn warp_affine(source: &Rgb32FImage, params: &TransformParams) -> Rgb32FImage {
    let (width, height) = source.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let map = inverse_map(params, cx, cy);

    Rgb32FImage::from_fn(width, height, |x, y| {
        let (sx, sy) = map(x as f32, y as f32);
        sample_bilinear_clamped(source, sx, sy)
    })
}

/// 範囲外座標は端にクランプしてから双線形補間
fn sample_bilinear_clamped(source: &Rgb32FImage, x: f32, y: f32) -> Rgb<f32> {
    let max_x = source.width() as f32 - 1.0;
    let max_y = source.height() as f32 - 1.0;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let x1 = (x0 + 1.0).min(max_x);
    let y1 = (y0 + 1.0).min(max_y);

    let p00 = source.get_pixel(x0 as u32, y0 as u32);
    let p10 = source.get_pixel(x1 as u32, y0 as u32);
    let p01 = source.get_pixel(x0 as u32, y1 as u32);
    let p11 = source.get_pixel(x1 as u32, y1 as u32);

    let mut out = [0.0f32; 3];
    for c in 0..3 {
        let top = p00[c] * (1.0 - fx) + p10[c] * fx;
        let bottom = p01[c] * (1.0 - fx) + p11[c] * fx;
        out[c] = top * (1.0 - fy) + bottom * fy;
    }
    Rgb(out)
}
