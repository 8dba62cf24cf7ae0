//! 学習時のデータ拡張
//!
//! 画素値のスケーリング、ランダムズーム、ランダム左右反転を行います。
//! テスト時はスケーリングのみ（乱数を使わない）です。

use image::GrayImage;
use rand::Rng;

use crate::model::config::AugmentationSettings;

#[derive(Debug, Clone)]
pub struct Augmenter {
    rescale: f32,
    zoom_range: f32,
    horizontal_flip: bool,
}

impl Augmenter {
    /// 学習用（設定どおりのランダム変換を行う）
    pub fn from_settings(settings: &AugmentationSettings) -> Self {
        Self {
            rescale: settings.rescale,
            zoom_range: settings.zoom_range.max(0.0),
            horizontal_flip: settings.horizontal_flip,
        }
    }

    /// テスト用（スケーリングのみ）
    pub fn rescale_only(rescale: f32) -> Self {
        Self {
            rescale,
            zoom_range: 0.0,
            horizontal_flip: false,
        }
    }

    /// 乱数を消費する変換を含むか
    pub fn is_random(&self) -> bool {
        self.zoom_range > 0.0 || self.horizontal_flip
    }

    /// 1枚の画像を変換し、行優先 (H, W) の画素値を返す
    pub fn apply<R: Rng + ?Sized>(&self, image: &GrayImage, rng: &mut R) -> Vec<f32> {
        let flipped;
        let source = if self.horizontal_flip && rng.gen_bool(0.5) {
            flipped = image::imageops::flip_horizontal(image);
            &flipped
        } else {
            image
        };

        let mut pixels = if self.zoom_range > 0.0 {
            let low = 1.0 - self.zoom_range;
            let high = 1.0 + self.zoom_range;
            let zx = rng.gen_range(low..=high);
            let zy = rng.gen_range(low..=high);
            zoom(source, zx, zy)
        } else {
            source.pixels().map(|p| p[0] as f32).collect()
        };

        for value in pixels.iter_mut() {
            *value *= self.rescale;
        }
        pixels
    }
}

/// 中心を基準にズームする
///
/// 出力座標 `p` は入力座標 `c + z * (p - c)` から双線形補間で取得します。
/// `z < 1` で拡大、`z > 1` で縮小になり、範囲外は最も近い端の画素で埋めます。
pub fn zoom(image: &GrayImage, zx: f32, zy: f32) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    let mut out = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        let sy = cy + zy * (y as f32 - cy);
        for x in 0..width {
            let sx = cx + zx * (x as f32 - cx);
            out.push(sample_bilinear(image, sx, sy));
        }
    }
    out
}

fn sample_bilinear(image: &GrayImage, x: f32, y: f32) -> f32 {
    let (width, height) = image.dimensions();
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p = |px: u32, py: u32| image.get_pixel(px, py)[0] as f32;
    let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
    let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
    top * (1.0 - fy) + bottom * fy
}
