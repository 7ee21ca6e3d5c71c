//! 画像前処理パイプライン
//!
//! 学習用（32x32、ランダム拡張あり）と評価用（16x16、最近傍補間）の
//! 2種類の固定パイプラインを提供します。出力は [1, size, size] の
//! グレースケールを平均0.5・標準偏差0.5で正規化した値です。

use std::sync::atomic::{AtomicU64, Ordering};

use image::{imageops::FilterType, GrayImage, Luma, Rgb, RgbImage, RgbaImage};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

/// 学習時の入力サイズ
pub const TRAIN_IMAGE_SIZE: usize = 32;

/// 評価時の入力サイズ
pub const EVAL_IMAGE_SIZE: usize = 16;

const NORMALIZE_MEAN: f32 = 0.5;
const NORMALIZE_STD: f32 = 0.5;

/// 透過部分を黒で塗りつぶす
///
/// 同じサイズの不透明な黒いキャンバスに、アルファチャンネルをマスクとして
/// 元画像を貼り付けます。不透明な画像はそのままの値になります。
pub fn composite_on_black(image: &RgbaImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut canvas = RgbImage::new(width, height);

    for (x, y, pixel) in image.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let blend = |c: u8| ((c as u32 * a as u32 + 127) / 255) as u8;
        canvas.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }

    canvas
}

/// ランダム拡張の設定
///
/// 乱数はサンプル番号とエポック番号から毎回導出するため、並列に前処理しても
/// 同じシードなら同じ拡張結果になります。
struct Augmentation {
    seed: u64,
    epoch: AtomicU64,
    jitter: f32,
    invert_probability: f64,
    translate: f32,
}

/// タイル画像 → 正規化済みテンソル（平坦化）
pub struct TilePipeline {
    size: usize,
    filter: FilterType,
    augmentation: Option<Augmentation>,
}

impl TilePipeline {
    /// 学習用パイプライン
    ///
    /// リサイズ(32x32) → 色調ゆらぎ → ランダム反転 → ランダム平行移動
    /// → グレースケール → 正規化
    pub fn training(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| StdRng::from_entropy().gen());

        Self {
            size: TRAIN_IMAGE_SIZE,
            filter: FilterType::Triangle,
            augmentation: Some(Augmentation {
                seed,
                epoch: AtomicU64::new(0),
                jitter: 0.125,
                invert_probability: 0.5,
                translate: 0.125,
            }),
        }
    }

    /// 評価用パイプライン（16x16、最近傍補間）
    pub fn evaluation() -> Self {
        Self::evaluation_with_size(EVAL_IMAGE_SIZE)
    }

    /// 評価用パイプライン（サイズ指定版）
    pub fn evaluation_with_size(size: usize) -> Self {
        Self {
            size,
            filter: FilterType::Nearest,
            augmentation: None,
        }
    }

    /// 出力画像の一辺のサイズ
    pub fn size(&self) -> usize {
        self.size
    }

    /// 出力テンソルの形状 [channels, height, width]
    pub fn output_shape(&self) -> [usize; 3] {
        [1, self.size, self.size]
    }

    /// 拡張の乱数を次のエポックのものに切り替える
    pub fn advance_epoch(&self) {
        if let Some(augmentation) = &self.augmentation {
            augmentation.epoch.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 合成済みRGB画像に前処理を適用
    ///
    /// `sample` はデータセット内のインデックスで、拡張の乱数の導出に使います。
    pub fn apply(&self, image: &RgbImage, sample: usize) -> Vec<f32> {
        let side = self.size as u32;
        let mut image = image::imageops::resize(image, side, side, self.filter);

        if let Some(augmentation) = &self.augmentation {
            let mut rng = augmentation.rng_for(sample);
            color_jitter(&mut image, augmentation.jitter, &mut rng);
            if rng.gen_bool(augmentation.invert_probability) {
                image::imageops::invert(&mut image);
            }
            image = random_translate(&image, augmentation.translate, &mut rng);
        }

        to_normalized_tensor(&to_grayscale(&image))
    }
}

impl Augmentation {
    fn rng_for(&self, sample: usize) -> StdRng {
        let epoch = self.epoch.load(Ordering::Relaxed);
        StdRng::seed_from_u64(self.seed ^ epoch.rotate_left(32) ^ sample as u64)
    }
}

/// ITU-R 601-2 の輝度変換
pub fn to_grayscale(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        Luma([luma(r, g, b)])
    })
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114 + 500) / 1000) as u8
}

/// [0, 255] → [0, 1] → (x - mean) / std
fn to_normalized_tensor(image: &GrayImage) -> Vec<f32> {
    image
        .pixels()
        .map(|p| (p.0[0] as f32 / 255.0 - NORMALIZE_MEAN) / NORMALIZE_STD)
        .collect()
}

/// 明るさ・コントラスト・彩度・色相をランダムな順序で揺らす
fn color_jitter(image: &mut RgbImage, amount: f32, rng: &mut impl Rng) {
    let mut order = [0usize, 1, 2, 3];
    order.shuffle(rng);

    for op in order {
        match op {
            0 => {
                let factor = rng.gen_range(1.0 - amount..=1.0 + amount);
                map_channels(image, |c| c * factor);
            }
            1 => {
                let factor = rng.gen_range(1.0 - amount..=1.0 + amount);
                let gray = to_grayscale(image);
                let count = (gray.width() * gray.height()).max(1) as f32;
                let mean = gray.pixels().map(|p| p.0[0] as f32).sum::<f32>() / count;
                map_channels(image, |c| mean + factor * (c - mean));
            }
            2 => {
                let factor = rng.gen_range(1.0 - amount..=1.0 + amount);
                for pixel in image.pixels_mut() {
                    let [r, g, b] = pixel.0;
                    let gray = luma(r, g, b) as f32;
                    pixel.0 = [r, g, b].map(|c| clamp_u8(gray + factor * (c as f32 - gray)));
                }
            }
            _ => {
                let shift = rng.gen_range(-amount..=amount);
                for pixel in image.pixels_mut() {
                    let [h, s, v] = rgb_to_hsv(pixel.0);
                    pixel.0 = hsv_to_rgb([(h + shift).rem_euclid(1.0), s, v]);
                }
            }
        }
    }
}

fn map_channels(image: &mut RgbImage, f: impl Fn(f32) -> f32) {
    for pixel in image.pixels_mut() {
        pixel.0 = pixel.0.map(|c| clamp_u8(f(c as f32)));
    }
}

fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn rgb_to_hsv([r, g, b]: [u8; 3]) -> [f32; 3] {
    let (r, g, b) = (r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };

    [hue, saturation, max]
}

fn hsv_to_rgb([h, s, v]: [f32; 3]) -> [u8; 3] {
    let sector = h * 6.0;
    let i = sector.floor();
    let f = sector - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    let (r, g, b) = match i as i32 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };

    [r, g, b].map(|c| clamp_u8(c * 255.0))
}

/// 幅・高さの `fraction` 倍までの整数ピクセル分だけ平行移動（はみ出しは黒）
fn random_translate(image: &RgbImage, fraction: f32, rng: &mut impl Rng) -> RgbImage {
    let (width, height) = image.dimensions();
    let max_dx = fraction * width as f32;
    let max_dy = fraction * height as f32;
    let dx = rng.gen_range(-max_dx..=max_dx).round() as i64;
    let dy = rng.gen_range(-max_dy..=max_dy).round() as i64;

    RgbImage::from_fn(width, height, |x, y| {
        let sx = x as i64 - dx;
        let sy = y as i64 - dy;
        if sx >= 0 && sy >= 0 && sx < width as i64 && sy < height as i64 {
            *image.get_pixel(sx as u32, sy as u32)
        } else {
            Rgb([0, 0, 0])
        }
    })
}
