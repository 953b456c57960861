//! SimCLR augmentation pipeline on `image` buffers.
//!
//! Random resized crop → horizontal flip → color distortion (randomly applied
//! color jitter, then random grayscale). Geometry and grayscale go through
//! `image::imageops`; the multiplicative jitter ops work on the `f32` pixels
//! directly. All randomness comes from the `Rng` passed to
//! [`Augmenter::apply`], so a view is fully determined by its seed.

use burn::prelude::*;
use image::imageops::{self, FilterType};
use image::{Pixel, Rgb, Rgb32FImage};
use rand::seq::SliceRandom;
use rand::Rng;

/// Flatten an RGB image to CHW `f32` values.
pub fn to_chw(image: &Rgb32FImage) -> Vec<f32> {
    let n = (image.width() * image.height()) as usize;
    let mut chw = vec![0.0; 3 * n];
    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            chw[c * n + i] = pixel[c];
        }
    }
    chw
}

/// Augmentation hyperparameters. Defaults follow SimCLR's CIFAR-10 recipe.
#[derive(Config, Debug)]
pub struct AugmentConfig {
    /// Output height and width.
    #[config(default = 32)]
    pub crop_size: usize,
    /// Lower bound of the crop area as a fraction of the image area.
    #[config(default = 0.08)]
    pub crop_scale_min: f64,
    #[config(default = 1.0)]
    pub crop_scale_max: f64,
    /// Lower bound of the crop aspect ratio (width / height).
    #[config(default = 0.75)]
    pub crop_ratio_min: f64,
    #[config(default = 1.3333333333333333)]
    pub crop_ratio_max: f64,
    #[config(default = 0.5)]
    pub flip_prob: f64,
    /// Color distortion strength `s`: jitter of (0.8s, 0.8s, 0.8s, 0.2s).
    #[config(default = 0.5)]
    pub color_strength: f64,
    /// Probability of applying color jitter.
    #[config(default = 0.8)]
    pub jitter_prob: f64,
    #[config(default = 0.2)]
    pub grayscale_prob: f64,
}

impl AugmentConfig {
    /// A pipeline that returns its input unchanged (for a `crop_size` equal to
    /// the input size).
    pub fn identity() -> Self {
        Self::new()
            .with_crop_scale_min(1.0)
            .with_crop_ratio_min(1.0)
            .with_crop_ratio_max(1.0)
            .with_flip_prob(0.0)
            .with_jitter_prob(0.0)
            .with_grayscale_prob(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CropRect {
    top: usize,
    left: usize,
    height: usize,
    width: usize,
}

/// Applies the augmentation pipeline.
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentConfig,
}

impl Augmenter {
    pub fn new(config: AugmentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentConfig {
        &self.config
    }

    /// Produce one augmented view, `crop_size` pixels square.
    pub fn apply(&self, image: &Rgb32FImage, rng: &mut impl Rng) -> Rgb32FImage {
        let cfg = &self.config;
        let size = cfg.crop_size as u32;

        let rect = self.crop_params(image.height() as usize, image.width() as usize, rng);
        let patch = imageops::crop_imm(
            image,
            rect.left as u32,
            rect.top as u32,
            rect.width as u32,
            rect.height as u32,
        )
        .to_image();
        let mut out = imageops::resize(&patch, size, size, FilterType::Triangle);
        clamp_unit(&mut out);

        if rng.gen::<f64>() < cfg.flip_prob {
            imageops::flip_horizontal_in_place(&mut out);
        }
        if rng.gen::<f64>() < cfg.jitter_prob {
            self.color_jitter(&mut out, rng);
        }
        if rng.gen::<f64>() < cfg.grayscale_prob {
            out = grayscale(&out);
        }
        out
    }

    fn crop_params(&self, height: usize, width: usize, rng: &mut impl Rng) -> CropRect {
        let cfg = &self.config;
        let area = (height * width) as f64;
        let log_ratio = (cfg.crop_ratio_min.ln(), cfg.crop_ratio_max.ln());

        for _ in 0..10 {
            let target_area = area * rng.gen_range(cfg.crop_scale_min..=cfg.crop_scale_max);
            let aspect = rng.gen_range(log_ratio.0..=log_ratio.1).exp();
            let w = (target_area * aspect).sqrt().round() as usize;
            let h = (target_area / aspect).sqrt().round() as usize;
            if w > 0 && w <= width && h > 0 && h <= height {
                let top = rng.gen_range(0..=height - h);
                let left = rng.gen_range(0..=width - w);
                return CropRect {
                    top,
                    left,
                    height: h,
                    width: w,
                };
            }
        }

        // Fallback: central crop with the ratio clamped into range.
        let in_ratio = width as f64 / height as f64;
        let (w, h) = if in_ratio < cfg.crop_ratio_min {
            (width, ((width as f64 / cfg.crop_ratio_min).round() as usize).clamp(1, height))
        } else if in_ratio > cfg.crop_ratio_max {
            (((height as f64 * cfg.crop_ratio_max).round() as usize).clamp(1, width), height)
        } else {
            (width, height)
        };
        CropRect {
            top: (height - h) / 2,
            left: (width - w) / 2,
            height: h,
            width: w,
        }
    }

    fn color_jitter(&self, image: &mut Rgb32FImage, rng: &mut impl Rng) {
        let s = self.config.color_strength;
        let (b, c, sat, hue) = (0.8 * s, 0.8 * s, 0.8 * s, 0.2 * s);

        let mut order = [0_usize, 1, 2, 3];
        order.shuffle(rng);
        for op in order {
            match op {
                0 if b > 0.0 => adjust_brightness(image, jitter_factor(rng, b)),
                1 if c > 0.0 => adjust_contrast(image, jitter_factor(rng, c)),
                2 if sat > 0.0 => adjust_saturation(image, jitter_factor(rng, sat)),
                3 if hue > 0.0 => adjust_hue(image, rng.gen_range(-hue..=hue)),
                _ => {}
            }
        }
    }
}

/// Multiplicative factor drawn from `[max(0, 1 - amount), 1 + amount]`.
fn jitter_factor(rng: &mut impl Rng, amount: f64) -> f64 {
    rng.gen_range((1.0 - amount).max(0.0)..=1.0 + amount)
}

fn clamp_unit(image: &mut Rgb32FImage) {
    for v in image.iter_mut() {
        *v = v.clamp(0.0, 1.0);
    }
}

/// Luma replicated into all three channels.
fn grayscale(image: &Rgb32FImage) -> Rgb32FImage {
    let luma = imageops::grayscale(image);
    Rgb32FImage::from_fn(image.width(), image.height(), |x, y| {
        let v = luma.get_pixel(x, y)[0];
        Rgb([v, v, v])
    })
}

fn adjust_brightness(image: &mut Rgb32FImage, factor: f64) {
    let f = factor as f32;
    for v in image.iter_mut() {
        *v = (*v * f).clamp(0.0, 1.0);
    }
}

fn adjust_contrast(image: &mut Rgb32FImage, factor: f64) {
    let luma = imageops::grayscale(&*image);
    let mean = luma.iter().sum::<f32>() / luma.len().max(1) as f32;
    let f = factor as f32;
    for v in image.iter_mut() {
        *v = (f * *v + (1.0 - f) * mean).clamp(0.0, 1.0);
    }
}

fn adjust_saturation(image: &mut Rgb32FImage, factor: f64) {
    let f = factor as f32;
    for pixel in image.pixels_mut() {
        let gray = pixel.to_luma()[0];
        pixel.apply(|v| (f * v + (1.0 - f) * gray).clamp(0.0, 1.0));
    }
}

fn adjust_hue(image: &mut Rgb32FImage, shift: f64) {
    for pixel in image.pixels_mut() {
        let [r, g, b] = pixel.0;
        let (h, s, v) = rgb_to_hsv(r, g, b);
        let (r, g, b) = hsv_to_rgb((h + shift as f32).rem_euclid(1.0), s, v);
        *pixel = Rgb([r, g, b]);
    }
}

fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let s = if max > 0.0 { delta / max } else { 0.0 };
    if delta <= f32::EPSILON {
        return (0.0, s, max);
    }
    let h = if max == r {
        ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    };
    (h / 6.0, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let h6 = (h * 6.0).rem_euclid(6.0);
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u32 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}
