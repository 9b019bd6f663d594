//! Seeded image augmentation.
//!
//! `augment` is a pure function of `(source, seed, record, variant)`: the
//! same inputs always produce the same pixels, so rerunning the augment
//! stage reproduces its images.
//!
//! Pipeline, each step gated by its own probability:
//! 1. photometric (p=0.5): brightness/contrast, or brightness + hue jitter
//! 2. shift crop (p=0.5): a 90% window at a random offset
//! 3. degrade (p=0.3): additive noise, or a light blur
//! 4. random resized crop (p=0.5): area 80–100%, aspect 0.9–1.1
//! 5. resize to `OUTPUT_SIZE`×`OUTPUT_SIZE`

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const OUTPUT_SIZE: u32 = 512;

const BRIGHTNESS_LIMIT: f32 = 0.2;
const CONTRAST_LIMIT: f32 = 0.2;
const HUE_LIMIT: f32 = 0.1;
const SHIFT_LIMIT: f32 = 0.1;
const NOISE_AMPLITUDE: (f32, f32) = (3.0, 5.5);
const BLUR_SIGMA: (f32, f32) = (0.5, 1.2);
const CROP_SCALE: (f32, f32) = (0.8, 1.0);
const CROP_RATIO: (f32, f32) = (0.9, 1.1);

/// Derive the RNG seed of one variant.
pub fn variant_seed(seed: u64, record: usize, variant: u32) -> u64 {
    let mut x = seed
        ^ (record as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ u64::from(variant).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    // splitmix64 finalizer
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

pub fn augment(source: &RgbImage, seed: u64, record: usize, variant: u32) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(variant_seed(seed, record, variant));
    let mut img = source.clone();

    if rng.gen_bool(0.5) {
        img = photometric(&img, &mut rng);
    }
    if rng.gen_bool(0.5) {
        img = shift_crop(&img, &mut rng);
    }
    if rng.gen_bool(0.3) {
        img = if rng.gen_bool(0.5) {
            add_noise(&img, &mut rng)
        } else {
            imageops::blur(&img, rng.gen_range(BLUR_SIGMA.0..=BLUR_SIGMA.1))
        };
    }
    if rng.gen_bool(0.5) {
        img = random_resized_crop(&img, &mut rng);
    }

    imageops::resize(&img, OUTPUT_SIZE, OUTPUT_SIZE, FilterType::Triangle)
}

fn photometric(img: &RgbImage, rng: &mut StdRng) -> RgbImage {
    let brightness = (rng.gen_range(-BRIGHTNESS_LIMIT..=BRIGHTNESS_LIMIT) * 255.0) as i32;
    if rng.gen_bool(0.5) {
        let contrast = rng.gen_range(-CONTRAST_LIMIT..=CONTRAST_LIMIT) * 100.0;
        imageops::contrast(&imageops::brighten(img, brightness), contrast)
    } else {
        let hue = (rng.gen_range(-HUE_LIMIT..=HUE_LIMIT) * 360.0) as i32;
        imageops::huerotate(&imageops::brighten(img, brightness), hue)
    }
}

fn shift_crop(img: &RgbImage, rng: &mut StdRng) -> RgbImage {
    let (w, h) = img.dimensions();
    let cw = ((w as f32) * (1.0 - SHIFT_LIMIT)).round().max(1.0) as u32;
    let ch = ((h as f32) * (1.0 - SHIFT_LIMIT)).round().max(1.0) as u32;
    let x = rng.gen_range(0..=w - cw);
    let y = rng.gen_range(0..=h - ch);
    imageops::crop_imm(img, x, y, cw, ch).to_image()
}

fn add_noise(img: &RgbImage, rng: &mut StdRng) -> RgbImage {
    let amplitude = rng.gen_range(NOISE_AMPLITUDE.0..=NOISE_AMPLITUDE.1);
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        let Rgb(channels) = *pixel;
        *pixel = Rgb(channels.map(|c| {
            let noise = rng.gen_range(-amplitude..=amplitude);
            (f32::from(c) + noise).round().clamp(0.0, 255.0) as u8
        }));
    }
    out
}

fn random_resized_crop(img: &RgbImage, rng: &mut StdRng) -> RgbImage {
    let (w, h) = img.dimensions();
    let area = (w as f32) * (h as f32) * rng.gen_range(CROP_SCALE.0..=CROP_SCALE.1);
    let ratio = rng.gen_range(CROP_RATIO.0..=CROP_RATIO.1);
    let cw = ((area * ratio).sqrt().round() as u32).clamp(1, w);
    let ch = ((area / ratio).sqrt().round() as u32).clamp(1, h);
    let x = rng.gen_range(0..=w - cw);
    let y = rng.gen_range(0..=h - ch);
    imageops::crop_imm(img, x, y, cw, ch).to_image()
}
