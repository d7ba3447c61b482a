//! Joint image/mask augmentation for fundus images.
//!
//! Available methods:
//! 1. Flip - horizontal, vertical or both
//! 2. Shift-scale-rotate - random affine warp about the image centre
//! 3. Color - brightness/contrast or gamma
//! 4. Detail - sharpen, blur or down-then-up scaling
//! 5. Dropout - rectangular holes, black in the image and background in the mask
//!
//! Geometric methods move the mask with the image (nearest-neighbour for the
//! mask so class indices stay intact); photometric methods leave it alone.

use std::{
    ops::RangeInclusive,
    sync::atomic::{AtomicU64, Ordering},
};

use burn::config::Config;
use image::{imageops, imageops::FilterType, GrayImage, Luma, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Available data augmentation methods.
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum AugmentationMethod {
    /// Flip horizontally, vertically or both.
    Flip,
    /// Random shift, scale and rotation.
    ShiftScaleRotate,
    /// Brightness/contrast or gamma change.
    Color,
    /// Sharpen, blur or downscale.
    Detail,
    /// Coarse rectangular dropout.
    Dropout,
}

impl AugmentationMethod {
    /// Every method, in application order.
    pub fn all() -> Vec<Self> {
        vec![
            Self::Flip,
            Self::ShiftScaleRotate,
            Self::Color,
            Self::Detail,
            Self::Dropout,
        ]
    }
}

/// Data augmentation parameters.
#[derive(Config, Debug)]
pub struct AugmentationConfig {
    /// Enabled methods, applied in order.
    #[config(default = "AugmentationMethod::all()")]
    pub methods: Vec<AugmentationMethod>,
    /// Probability of applying each of flip, shift-scale-rotate, color and detail.
    #[config(default = 0.5)]
    pub probability: f64,
    /// Maximum shift as a fraction of the image side.
    #[config(default = 0.2)]
    pub shift_limit: f64,
    /// Maximum relative zoom in or out.
    #[config(default = 0.1)]
    pub scale_limit: f64,
    /// Maximum rotation in degrees.
    #[config(default = 90.0)]
    pub rotate_limit: f64,
    /// Maximum brightness offset as a fraction of full scale.
    #[config(default = 0.2)]
    pub brightness_limit: f64,
    /// Maximum relative contrast change.
    #[config(default = 0.2)]
    pub contrast_limit: f64,
    /// Range of the gamma exponent.
    #[config(default = "(0.8, 1.2)")]
    pub gamma_range: (f64, f64),
    /// Maximum number of dropout holes.
    #[config(default = 3)]
    pub dropout_holes: u32,
    /// Minimum hole side in pixels.
    #[config(default = 32)]
    pub dropout_min: u32,
    /// Maximum hole side in pixels.
    #[config(default = 128)]
    pub dropout_max: u32,
    /// Probability of applying dropout.
    #[config(default = 0.2)]
    pub dropout_prob: f64,
    /// Mask value written into dropout holes; `None` leaves the mask intact.
    #[config(default = "Some(0)")]
    pub dropout_mask_fill: Option<u8>,
}

/// Applies the configured augmentations.
///
/// Each call draws from its own random stream derived from the seed and a
/// call counter, so concurrent dataloader workers never share RNG state.
pub struct ImageAugmentor {
    config: AugmentationConfig,
    seed: u64,
    calls: AtomicU64,
}

impl ImageAugmentor {
    /// Creates an augmentor whose random streams derive from `seed`.
    pub fn new(config: AugmentationConfig, seed: u64) -> Self {
        Self {
            config,
            seed,
            calls: AtomicU64::new(0),
        }
    }

    pub const fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    fn next_rng(&self) -> StdRng {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        StdRng::seed_from_u64(self.seed ^ call.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// Augments an image and its mask with a fresh random stream.
    pub fn augment(&self, image: RgbImage, mask: GrayImage) -> (RgbImage, GrayImage) {
        let mut rng = self.next_rng();
        self.augment_with(image, mask, &mut rng)
    }

    /// Augments an image and its mask drawing from `rng`.
    pub fn augment_with<R: Rng>(
        &self,
        mut image: RgbImage,
        mut mask: GrayImage,
        rng: &mut R,
    ) -> (RgbImage, GrayImage) {
        for method in &self.config.methods {
            (image, mask) = match method {
                AugmentationMethod::Flip => self.apply_flip(image, mask, rng),
                AugmentationMethod::ShiftScaleRotate => {
                    self.apply_shift_scale_rotate(image, mask, rng)
                }
                AugmentationMethod::Color => (self.apply_color(image, rng), mask),
                AugmentationMethod::Detail => (self.apply_detail(image, rng), mask),
                AugmentationMethod::Dropout => self.apply_dropout(image, mask, rng),
            };
        }
        (image, mask)
    }

    fn apply_flip<R: Rng>(
        &self,
        image: RgbImage,
        mask: GrayImage,
        rng: &mut R,
    ) -> (RgbImage, GrayImage) {
        if !rng.random_bool(self.config.probability) {
            return (image, mask);
        }
        match rng.random_range(0..3) {
            0 => (
                imageops::flip_horizontal(&image),
                imageops::flip_horizontal(&mask),
            ),
            1 => (
                imageops::flip_vertical(&image),
                imageops::flip_vertical(&mask),
            ),
            _ => (imageops::rotate180(&image), imageops::rotate180(&mask)),
        }
    }

    fn apply_shift_scale_rotate<R: Rng>(
        &self,
        image: RgbImage,
        mask: GrayImage,
        rng: &mut R,
    ) -> (RgbImage, GrayImage) {
        if !rng.random_bool(self.config.probability) {
            return (image, mask);
        }
        let (width, height) = image.dimensions();
        let shift = self.config.shift_limit;
        let angle = rng
            .random_range(-self.config.rotate_limit..=self.config.rotate_limit)
            .to_radians() as f32;
        let scale =
            1.0 + rng.random_range(-self.config.scale_limit..=self.config.scale_limit) as f32;
        let dx = rng.random_range(-shift..=shift) as f32 * width as f32;
        let dy = rng.random_range(-shift..=shift) as f32 * height as f32;

        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        let projection = Projection::translate(cx + dx, cy + dy)
            * Projection::rotate(angle)
            * Projection::scale(scale, scale)
            * Projection::translate(-cx, -cy);

        let image = warp(&image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]));
        let mask = warp(&mask, &projection, Interpolation::Nearest, Luma([0]));
        (image, mask)
    }

    fn apply_color<R: Rng>(&self, mut image: RgbImage, rng: &mut R) -> RgbImage {
        if !rng.random_bool(self.config.probability) {
            return image;
        }
        if rng.random_bool(0.5) {
            let contrast = self.config.contrast_limit;
            let brightness = self.config.brightness_limit;
            let alpha = 1.0 + rng.random_range(-contrast..=contrast) as f32;
            let beta = rng.random_range(-brightness..=brightness) as f32 * 255.0;
            for value in image.iter_mut() {
                *value = (f32::from(*value) * alpha + beta).clamp(0.0, 255.0) as u8;
            }
        } else {
            let (low, high) = self.config.gamma_range;
            let gamma = rng.random_range(low..=high) as f32;
            for value in image.iter_mut() {
                *value = (255.0 * (f32::from(*value) / 255.0).powf(gamma)).clamp(0.0, 255.0) as u8;
            }
        }
        image
    }

    fn apply_detail<R: Rng>(&self, image: RgbImage, rng: &mut R) -> RgbImage {
        if !rng.random_bool(self.config.probability) {
            return image;
        }
        match rng.random_range(0..3) {
            0 => map_channels(&image, imageproc::filter::sharpen3x3),
            1 => {
                let sigma = rng.random_range(0.5f32..=1.5);
                imageops::blur(&image, sigma)
            }
            _ => downscale(&image, rng.random_range(DOWNSCALE_FACTORS)),
        }
    }

    fn apply_dropout<R: Rng>(
        &self,
        mut image: RgbImage,
        mut mask: GrayImage,
        rng: &mut R,
    ) -> (RgbImage, GrayImage) {
        if !rng.random_bool(self.config.dropout_prob) {
            return (image, mask);
        }
        let (width, height) = image.dimensions();
        let holes = rng.random_range(1..=self.config.dropout_holes.max(1));
        let low = self.config.dropout_min.min(self.config.dropout_max).max(1);
        let high = self.config.dropout_max.max(low);

        for _ in 0..holes {
            let hole_width = rng.random_range(low..=high).min(width);
            let hole_height = rng.random_range(low..=high).min(height);
            let x0 = rng.random_range(0..=width - hole_width);
            let y0 = rng.random_range(0..=height - hole_height);

            for y in y0..y0 + hole_height {
                for x in x0..x0 + hole_width {
                    image.put_pixel(x, y, Rgb([0, 0, 0]));
                    if let Some(fill) = self.config.dropout_mask_fill {
                        mask.put_pixel(x, y, Luma([fill]));
                    }
                }
            }
        }
        (image, mask)
    }
}

/// Scale factors tried by the downscale detail augmentation.
const DOWNSCALE_FACTORS: RangeInclusive<f32> = 0.7..=0.9;

/// Shrinks `image` by `factor` with nearest neighbour and scales it back up.
fn downscale(image: &RgbImage, factor: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let small_width = ((width as f32 * factor) as u32).max(1);
    let small_height = ((height as f32 * factor) as u32).max(1);
    let small = imageops::resize(image, small_width, small_height, FilterType::Nearest);
    imageops::resize(&small, width, height, FilterType::Triangle)
}

/// Applies a single-channel filter to each RGB channel.
fn map_channels(image: &RgbImage, filter: impl Fn(&GrayImage) -> GrayImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let channels: Vec<GrayImage> = (0..3)
        .map(|c| {
            let channel = GrayImage::from_fn(width, height, |x, y| Luma([image.get_pixel(x, y)[c]]));
            filter(&channel)
        })
        .collect();
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            channels[0].get_pixel(x, y)[0],
            channels[1].get_pixel(x, y)[0],
            channels[2].get_pixel(x, y)[0],
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Image whose red channel encodes the mask, so geometric consistency is checkable.
    fn sample(width: u32, height: u32) -> (RgbImage, GrayImage) {
        let mask = GrayImage::from_fn(width, height, |x, y| {
            Luma([if x < width / 3 && y < height / 2 { 255 } else { 0 }])
        });
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([mask.get_pixel(x, y)[0], (x * 7 % 256) as u8, (y * 11 % 256) as u8])
        });
        (image, mask)
    }

    fn only(method: AugmentationMethod) -> AugmentationConfig {
        AugmentationConfig::new()
            .with_methods(vec![method])
            .with_probability(1.0)
            .with_dropout_prob(1.0)
    }

    #[test]
    fn default_config_enables_every_method() {
        let config = AugmentationConfig::new();
        assert_eq!(config.methods, AugmentationMethod::all());
        assert_eq!(config.dropout_mask_fill, Some(0));
    }

    #[test]
    fn every_method_preserves_dimensions() {
        for method in AugmentationMethod::all() {
            let augmentor = ImageAugmentor::new(only(method.clone()), 7);
            for _ in 0..4 {
                let (image, mask) = sample(40, 30);
                let (image, mask) = augmentor.augment(image, mask);
                assert_eq!(image.dimensions(), (40, 30), "{method:?}");
                assert_eq!(mask.dimensions(), (40, 30), "{method:?}");
            }
        }
    }

    #[test]
    fn flip_moves_mask_with_image() {
        let augmentor = ImageAugmentor::new(only(AugmentationMethod::Flip), 3);
        for _ in 0..6 {
            let (image, mask) = sample(9, 8);
            let (image, mask) = augmentor.augment(image, mask);
            for (pixel, label) in image.pixels().zip(mask.pixels()) {
                assert_eq!(pixel[0], label[0]);
            }
        }
    }

    #[test]
    fn shift_scale_rotate_keeps_mask_binary() {
        let augmentor = ImageAugmentor::new(only(AugmentationMethod::ShiftScaleRotate), 11);
        let (image, mask) = sample(32, 32);
        let (_, mask) = augmentor.augment(image, mask);
        assert!(mask.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn photometric_methods_leave_mask_untouched() {
        for method in [AugmentationMethod::Color, AugmentationMethod::Detail] {
            let augmentor = ImageAugmentor::new(only(method), 5);
            let (image, mask) = sample(16, 16);
            let (_, augmented) = augmentor.augment(image, mask.clone());
            assert_eq!(augmented, mask);
        }
    }

    #[test]
    fn dropout_clears_holes_in_image_and_mask() {
        let config = only(AugmentationMethod::Dropout)
            .with_dropout_holes(1)
            .with_dropout_min(4)
            .with_dropout_max(4);
        let white = RgbImage::from_pixel(12, 12, Rgb([255, 255, 255]));
        let full_mask = GrayImage::from_pixel(12, 12, Luma([255]));

        let (dropped, cleared) =
            ImageAugmentor::new(config.clone(), 1).augment(white.clone(), full_mask.clone());
        let black = dropped.pixels().filter(|p| p.0 == [0, 0, 0]).count();
        assert_eq!(black, 16);
        assert_eq!(cleared.pixels().filter(|p| p[0] == 0).count(), 16);

        let kept = config.with_dropout_mask_fill(None);
        let (_, untouched) = ImageAugmentor::new(kept, 1).augment(white, full_mask.clone());
        assert_eq!(untouched, full_mask);
    }

    #[test]
    fn downscale_keeps_size_and_softens_detail() {
        assert_eq!(
            (*DOWNSCALE_FACTORS.start(), *DOWNSCALE_FACTORS.end()),
            (0.7, 0.9)
        );
        let checker = RgbImage::from_fn(20, 20, |x, y| {
            if (x + y) % 2 == 0 { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) }
        });
        let softened = downscale(&checker, *DOWNSCALE_FACTORS.start());
        assert_eq!(softened.dimensions(), (20, 20));
        assert_ne!(softened, checker);
    }

    #[test]
    fn same_seed_same_stream() {
        let config = AugmentationConfig::new().with_probability(1.0);
        let first = ImageAugmentor::new(config.clone(), 42);
        let second = ImageAugmentor::new(config, 42);
        let (image, mask) = sample(24, 24);
        assert_eq!(
            first.augment(image.clone(), mask.clone()),
            second.augment(image, mask)
        );
    }

    #[test]
    fn empty_method_list_is_identity() {
        let augmentor = ImageAugmentor::new(AugmentationConfig::new().with_methods(vec![]), 0);
        let (image, mask) = sample(10, 10);
        assert_eq!(
            augmentor.augment(image.clone(), mask.clone()),
            (image, mask)
        );
    }
}
