//! Fundus image/lesion mask dataset.
//!
//! Images and masks live in two flat directories and are paired by file
//! name. Items carry raw pixel data; [`SegmentationBatcher`] turns them into
//! tensors on the target device.

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
};

use burn::{
    config::Config,
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use image::{imageops, imageops::FilterType, GrayImage, ImageFormat, RgbImage};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use u2net_model::SegmentationBatch;
use walkdir::WalkDir;

use crate::{
    augmentation::ImageAugmentor,
    error::{DatasetError, DatasetResult},
};

/// Where the data lives and how it is decoded.
#[derive(Config, Debug)]
pub struct DatasetConfig {
    /// Directory of RGB fundus images.
    pub image_dir: String,
    /// Directory of lesion masks, one per image with the same file name.
    pub mask_dir: String,
    /// Square side every sample is resized to; native size when `None`.
    pub image_size: Option<u32>,
    /// Fraction of pairs held out for validation. `0` validates on the training set.
    #[config(default = 0.0)]
    pub val_ratio: f64,
    /// Mask pixels at or above this value are lesion.
    #[config(default = 128)]
    pub foreground_threshold: u8,
}

/// Paths of an image and its mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePair {
    pub image: PathBuf,
    pub mask: PathBuf,
}

/// A decoded sample.
#[derive(Debug, Clone)]
pub struct LesionItem {
    /// RGB values in `[0, 1]`, laid out `[height, width, 3]`.
    pub image: Vec<f32>,
    /// Class index of every pixel, laid out `[height, width]`.
    pub mask: Vec<i64>,
    pub height: usize,
    pub width: usize,
}

fn is_image(path: &Path) -> bool {
    path.is_file() && ImageFormat::from_path(path).is_ok_and(|format| format.reading_enabled())
}

fn find_mask(mask_dir: &Path, image: &Path) -> Option<PathBuf> {
    let exact = mask_dir.join(image.file_name()?);
    if exact.is_file() {
        return Some(exact);
    }
    let stem = image.file_stem()?.to_str()?;
    ImageFormat::all()
        .flat_map(|format| format.extensions_str().iter())
        .map(|extension| mask_dir.join(format!("{stem}.{extension}")))
        .find(|candidate| candidate.is_file())
}

/// Pairs every image of `image_dir` with its mask in `mask_dir`.
///
/// Masks are looked up by identical file name first, then by stem with any
/// readable image extension. Images without a mask are skipped with a
/// warning. Pairs come back sorted by file name.
pub fn discover_pairs(image_dir: &Path, mask_dir: &Path) -> DatasetResult<Vec<SamplePair>> {
    if !image_dir.is_dir() {
        return Err(DatasetError::ImageDirectoryNotFound {
            path: image_dir.to_path_buf(),
        });
    }
    if !mask_dir.is_dir() {
        return Err(DatasetError::MaskDirectoryNotFound {
            path: mask_dir.to_path_buf(),
        });
    }

    let mut pairs = Vec::new();
    for entry in WalkDir::new(image_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| DatasetError::DirectoryReadFailed {
            path: image_dir.to_path_buf(),
            source,
        })?;
        let image = entry.path();
        if !is_image(image) {
            continue;
        }
        match find_mask(mask_dir, image) {
            Some(mask) => pairs.push(SamplePair {
                image: image.to_path_buf(),
                mask,
            }),
            None => tracing::warn!(image = %image.display(), "no mask found, skipping"),
        }
    }

    if pairs.is_empty() {
        return Err(DatasetError::NoValidPairs {
            path: image_dir.to_path_buf(),
        });
    }
    tracing::info!(
        pairs = pairs.len(),
        image_dir = %image_dir.display(),
        "found image/mask pairs"
    );
    Ok(pairs)
}

/// Splits pairs into training and validation sets.
///
/// A ratio of `0` returns the full list as both sets. Otherwise the pairs
/// are shuffled with `seed` and at least one pair lands on each side.
pub fn split_pairs(
    mut pairs: Vec<SamplePair>,
    val_ratio: f64,
    seed: u64,
) -> DatasetResult<(Vec<SamplePair>, Vec<SamplePair>)> {
    if !(0.0..1.0).contains(&val_ratio) {
        return Err(DatasetError::InvalidSplit {
            reason: format!("val_ratio must be in [0, 1), got {val_ratio}"),
        });
    }
    if val_ratio == 0.0 {
        return Ok((pairs.clone(), pairs));
    }
    let total = pairs.len();
    if total < 2 {
        return Err(DatasetError::InvalidSplit {
            reason: format!("cannot hold out a validation set from {total} pair(s)"),
        });
    }

    pairs.shuffle(&mut StdRng::seed_from_u64(seed));
    let held_out = ((total as f64 * val_ratio).round() as usize).clamp(1, total - 1);
    let valid = pairs.split_off(total - held_out);
    Ok((pairs, valid))
}

/// Dataset of fundus images and their lesion masks.
pub struct LesionDataset {
    pairs: Vec<SamplePair>,
    image_size: Option<u32>,
    foreground_threshold: u8,
    augmentor: Option<ImageAugmentor>,
}

impl LesionDataset {
    /// Dataset over `pairs` decoded as `config` describes, without augmentation.
    pub fn new(pairs: Vec<SamplePair>, config: &DatasetConfig) -> Self {
        Self {
            pairs,
            image_size: config.image_size,
            foreground_threshold: config.foreground_threshold,
            augmentor: None,
        }
    }

    /// Augments every sample before resizing.
    pub fn with_augmentor(mut self, augmentor: ImageAugmentor) -> Self {
        self.augmentor = Some(augmentor);
        self
    }

    /// Discovers the pairs of `config` and splits them into an augmented
    /// training set and a plain validation set.
    pub fn train_valid(
        config: &DatasetConfig,
        augmentor: ImageAugmentor,
        seed: u64,
    ) -> DatasetResult<(Self, Self)> {
        let pairs = discover_pairs(Path::new(&config.image_dir), Path::new(&config.mask_dir))?;
        let (train, valid) = split_pairs(pairs, config.val_ratio, seed)?;
        tracing::info!(train = train.len(), valid = valid.len(), "dataset split");
        Ok((
            Self::new(train, config).with_augmentor(augmentor),
            Self::new(valid, config),
        ))
    }

    pub fn pairs(&self) -> &[SamplePair] {
        &self.pairs
    }

    /// Decodes one pair.
    pub fn load(&self, pair: &SamplePair) -> DatasetResult<LesionItem> {
        let image = open(&pair.image)?.to_rgb8();
        let mask = open(&pair.mask)?.to_luma8();
        if image.dimensions() != mask.dimensions() {
            return Err(DatasetError::DimensionMismatch {
                image: pair.image.clone(),
                mask: pair.mask.clone(),
                image_size: image.dimensions(),
                mask_size: mask.dimensions(),
            });
        }

        let (image, mask) = match &self.augmentor {
            Some(augmentor) => augmentor.augment(image, mask),
            None => (image, mask),
        };
        let (image, mask) = self.resize(image, mask);

        let (width, height) = image.dimensions();
        let threshold = self.foreground_threshold;
        Ok(LesionItem {
            image: image
                .into_raw()
                .into_iter()
                .map(|value| f32::from(value) / 255.0)
                .collect(),
            mask: mask
                .into_raw()
                .into_iter()
                .map(|value| i64::from(value >= threshold))
                .collect(),
            height: height as usize,
            width: width as usize,
        })
    }

    fn resize(&self, image: RgbImage, mask: GrayImage) -> (RgbImage, GrayImage) {
        match self.image_size {
            Some(size) if image.dimensions() != (size, size) => (
                imageops::resize(&image, size, size, FilterType::Lanczos3),
                imageops::resize(&mask, size, size, FilterType::Nearest),
            ),
            _ => (image, mask),
        }
    }
}

fn open(path: &Path) -> DatasetResult<image::DynamicImage> {
    image::open(path).map_err(|source| DatasetError::ImageOpenFailed {
        path: path.to_path_buf(),
        source,
    })
}

impl Dataset<LesionItem> for LesionDataset {
    fn get(&self, index: usize) -> Option<LesionItem> {
        let pair = self.pairs.get(index)?;
        match self.load(pair) {
            Ok(item) => Some(item),
            Err(err) => {
                tracing::error!(error = %err, image = %pair.image.display(), "failed to load sample");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }
}

/// Stacks [`LesionItem`]s into a [`SegmentationBatch`].
#[derive(Clone, Default)]
pub struct SegmentationBatcher<B: Backend> {
    _backend: PhantomData<B>,
}

impl<B: Backend> SegmentationBatcher<B> {
    pub const fn new() -> Self {
        Self {
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, LesionItem, SegmentationBatch<B>> for SegmentationBatcher<B> {
    fn batch(&self, items: Vec<LesionItem>, device: &B::Device) -> SegmentationBatch<B> {
        let mut images = Vec::with_capacity(items.len());
        let mut masks = Vec::with_capacity(items.len());

        for item in items {
            // HWC -> CHW
            let image = Tensor::<B, 3>::from_data(
                TensorData::new(item.image, [item.height, item.width, 3]),
                device,
            )
            .permute([2, 0, 1]);
            let mask = Tensor::<B, 2, Int>::from_data(
                TensorData::new(item.mask, [item.height, item.width]),
                device,
            );
            images.push(image);
            masks.push(mask);
        }

        SegmentationBatch::new(Tensor::stack(images, 0), Tensor::stack(masks, 0))
    }
}

#[cfg(test)]
mod tests {
    use image::{Luma, Rgb};
    use tempfile::TempDir;

    use super::*;
    use crate::{augmentation::AugmentationConfig, tests::TestBackend};

    struct Fixture {
        _root: TempDir,
        images: PathBuf,
        masks: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let images = root.path().join("images");
            let masks = root.path().join("masks");
            std::fs::create_dir_all(&images).unwrap();
            std::fs::create_dir_all(&masks).unwrap();
            Self {
                _root: root,
                images,
                masks,
            }
        }

        fn image(&self, name: &str, width: u32, height: u32) {
            RgbImage::from_fn(width, height, |x, _| Rgb([255, (x * 40) as u8, 0]))
                .save(self.images.join(name))
                .unwrap();
        }

        fn mask(&self, name: &str, width: u32, height: u32) {
            GrayImage::from_fn(width, height, |x, _| Luma([if x == 0 { 255 } else { 100 }]))
                .save(self.masks.join(name))
                .unwrap();
        }

        fn config(&self) -> DatasetConfig {
            DatasetConfig::new(
                self.images.display().to_string(),
                self.masks.display().to_string(),
            )
        }
    }

    #[test]
    fn pairs_images_with_masks_by_name() {
        let fixture = Fixture::new();
        fixture.image("b.png", 4, 3);
        fixture.mask("b.png", 4, 3);
        fixture.image("a.png", 4, 3);
        fixture.mask("a.bmp", 4, 3);
        fixture.image("orphan.png", 4, 3);
        std::fs::write(fixture.images.join("notes.txt"), "not an image").unwrap();

        let pairs = discover_pairs(&fixture.images, &fixture.masks).unwrap();
        let names: Vec<_> = pairs
            .iter()
            .map(|pair| pair.image.file_name().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["a.png", "b.png"]);
        assert_eq!(pairs[0].mask, fixture.masks.join("a.bmp"));
    }

    #[test]
    fn missing_directories_and_empty_pairs_are_errors() {
        let fixture = Fixture::new();
        let missing = fixture.images.join("nope");
        assert!(matches!(
            discover_pairs(&missing, &fixture.masks),
            Err(DatasetError::ImageDirectoryNotFound { .. })
        ));
        assert!(matches!(
            discover_pairs(&fixture.images, &missing),
            Err(DatasetError::MaskDirectoryNotFound { .. })
        ));

        fixture.image("lonely.png", 2, 2);
        assert!(matches!(
            discover_pairs(&fixture.images, &fixture.masks),
            Err(DatasetError::NoValidPairs { .. })
        ));
    }

    fn fake_pairs(count: usize) -> Vec<SamplePair> {
        (0..count)
            .map(|i| SamplePair {
                image: PathBuf::from(format!("{i}.png")),
                mask: PathBuf::from(format!("{i}.png")),
            })
            .collect()
    }

    #[test]
    fn zero_ratio_validates_on_the_training_set() {
        let (train, valid) = split_pairs(fake_pairs(5), 0.0, 42).unwrap();
        assert_eq!(train, fake_pairs(5));
        assert_eq!(valid, fake_pairs(5));
    }

    #[test]
    fn split_is_disjoint_and_seeded() {
        let (train, valid) = split_pairs(fake_pairs(10), 0.2, 42).unwrap();
        assert_eq!((train.len(), valid.len()), (8, 2));
        assert!(valid.iter().all(|pair| !train.contains(pair)));

        let again = split_pairs(fake_pairs(10), 0.2, 42).unwrap();
        assert_eq!(again, (train, valid));
    }

    #[test]
    fn split_keeps_both_sides_non_empty() {
        let (train, valid) = split_pairs(fake_pairs(3), 0.01, 0).unwrap();
        assert_eq!((train.len(), valid.len()), (2, 1));
        let (train, valid) = split_pairs(fake_pairs(3), 0.99, 0).unwrap();
        assert_eq!((train.len(), valid.len()), (1, 2));
    }

    #[test]
    fn impossible_splits_are_rejected() {
        assert!(matches!(
            split_pairs(fake_pairs(1), 0.5, 0),
            Err(DatasetError::InvalidSplit { .. })
        ));
        assert!(matches!(
            split_pairs(fake_pairs(4), 1.0, 0),
            Err(DatasetError::InvalidSplit { .. })
        ));
    }

    #[test]
    fn load_scales_image_and_thresholds_mask() {
        let fixture = Fixture::new();
        fixture.image("a.png", 3, 2);
        fixture.mask("a.png", 3, 2);
        let dataset = LesionDataset::train_valid(
            &fixture.config(),
            ImageAugmentor::new(AugmentationConfig::new().with_methods(vec![]), 0),
            0,
        )
        .unwrap()
        .1;

        let item = dataset.get(0).unwrap();
        assert_eq!((item.height, item.width), (2, 3));
        assert_eq!(item.image.len(), 2 * 3 * 3);
        assert_eq!(&item.image[..6], &[1.0, 0.0, 0.0, 1.0, 40.0 / 255.0, 0.0]);
        assert_eq!(item.mask, [1, 0, 0, 1, 0, 0]);
        assert!(dataset.get(1).is_none());
    }

    #[test]
    fn load_resizes_to_square() {
        let fixture = Fixture::new();
        fixture.image("a.png", 6, 4);
        fixture.mask("a.png", 6, 4);
        let config = fixture.config().with_image_size(Some(8));
        let pairs = discover_pairs(&fixture.images, &fixture.masks).unwrap();

        let item = LesionDataset::new(pairs, &config).get(0).unwrap();
        assert_eq!((item.height, item.width), (8, 8));
        assert!(item.mask.iter().all(|&class| class == 0 || class == 1));
    }

    #[test]
    fn mismatched_mask_size_is_an_error() {
        let fixture = Fixture::new();
        fixture.image("a.png", 4, 4);
        fixture.mask("a.png", 5, 4);
        let pairs = discover_pairs(&fixture.images, &fixture.masks).unwrap();
        let dataset = LesionDataset::new(pairs.clone(), &fixture.config());

        assert!(matches!(
            dataset.load(&pairs[0]),
            Err(DatasetError::DimensionMismatch { .. })
        ));
        assert!(dataset.get(0).is_none());
    }

    #[test]
    fn batcher_stacks_channels_first() {
        let device = Default::default();
        let item = |value: f32, class: i64| LesionItem {
            image: vec![value; 4 * 5 * 3],
            mask: vec![class; 4 * 5],
            height: 4,
            width: 5,
        };
        let batch = SegmentationBatcher::<TestBackend>::new()
            .batch(vec![item(0.25, 0), item(0.75, 1)], &device);

        assert_eq!(batch.images.dims(), [2, 3, 4, 5]);
        assert_eq!(batch.masks.dims(), [2, 4, 5]);
        assert_eq!(batch.masks.sum().into_scalar(), 20);
    }
}
