//! Lesion mask prediction with a trained checkpoint.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use burn::{prelude::*, record::CompactRecorder};
use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, ImageFormat};
use u2net_metric::predict_mask;
use u2net_model::U2Net;
use walkdir::WalkDir;

use crate::{
    backend::{SelectedBackend, SelectedDevice},
    training::TrainingConfig,
};

/// Grey level written for lesion pixels.
pub const LESION_VALUE: u8 = 255;

/// Inference configuration.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Image file or directory of images.
    pub input_path: PathBuf,
    /// Directory receiving `<stem>_mask.png` files.
    pub output_path: PathBuf,
    /// Checkpoint saved by training.
    pub model_path: PathBuf,
    /// Training configuration the checkpoint was trained with.
    pub config_path: PathBuf,
}

impl InferenceConfig {
    pub fn new(
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        model_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            model_path: model_path.into(),
            config_path: config_path.into(),
        }
    }
}

/// Predicts a mask for every input image and returns the written files.
///
/// # Errors
///
/// Returns an error if the configuration or checkpoint cannot be loaded,
/// the input path does not exist, or an image fails to process.
pub fn run_inference(config: &InferenceConfig, device: &SelectedDevice) -> Result<Vec<PathBuf>> {
    tracing::info!(
        input = %config.input_path.display(),
        output = %config.output_path.display(),
        model = %config.model_path.display(),
        "running inference",
    );

    let training = TrainingConfig::load(&config.config_path)
        .with_context(|| format!("failed to load {}", config.config_path.display()))?;
    let model: U2Net<SelectedBackend> = training
        .model
        .init(device)?
        .load_file(&config.model_path, &CompactRecorder::new(), device)
        .map_err(|e| anyhow!("failed to load model {}: {e}", config.model_path.display()))?;
    tracing::info!(variant = training.model.variant.name(), "model loaded");

    let inputs = collect_inputs(&config.input_path)?;
    fs::create_dir_all(&config.output_path)?;

    let mut written = Vec::with_capacity(inputs.len());
    for input in inputs {
        let output = process_image(
            &model,
            &input,
            &config.output_path,
            training.dataset.image_size,
            device,
        )?;
        written.push(output);
    }
    tracing::info!(images = written.len(), "inference completed");
    Ok(written)
}

/// The input file itself, or every readable image of a directory in name order.
fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        anyhow::bail!("Input path does not exist: {}", input.display());
    }
    let mut images = Vec::new();
    for entry in WalkDir::new(input).min_depth(1).max_depth(1).sort_by_file_name() {
        let path = entry?.into_path();
        if path.is_file() && ImageFormat::from_path(&path).is_ok_and(|f| f.reading_enabled()) {
            images.push(path);
        }
    }
    if images.is_empty() {
        anyhow::bail!("No images found in {}", input.display());
    }
    Ok(images)
}

fn process_image<B: Backend>(
    model: &U2Net<B>,
    input: &Path,
    output_dir: &Path,
    image_size: Option<u32>,
    device: &B::Device,
) -> Result<PathBuf> {
    tracing::info!(path = %input.display(), "processing image");
    let image = image::open(input).with_context(|| format!("failed to open {}", input.display()))?;
    let mask = predict_lesion_mask(model, &image, image_size, device)?;

    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let output = output_dir.join(format!("{stem}_mask.png"));
    mask.save(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(output)
}

/// Binary lesion mask of `image` at its original resolution.
///
/// The image is scaled to `[0, 1]`, optionally resized to the training
/// size, and the arg-max of the fused map is resized back with nearest
/// neighbour. Lesion pixels are [`LESION_VALUE`], background is 0.
///
/// # Errors
///
/// Returns an error if the prediction does not match the image size.
pub fn predict_lesion_mask<B: Backend>(
    model: &U2Net<B>,
    image: &DynamicImage,
    image_size: Option<u32>,
    device: &B::Device,
) -> Result<GrayImage> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let rgb = match image_size {
        Some(size) if (width, height) != (size, size) => {
            imageops::resize(&rgb, size, size, FilterType::Lanczos3)
        }
        _ => rgb,
    };
    let (input_width, input_height) = rgb.dimensions();

    let pixels: Vec<f32> = rgb
        .into_raw()
        .into_iter()
        .map(|value| f32::from(value) / 255.0)
        .collect();
    // HWC -> NCHW
    let images = Tensor::<B, 3>::from_data(
        TensorData::new(pixels, [input_height as usize, input_width as usize, 3]),
        device,
    )
    .permute([2, 0, 1])
    .unsqueeze::<4>();
    model.check_input(images.dims())?;

    let classes = predict_mask(model.forward_fused(images));
    let values: Vec<u8> = classes
        .into_data()
        .iter::<i64>()
        .map(|class| if class > 0 { LESION_VALUE } else { 0 })
        .collect();
    let mask = GrayImage::from_raw(input_width, input_height, values)
        .ok_or_else(|| anyhow!("prediction does not match a {input_width}x{input_height} image"))?;

    if mask.dimensions() == (width, height) {
        Ok(mask)
    } else {
        Ok(imageops::resize(&mask, width, height, FilterType::Nearest))
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use u2net_model::{U2NetVariant, UpsampleMode};

    use super::*;
    use crate::training::ModelVariantConfig;

    type TestBackend = NdArray<f32>;

    fn lite() -> U2Net<TestBackend> {
        ModelVariantConfig::new()
            .with_variant(U2NetVariant::Lite)
            .with_upsample(UpsampleMode::Nearest)
            .init(&Default::default())
            .unwrap()
    }

    fn fundus(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 9) as u8, (y * 13) as u8, 90])
        }))
    }

    #[test]
    fn mask_has_original_resolution_and_binary_values() {
        let model = lite();
        let mask = predict_lesion_mask(&model, &fundus(13, 9), Some(16), &Default::default()).unwrap();
        assert_eq!(mask.dimensions(), (13, 9));
        assert!(mask.pixels().all(|p| p[0] == 0 || p[0] == LESION_VALUE));
    }

    #[test]
    fn mask_without_resize_keeps_native_size() {
        let model = lite();
        let mask = predict_lesion_mask(&model, &fundus(10, 6), None, &Default::default()).unwrap();
        assert_eq!(mask.dimensions(), (10, 6));
    }

    #[test]
    fn writes_stem_mask_png() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("eye_01.jpg");
        fundus(8, 8).save(&input).unwrap();

        let output = process_image(&lite(), &input, dir.path(), None, &Default::default()).unwrap();
        assert_eq!(output, dir.path().join("eye_01_mask.png"));
        let written = image::open(&output).unwrap();
        assert_eq!((written.width(), written.height()), (8, 8));
    }

    #[test]
    fn collects_images_of_a_directory_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fundus(4, 4).save(dir.path().join("b.png")).unwrap();
        fundus(4, 4).save(dir.path().join("a.png")).unwrap();
        fs::write(dir.path().join("readme.txt"), "skip").unwrap();

        let inputs = collect_inputs(dir.path()).unwrap();
        assert_eq!(inputs, [dir.path().join("a.png"), dir.path().join("b.png")]);
        assert_eq!(collect_inputs(&inputs[0]).unwrap(), [inputs[0].clone()]);
        assert!(collect_inputs(&dir.path().join("missing")).is_err());
    }
}
