//! Training runner: configuration, epoch loop, checkpoints and curves.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use burn::{
    config::Config,
    data::dataloader::{DataLoader, DataLoaderBuilder, Progress},
    module::{AutodiffModule, Module},
    nn::loss::Reduction,
    optim::{AdamWConfig, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{
        metric::{Adaptor, Metric, MetricMetadata, Numeric},
        TrainStep, ValidStep,
    },
};
use u2net_loss::{DiceLoss, SegmentationLossConfig};
use u2net_metric::{DiceMetric, IoUMetric, MeanAccumulator, SegmentationMetricInput};
use u2net_model::{
    SegmentationBatch, U2Net, U2NetConfig, U2NetResult, U2NetVariant, UpsampleMode,
};
use u2net_train::{AugmentationConfig, DatasetConfig, ImageAugmentor, LesionDataset, SegmentationBatcher};

use crate::{
    backend::{create_device, get_backend_name, SelectedAutodiffBackend},
    history::{EpochRecord, TrainingHistory},
    plot::plot_training_progress,
};

/// File names inside the artifact directory.
pub const CONFIG_FILE: &str = "config.json";
pub const HISTORY_FILE: &str = "history.json";
pub const BEST_MODEL: &str = "best_model";
pub const LAST_MODEL: &str = "last_model";
pub const PROGRESS_PLOT: &str = "training_progress.png";

type BatchLoader<B> = Arc<dyn DataLoader<B, SegmentationBatch<B>>>;

/// CLI arguments for the training subcommand.
#[derive(Debug)]
pub struct TrainingCliArgs {
    /// Path to the training configuration file.
    pub config_path: PathBuf,
    /// Optional checkpoint to resume training from.
    pub resume_checkpoint: Option<PathBuf>,
}

impl TrainingCliArgs {
    pub fn new(config_path: impl Into<PathBuf>, resume_checkpoint: Option<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            resume_checkpoint,
        }
    }
}

/// Which network to train.
#[derive(Config, Debug)]
pub struct ModelVariantConfig {
    #[config(default = "U2NetVariant::Full")]
    pub variant: U2NetVariant,
    /// Output classes, background included.
    #[config(default = 2)]
    pub out_channels: usize,
    /// Training on the ndarray backend requires `Nearest`.
    #[config(default = "UpsampleMode::Bilinear")]
    pub upsample: UpsampleMode,
}

impl ModelVariantConfig {
    /// Network configuration, optionally carrying the training loss.
    pub fn network(&self, loss: Option<SegmentationLossConfig>) -> U2NetConfig {
        U2NetConfig::from_variant(&self.variant, self.out_channels)
            .with_upsample(self.upsample.clone())
            .with_loss(loss)
    }

    /// Initializes the network without a loss.
    pub fn init<B: Backend>(&self, device: &B::Device) -> U2NetResult<U2Net<B>> {
        self.network(None).init(device)
    }
}

/// Complete training configuration, loaded from JSON.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelVariantConfig,
    #[config(default = "SegmentationLossConfig::new()")]
    pub loss: SegmentationLossConfig,
    pub dataset: DatasetConfig,
    #[config(default = "AugmentationConfig::new()")]
    pub augmentation: AugmentationConfig,

    #[config(default = 1e-4)]
    pub learning_rate: f64,

    #[config(default = 1e-2)]
    pub weight_decay: f64,

    #[config(default = 400)]
    pub num_epochs: usize,

    #[config(default = 5)]
    pub batch_size: usize,

    #[config(default = 1)]
    pub valid_batch_size: usize,

    #[config(default = 6)]
    pub num_workers: usize,

    /// Seeds the backend, the shuffles, the split and the augmentation.
    #[config(default = 42)]
    pub seed: u64,

    /// Directory receiving checkpoints, history, config and plot.
    #[config(default = "String::from(\"artifacts\")")]
    pub artifact_dir: String,
}

impl TrainingConfig {
    /// Loads a training configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config_str = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&config_str)?;
        Ok(config)
    }

    /// Saves this configuration to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let config_str = serde_json::to_string_pretty(self)?;
        fs::write(path, config_str)?;
        Ok(())
    }
}

/// Runs training from CLI arguments on the selected backend.
///
/// # Errors
///
/// Returns an error if the configuration or checkpoint file is missing,
/// the configuration cannot be parsed, or training fails.
pub fn run_training(args: TrainingCliArgs) -> Result<TrainingHistory> {
    if !args.config_path.exists() {
        anyhow::bail!(
            "Configuration file not found: {}",
            args.config_path.display()
        );
    }
    if let Some(checkpoint) = &args.resume_checkpoint {
        if !checkpoint.exists() && !checkpoint.with_extension("mpk").exists() {
            anyhow::bail!("Checkpoint file not found: {}", checkpoint.display());
        }
        tracing::info!(checkpoint = %checkpoint.display(), "resuming from checkpoint");
    }

    let config = TrainingConfig::load(&args.config_path)
        .with_context(|| format!("failed to load {}", args.config_path.display()))?;
    tracing::info!(
        variant = config.model.variant.name(),
        classes = config.model.out_channels,
        learning_rate = config.learning_rate,
        batch_size = config.batch_size,
        epochs = config.num_epochs,
        image_dir = %config.dataset.image_dir,
        "configuration loaded",
    );

    tracing::info!(backend = get_backend_name(), "starting training");
    run_training_on_device::<SelectedAutodiffBackend>(
        create_device(),
        config,
        args.resume_checkpoint,
    )
}

/// Trains on `device` and returns the recorded history.
///
/// Every epoch runs a training pass, a validation pass, saves
/// `last_model`, and saves `best_model` when the validation Dice is at
/// least the best seen so far. The history is rewritten after every epoch
/// and plotted at the end.
///
/// # Errors
///
/// Returns an error if the dataset, the model, or any artifact fails.
pub fn run_training_on_device<B: AutodiffBackend>(
    device: B::Device,
    config: TrainingConfig,
    resume_checkpoint: Option<PathBuf>,
) -> Result<TrainingHistory> {
    tracing::info!(?device, "initializing U2-Net training");
    check_backend_support::<B>(&device, &config.model)?;
    let artifact_dir = PathBuf::from(&config.artifact_dir);
    fs::create_dir_all(&artifact_dir)
        .with_context(|| format!("failed to create {}", artifact_dir.display()))?;
    config.save(artifact_dir.join(CONFIG_FILE))?;

    B::seed(config.seed);
    let recorder = CompactRecorder::new();

    let mut model: U2Net<B> = config
        .model
        .network(Some(config.loss.clone()))
        .init(&device)?;
    if let Some(checkpoint) = &resume_checkpoint {
        model = model
            .load_file(checkpoint, &recorder, &device)
            .map_err(|e| anyhow!("failed to load checkpoint {}: {e}", checkpoint.display()))?;
    }
    tracing::info!(parameters = model.num_params(), "model created");

    let mut optim = AdamWConfig::new()
        .with_weight_decay(config.weight_decay as f32)
        .init();

    let (train_loader, valid_loader) = data_loaders::<B>(&config, &device)?;

    let soft_dice = config.loss.dice.init();
    let mut dice_metric = DiceMetric::<B::InnerBackend>::new();
    let mut iou_metric = IoUMetric::<B::InnerBackend>::new();
    let mut history = TrainingHistory::new();
    let mut best_dice: Option<f64> = None;

    for epoch in 1..=config.num_epochs {
        let mut train_loss = MeanAccumulator::new();
        let mut train_dice = MeanAccumulator::new();
        for (iteration, batch) in train_loader.iter().enumerate() {
            let output = TrainStep::step(&model, batch);
            let loss = output.item.loss.clone().into_scalar().elem::<f64>();
            train_loss.push(Some(loss));
            train_dice.push(Some(soft_dice_score(
                &soft_dice,
                output.item.output.clone().inner(),
                output.item.targets.clone().inner(),
            )));
            model = optim.step(config.learning_rate, model, output.grads);
            tracing::debug!(epoch, iteration, loss, "train step");
        }

        let valid_model = model.valid();
        let mut val_loss = MeanAccumulator::new();
        dice_metric.clear();
        iou_metric.clear();
        let items_total = valid_loader.num_items();
        let mut items_processed = 0;
        for (iteration, batch) in valid_loader.iter().enumerate() {
            items_processed += batch.batch_size();
            let output = ValidStep::step(&valid_model, batch);
            val_loss.push(Some(output.loss.clone().into_scalar().elem::<f64>()));

            let metadata = MetricMetadata {
                progress: Progress {
                    items_processed,
                    items_total,
                },
                epoch,
                epoch_total: config.num_epochs,
                iteration,
                lr: Some(config.learning_rate),
            };
            let input: SegmentationMetricInput<B::InnerBackend> = output.adapt();
            dice_metric.update(&input, &metadata);
            iou_metric.update(&input, &metadata);
        }

        let record = EpochRecord {
            epoch,
            train_loss: train_loss.mean().unwrap_or(f64::NAN),
            train_dice: train_dice.mean().unwrap_or(f64::NAN),
            val_loss: val_loss.mean(),
            val_dice: defined(dice_metric.value()),
            val_iou: defined(iou_metric.value()),
        };
        tracing::info!(
            epoch,
            epochs = config.num_epochs,
            loss = record.train_loss,
            dice = record.train_dice,
            "[TRAIN]"
        );
        tracing::info!(
            epoch,
            loss = ?record.val_loss,
            dice = ?record.val_dice,
            iou = ?record.val_iou,
            "[EVAL]"
        );

        if let Some(dice) = record.val_dice {
            if best_dice.is_none_or(|best| dice >= best) {
                best_dice = Some(dice);
                save_model(&model, &artifact_dir.join(BEST_MODEL), &recorder)?;
                tracing::info!(epoch, dice, "new best model saved");
            }
        }
        save_model(&model, &artifact_dir.join(LAST_MODEL), &recorder)?;

        history.push(record);
        history.save(artifact_dir.join(HISTORY_FILE))?;
    }

    if let Some((epoch, dice)) = history.best_val_dice() {
        tracing::info!(epoch, dice, "training completed");
    } else {
        tracing::warn!("training completed without a defined validation Dice");
    }
    if !history.is_empty() {
        if let Err(err) =
            plot_training_progress(&history, artifact_dir.join(PROGRESS_PLOT), "U2-Net training")
        {
            tracing::warn!(error = %err, "failed to plot training progress");
        }
    }
    Ok(history)
}

/// Rejects network settings whose backward pass the backend cannot run.
///
/// burn-ndarray has no bilinear interpolation backward pass.
fn check_backend_support<B: AutodiffBackend>(
    device: &B::Device,
    model: &ModelVariantConfig,
) -> Result<()> {
    let backend = B::name(device);
    if model.upsample == UpsampleMode::Bilinear && backend.contains("ndarray") {
        anyhow::bail!(
            "the {backend} backend cannot train with bilinear upsampling; \
             set \"upsample\": \"Nearest\" in the model configuration"
        );
    }
    Ok(())
}

/// Training and validation loaders, both producing batches on `device`.
fn data_loaders<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<(BatchLoader<B>, BatchLoader<B::InnerBackend>)> {
    let augmentor = ImageAugmentor::new(config.augmentation.clone(), config.seed);
    let (train_set, valid_set) = LesionDataset::train_valid(&config.dataset, augmentor, config.seed)?;
    let train_loader = DataLoaderBuilder::new(SegmentationBatcher::<B>::new())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(train_set);
    let valid_loader = DataLoaderBuilder::new(SegmentationBatcher::<B::InnerBackend>::new())
        .batch_size(config.valid_batch_size)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(valid_set);
    Ok((train_loader, valid_loader))
}

/// Mean soft Dice score (1 - Dice loss) of a batch.
fn soft_dice_score<B: Backend>(
    dice: &DiceLoss,
    logits: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
) -> f64 {
    1.0 - dice
        .forward(logits, targets, Reduction::Mean)
        .into_scalar()
        .elem::<f64>()
}

fn defined(value: f64) -> Option<f64> {
    (!value.is_nan()).then_some(value)
}

fn save_model<B: Backend>(model: &U2Net<B>, path: &Path, recorder: &CompactRecorder) -> Result<()> {
    model
        .clone()
        .save_file(path, recorder)
        .map_err(|e| anyhow!("failed to save model {}: {e}", path.display()))
}
