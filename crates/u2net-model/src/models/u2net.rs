//! The nested U2-Net.
//!
//! Six RSU encoder stages and five RSU decoder stages arranged in a U-shape.
//! Every decoder stage and the bottleneck emit a side prediction at the input
//! resolution; the side predictions are concatenated and fused by a 1x1
//! convolution into the final map. All maps are raw logits.

use burn::{
    module::Ignored,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::MaxPool2d,
    },
    prelude::*,
};
#[cfg(feature = "train")]
use burn::{
    tensor::backend::AutodiffBackend,
    train::{TrainOutput, TrainStep, ValidStep},
};
#[cfg(feature = "train")]
use u2net_loss::{SegmentationLoss, SegmentationLossConfig};

use super::{
    conv::pad_zeros,
    rsu::{Rsu, RsuConfig},
    utils::{halving_pool, max_pool_ceil, resize, SizeMap},
};
#[cfg(feature = "train")]
use crate::training::{SegmentationBatch, SegmentationOutput};
use crate::{
    config::{StageConfig, StageTable, U2NetVariant, UpsampleMode},
    error::{U2NetError, U2NetResult},
};

/// Configuration for the [`U2Net`] model.
#[derive(Config, Debug)]
pub struct U2NetConfig {
    /// Encoder and decoder stage descriptions.
    pub stages: StageTable,
    /// Number of channels of every prediction map.
    #[config(default = 1)]
    pub out_channels: usize,
    /// Resampling used between depths and for side outputs.
    #[config(default = "UpsampleMode::Bilinear")]
    pub upsample: UpsampleMode,
    /// Loss used by the train and valid steps.
    #[cfg(feature = "train")]
    pub loss: Option<SegmentationLossConfig>,
}

impl U2NetConfig {
    /// Configuration of a published variant.
    pub fn from_variant(variant: &U2NetVariant, out_channels: usize) -> Self {
        Self::new(StageTable::for_variant(variant)).with_out_channels(out_channels)
    }

    /// Replaces the number of input image channels.
    pub fn with_in_channels(mut self, in_channels: usize) -> Self {
        self.stages = self.stages.with_in_channels(in_channels);
        self
    }

    /// Initializes a `U2Net` with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`U2NetError::InvalidConfiguration`] if the stage table is
    /// inconsistent or `out_channels` is zero.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> U2NetResult<U2Net<B>> {
        if self.out_channels == 0 {
            return Err(U2NetError::InvalidConfiguration {
                reason: "out_channels must be at least 1".to_owned(),
            });
        }
        self.stages.validate()?;

        let encoders = self
            .stages
            .encoders
            .iter()
            .map(|stage| self.init_stage(stage, device))
            .collect::<U2NetResult<Vec<_>>>()?;
        let decoders = self
            .stages
            .decoders
            .iter()
            .map(|stage| self.init_stage(stage, device))
            .collect::<U2NetResult<Vec<_>>>()?;

        let side_count = self.stages.side_count();
        let fuse = Conv2dConfig::new([side_count * self.out_channels, self.out_channels], [1, 1])
            .init(device);

        Ok(U2Net {
            encoders,
            decoders,
            fuse,
            pool: halving_pool(),
            height: self.stages.height(),
            in_channels: self.stages.in_channels(),
            out_channels: self.out_channels,
            side_count,
            upsample: Ignored(self.upsample.clone()),
            #[cfg(feature = "train")]
            loss: self.loss.as_ref().map(SegmentationLossConfig::init),
        })
    }

    fn init_stage<B: Backend>(
        &self,
        stage: &StageConfig,
        device: &Device<B>,
    ) -> U2NetResult<Stage<B>> {
        let rsu = RsuConfig::from_stage(stage, self.upsample.clone()).init(device)?;
        let side = stage
            .side
            .map(|channels| Conv2dConfig::new([channels, self.out_channels], [3, 3]).init(device));
        Ok(Stage { rsu, side })
    }
}

/// Builds a published U2-Net variant with `out_channels` prediction channels.
///
/// # Errors
///
/// Returns [`U2NetError::InvalidConfiguration`] if `out_channels` is zero.
pub fn build<B: Backend>(
    variant: U2NetVariant,
    out_channels: usize,
    device: &Device<B>,
) -> U2NetResult<U2Net<B>> {
    U2NetConfig::from_variant(&variant, out_channels).init(device)
}

/// One RSU stage with its optional side-output head.
#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    rsu: Rsu<B>,
    side: Option<Conv2d<B>>,
}

impl<B: Backend> Stage<B> {
    /// The stage's residual U-block.
    pub const fn rsu(&self) -> &Rsu<B> {
        &self.rsu
    }

    /// Whether the stage emits a side prediction.
    pub const fn has_side(&self) -> bool {
        self.side.is_some()
    }
}

/// U2-Net: a U-shaped network of residual U-blocks with deep supervision.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `1 + side_count` maps of `[batch_size, out_channels, height, width]`
#[derive(Module, Debug)]
pub struct U2Net<B: Backend> {
    /// `encoders[d - 1]` runs at depth `d`; the last one is the bottleneck.
    encoders: Vec<Stage<B>>,
    /// `decoders[d - 1]` runs at depth `d`.
    decoders: Vec<Stage<B>>,
    fuse: Conv2d<B>,
    pool: MaxPool2d,
    height: usize,
    in_channels: usize,
    out_channels: usize,
    side_count: usize,
    upsample: Ignored<UpsampleMode>,
    #[cfg(feature = "train")]
    loss: Option<SegmentationLoss>,
}

impl<B: Backend> U2Net<B> {
    /// Runs the network.
    ///
    /// Returns the fused prediction followed by the side predictions ordered
    /// from the shallowest stage to the bottleneck.
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let [_, _, h, w] = images.dims();
        let sizes = SizeMap::new([h, w], self.height - 1);

        let mut sides = Vec::with_capacity(self.side_count);
        self.traverse(images, 1, &sizes, &mut sides);
        sides.reverse();

        let fused = self.fuse.forward(Tensor::cat(sides.clone(), 1));

        let mut maps = Vec::with_capacity(sides.len() + 1);
        maps.push(fused);
        maps.extend(sides);
        maps
    }

    /// Runs the network and keeps only the fused prediction.
    pub fn forward_fused(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = images.dims();
        let sizes = SizeMap::new([h, w], self.height - 1);

        let mut sides = Vec::with_capacity(self.side_count);
        self.traverse(images, 1, &sizes, &mut sides);
        sides.reverse();

        self.fuse.forward(Tensor::cat(sides, 1))
    }

    fn traverse(
        &self,
        x: Tensor<B, 4>,
        depth: usize,
        sizes: &SizeMap,
        sides: &mut Vec<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let encoder = &self.encoders[depth - 1];

        if depth == self.height {
            let x = encoder.rsu.forward(x);
            self.record_side(encoder, &x, sizes, sides);
            return resize(x, sizes.at(depth - 1), &self.upsample);
        }

        let x1 = encoder.rsu.forward(x);
        self.record_side(encoder, &x1, sizes, sides);
        let x2 = self.traverse(max_pool_ceil(&self.pool, x1.clone()), depth + 1, sizes, sides);

        let decoder = &self.decoders[depth - 1];
        let x = decoder.rsu.forward(Tensor::cat(vec![x2, x1], 1));
        self.record_side(decoder, &x, sizes, sides);

        if depth > 1 {
            resize(x, sizes.at(depth - 1), &self.upsample)
        } else {
            x
        }
    }

    fn record_side(
        &self,
        stage: &Stage<B>,
        x: &Tensor<B, 4>,
        sizes: &SizeMap,
        sides: &mut Vec<Tensor<B, 4>>,
    ) {
        if let Some(side) = &stage.side {
            let logits = side.forward(pad_zeros(x.clone(), 1));
            sides.push(resize(logits, sizes.at(1), &self.upsample));
        }
    }

    /// Checks that `dims` is an image batch this model accepts.
    ///
    /// # Errors
    ///
    /// Returns [`U2NetError::InvalidTensorShape`] if the channel count differs
    /// from the first stage's input or a spatial side is zero.
    pub fn check_input(&self, dims: [usize; 4]) -> U2NetResult<()> {
        let [batch, channels, height, width] = dims;
        if channels != self.in_channels || batch == 0 || height == 0 || width == 0 {
            return Err(U2NetError::InvalidTensorShape {
                expected: format!("[N > 0, {}, H > 0, W > 0]", self.in_channels),
                actual: format!("{dims:?}"),
            });
        }
        Ok(())
    }

    /// Encoder stages, shallowest first.
    pub fn encoders(&self) -> &[Stage<B>] {
        &self.encoders
    }

    /// Decoder stages, shallowest first.
    pub fn decoders(&self) -> &[Stage<B>] {
        &self.decoders
    }

    /// Number of side predictions, i.e. `forward` returns one map more.
    pub const fn side_count(&self) -> usize {
        self.side_count
    }

    /// Number of input channels.
    pub const fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Number of channels of every prediction map.
    pub const fn out_channels(&self) -> usize {
        self.out_channels
    }
}

#[cfg(feature = "train")]
impl<B: Backend> U2Net<B> {
    /// Runs the network on a batch and scores it against the batch masks.
    pub fn forward_segmentation(&self, batch: SegmentationBatch<B>) -> SegmentationOutput<B> {
        let mut maps = self.forward(batch.images);
        let loss = match &self.loss {
            Some(loss) => loss.forward(&maps, batch.masks.clone()),
            None => SegmentationLossConfig::new()
                .init()
                .forward(&maps, batch.masks.clone()),
        };
        // Element 0 is always the fused map.
        let fused = maps.swap_remove(0);
        SegmentationOutput::new(loss, fused, batch.masks)
    }
}

#[cfg(feature = "train")]
impl<B: AutodiffBackend> TrainStep<SegmentationBatch<B>, SegmentationOutput<B>> for U2Net<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> TrainOutput<SegmentationOutput<B>> {
        let item = self.forward_segmentation(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

#[cfg(feature = "train")]
impl<B: Backend> ValidStep<SegmentationBatch<B>, SegmentationOutput<B>> for U2Net<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> SegmentationOutput<B> {
        self.forward_segmentation(batch)
    }
}


#[cfg(all(test, feature = "train"))]
mod train_tests {
    use burn::{
        tensor::{Distribution, Int, Tensor, TensorData},
        train::{TrainStep, ValidStep},
    };

    use super::*;
    use crate::tests::{TestAutodiffBackend, TestBackend};

    fn lite_nearest() -> U2NetConfig {
        U2NetConfig::from_variant(&U2NetVariant::Lite, 2)
            .with_upsample(UpsampleMode::Nearest)
            .with_loss(Some(SegmentationLossConfig::new()))
    }

    fn masks<B: Backend>(device: &B::Device) -> Tensor<B, 3, Int> {
        let values: Vec<i64> = (0..2 * 16 * 16).map(|i| i64::from(i % 5 == 0)).collect();
        Tensor::from_data(TensorData::new(values, [2, 16, 16]), device)
    }

    #[test]
    fn train_step_produces_finite_loss_and_gradients() {
        let device = Default::default();
        let model = lite_nearest().init::<TestAutodiffBackend>(&device).unwrap();
        let images = Tensor::random([2, 3, 16, 16], Distribution::Default, &device);
        let batch = SegmentationBatch::new(images, masks(&device));

        let output = TrainStep::step(&model, batch);
        let loss = output.item.loss.into_scalar();
        assert!(loss.is_finite());
        assert!(loss > 0.0);
        assert_eq!(output.item.output.dims(), [2, 2, 16, 16]);
    }

    #[test]
    fn lite_backward_pass_on_tiny_inputs() {
        let device = Default::default();
        let model = lite_nearest().init::<TestAutodiffBackend>(&device).unwrap();
        for size in [1, 2, 8, 33] {
            let images = Tensor::random([1, 3, size, size], Distribution::Default, &device);
            let maps = model.forward(images);
            assert!(maps.iter().all(|map| map.dims() == [1, 2, size, size]));

            let grads = Tensor::cat(maps, 1).sum().backward();
            let fuse = model.fuse.weight.grad(&grads).unwrap();
            assert_eq!(fuse.dims(), [2, 12, 1, 1]);
        }
    }

    #[test]
    fn valid_step_keeps_targets() {
        let device = Default::default();
        let model = lite_nearest().init::<TestBackend>(&device).unwrap();
        let images = Tensor::random([2, 3, 16, 16], Distribution::Default, &device);
        let batch = SegmentationBatch::new(images, masks(&device));

        let output = ValidStep::step(&model, batch);
        assert_eq!(output.targets.dims(), [2, 16, 16]);
        assert!(output.loss.into_scalar().is_finite());
    }
}
