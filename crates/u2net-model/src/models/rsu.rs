//! Residual U-block (RSU).
//!
//! An RSU of height `H` is a small encoder-decoder: `H - 1` encoder blocks
//! separated by pooling, a base block, and `H - 1` decoder blocks that fuse the
//! deeper result with the matching encoder output. Dilated RSUs keep the full
//! resolution throughout and grow the dilation rate with depth instead. The
//! block output is the input projection plus the nested result.

use burn::{module::Ignored, nn::pool::MaxPool2d, prelude::*};

use super::{
    conv::{ConvBnRelu, ConvBnReluConfig},
    utils::{halving_pool, max_pool_ceil, resize, SizeMap},
};
use crate::{
    config::{StageConfig, UpsampleMode},
    error::{U2NetError, U2NetResult},
};

/// Configuration for a residual U-block.
#[derive(Config, Debug)]
pub struct RsuConfig {
    /// Recursion height, at least 2.
    pub height: usize,
    /// Number of input channels.
    pub in_channels: usize,
    /// Width of the nested encoder/decoder blocks.
    pub mid_channels: usize,
    /// Number of output channels.
    pub out_channels: usize,
    /// Replace pooling with growing dilation.
    #[config(default = false)]
    pub dilated: bool,
    /// Resampling used when returning to a shallower depth.
    #[config(default = "UpsampleMode::Bilinear")]
    pub upsample: UpsampleMode,
}

impl RsuConfig {
    /// Builds the configuration of a table stage.
    pub fn from_stage(stage: &StageConfig, upsample: UpsampleMode) -> Self {
        Self::new(
            stage.height,
            stage.in_channels,
            stage.mid_channels,
            stage.out_channels,
        )
        .with_dilated(stage.dilated)
        .with_upsample(upsample)
    }

    /// Dilation of the encoder block at `depth` (and of its decoder for `depth >= 2`).
    pub fn dilation_at(&self, depth: usize) -> usize {
        let exponent = if self.dilated {
            depth - 1
        } else if depth == self.height {
            1
        } else {
            0
        };
        1 << exponent
    }

    /// Initializes the block.
    ///
    /// # Errors
    ///
    /// Returns [`U2NetError::InvalidConfiguration`] if the height is below 2 or
    /// any channel count is zero.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> U2NetResult<Rsu<B>> {
        if self.height < 2 {
            return Err(U2NetError::InvalidConfiguration {
                reason: format!("RSU height must be at least 2, got {}", self.height),
            });
        }
        if self.in_channels == 0 || self.mid_channels == 0 || self.out_channels == 0 {
            return Err(U2NetError::InvalidConfiguration {
                reason: format!(
                    "RSU channels must be non-zero, got {} -> {} -> {}",
                    self.in_channels, self.mid_channels, self.out_channels
                ),
            });
        }

        let mid = self.mid_channels;
        let input = ConvBnReluConfig::new(self.in_channels, self.out_channels).init(device);

        let encoders = (1..=self.height)
            .map(|depth| {
                let in_channels = if depth == 1 { self.out_channels } else { mid };
                ConvBnReluConfig::new(in_channels, mid)
                    .with_dilation(self.dilation_at(depth))
                    .init(device)
            })
            .collect();

        let decoders = (1..self.height)
            .map(|depth| {
                let out_channels = if depth == 1 { self.out_channels } else { mid };
                ConvBnReluConfig::new(2 * mid, out_channels)
                    .with_dilation(self.dilation_at(depth))
                    .init(device)
            })
            .collect();

        Ok(Rsu {
            input,
            encoders,
            decoders,
            pool: halving_pool(),
            height: self.height,
            dilated: self.dilated,
            upsample: Ignored(self.upsample.clone()),
        })
    }
}

/// Residual U-block.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, out_channels, height, width]`
#[derive(Module, Debug)]
pub struct Rsu<B: Backend> {
    input: ConvBnRelu<B>,
    /// `encoders[d - 1]` runs at depth `d`; the last one is the base block.
    encoders: Vec<ConvBnRelu<B>>,
    /// `decoders[d - 1]` runs at depth `d`.
    decoders: Vec<ConvBnRelu<B>>,
    pool: MaxPool2d,
    height: usize,
    dilated: bool,
    upsample: Ignored<UpsampleMode>,
}

impl<B: Backend> Rsu<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = x.dims();
        let sizes = SizeMap::new([h, w], self.height - 1);

        let x = self.input.forward(x);
        let nested = self.nest(x.clone(), 1, &sizes);
        x + nested
    }

    fn nest(&self, x: Tensor<B, 4>, depth: usize, sizes: &SizeMap) -> Tensor<B, 4> {
        if depth == self.height {
            return self.encoders[depth - 1].forward(x);
        }

        let x1 = self.encoders[depth - 1].forward(x);
        let deeper = if self.downsamples_at(depth) {
            max_pool_ceil(&self.pool, x1.clone())
        } else {
            x1.clone()
        };
        let x2 = self.nest(deeper, depth + 1, sizes);

        let x = self.decoders[depth - 1].forward(Tensor::cat(vec![x2, x1], 1));
        if self.upsamples_at(depth) {
            resize(x, sizes.at(depth - 1), &self.upsample)
        } else {
            x
        }
    }

    /// Whether the encoder output at `depth` is pooled before going deeper.
    pub const fn downsamples_at(&self, depth: usize) -> bool {
        !self.dilated && depth + 1 < self.height
    }

    /// Whether the decoder output at `depth` is resized to the shallower level.
    pub const fn upsamples_at(&self, depth: usize) -> bool {
        !self.dilated && depth > 1
    }

    /// Recursion height of the block.
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Whether the block uses dilation instead of pooling.
    pub const fn is_dilated(&self) -> bool {
        self.dilated
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Distribution, Tensor};

    use super::*;
    use crate::tests::TestBackend;

    fn input(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn rsu_preserves_spatial_size_for_every_height() {
        let device = Default::default();
        for height in 2..=7 {
            for dilated in [false, true] {
                let rsu = RsuConfig::new(height, 3, 4, 6)
                    .with_dilated(dilated)
                    .init::<TestBackend>(&device)
                    .unwrap();
                let y = rsu.forward(input([1, 3, 37, 45]));
                assert_eq!(y.dims(), [1, 6, 37, 45], "height {height}, dilated {dilated}");
            }
        }
    }

    #[test]
    fn rsu_handles_tiny_inputs() {
        let device = Default::default();
        let rsu = RsuConfig::new(7, 2, 2, 2)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(rsu.forward(input([2, 2, 1, 3])).dims(), [2, 2, 1, 3]);
    }

    #[test]
    fn rsu_with_nearest_upsampling_preserves_size() {
        let device = Default::default();
        let rsu = RsuConfig::new(5, 3, 4, 4)
            .with_upsample(UpsampleMode::Nearest)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(rsu.forward(input([1, 3, 21, 10])).dims(), [1, 4, 21, 10]);
    }

    #[test]
    fn dilated_rsu_never_resamples() {
        let device = Default::default();
        let rsu = RsuConfig::new(4, 3, 4, 4)
            .with_dilated(true)
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(rsu.is_dilated());
        for depth in 1..=rsu.height() {
            assert!(!rsu.downsamples_at(depth));
            assert!(!rsu.upsamples_at(depth));
        }
    }

    #[test]
    fn plain_rsu_resamples_everywhere_but_the_edges() {
        let device = Default::default();
        let rsu = RsuConfig::new(5, 3, 4, 4)
            .init::<TestBackend>(&device)
            .unwrap();
        let down: Vec<bool> = (1..5).map(|d| rsu.downsamples_at(d)).collect();
        let up: Vec<bool> = (1..5).map(|d| rsu.upsamples_at(d)).collect();
        assert_eq!(down, [true, true, true, false]);
        assert_eq!(up, [false, true, true, true]);
    }

    #[test]
    fn dilation_schedule() {
        let plain = RsuConfig::new(7, 3, 32, 64);
        let plain: Vec<usize> = (1..=7).map(|d| plain.dilation_at(d)).collect();
        assert_eq!(plain, [1, 1, 1, 1, 1, 1, 2]);

        let dilated = RsuConfig::new(4, 512, 256, 512).with_dilated(true);
        let dilated: Vec<usize> = (1..=4).map(|d| dilated.dilation_at(d)).collect();
        assert_eq!(dilated, [1, 2, 4, 8]);
    }

    #[test]
    fn height_one_is_rejected() {
        let device = Default::default();
        let result = RsuConfig::new(1, 3, 4, 4).init::<TestBackend>(&device);
        assert!(matches!(
            result,
            Err(U2NetError::InvalidConfiguration { .. })
        ));
    }
}
