//! The convolution, batch-norm and ReLU unit every residual U-block is made of.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Relu,
    },
    prelude::*,
};

/// Configuration for the [`ConvBnRelu`] block.
#[derive(Config, Debug)]
pub struct ConvBnReluConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels.
    pub out_channels: usize,
    /// Dilation of the 3x3 kernel. The input is zero-padded by the dilation
    /// so the spatial size is preserved.
    #[config(default = 1)]
    pub dilation: usize,
}

impl ConvBnReluConfig {
    /// Creates a new `ConvBnRelu` block on `device`.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ConvBnRelu<B> {
        let conv = Conv2dConfig::new([self.in_channels, self.out_channels], [3, 3])
            .with_stride([1, 1])
            .with_dilation([self.dilation, self.dilation])
            .init(device);
        let bn = BatchNormConfig::new(self.out_channels).init(device);

        ConvBnRelu {
            conv,
            padding: self.dilation,
            bn,
            relu: Relu::new(),
        }
    }
}

/// 3x3 convolution followed by batch normalization and ReLU.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, out_channels, height, width]`
#[derive(Module, Debug)]
pub struct ConvBnRelu<B: Backend> {
    conv: Conv2d<B>,
    padding: usize,
    bn: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> ConvBnRelu<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(pad_zeros(x, self.padding));
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

/// Zero-pads both spatial sides by `padding`.
///
/// The convolutions run unpadded on the result; burn-ndarray's SIMD conv
/// indexes out of bounds when its own padding reaches the feature map size.
pub fn pad_zeros<B: Backend>(x: Tensor<B, 4>, padding: usize) -> Tensor<B, 4> {
    if padding == 0 {
        return x;
    }
    x.pad((padding, padding, padding, padding), 0.0)
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Distribution, Tensor};

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn conv_bn_relu_preserves_spatial_size_for_any_dilation() {
        let device = Default::default();
        for dilation in [1, 2, 4, 8] {
            let block = ConvBnReluConfig::new(3, 5)
                .with_dilation(dilation)
                .init::<TestBackend>(&device);
            let x = Tensor::<TestBackend, 4>::random(
                [2, 3, 11, 7],
                Distribution::Normal(0.0, 1.0),
                &device,
            );
            assert_eq!(block.forward(x).dims(), [2, 5, 11, 7]);
        }
    }

    #[test]
    fn dilated_conv_runs_on_a_single_pixel() {
        let device = Default::default();
        for dilation in [1, 2, 4, 8] {
            let block = ConvBnReluConfig::new(3, 32)
                .with_dilation(dilation)
                .init::<TestBackend>(&device);
            let x = Tensor::<TestBackend, 4>::ones([1, 3, 1, 1], &device);
            assert_eq!(block.forward(x).dims(), [1, 32, 1, 1]);
        }
    }

    #[test]
    fn pad_zeros_surrounds_the_map() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 1, 2], &device);
        let padded = pad_zeros(x, 2);
        assert_eq!(padded.dims(), [1, 1, 5, 6]);
        assert_eq!(padded.sum().into_scalar(), 2.0);
    }

    #[test]
    fn conv_bn_relu_output_is_non_negative() {
        let device = Default::default();
        let block = ConvBnReluConfig::new(2, 4).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random(
            [1, 2, 6, 6],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let min = block.forward(x).min().into_scalar();
        assert!(min >= 0.0);
    }
}
