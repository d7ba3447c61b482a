//! Batch and output types shared by the model's train/valid steps, the
//! dataset batcher and the metrics.

use burn::{
    prelude::*,
    tensor::backend::Backend,
    train::metric::{Adaptor, ItemLazy, LossInput},
};
use u2net_metric::SegmentationMetricInput;

/// A batch of fundus images and their lesion masks.
#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    /// Images with shape `[batch_size, 3, height, width]`, values in `[0, 1]`.
    pub images: Tensor<B, 4>,
    /// Class indices with shape `[batch_size, height, width]`.
    pub masks: Tensor<B, 3, Int>,
}

impl<B: Backend> SegmentationBatch<B> {
    pub const fn new(images: Tensor<B, 4>, masks: Tensor<B, 3, Int>) -> Self {
        Self { images, masks }
    }

    pub fn batch_size(&self) -> usize {
        self.images.dims()[0]
    }
}

/// Result of a train or valid step.
#[derive(Debug, Clone)]
pub struct SegmentationOutput<B: Backend> {
    /// Scalar loss of the batch.
    pub loss: Tensor<B, 1>,
    /// Fused logits with shape `[batch_size, classes, height, width]`.
    pub output: Tensor<B, 4>,
    /// Class indices with shape `[batch_size, height, width]`.
    pub targets: Tensor<B, 3, Int>,
}

impl<B: Backend> SegmentationOutput<B> {
    pub const fn new(loss: Tensor<B, 1>, output: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Self {
        Self {
            loss,
            output,
            targets,
        }
    }
}

impl<B: Backend> ItemLazy for SegmentationOutput<B> {
    type ItemSync = Self;

    fn sync(self) -> Self::ItemSync {
        self
    }
}

impl<B: Backend> Adaptor<LossInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> Adaptor<SegmentationMetricInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> SegmentationMetricInput<B> {
        SegmentationMetricInput::new(self.output.clone(), self.targets.clone())
    }
}
