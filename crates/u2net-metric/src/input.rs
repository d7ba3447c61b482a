//! Input types for the segmentation metrics.

use burn::{prelude::*, tensor::backend::Backend};

/// Fused logits and ground-truth class indices of a batch.
#[derive(Debug, Clone)]
pub struct SegmentationMetricInput<B: Backend> {
    /// Logits with shape `[batch_size, classes, height, width]`.
    pub logits: Tensor<B, 4>,
    /// Class indices with shape `[batch_size, height, width]`.
    pub targets: Tensor<B, 3, Int>,
}

impl<B: Backend> SegmentationMetricInput<B> {
    pub const fn new(logits: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Self {
        Self { logits, targets }
    }
}
