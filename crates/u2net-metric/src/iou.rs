//! Intersection-over-union metric on hard lesion masks.

use core::marker::PhantomData;

use burn::{
    tensor::backend::Backend,
    train::metric::{Metric, MetricEntry, MetricMetadata, Numeric},
};

use super::{
    dice::entry,
    input::SegmentationMetricInput,
    scores::{segmentation_scores, MeanAccumulator},
};

/// Mean IoU over every image with a non-empty ground truth.
#[derive(Default)]
pub struct IoUMetric<B: Backend> {
    state: MeanAccumulator,
    _b: PhantomData<B>,
}

impl<B: Backend> IoUMetric<B> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B: Backend> Metric for IoUMetric<B> {
    type Input = SegmentationMetricInput<B>;

    fn name(&self) -> String {
        "IoU".to_owned()
    }

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> MetricEntry {
        let scores = segmentation_scores(item.logits.clone(), item.targets.clone());
        let mut batch = MeanAccumulator::new();
        for score in scores {
            batch.push(score.iou);
            self.state.push(score.iou);
        }
        entry(self.name(), batch.mean(), self.value())
    }

    fn clear(&mut self) {
        self.state.reset();
    }
}

impl<B: Backend> Numeric for IoUMetric<B> {
    fn value(&self) -> f64 {
        self.state.mean().unwrap_or(f64::NAN)
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Int, Tensor, TensorData};

    use super::*;
    use crate::tests::{metadata, TestBackend};

    #[test]
    fn iou_metric_of_half_overlap() {
        let device = Default::default();
        let mut metric = IoUMetric::<TestBackend>::new();
        // Predicts lesion on both pixels, ground truth marks one.
        let logits = Tensor::<TestBackend, 4>::from_data(
            TensorData::from([[[[0.0f32, 0.0]], [[1.0, 1.0]]]]),
            &device,
        );
        let targets =
            Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[1, 0]]]), &device);

        metric.update(&SegmentationMetricInput::new(logits, targets), &metadata());
        assert_eq!(metric.value(), 0.5);
        assert_eq!(metric.name(), "IoU");
    }
}
