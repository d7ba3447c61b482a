//! Dice coefficient metric on hard lesion masks.

use core::marker::PhantomData;

use burn::{
    tensor::backend::Backend,
    train::metric::{Metric, MetricEntry, MetricMetadata, Numeric},
};

use super::{
    input::SegmentationMetricInput,
    scores::{segmentation_scores, MeanAccumulator},
};

/// Mean Dice over every image with a non-empty ground truth seen since the
/// last [`clear`](Metric::clear).
#[derive(Default)]
pub struct DiceMetric<B: Backend> {
    state: MeanAccumulator,
    _b: PhantomData<B>,
}

impl<B: Backend> DiceMetric<B> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B: Backend> Metric for DiceMetric<B> {
    type Input = SegmentationMetricInput<B>;

    fn name(&self) -> String {
        "Dice".to_owned()
    }

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> MetricEntry {
        let scores = segmentation_scores(item.logits.clone(), item.targets.clone());
        let mut batch = MeanAccumulator::new();
        for score in scores {
            batch.push(score.dice);
            self.state.push(score.dice);
        }
        entry(self.name(), batch.mean(), self.value())
    }

    fn clear(&mut self) {
        self.state.reset();
    }
}

impl<B: Backend> Numeric for DiceMetric<B> {
    fn value(&self) -> f64 {
        self.state.mean().unwrap_or(f64::NAN)
    }
}

/// Formats a batch value next to the running mean.
pub(crate) fn entry(name: String, batch: Option<f64>, running: f64) -> MetricEntry {
    let batch = batch.unwrap_or(f64::NAN);
    let formatted = format!("epoch {running:.4} - batch {batch:.4}");
    MetricEntry::new(name, formatted, running.to_string())
}
