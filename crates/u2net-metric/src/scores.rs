//! Per-image Dice and IoU on hard lesion masks.
//!
//! Predictions are the arg-max class of the logits (or `logit > 0` for a
//! single channel); any non-zero class counts as lesion. Images whose ground
//! truth holds no lesion pixel have no defined score and are skipped when
//! averaging.

use burn::{prelude::*, tensor::backend::Backend};

/// Scores of a single image. `None` when the ground truth is empty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentationScore {
    /// `2|G ∩ P| / (|G| + |P|)`
    pub dice: Option<f64>,
    /// `|G ∩ P| / |G ∪ P|`
    pub iou: Option<f64>,
}

impl SegmentationScore {
    /// Scores from pixel counts.
    pub fn from_counts(intersection: f64, ground_truth: f64, predicted: f64) -> Self {
        if ground_truth <= 0.0 {
            return Self {
                dice: None,
                iou: None,
            };
        }
        let union = ground_truth + predicted - intersection;
        Self {
            dice: Some(2.0 * intersection / (ground_truth + predicted)),
            iou: Some(intersection / union),
        }
    }
}

/// Hard class prediction of every pixel.
///
/// # Shapes
///
/// - logits: `[batch_size, classes, height, width]`
/// - output: `[batch_size, height, width]`
pub fn predict_mask<B: Backend>(logits: Tensor<B, 4>) -> Tensor<B, 3, Int> {
    let [batch_size, classes, height, width] = logits.dims();
    let prediction = if classes == 1 {
        logits.greater_elem(0.0).int()
    } else {
        logits.argmax(1)
    };
    prediction.reshape([batch_size, height, width])
}

/// Dice and IoU of every image of the batch.
///
/// # Shapes
///
/// - logits: `[batch_size, classes, height, width]`
/// - targets: `[batch_size, height, width]`
pub fn segmentation_scores<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
) -> Vec<SegmentationScore> {
    let [batch_size, ..] = logits.dims();
    mask_scores(predict_mask(logits), targets, batch_size)
}

/// Dice and IoU of hard predictions against targets.
pub fn mask_scores<B: Backend>(
    predictions: Tensor<B, 3, Int>,
    targets: Tensor<B, 3, Int>,
    batch_size: usize,
) -> Vec<SegmentationScore> {
    let predicted = predictions
        .greater_elem(0)
        .float()
        .reshape([batch_size as i32, -1]);
    let ground_truth = targets
        .greater_elem(0)
        .float()
        .reshape([batch_size as i32, -1]);

    let intersection = (predicted.clone() * ground_truth.clone()).sum_dim(1);
    // [B, 3]: intersection, |G|, |P|
    let counts = Tensor::cat(
        vec![intersection, ground_truth.sum_dim(1), predicted.sum_dim(1)],
        1,
    );
    let counts: Vec<f64> = counts.into_data().iter::<f64>().collect();

    counts
        .chunks_exact(3)
        .map(|c| SegmentationScore::from_counts(c[0], c[1], c[2]))
        .collect()
}

/// Running mean over defined scores.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeanAccumulator {
    sum: f64,
    count: usize,
}

impl MeanAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a score; undefined scores are skipped.
    pub fn push(&mut self, value: Option<f64>) {
        if let Some(value) = value {
            self.sum += value;
            self.count += 1;
        }
    }

    /// Mean of the defined scores, `None` if there were none.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Number of defined scores seen.
    pub const fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
