//! # U2-Net metrics
//!
//! Evaluation of lesion segmentation on hard (arg-max) masks.
//!
//! - [`DiceMetric`]: mean Dice coefficient per image.
//! - [`IoUMetric`]: mean intersection over union per image.
//! - [`segmentation_scores`]: the per-image scores both metrics build on.
//!
//! Images whose ground truth contains no lesion have no defined score and are
//! left out of the mean, so an epoch without any lesion reports `NaN`.
//! Loss tracking uses Burn's own `LossMetric`.

mod dice;
mod input;
mod iou;
mod scores;

pub use dice::DiceMetric;
pub use input::SegmentationMetricInput;
pub use iou::IoUMetric;
pub use scores::{mask_scores, predict_mask, segmentation_scores, MeanAccumulator, SegmentationScore};
