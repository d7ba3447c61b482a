//! Segmentation losses for training U2-Net on lesion masks.
//!
//! - [`DiceLoss`]: soft Dice over softmax probabilities, background excluded
//!   by default.
//! - [`cross_entropy`]: pixel-wise cross-entropy against class indices.
//! - [`SegmentationLoss`]: `ce_weight * CE + dice_weight * Dice` on the fused
//!   prediction, optionally adding every side prediction for deep supervision.
//!
//! All losses follow Burn's `Config` + `Module` conventions and work with any
//! backend.
//!
//! ```rust,ignore
//! use u2net_loss::SegmentationLossConfig;
//!
//! let loss = SegmentationLossConfig::new().with_side_weight(0.2).init();
//! let value = loss.forward(&maps, masks);
//! ```

mod dice;
mod segmentation;

pub use dice::{one_hot, DiceLoss, DiceLossConfig};
pub use segmentation::{cross_entropy, SegmentationLoss, SegmentationLossConfig};
