//! Combined cross-entropy and Dice loss with optional deep supervision.
//!
//! ```text
//! L(map)  = ce_weight * CE(map, t) + dice_weight * Dice(map, t)
//! L_total = L(fused) + side_weight * sum_k L(side_k)
//! ```

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    nn::loss::{BinaryCrossEntropyLossConfig, CrossEntropyLossConfig, Reduction},
    tensor::{backend::Backend, Int, Tensor},
};

use crate::dice::{assert_targets_match, DiceLoss, DiceLossConfig};

/// Configuration for creating a [segmentation loss](SegmentationLoss).
#[derive(Config, Debug)]
pub struct SegmentationLossConfig {
    /// Weight of the pixel-wise cross-entropy term. Default: 0.5
    #[config(default = 0.5)]
    pub ce_weight: f64,
    /// Weight of the soft Dice term. Default: 1.0
    #[config(default = 1.0)]
    pub dice_weight: f64,
    /// Weight of every side prediction's loss. Default: 0.0 (fused map only)
    #[config(default = 0.0)]
    pub side_weight: f64,
    /// Dice loss settings.
    #[config(default = "DiceLossConfig::new()")]
    pub dice: DiceLossConfig,
}

impl SegmentationLossConfig {
    /// Initialize [segmentation loss](SegmentationLoss).
    pub fn init(&self) -> SegmentationLoss {
        self.assertions();
        SegmentationLoss {
            ce_weight: self.ce_weight,
            dice_weight: self.dice_weight,
            side_weight: self.side_weight,
            dice: self.dice.init(),
        }
    }

    fn assertions(&self) {
        for (name, weight) in [
            ("ce_weight", self.ce_weight),
            ("dice_weight", self.dice_weight),
            ("side_weight", self.side_weight),
        ] {
            assert!(
                weight >= 0.0,
                "{name} for SegmentationLoss must be non-negative, got {weight}"
            );
        }
    }
}

/// Weighted sum of cross-entropy and Dice over U2-Net predictions.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct SegmentationLoss {
    /// Weight of the cross-entropy term.
    pub ce_weight: f64,
    /// Weight of the Dice term.
    pub dice_weight: f64,
    /// Weight of each side prediction.
    pub side_weight: f64,
    /// Dice criterion.
    pub dice: DiceLoss,
}

impl Default for SegmentationLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleDisplay for SegmentationLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("ce_weight", &self.ce_weight)
            .add("dice_weight", &self.dice_weight)
            .add("side_weight", &self.side_weight)
            .optional()
    }
}

impl SegmentationLoss {
    /// Create a new segmentation loss with default configuration.
    pub fn new() -> Self {
        SegmentationLossConfig::new().init()
    }

    /// Loss over the network outputs, fused prediction first.
    ///
    /// # Shapes
    ///
    /// - maps: each `[batch_size, classes, height, width]`
    /// - targets: `[batch_size, height, width]`
    /// - output: `[1]`
    pub fn forward<B: Backend>(
        &self,
        maps: &[Tensor<B, 4>],
        targets: Tensor<B, 3, Int>,
    ) -> Tensor<B, 1> {
        assert!(
            !maps.is_empty(),
            "SegmentationLoss needs at least the fused prediction"
        );
        let mut total = self.forward_map(maps[0].clone(), targets.clone());
        if self.side_weight > 0.0 {
            for side in &maps[1..] {
                let side_loss = self.forward_map(side.clone(), targets.clone());
                total = total + side_loss.mul_scalar(self.side_weight);
            }
        }
        total
    }

    /// Loss of a single prediction map.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, classes, height, width]`
    /// - targets: `[batch_size, height, width]`
    /// - output: `[1]`
    pub fn forward_map<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
    ) -> Tensor<B, 1> {
        let ce = cross_entropy(logits.clone(), targets.clone());
        let dice = self.dice.forward(logits, targets, Reduction::Mean);
        ce.mul_scalar(self.ce_weight) + dice.mul_scalar(self.dice_weight)
    }
}

/// Mean pixel-wise cross-entropy of class logits against class indices.
///
/// A single channel is scored as a binary foreground logit.
///
/// # Shapes
///
/// - logits: `[batch_size, classes, height, width]`
/// - targets: `[batch_size, height, width]`
/// - output: `[1]`
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Tensor<B, 1> {
    assert_targets_match(&logits, &targets);
    let [batch_size, classes, height, width] = logits.dims();
    let pixels = batch_size * height * width;
    let device = logits.device();

    if classes == 1 {
        let logits = logits.reshape([pixels]);
        let targets = targets.greater_elem(0).int().reshape([pixels]);
        return BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&device)
            .forward(logits, targets);
    }

    // [B, C, H, W] -> [B * H * W, C]
    let logits = logits.permute([0, 2, 3, 1]).reshape([pixels, classes]);
    let targets = targets.reshape([pixels]);
    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(logits, targets)
}
