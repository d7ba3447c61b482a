//! Soft Dice loss over class probabilities.
//!
//! ```text
//! Dice_c = (2 * sum(p_c * t_c) + s) / (sum(p_c) + sum(t_c) + s)
//! Loss   = 1 - mean_c(Dice_c)
//! ```
//!
//! Multi-class logits go through a softmax and the targets are one-hot
//! encoded; the background class is skipped unless requested. A single
//! output channel is treated as a binary foreground logit with a sigmoid.

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    nn::loss::Reduction,
    tensor::{
        activation::{sigmoid, softmax},
        backend::Backend,
        Int, Tensor,
    },
};

/// Configuration for creating a [Dice loss](DiceLoss).
#[derive(Config, Debug)]
pub struct DiceLossConfig {
    /// Smoothing added to numerator and denominator. Default: 1e-5
    #[config(default = 1e-5)]
    pub smooth: f64,
    /// Score the background class (index 0) too. Default: false
    #[config(default = false)]
    pub include_background: bool,
}

impl DiceLossConfig {
    /// Initialize [Dice loss](DiceLoss).
    pub fn init(&self) -> DiceLoss {
        self.assertions();
        DiceLoss {
            smooth: self.smooth,
            include_background: self.include_background,
        }
    }

    fn assertions(&self) {
        assert!(
            self.smooth > 0.0,
            "Smoothing for DiceLoss must be positive, got {}",
            self.smooth
        );
    }
}

/// Soft Dice loss for semantic segmentation.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct DiceLoss {
    /// Smoothing added to numerator and denominator.
    pub smooth: f64,
    /// Whether the background class is scored.
    pub include_background: bool,
}

impl Default for DiceLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleDisplay for DiceLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("smooth", &self.smooth)
            .add("include_background", &self.include_background)
            .optional()
    }
}

impl DiceLoss {
    /// Create a new Dice loss with default configuration.
    pub fn new() -> Self {
        DiceLossConfig::new().init()
    }

    /// Compute the criterion with reduction.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, classes, height, width]`
    /// - targets: `[batch_size, height, width]`
    /// - output: `[1]`
    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
        reduction: Reduction,
    ) -> Tensor<B, 1> {
        let loss = self.forward_no_reduction(logits, targets);
        match reduction {
            Reduction::Mean | Reduction::Auto => loss.mean(),
            Reduction::Sum => loss.sum(),
        }
    }

    /// Compute the criterion per sample, averaged over the scored classes.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, classes, height, width]`
    /// - targets: `[batch_size, height, width]`
    /// - output: `[batch_size]`
    pub fn forward_no_reduction<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
    ) -> Tensor<B, 1> {
        assert_targets_match(&logits, &targets);
        let [batch_size, classes, height, width] = logits.dims();

        let (probs, onehot, first) = if classes == 1 {
            let foreground = targets.greater_elem(0).float().unsqueeze_dim::<4>(1);
            (sigmoid(logits), foreground, 0)
        } else {
            let first = usize::from(!self.include_background);
            (softmax(logits, 1), one_hot(targets, classes), first)
        };

        let scored = classes - first;
        let probs = probs
            .narrow(1, first, scored)
            .reshape([batch_size, scored, height * width]);
        let onehot = onehot
            .narrow(1, first, scored)
            .reshape([batch_size, scored, height * width]);

        let intersection = (probs.clone() * onehot.clone()).sum_dim(2);
        let denominator = probs.sum_dim(2) + onehot.sum_dim(2);
        let dice = intersection
            .mul_scalar(2.0)
            .add_scalar(self.smooth)
            .div(denominator.add_scalar(self.smooth));

        // [B, C', 1] -> [B]
        dice.neg()
            .add_scalar(1.0)
            .mean_dim(1)
            .reshape([batch_size])
    }
}

/// One-hot encodes class indices along a new channel axis.
///
/// # Shapes
///
/// - targets: `[batch_size, height, width]`
/// - output: `[batch_size, classes, height, width]`
pub fn one_hot<B: Backend>(targets: Tensor<B, 3, Int>, classes: usize) -> Tensor<B, 4> {
    let planes = (0..classes)
        .map(|class| {
            targets
                .clone()
                .equal_elem(class as i64)
                .float()
                .unsqueeze_dim::<4>(1)
        })
        .collect();
    Tensor::cat(planes, 1)
}

pub(crate) fn assert_targets_match<B: Backend>(logits: &Tensor<B, 4>, targets: &Tensor<B, 3, Int>) {
    let [batch_size, _, height, width] = logits.dims();
    let target_dims = targets.dims();
    assert_eq!(
        [batch_size, height, width],
        target_dims,
        "Targets {target_dims:?} must match the logits' batch and spatial dims {:?}",
        logits.dims()
    );
}
