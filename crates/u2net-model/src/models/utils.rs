use burn::{
    nn::pool::{MaxPool2d, MaxPool2dConfig},
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::config::UpsampleMode;

/// Spatial size of the feature map at every recursion depth of a forward pass.
///
/// Depth 1 holds the input size; each deeper level halves the previous one,
/// rounding up, which is exactly what a 2x2 ceil-mode max-pool produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeMap {
    sizes: Vec<[usize; 2]>,
}

impl SizeMap {
    /// Computes the sizes of depths `1..=depths` for an input of `[height, width]`.
    pub fn new(input: [usize; 2], depths: usize) -> Self {
        let mut sizes = Vec::with_capacity(depths);
        let mut size = input;
        for _ in 0..depths {
            sizes.push(size);
            size = [size[0].div_ceil(2), size[1].div_ceil(2)];
        }
        Self { sizes }
    }

    /// Size recorded for `depth` (1-based).
    ///
    /// # Panics
    ///
    /// Panics if `depth` is 0 or deeper than the map was built for.
    pub fn at(&self, depth: usize) -> [usize; 2] {
        self.sizes[depth - 1]
    }

    /// Number of depths in the map.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    /// Whether the map holds no depth at all.
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// Creates the 2x2, stride 2 max-pool used between recursion levels.
pub fn halving_pool() -> MaxPool2d {
    MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()
}

/// Max-pools with ceiling rounding of the output size.
///
/// Odd sides are padded on the right/bottom with the lowest float so the last
/// window only ever selects real values.
pub fn max_pool_ceil<B: Backend>(pool: &MaxPool2d, x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    let x = if h % 2 == 1 || w % 2 == 1 {
        x.pad((0, w % 2, 0, h % 2), B::FloatElem::from_elem(f32::MIN))
    } else {
        x
    };
    pool.forward(x)
}

/// Resizes `x` to `size`, returning it untouched if it already matches.
///
/// Burn's bilinear mode aligns corners, unlike a half-pixel resize.
pub fn resize<B: Backend>(x: Tensor<B, 4>, size: [usize; 2], mode: &UpsampleMode) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    if [h, w] == size {
        return x;
    }
    let mode = match mode {
        UpsampleMode::Bilinear => InterpolateMode::Bilinear,
        UpsampleMode::Nearest => InterpolateMode::Nearest,
    };
    interpolate(x, size, InterpolateOptions::new(mode))
}
