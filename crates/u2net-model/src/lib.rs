//! # U2-Net
//!
//! A Burn implementation of U2-Net, the nested U-structure network used here
//! to segment lesions in retinal fundus images.
//!
//! ## Modules
//!
//! - `config`: stage tables for the `full` and `lite` variants and the enums
//!   that select them.
//! - `error`: the crate error type.
//! - `models`: the convolution unit, the residual U-block and the network.
//! - `training` (feature `train`): batch and output types plus the
//!   `TrainStep`/`ValidStep` implementations.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use burn::backend::NdArray;
//! use u2net_model::{build, U2NetVariant};
//!
//! let device = Default::default();
//! let model = build::<NdArray>(U2NetVariant::Lite, 1, &device)?;
//! let maps = model.forward(images); // fused map first, then six side maps
//! ```

mod config;
mod error;
mod models;

#[cfg(feature = "train")]
pub mod training;

#[doc(inline)]
pub use config::{StageConfig, StageTable, U2NetVariant, UpsampleMode};
#[doc(inline)]
pub use error::{U2NetError, U2NetResult};
#[doc(inline)]
pub use models::{
    conv::{ConvBnRelu, ConvBnReluConfig},
    rsu::{Rsu, RsuConfig},
    u2net::{build, Stage, U2Net, U2NetConfig, U2NetRecord},
    utils::SizeMap,
};
#[cfg(feature = "train")]
#[doc(inline)]
pub use training::{SegmentationBatch, SegmentationOutput};

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    pub type TestBackend = NdArray<f32>;

    #[cfg(feature = "train")]
    pub type TestAutodiffBackend = Autodiff<TestBackend>;
}
