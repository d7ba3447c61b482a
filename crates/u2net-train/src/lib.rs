//! Data pipeline for U2-Net lesion segmentation: image/mask pairing,
//! train/validation splitting, joint augmentation and batching.

pub mod augmentation;
pub mod dataset;
pub mod error;

pub use augmentation::{AugmentationConfig, AugmentationMethod, ImageAugmentor};
pub use dataset::{
    discover_pairs, split_pairs, DatasetConfig, LesionDataset, LesionItem, SamplePair,
    SegmentationBatcher,
};
pub use error::{DatasetError, DatasetResult};

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    pub type TestBackend = NdArray;
}
