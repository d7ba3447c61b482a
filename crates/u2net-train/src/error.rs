//! Error types of the dataset pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Error type for dataset discovery, loading and splitting.
#[derive(Error, Debug)]
pub enum DatasetError {
    /// Walking a dataset directory failed.
    #[error("Failed to read directory: {path}")]
    DirectoryReadFailed {
        /// The directory being read.
        path: PathBuf,
        /// The underlying walk error.
        #[source]
        source: walkdir::Error,
    },

    /// The image directory does not exist.
    #[error("Image directory not found: {path}")]
    ImageDirectoryNotFound {
        /// The expected image directory path.
        path: PathBuf,
    },

    /// The mask directory does not exist.
    #[error("Mask directory not found: {path}")]
    MaskDirectoryNotFound {
        /// The expected mask directory path.
        path: PathBuf,
    },

    /// No image in the image directory has a matching mask.
    #[error("No valid image/mask pairs found in: {path}")]
    NoValidPairs {
        /// The image directory that was scanned.
        path: PathBuf,
    },

    /// Opening or decoding an image failed.
    #[error("Failed to open image: {path}")]
    ImageOpenFailed {
        /// The file that failed to open.
        path: PathBuf,
        /// The underlying decoding error.
        #[source]
        source: image::ImageError,
    },

    /// An image and its mask differ in size.
    #[error(
        "Image {image} is {image_size:?} but its mask {mask} is {mask_size:?}"
    )]
    DimensionMismatch {
        /// The image path.
        image: PathBuf,
        /// The mask path.
        mask: PathBuf,
        /// Image `(width, height)`.
        image_size: (u32, u32),
        /// Mask `(width, height)`.
        mask_size: (u32, u32),
    },

    /// The requested train/validation split cannot be made.
    #[error("Invalid train/validation split: {reason}")]
    InvalidSplit {
        /// Why the split is impossible.
        reason: String,
    },
}

/// A specialized `Result` type for dataset operations.
pub type DatasetResult<T> = Result<T, DatasetError>;
