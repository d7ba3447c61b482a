use thiserror::Error;

/// The error type for U2-Net construction and model-level operations.
///
/// Forward passes are infallible once a model is built; every shape
/// inconsistency that can be detected from the stage table is reported here
/// at construction time instead.
#[derive(Error, Debug)]
pub enum U2NetError {
    /// The stage table or a model parameter is logically inconsistent.
    #[error("Invalid model configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// An input tensor does not have the shape the model expects.
    #[error("Invalid input tensor shape: expected {expected}, got {actual}")]
    InvalidTensorShape {
        /// The expected tensor shape.
        expected: String,
        /// The actual tensor shape.
        actual: String,
    },
}

/// A specialized `Result` type for U2-Net operations.
pub type U2NetResult<T> = Result<T, U2NetError>;
