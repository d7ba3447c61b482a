//! Compile-time backend choice for the `u2net` binary.
//!
//! `cuda` wins over `wgpu`; without either, training and inference run on
//! the ndarray CPU backend. The device and autodiff types follow from the
//! chosen backend.

use burn::{backend::Autodiff, tensor::backend::Backend};
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        pub type SelectedBackend = burn::backend::Cuda;
        const BACKEND_NAME: &str = "CUDA (NVIDIA GPU)";
    } else if #[cfg(feature = "wgpu")] {
        pub type SelectedBackend = burn::backend::Wgpu;
        const BACKEND_NAME: &str = "WGPU (GPU)";
    } else {
        pub type SelectedBackend = burn::backend::NdArray;
        const BACKEND_NAME: &str = "NdArray (CPU)";
    }
}

/// Device of [`SelectedBackend`].
pub type SelectedDevice = <SelectedBackend as Backend>::Device;

/// Autodiff wrapper of [`SelectedBackend`], used for training.
pub type SelectedAutodiffBackend = Autodiff<SelectedBackend>;

/// Default device of the selected backend.
pub fn create_device() -> SelectedDevice {
    let device = SelectedDevice::default();
    tracing::debug!(backend = BACKEND_NAME, ?device, "device selected");
    device
}

/// Human-readable name of the selected backend.
pub const fn get_backend_name() -> &'static str {
    BACKEND_NAME
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selected_device_is_the_backend_default() {
        assert_eq!(create_device(), SelectedDevice::default());
        assert!(!get_backend_name().is_empty());
    }
}
