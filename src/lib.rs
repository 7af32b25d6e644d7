//! # MelVAE Burn
//!
//! A streaming neural audio codec in pure Rust using the Burn framework:
//! a convolutional variational autoencoder over normalized mel features,
//! paired with a MelGAN vocoder that renders mel frames back to audio.
//!
//! ## Architecture
//!
//! ```text
//! Audio -> (CausalBuffer) -> Mel [1, n_mels, T] -> ConvEncoder -> mean [1, L, T/R]
//!   -> PCA forward -> (external control) -> PCA inverse
//!   -> ConvDecoder -> sigmoid -> Mel [1, n_mels, T] -> MelGAN -> Audio
//! ```
//!
//! In cached mode every call consumes exactly `buffer_size` samples and
//! produces one latent frame, so the codec can run inside a real-time host.

pub mod audio;
pub mod checkpoint;
pub mod model;
pub mod wrapper;

pub use audio::AudioBuffer;
pub use wrapper::{Wrapper, WrapperOptions};

/// Tensor backend used by every model in the crate.
#[cfg(not(feature = "wgpu"))]
pub type Backend = burn::backend::NdArray<f32>;

/// Tensor backend used by every model in the crate.
#[cfg(feature = "wgpu")]
pub type Backend = burn::backend::Wgpu;

/// Device type of [`Backend`].
pub type Device = <Backend as burn::tensor::backend::Backend>::Device;

/// Inference mode, fixed when a model is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    /// Whole windows at once, no buffering.
    Batch,
    /// One fixed-size chunk per call with cached left context.
    Cached,
}

impl CodecMode {
    pub fn from_cached_flag(use_cached_padding: bool) -> Self {
        if use_cached_padding {
            CodecMode::Cached
        } else {
            CodecMode::Batch
        }
    }

    pub fn is_cached(self) -> bool {
        self == CodecMode::Cached
    }

    pub fn display_name(self) -> &'static str {
        match self {
            CodecMode::Batch => "batch",
            CodecMode::Cached => "cached",
        }
    }
}
