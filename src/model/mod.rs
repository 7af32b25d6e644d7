//! Model architecture.
//!
//! The mel VAE (convolutional encoder and decoder), the latent PCA transform,
//! and the MelGAN vocoder, all built from a [`ParameterStore`](crate::checkpoint::ParameterStore).

pub mod config;
pub mod decoder;
pub mod encoder;
pub mod layers;
pub mod pca;
pub mod stack;
pub mod vae;
pub mod vocoder;

pub use config::{RunDir, VaeConfig, VocoderConfig};
pub use pca::{PcaBasis, PcaTransform};
pub use vae::TopVae;
pub use vocoder::{MelGanGenerator, Vocoder};
