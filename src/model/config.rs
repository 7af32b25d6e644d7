//! Model configuration.
//!
//! Configurations are plain JSON files written next to each checkpoint by the
//! training side and are read-only once parsed.

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::CodecMode;

/// Configuration of the mel VAE and its streaming front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaeConfig {
    /// Run name, used to locate the run directory
    #[serde(default = "default_name")]
    pub name: String,
    /// Channel width per layer boundary, `channels[0]` = mel bins,
    /// `channels[last]` = 2 * latent size
    pub channels: Vec<usize>,
    /// Per-layer stride, `len(ratios) == len(channels) - 1`
    pub ratios: Vec<usize>,
    /// Convolution kernel width
    pub kernel: usize,
    /// Samples per streaming chunk
    pub buffer_size: usize,
    /// STFT hop length in samples
    pub hop_length: usize,
    /// STFT size, also the ring buffer lookback (2048)
    #[serde(default = "default_n_fft")]
    pub n_fft: usize,
    /// Number of mel bins fed to the encoder
    pub input_size: usize,
    /// Audio sample rate in Hz (44100)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Cached/causal streaming mode
    #[serde(default)]
    pub use_cached_padding: bool,
    /// Seed for parameter initialisation
    #[serde(default)]
    pub seed: u64,
}

fn default_name() -> String {
    "default".into()
}

fn default_n_fft() -> usize {
    2048
}

fn default_sample_rate() -> u32 {
    44100
}

impl VaeConfig {
    /// Small configuration with a 128-bin mel and 16 latent channels.
    pub fn small() -> Self {
        Self {
            name: default_name(),
            channels: vec![128, 256, 256, 32],
            ratios: vec![1, 2, 2],
            kernel: 3,
            buffer_size: 1024,
            hop_length: 256,
            n_fft: 2048,
            input_size: 128,
            sample_rate: 44100,
            use_cached_padding: false,
            seed: 0,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read VAE config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse VAE config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the layer schedule and the streaming geometry.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.ratios.is_empty(), "VAE needs at least one layer");
        ensure!(
            self.ratios.len() + 1 == self.channels.len(),
            "len(ratios) must equal len(channels) - 1, got {} ratios for {} channels",
            self.ratios.len(),
            self.channels.len()
        );
        if let Some(&c) = self.channels.iter().find(|&&c| c == 0) {
            bail!("Channel widths must be positive, got {c}");
        }
        let last = self.channels[self.channels.len() - 1];
        ensure!(
            last % 2 == 0,
            "Last channel count must be even (mean + logvar), got {last}"
        );
        ensure!(
            self.channels[0] == self.input_size,
            "channels[0] ({}) must match input_size ({})",
            self.channels[0],
            self.input_size
        );
        ensure!(self.kernel > 0, "Kernel width must be positive");
        ensure!(
            self.ratios.iter().all(|&r| r > 0),
            "Ratios must be positive, got {:?}",
            self.ratios
        );
        ensure!(self.hop_length > 0, "Hop length must be positive");
        ensure!(
            self.buffer_size > 0 && self.buffer_size % self.hop_length == 0,
            "buffer_size ({}) must be a positive multiple of hop_length ({})",
            self.buffer_size,
            self.hop_length
        );
        ensure!(
            self.n_fft >= self.hop_length,
            "n_fft ({}) must be at least hop_length ({})",
            self.n_fft,
            self.hop_length
        );
        if self.use_cached_padding {
            let frames = self.chunk_frames();
            ensure!(
                self.total_ratio() == frames,
                "Cached mode needs one latent frame per chunk: product(ratios) = {} but a chunk has {} mel frames",
                self.total_ratio(),
                frames
            );
        }
        Ok(())
    }

    /// Latent channel count (half of the encoder output width).
    pub fn latent_size(&self) -> usize {
        self.channels[self.channels.len() - 1] / 2
    }

    /// Mel bins reconstructed by the decoder.
    pub fn mel_size(&self) -> usize {
        self.channels[0]
    }

    /// Total temporal downsampling of the encoder.
    pub fn total_ratio(&self) -> usize {
        self.ratios.iter().product()
    }

    /// Mel frames per streaming chunk.
    pub fn chunk_frames(&self) -> usize {
        self.buffer_size / self.hop_length
    }

    pub fn mode(&self) -> CodecMode {
        CodecMode::from_cached_flag(self.use_cached_padding)
    }
}

/// Configuration of the MelGAN generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocoderConfig {
    /// Input mel bins
    pub n_mels: usize,
    /// Base width, the first layer has `ngf * 2^len(ratios)` channels
    pub ngf: usize,
    /// Upsampling ratios, their product is the hop length
    pub ratios: Vec<usize>,
    /// Residual blocks per upsampling stage
    pub n_residual_layers: usize,
    #[serde(default)]
    pub use_cached_padding: bool,
    #[serde(default)]
    pub seed: u64,
}

impl VocoderConfig {
    /// MelGAN default: 8x8x2x2 upsampling (hop 256).
    pub fn melgan(n_mels: usize) -> Self {
        Self {
            n_mels,
            ngf: 32,
            ratios: vec![8, 8, 2, 2],
            n_residual_layers: 3,
            use_cached_padding: false,
            seed: 0,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocoder config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse vocoder config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.n_mels > 0, "Vocoder needs at least one mel bin");
        ensure!(self.ngf > 0, "ngf must be positive");
        ensure!(
            self.ratios.iter().all(|&r| r >= 2),
            "Upsampling ratios must be at least 2, got {:?}",
            self.ratios
        );
        ensure!(
            !self.ratios.is_empty() && self.ratios.len() <= 8,
            "Vocoder needs between 1 and 8 upsampling stages, got {}",
            self.ratios.len()
        );
        Ok(())
    }

    /// Output samples per mel frame.
    pub fn hop_length(&self) -> usize {
        self.ratios.iter().product()
    }
}

/// Layout of a training run directory.
///
/// ```text
/// runs/<name>/vanilla/{config.json, vanilla_state.gguf}
/// runs/<name>/melgan/{config.json, melgan_state.gguf}
/// runs/<name>/pca.gguf
/// ```
#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `runs/<name>` relative to `base`.
    pub fn named(base: &Path, name: &str) -> Self {
        Self::new(base.join("runs").join(name))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vae_config(&self) -> PathBuf {
        self.root.join("vanilla").join("config.json")
    }

    pub fn vae_state(&self) -> PathBuf {
        self.root.join("vanilla").join("vanilla_state.gguf")
    }

    pub fn vocoder_config(&self) -> PathBuf {
        self.root.join("melgan").join("config.json")
    }

    pub fn vocoder_state(&self) -> PathBuf {
        self.root.join("melgan").join("melgan_state.gguf")
    }

    pub fn pca(&self) -> PathBuf {
        self.root.join("pca.gguf")
    }
}
