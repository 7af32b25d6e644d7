//! Inference wrapper: waveform -> latent -> waveform.
//!
//! Binds a trained VAE, a trained vocoder, the mel front-end and an optional
//! PCA transform into one object with a streaming-friendly interface:
//!
//! ```text
//! encode: audio -> (CausalBuffer) -> mel -> encoder mean -> PCA forward
//! decode: latent -> PCA inverse -> decoder -> sigmoid -> mel half -> vocoder -> audio
//! ```
//!
//! The mode (batch or cached) is fixed at construction.

use anyhow::{anyhow, bail, ensure, Context, Result};
use burn::tensor::Tensor;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::{resample, AudioBuffer, MelConfig, MelFrontend, MelSpectrogram};
use crate::checkpoint::ParameterStore;
use crate::model::layers::sigmoid;
use crate::model::stack::vae_template;
use crate::model::vocoder::vocoder_template;
use crate::model::{
    MelGanGenerator, PcaBasis, PcaTransform, RunDir, TopVae, VaeConfig, Vocoder, VocoderConfig,
};
use crate::{Backend, CodecMode, Device};

type B = Backend;

/// Construction options.
#[derive(Debug, Clone)]
pub struct WrapperOptions {
    /// Override the cached-padding flag of both configs.
    pub use_cached_padding: Option<bool>,
    /// Apply the PCA transform around the latent space.
    pub pca: bool,
    /// Subtract the PCA mean before projecting (and add it back after).
    pub centered: bool,
    /// Squash the raw decoder output with a sigmoid before the vocoder.
    pub sigmoid_mel: bool,
    /// Random windows drawn from the calibration audio to compute PCA.
    pub pca_samples: usize,
    /// Samples per calibration window.
    pub pca_window: usize,
    /// Audio used to compute PCA in batch mode when no basis is stored yet.
    pub calibration: Option<AudioBuffer>,
    /// Seed for the calibration window positions.
    pub seed: u64,
}

impl Default for WrapperOptions {
    fn default() -> Self {
        Self {
            use_cached_padding: None,
            pca: true,
            centered: false,
            sigmoid_mel: true,
            pca_samples: 32,
            pca_window: 8192,
            calibration: None,
            seed: 0,
        }
    }
}

pub struct Wrapper {
    config: VaeConfig,
    vae: TopVae,
    vocoder: Box<dyn Vocoder>,
    frontend: MelFrontend,
    pca: Option<PcaTransform>,
    sigmoid_mel: bool,
}

impl Wrapper {
    /// Build the codec from a run directory.
    ///
    /// Fails if a checkpoint is missing or does not fit its architecture, or
    /// if cached mode is requested before a PCA basis has been computed.
    pub fn load(run: &RunDir, options: WrapperOptions, device: &Device) -> Result<Self> {
        let start = Instant::now();
        let mut vae_config = VaeConfig::load(&run.vae_config())?;
        let mut vocoder_config = VocoderConfig::load(&run.vocoder_config())?;
        if let Some(cached) = options.use_cached_padding {
            vae_config.use_cached_padding = cached;
            vocoder_config.use_cached_padding = cached;
            vae_config.validate()?;
        }
        info!(
            mode = vae_config.mode().display_name(),
            "Loading run {}",
            run.root().display()
        );

        let vocoder_params =
            ParameterStore::load_over(&vocoder_template(&vocoder_config)?, &run.vocoder_state())
                .context("Failed to load vocoder")?;
        let vocoder = MelGanGenerator::load(&vocoder_config, &vocoder_params, device)?;

        let vae_params = ParameterStore::load_over(&vae_template(&vae_config)?, &run.vae_state())
            .context("Failed to load VAE")?;
        let vae = TopVae::load(&vae_config, &vae_params, device)?;

        let pca = if options.pca {
            let basis = resolve_pca(run, &vae_config, &vae, &options, device)?;
            Some(PcaTransform::new(&basis, options.centered, device)?)
        } else {
            None
        };

        let wrapper = Self::from_parts(
            vae_config,
            vae,
            Box::new(vocoder),
            pca,
            options.sigmoid_mel,
            device,
        )?;
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            latent = wrapper.latent_size(),
            pca = wrapper.pca.is_some(),
            "Codec ready"
        );
        Ok(wrapper)
    }

    /// Assemble already-built components.
    pub fn from_parts(
        config: VaeConfig,
        vae: TopVae,
        vocoder: Box<dyn Vocoder>,
        pca: Option<PcaTransform>,
        sigmoid_mel: bool,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        ensure!(
            vocoder.n_mels() == vae.mel_size(),
            "Vocoder expects {} mel bins but the VAE reconstructs {}",
            vocoder.n_mels(),
            vae.mel_size()
        );
        ensure!(
            vocoder.hop_length() == config.hop_length,
            "Vocoder hop length {} does not match the mel hop length {}",
            vocoder.hop_length(),
            config.hop_length
        );
        if let Some(pca) = &pca {
            ensure!(
                pca.size() == vae.latent_size(),
                "PCA basis has {} components but the latent space has {}",
                pca.size(),
                vae.latent_size()
            );
        }
        let frontend = MelFrontend::new(&config, device)?;

        Ok(Self {
            config,
            vae,
            vocoder,
            frontend,
            pca,
            sigmoid_mel,
        })
    }

    pub fn mode(&self) -> CodecMode {
        self.config.mode()
    }

    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    pub fn latent_size(&self) -> usize {
        self.vae.latent_size()
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Samples per call in cached mode.
    pub fn chunk_size(&self) -> Option<usize> {
        self.frontend.chunk_size()
    }

    /// Mel features `[1, n_mels, frames]` of a waveform.
    pub fn melencode(&mut self, waveform: &[f32]) -> Result<Tensor<B, 3>> {
        self.frontend.encode(waveform)
    }

    /// Deterministic latent `[1, L, frames / R]`: encoder mean, then PCA.
    ///
    /// Cached mode takes exactly `buffer_size` samples and returns one frame.
    pub fn encode(&mut self, waveform: &[f32]) -> Result<Tensor<B, 3>> {
        let mel = self.melencode(waveform)?;
        let (mean, _) = self.vae.encode_statistics(mel)?;
        match &self.pca {
            Some(pca) => pca.forward(mean),
            None => Ok(mean),
        }
    }

    /// Waveform `[1, 1, samples]` from a latent `[1, L, T]`.
    pub fn decode(&mut self, z: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let z = match &self.pca {
            Some(pca) => pca.inverse(z)?,
            None => z,
        };
        let rec = self.vae.decoder().forward(z)?;
        let rec = if self.sigmoid_mel { sigmoid(rec) } else { rec };
        let mel = rec.narrow(1, 0, self.vocoder.n_mels());
        self.vocoder.decode(mel)
    }

    pub fn forward(&mut self, waveform: &[f32]) -> Result<Tensor<B, 3>> {
        let z = self.encode(waveform)?;
        self.decode(z)
    }

    /// Clear the streaming buffer and every vocoder cache.
    pub fn reset(&mut self) {
        self.frontend.reset();
        self.vocoder.reset();
    }
}

/// Flatten a `[1, 1, N]` waveform tensor into samples.
pub fn waveform_samples(waveform: Tensor<B, 3>) -> Result<Vec<f32>> {
    let [batch, channels, _] = waveform.dims();
    ensure!(
        batch == 1 && channels == 1,
        "Expected a [1, 1, N] waveform, got [{batch}, {channels}, _]"
    );
    waveform
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read waveform: {e:?}"))
}

/// Load the stored basis, or compute and store it in batch mode.
fn resolve_pca(
    run: &RunDir,
    config: &VaeConfig,
    vae: &TopVae,
    options: &WrapperOptions,
    device: &Device,
) -> Result<PcaBasis> {
    let path = run.pca();
    if path.exists() {
        info!("Loading PCA basis from {}", path.display());
        return PcaBasis::load(&path);
    }
    if config.use_cached_padding {
        bail!(
            "No PCA basis at {}; it should be computed first in batch mode",
            path.display()
        );
    }
    let audio = options.calibration.as_ref().with_context(|| {
        format!(
            "No PCA basis at {} and no calibration audio to compute one",
            path.display()
        )
    })?;

    let basis = calibrate_pca(
        config,
        vae,
        audio,
        options.pca_samples,
        options.pca_window,
        options.seed,
        device,
    )?;
    basis.save(&path)?;
    info!("Saved PCA basis to {}", path.display());
    Ok(basis)
}

/// Compute a PCA basis from encoder means of `count` random windows of
/// `window` samples. The encoder is run in batch mode with centred framing.
pub fn calibrate_pca(
    config: &VaeConfig,
    vae: &TopVae,
    audio: &AudioBuffer,
    count: usize,
    window: usize,
    seed: u64,
    device: &Device,
) -> Result<PcaBasis> {
    ensure!(count > 0, "PCA needs at least one calibration window");
    ensure!(
        window >= config.hop_length,
        "Calibration window of {window} samples is shorter than one hop"
    );
    let audio = resample(audio, config.sample_rate)?;
    ensure!(!audio.is_empty(), "Calibration audio is empty");

    let mel = MelSpectrogram::new(MelConfig {
        center: true,
        ..MelConfig::for_vae(config)
    })?;

    let mut samples = audio.samples;
    if samples.len() < window {
        warn!(
            "Calibration audio has {} samples, padding to {window}",
            samples.len()
        );
        samples.resize(window, 0.0);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut latents = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = rng.gen_range(0..=samples.len() - window);
        let features = mel.compute_tensor(&samples[offset..offset + window], device)?;
        let (mean, _) = vae.encode_statistics(features)?;
        latents.push(mean);
    }
    debug!(windows = count, window, "Encoded calibration windows");

    PcaBasis::compute(&latents)
}
