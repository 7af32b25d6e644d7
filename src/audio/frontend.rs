//! Waveform to mel front-end, optionally buffered for streaming.

use anyhow::{ensure, Result};
use burn::tensor::Tensor;
use tracing::debug;

use super::buffer::CausalBuffer;
use super::mel::{MelConfig, MelSpectrogram};
use crate::model::VaeConfig;
use crate::{Backend, Device};

type B = Backend;

/// Mel extractor with a [`CausalBuffer`] in front of it in cached mode.
pub struct MelFrontend {
    mel: MelSpectrogram,
    buffer: Option<CausalBuffer>,
    device: Device,
}

impl MelFrontend {
    pub fn new(config: &VaeConfig, device: &Device) -> Result<Self> {
        let mel = MelSpectrogram::new(MelConfig::for_vae(config))?;
        let buffer = if config.use_cached_padding {
            let buffer =
                CausalBuffer::for_stft(config.buffer_size, config.hop_length, config.n_fft)?;
            debug!(
                "Streaming front-end: {} sample window, {} samples per chunk",
                buffer.capacity(),
                buffer.chunk_size()
            );
            Some(buffer)
        } else {
            None
        };

        Ok(Self {
            mel,
            buffer,
            device: device.clone(),
        })
    }

    pub fn n_mels(&self) -> usize {
        self.mel.n_mels()
    }

    pub fn is_buffered(&self) -> bool {
        self.buffer.is_some()
    }

    /// Samples per call in buffered mode.
    pub fn chunk_size(&self) -> Option<usize> {
        self.buffer.as_ref().map(CausalBuffer::chunk_size)
    }

    /// Normalized mel features `[1, n_mels, frames]`.
    ///
    /// Buffered mode takes exactly one chunk and returns `chunk / hop` frames.
    /// Otherwise the whole waveform is framed with centering.
    pub fn encode(&mut self, samples: &[f32]) -> Result<Tensor<B, 3>> {
        ensure!(!samples.is_empty(), "Cannot compute mel features of empty audio");
        match self.buffer.as_mut() {
            Some(buffer) => {
                let window = buffer.push(samples)?;
                self.mel.compute_tensor(window, &self.device)
            }
            None => self.mel.compute_tensor(samples, &self.device),
        }
    }

    /// Forget buffered history.
    pub fn reset(&mut self) {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cached: bool) -> VaeConfig {
        VaeConfig {
            channels: vec![16, 32, 8],
            ratios: vec![2, 2],
            input_size: 16,
            buffer_size: 512,
            hop_length: 128,
            n_fft: 512,
            sample_rate: 16000,
            use_cached_padding: cached,
            ..VaeConfig::small()
        }
    }

    fn noise(len: usize) -> Vec<f32> {
        (0..len).map(|i| ((i * 7919) % 201) as f32 / 100.0 - 1.0).collect()
    }

    #[test]
    fn buffered_chunk_yields_chunk_frames() {
        let mut frontend = MelFrontend::new(&config(true), &Default::default()).unwrap();
        assert_eq!(frontend.chunk_size(), Some(512));
        let mel = frontend.encode(&noise(512)).unwrap();
        assert_eq!(mel.dims(), [1, 16, 4]);
        assert!(frontend.encode(&noise(256)).is_err());
    }

    #[test]
    fn batch_mode_frames_whole_window() {
        let mut frontend = MelFrontend::new(&config(false), &Default::default()).unwrap();
        assert!(!frontend.is_buffered());
        let mel = frontend.encode(&noise(2048)).unwrap();
        assert_eq!(mel.dims(), [1, 16, 16]);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut frontend = MelFrontend::new(&config(true), &Default::default()).unwrap();
        let chunk = noise(512);
        let first = frontend.encode(&chunk).unwrap().into_data().to_vec::<f32>().unwrap();
        frontend.encode(&chunk).unwrap();
        frontend.reset();
        let again = frontend.encode(&chunk).unwrap().into_data().to_vec::<f32>().unwrap();
        assert_eq!(first, again);
    }
}
