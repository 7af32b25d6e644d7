//! Mel-spectrogram computation.
//!
//! Magnitude mel spectrogram on a Slaney filterbank, log-compressed into
//! `[0, 1]` with a fixed range so streamed chunks and whole-file windows
//! produce the same frames.

use anyhow::{ensure, Result};
use burn::tensor::{Tensor, TensorData};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

use crate::model::VaeConfig;
use crate::{Backend, Device};

type B = Backend;

/// Magnitudes below this are clamped before the log.
const LOG_FLOOR: f32 = 1e-5;
/// `log10(LOG_FLOOR)` maps to 0.
const LOG_OFFSET: f32 = 5.0;
/// Width of the log10 range mapped onto `[0, 1]`.
const LOG_RANGE: f32 = 8.0;

/// Configuration for mel spectrogram computation.
#[derive(Debug, Clone)]
pub struct MelConfig {
    /// Sample rate of input audio (default: 44100)
    pub sample_rate: u32,
    /// FFT size (default: 2048)
    pub n_fft: usize,
    /// Hop length between frames (default: 256)
    pub hop_length: usize,
    /// Window length (defaults to n_fft)
    pub win_length: Option<usize>,
    /// Number of mel bands (default: 128)
    pub n_mels: usize,
    /// Minimum frequency for mel filterbank
    pub fmin: f32,
    /// Maximum frequency for mel filterbank (defaults to sample_rate / 2)
    pub fmax: Option<f32>,
    /// Reflect-pad by `n_fft / 2` on both sides before framing
    pub center: bool,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            n_fft: 2048,
            hop_length: 256,
            win_length: None,
            n_mels: 128,
            fmin: 0.0,
            fmax: None,
            center: true,
        }
    }
}

impl MelConfig {
    /// Front-end matching a VAE configuration. Cached mode frames the ring
    /// buffer without centering, batch mode centres the window.
    pub fn for_vae(config: &VaeConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            n_fft: config.n_fft,
            hop_length: config.hop_length,
            win_length: None,
            n_mels: config.input_size,
            fmin: 0.0,
            fmax: None,
            center: !config.use_cached_padding,
        }
    }
}

/// Mel-spectrogram extractor.
pub struct MelSpectrogram {
    config: MelConfig,
    mel_basis: Vec<Vec<f32>>,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Result<Self> {
        ensure!(config.n_fft > 0, "n_fft must be positive");
        ensure!(config.hop_length > 0, "Hop length must be positive");
        ensure!(config.n_mels > 0, "Mel front-end needs at least one band");
        let win_length = config.win_length.unwrap_or(config.n_fft);
        ensure!(
            win_length <= config.n_fft,
            "Window length {win_length} exceeds n_fft {}",
            config.n_fft
        );
        let fmax = config.fmax.unwrap_or(config.sample_rate as f32 / 2.0);

        let mel_basis = Self::create_mel_filterbank(
            config.sample_rate,
            config.n_fft,
            config.n_mels,
            config.fmin,
            fmax,
        );
        let window = Self::hann_window(win_length);
        let fft = FftPlanner::new().plan_fft_forward(config.n_fft);

        Ok(Self {
            config,
            mel_basis,
            window,
            fft,
        })
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    pub fn n_mels(&self) -> usize {
        self.config.n_mels
    }

    /// Magnitude mel spectrogram, shape `[n_frames, n_mels]`.
    pub fn compute(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let magnitudes: Vec<Vec<f32>> = self
            .stft(samples)
            .iter()
            .map(|frame| frame.iter().map(|c| c.norm()).collect())
            .collect();

        self.apply_mel_filterbank(&magnitudes)
    }

    /// Normalized mel spectrogram in `[0, 1]`, shape `[n_frames, n_mels]`.
    pub fn compute_normalized(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut mel = self.compute(samples);
        for frame in &mut mel {
            for v in frame.iter_mut() {
                *v = normalize(*v);
            }
        }
        mel
    }

    /// Normalized mel spectrogram as a `[1, n_mels, n_frames]` tensor.
    pub fn compute_tensor(&self, samples: &[f32], device: &Device) -> Result<Tensor<B, 3>> {
        let frames = self.compute_normalized(samples);
        ensure!(
            !frames.is_empty(),
            "{} samples are too short for a single mel frame (n_fft {}, hop {})",
            samples.len(),
            self.config.n_fft,
            self.config.hop_length
        );
        Ok(frames_to_tensor(&frames, self.config.n_mels, device))
    }

    /// Number of frames for a given number of samples.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        if self.config.center {
            (num_samples + 2 * (n_fft / 2) - n_fft) / hop
        } else if num_samples < n_fft {
            0
        } else {
            (num_samples - n_fft) / hop + 1
        }
    }

    /// Short-time Fourier transform, one-sided bins per frame.
    fn stft(&self, samples: &[f32]) -> Vec<Vec<Complex<f32>>> {
        let n_fft = self.config.n_fft;
        let hop_length = self.config.hop_length;
        let win_length = self.window.len();
        // Centre the window inside the FFT frame when it is shorter.
        let win_offset = (n_fft - win_length) / 2;

        let padded = if self.config.center {
            reflect_pad(samples, n_fft / 2)
        } else {
            samples.to_vec()
        };

        let n_frames = self.num_frames(samples.len());
        let mut result = Vec::with_capacity(n_frames);
        let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];

        for i in 0..n_frames {
            let start = i * hop_length;
            for (j, slot) in buffer.iter_mut().enumerate() {
                let sample = if j >= win_offset && j < win_offset + win_length {
                    padded
                        .get(start + j)
                        .map_or(0.0, |s| s * self.window[j - win_offset])
                } else {
                    0.0
                };
                *slot = Complex::new(sample, 0.0);
            }

            self.fft.process(&mut buffer);
            result.push(buffer[..n_fft / 2 + 1].to_vec());
        }

        result
    }

    fn apply_mel_filterbank(&self, spectrum: &[Vec<f32>]) -> Vec<Vec<f32>> {
        spectrum
            .iter()
            .map(|frame| {
                self.mel_basis
                    .iter()
                    .map(|filter| filter.iter().zip(frame.iter()).map(|(f, p)| f * p).sum())
                    .collect()
            })
            .collect()
    }

    /// Convert frequency in Hz to mel scale (Slaney / O'Shaughnessy).
    fn hz_to_mel(f: f32) -> f32 {
        const F_SP: f32 = 200.0 / 3.0;
        const MIN_LOG_HZ: f32 = 1000.0;
        const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
        const LOGSTEP: f32 = 0.068_751_74;

        if f < MIN_LOG_HZ {
            f / F_SP
        } else {
            MIN_LOG_MEL + (f / MIN_LOG_HZ).ln() / LOGSTEP
        }
    }

    /// Convert mel value to Hz (Slaney / O'Shaughnessy).
    fn mel_to_hz(m: f32) -> f32 {
        const F_SP: f32 = 200.0 / 3.0;
        const MIN_LOG_HZ: f32 = 1000.0;
        const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
        const LOGSTEP: f32 = 0.068_751_74;

        if m < MIN_LOG_MEL {
            m * F_SP
        } else {
            MIN_LOG_HZ * ((m - MIN_LOG_MEL) * LOGSTEP).exp()
        }
    }

    /// Triangular filters with Slaney area normalization.
    fn create_mel_filterbank(
        sample_rate: u32,
        n_fft: usize,
        n_mels: usize,
        fmin: f32,
        fmax: f32,
    ) -> Vec<Vec<f32>> {
        let n_freqs = n_fft / 2 + 1;

        let mel_min = Self::hz_to_mel(fmin);
        let mel_max = Self::hz_to_mel(fmax);
        let hz_points: Vec<f32> = (0..=n_mels + 1)
            .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
            .map(Self::mel_to_hz)
            .collect();

        let fft_freqs: Vec<f32> = (0..n_freqs)
            .map(|i| i as f32 * sample_rate as f32 / n_fft as f32)
            .collect();

        let mut filterbank = vec![vec![0.0f32; n_freqs]; n_mels];

        for (i, filter) in filterbank.iter_mut().enumerate() {
            let f_lower = hz_points[i];
            let f_center = hz_points[i + 1];
            let f_upper = hz_points[i + 2];

            for (j, &freq) in fft_freqs.iter().enumerate() {
                if freq >= f_lower && freq <= f_center && f_center > f_lower {
                    filter[j] = (freq - f_lower) / (f_center - f_lower);
                } else if freq > f_center && freq <= f_upper && f_upper > f_center {
                    filter[j] = (f_upper - freq) / (f_upper - f_center);
                }
            }

            if f_upper > f_lower {
                let enorm = 2.0 / (f_upper - f_lower);
                filter.iter_mut().for_each(|w| *w *= enorm);
            }
        }

        filterbank
    }

    /// Periodic Hann window.
    fn hann_window(length: usize) -> Vec<f32> {
        (0..length)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / length as f32).cos()))
            .collect()
    }
}

/// Map a mel magnitude onto `[0, 1]`.
pub fn normalize(magnitude: f32) -> f32 {
    ((magnitude.max(LOG_FLOOR).log10() + LOG_OFFSET) / LOG_RANGE).clamp(0.0, 1.0)
}

/// `[n_frames][n_mels]` rows to a `[1, n_mels, n_frames]` tensor.
pub fn frames_to_tensor(frames: &[Vec<f32>], n_mels: usize, device: &Device) -> Tensor<B, 3> {
    let n_frames = frames.len();
    let mut data = vec![0.0f32; n_mels * n_frames];
    for (t, frame) in frames.iter().enumerate() {
        for (m, &v) in frame.iter().enumerate().take(n_mels) {
            data[m * n_frames + t] = v;
        }
    }
    Tensor::from_data(TensorData::new(data, [1, n_mels, n_frames]), device)
}

/// Reflect padding without repeating the edge sample. Positions past the far
/// end of a short signal replicate the nearest edge sample.
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let (Some(&first), Some(&last)) = (samples.first(), samples.last()) else {
        return vec![0.0; 2 * pad];
    };
    let mut padded = Vec::with_capacity(samples.len() + 2 * pad);

    for i in (1..=pad).rev() {
        padded.push(samples.get(i).copied().unwrap_or(first));
    }
    padded.extend_from_slice(samples);
    for i in 0..pad {
        let idx = samples.len().checked_sub(2 + i);
        padded.push(idx.map_or(last, |idx| samples[idx]));
    }
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn reflect_pad_mirrors_and_replicates_edges() {
        let samples = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(
            reflect_pad(&samples, 2),
            vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]
        );
        // past the far end each side repeats its own edge
        assert_eq!(
            reflect_pad(&[1.0, 2.0], 3),
            vec![1.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 2.0]
        );
        assert_eq!(reflect_pad(&[], 2), vec![0.0; 4]);
    }

    fn small_config(center: bool) -> MelConfig {
        MelConfig {
            sample_rate: 16000,
            n_fft: 512,
            hop_length: 128,
            n_mels: 40,
            center,
            ..Default::default()
        }
    }

    #[test]
    fn frame_counts() {
        let centred = MelSpectrogram::new(small_config(true)).unwrap();
        assert_eq!(centred.num_frames(1280), 10);
        assert_eq!(centred.compute(&vec![0.0; 1280]).len(), 10);

        let causal = MelSpectrogram::new(small_config(false)).unwrap();
        // A ring buffer of n_fft + 3 * hop samples yields 4 frames.
        assert_eq!(causal.num_frames(512 + 3 * 128), 4);
        assert_eq!(causal.compute(&vec![0.0; 512 + 3 * 128]).len(), 4);
        assert_eq!(causal.num_frames(100), 0);
    }

    #[test]
    fn normalized_values_stay_in_unit_range() {
        let mel = MelSpectrogram::new(small_config(true)).unwrap();
        let mut signal = sine(1000.0, 16000, 4096);
        signal.iter_mut().for_each(|s| *s *= 2.0);
        for frame in mel.compute_normalized(&signal) {
            assert_eq!(frame.len(), 40);
            assert!(frame.iter().all(|v| (0.0..=1.0).contains(v)));
        }

        assert_eq!(normalize(0.0), 0.0);
        assert_eq!(normalize(1e9), 1.0);
        assert!((normalize(1.0) - 5.0 / 8.0).abs() < 1e-6);
    }

    #[test]
    fn tone_energy_lands_in_matching_band() {
        let mel = MelSpectrogram::new(small_config(true)).unwrap();
        let low = mel.compute(&sine(300.0, 16000, 4096));
        let high = mel.compute(&sine(5000.0, 16000, 4096));

        let argmax = |frame: &Vec<f32>| {
            frame
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap()
        };
        assert!(argmax(&low[8]) < argmax(&high[8]));
    }

    #[test]
    fn streaming_frames_match_whole_signal() {
        // Uncentred framing of a sliding window reproduces the frames of the
        // same samples taken at once.
        let mel = MelSpectrogram::new(small_config(false)).unwrap();
        let signal = sine(440.0, 16000, 512 + 7 * 128);
        let whole = mel.compute_normalized(&signal);
        let tail = mel.compute_normalized(&signal[4 * 128..]);

        assert_eq!(whole.len(), 8);
        assert_eq!(tail.len(), 4);
        for (a, b) in whole[4..].iter().zip(&tail) {
            for (x, y) in a.iter().zip(b) {
                assert!((x - y).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn tensor_layout_is_mels_by_frames() {
        let frames = vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];
        let tensor = frames_to_tensor(&frames, 2, &Default::default());
        assert_eq!(tensor.dims(), [1, 2, 3]);
        let data = tensor.into_data().to_vec::<f32>().unwrap();
        assert_eq!(data, vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn too_short_input_is_an_error() {
        let mel = MelSpectrogram::new(small_config(false)).unwrap();
        assert!(mel.compute_tensor(&[0.0; 100], &Default::default()).is_err());
    }

    #[test]
    fn filterbank_has_expected_shape() {
        let mel = MelSpectrogram::new(MelConfig::default()).unwrap();
        assert_eq!(mel.mel_basis.len(), 128);
        assert!(mel.mel_basis.iter().all(|f| f.len() == 1025));
        assert!(mel.mel_basis.iter().all(|f| f.iter().any(|&w| w > 0.0)));
    }
}
