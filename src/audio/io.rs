//! WAV input and output.
//!
//! Everything is mixed down to mono `f32` in `[-1.0, 1.0]`.

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

use super::resample::resample;

/// Mono audio with its sample rate.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Append samples from another buffer at the same rate.
    pub fn append(&mut self, other: &AudioBuffer) -> Result<()> {
        if self.sample_rate != other.sample_rate {
            bail!(
                "Sample rate mismatch: {} vs {}",
                self.sample_rate,
                other.sample_rate
            );
        }
        self.samples.extend_from_slice(&other.samples);
        Ok(())
    }

    /// Split into `size`-sample chunks, zero-padding the last one.
    pub fn padded_chunks(&self, size: usize) -> Vec<Vec<f32>> {
        if size == 0 {
            return Vec::new();
        }
        self.samples
            .chunks(size)
            .map(|chunk| {
                let mut chunk = chunk.to_vec();
                chunk.resize(size, 0.0);
                chunk
            })
            .collect()
    }

    /// Peak-normalize to `peak` (no-op on silence).
    pub fn normalize_peak(&mut self, peak: f32) {
        let max = self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        if max > 0.0 {
            let gain = peak / max;
            self.samples.iter_mut().for_each(|s| *s *= gain);
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_wav(self, path)
    }
}

/// Load a WAV file as mono `f32` samples at its native rate.
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read WAV samples")?
                .chunks(channels)
                .map(|frame| frame.iter().map(|&s| s as f32).sum::<f32>() / channels as f32 / max_val)
                .collect()
        }
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read WAV samples")?
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect(),
    };

    Ok(AudioBuffer::new(samples, spec.sample_rate))
}

/// Load a WAV file and resample it to `sample_rate`.
pub fn load_wav_at<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<AudioBuffer> {
    let audio = load_wav(path)?;
    resample(&audio, sample_rate)
}

/// Save as 16-bit PCM mono.
pub fn save_wav<P: AsRef<Path>>(audio: &AudioBuffer, path: P) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;

    for &sample in &audio.samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
    }

    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..441).map(|i| (i as f32 / 441.0) - 0.5).collect();
        AudioBuffer::new(samples.clone(), 44100).save(&path).unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.sample_rate, 44100);
        assert_eq!(loaded.len(), 441);
        for (a, b) in samples.iter().zip(&loaded.samples) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn stereo_is_mixed_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..10 {
            writer.write_sample(0.5f32).unwrap();
            writer.write_sample(-0.1f32).unwrap();
        }
        writer.finalize().unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.len(), 10);
        assert!(loaded.samples.iter().all(|&s| (s - 0.2).abs() < 1e-6));
    }

    #[test]
    fn chunks_are_zero_padded() {
        let audio = AudioBuffer::new(vec![1.0; 5], 100);
        let chunks = audio.padded_chunks(2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], vec![1.0, 0.0]);
    }

    #[test]
    fn append_checks_rate() {
        let mut a = AudioBuffer::new(vec![0.0; 4], 100);
        assert!(a.append(&AudioBuffer::new(vec![1.0; 2], 200)).is_err());
        a.append(&AudioBuffer::new(vec![1.0; 2], 100)).unwrap();
        assert_eq!(a.len(), 6);
    }
}
