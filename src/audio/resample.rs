//! Sample-rate conversion to the model rate with rubato.

use crate::audio::AudioBuffer;
use anyhow::{Context, Result};
use audioadapter_buffers::owned::InterleavedOwned;
use rubato::{Fft, FixedSync, Resampler};
use tracing::debug;

/// Resample audio to `target_rate`. Matching rates return a copy.
pub fn resample(audio: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    if audio.sample_rate == target_rate || audio.is_empty() {
        return Ok(AudioBuffer::new(audio.samples.clone(), target_rate));
    }
    debug!("Resampling {} Hz -> {} Hz", audio.sample_rate, target_rate);

    let mut resampler = Fft::<f32>::new(
        audio.sample_rate as usize,
        target_rate as usize,
        1024,
        2,
        1,
        FixedSync::Input,
    )
    .context("Failed to create resampler")?;

    let output_len = resampler.process_all_needed_output_len(audio.samples.len());

    let input_buf = InterleavedOwned::new_from(audio.samples.clone(), 1, audio.samples.len())
        .context("Failed to create input buffer")?;
    let mut output_buf = InterleavedOwned::new(0.0f32, 1, output_len);

    let (_, actual_output_len) = resampler
        .process_all_into_buffer(&input_buf, &mut output_buf, audio.samples.len(), None)
        .context("Failed to resample audio")?;

    let mut output = output_buf.take_data();
    output.truncate(actual_output_len);

    Ok(AudioBuffer::new(output, target_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_passthrough() {
        let audio = AudioBuffer::new(vec![0.1, 0.2, 0.3], 44100);
        let out = resample(&audio, 44100).unwrap();
        assert_eq!(out.samples, audio.samples);
    }

    #[test]
    fn upsampling_scales_length() {
        let audio = AudioBuffer::new(vec![0.0; 22050], 22050);
        let out = resample(&audio, 44100).unwrap();
        assert_eq!(out.sample_rate, 44100);
        assert!((out.len() as i64 - 44100).abs() < 2048, "{}", out.len());
    }
}
