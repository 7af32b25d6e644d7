//! Causal sample buffer for streaming STFT.
//!
//! Holds a fixed window of the most recent samples. Each push shifts the
//! window left by one chunk and writes the new chunk at the tail, so the mel
//! front-end always sees `n_fft - hop` samples of left context in addition to
//! the new audio. One buffer belongs to exactly one stream.

use anyhow::{ensure, Result};

#[derive(Debug, Clone)]
pub struct CausalBuffer {
    buffer: Vec<f32>,
    chunk_size: usize,
}

impl CausalBuffer {
    /// Zero-filled buffer of `capacity` samples accepting `chunk_size` per push.
    pub fn new(capacity: usize, chunk_size: usize) -> Result<Self> {
        ensure!(chunk_size > 0, "Chunk size must be positive");
        ensure!(
            chunk_size <= capacity,
            "Chunk size {chunk_size} exceeds buffer capacity {capacity}"
        );
        Ok(Self {
            buffer: vec![0.0; capacity],
            chunk_size,
        })
    }

    /// Buffer sized so that an uncentered STFT with `n_fft` / `hop_length`
    /// yields exactly `chunk_size / hop_length` frames per push:
    /// capacity = `n_fft + (chunk_size / hop_length - 1) * hop_length`.
    pub fn for_stft(chunk_size: usize, hop_length: usize, n_fft: usize) -> Result<Self> {
        ensure!(hop_length > 0, "Hop length must be positive");
        ensure!(
            chunk_size >= hop_length && chunk_size % hop_length == 0,
            "Chunk size {chunk_size} must be a positive multiple of hop length {hop_length}"
        );
        let frames = chunk_size / hop_length;
        Self::new(n_fft + (frames - 1) * hop_length, chunk_size)
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Discard the oldest `chunk_size` samples, append `chunk`, and return the
    /// whole window.
    pub fn push(&mut self, chunk: &[f32]) -> Result<&[f32]> {
        ensure!(
            chunk.len() == self.chunk_size,
            "Streaming chunk must have exactly {} samples, got {}",
            self.chunk_size,
            chunk.len()
        );
        let capacity = self.buffer.len();
        self.buffer.copy_within(self.chunk_size.., 0);
        self.buffer[capacity - self.chunk_size..].copy_from_slice(chunk);
        Ok(&self.buffer)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.buffer
    }

    /// Zero the window, as at the start of a new stream.
    pub fn reset(&mut self) {
        self.buffer.fill(0.0);
    }
}
