//! Convolutional variational decoder.
//!
//! Mirror of the encoder: transposed convolutions (kernel `2r`, padding
//! `r/2`) undo each stride `r > 1`, unit-stride stages stay plain
//! convolutions. Output carries mel mean and log-variance channels.

use anyhow::{ensure, Result};
use burn::tensor::Tensor;

use super::config::VaeConfig;
use super::stack::{decoder_layers, ConvStack};
use crate::checkpoint::ParameterStore;
use crate::{Backend, Device};

type B = Backend;

pub struct ConvDecoder {
    stack: ConvStack,
}

impl ConvDecoder {
    pub fn load(config: &VaeConfig, params: &ParameterStore, device: &Device) -> Result<Self> {
        let layers = decoder_layers(config)?;
        Ok(Self {
            stack: ConvStack::load(&layers, params, device)?,
        })
    }

    /// Decode a latent sample to raw mel statistics.
    ///
    /// Input: [B, latent_size, T]
    /// Output: [B, 2 * channels[0], T'] where T' = T * product(ratios) for
    /// even ratios (odd ratios > 1 add one frame per stage)
    pub fn forward(&self, z: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [_, channels, time] = z.dims();
        ensure!(
            channels == self.stack.in_channels(),
            "Decoder expects {} latent channels, got {channels}",
            self.stack.in_channels()
        );
        ensure!(time > 0, "Decoder input has no frames");
        Ok(self.stack.forward(z))
    }

    pub fn out_channels(&self) -> usize {
        self.stack.out_channels()
    }
}
