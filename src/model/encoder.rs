//! Convolutional variational encoder.
//!
//! A stack of strided Conv1D layers with `relu -> batchnorm` between them,
//! mapping mel features to latent statistics (mean and log-variance channels
//! concatenated).

use anyhow::{ensure, Result};
use burn::tensor::Tensor;

use super::config::VaeConfig;
use super::stack::{encoder_layers, ConvStack};
use crate::checkpoint::ParameterStore;
use crate::{Backend, Device};

type B = Backend;

pub struct ConvEncoder {
    stack: ConvStack,
}

impl ConvEncoder {
    pub fn load(config: &VaeConfig, params: &ParameterStore, device: &Device) -> Result<Self> {
        let layers = encoder_layers(config)?;
        Ok(Self {
            stack: ConvStack::load(&layers, params, device)?,
        })
    }

    /// Encode mel features to latent statistics.
    ///
    /// Input: [B, channels[0], T]
    /// Output: [B, channels[last], ceil(T / product(ratios))] for odd kernels
    pub fn forward(&self, mel: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [_, channels, time] = mel.dims();
        ensure!(
            channels == self.stack.in_channels(),
            "Encoder expects {} input channels, got {channels}",
            self.stack.in_channels()
        );
        ensure!(time > 0, "Encoder input has no frames");
        Ok(self.stack.forward(mel))
    }

    pub fn out_channels(&self) -> usize {
        self.stack.out_channels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::stack::vae_template;

    #[test]
    fn zero_input_gives_finite_statistics() {
        let config = VaeConfig {
            channels: vec![2, 4, 6],
            ratios: vec![1, 1],
            kernel: 3,
            input_size: 2,
            ..VaeConfig::small()
        };
        let device = Device::default();
        let params = vae_template(&config).unwrap();
        let encoder = ConvEncoder::load(&config, &params, &device).unwrap();

        let x: Tensor<B, 3> = Tensor::zeros([1, 2, 10], &device);
        let y = encoder.forward(x).unwrap();
        assert_eq!(y.dims(), [1, 6, 10]);
        let values = y.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn strided_encoder_downsamples() {
        let config = VaeConfig::small();
        let device = Device::default();
        let params = vae_template(&config).unwrap();
        let encoder = ConvEncoder::load(&config, &params, &device).unwrap();

        let x: Tensor<B, 3> = Tensor::ones([2, 128, 16], &device);
        assert_eq!(encoder.forward(x).unwrap().dims(), [2, 32, 4]);

        let odd: Tensor<B, 3> = Tensor::ones([1, 128, 7], &device);
        assert_eq!(encoder.forward(odd).unwrap().dims(), [1, 32, 2]);
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let config = VaeConfig::small();
        let device = Device::default();
        let params = vae_template(&config).unwrap();
        let encoder = ConvEncoder::load(&config, &params, &device).unwrap();
        let x: Tensor<B, 3> = Tensor::zeros([1, 64, 8], &device);
        assert!(encoder.forward(x).is_err());
    }
}
