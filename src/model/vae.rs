//! Top-level variational autoencoder (encoder + decoder).

use anyhow::{ensure, Result};
use burn::tensor::{Distribution, ElementConversion, Tensor};

use super::config::VaeConfig;
use super::decoder::ConvDecoder;
use super::encoder::ConvEncoder;
use super::layers::sigmoid;
use crate::checkpoint::ParameterStore;
use crate::{Backend, Device};

type B = Backend;

/// Decoder log-variance range.
pub const LOGVAR_MIN: f32 = -10.0;
pub const LOGVAR_MAX: f32 = 0.0;

/// Sampled latent and the posterior statistics it was drawn from.
pub struct Encoded {
    /// [B, L, T]
    pub z: Tensor<B, 3>,
    pub mean: Tensor<B, 3>,
    /// Unclamped
    pub logvar: Tensor<B, 3>,
}

/// Sampled reconstruction and its observation statistics.
pub struct Decoded {
    /// [B, mel, T]
    pub y: Tensor<B, 3>,
    /// In [0, 1]
    pub mean: Tensor<B, 3>,
    /// In [-10, 0]
    pub logvar: Tensor<B, 3>,
}

pub struct VaeOutput {
    pub y: Tensor<B, 3>,
    pub mean_y: Tensor<B, 3>,
    pub logvar_y: Tensor<B, 3>,
    pub mean_z: Tensor<B, 3>,
    pub logvar_z: Tensor<B, 3>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VaeLoss {
    /// Gaussian negative log-likelihood with learned variance (no 1/2, no log 2pi).
    pub reconstruction: f32,
    /// KL to a standard normal, scaled by 2.
    pub regularization: f32,
}

pub struct TopVae {
    encoder: ConvEncoder,
    decoder: ConvDecoder,
    latent_size: usize,
    mel_size: usize,
}

impl TopVae {
    pub fn load(config: &VaeConfig, params: &ParameterStore, device: &Device) -> Result<Self> {
        Ok(Self {
            encoder: ConvEncoder::load(config, params, device)?,
            decoder: ConvDecoder::load(config, params, device)?,
            latent_size: config.latent_size(),
            mel_size: config.mel_size(),
        })
    }

    pub fn encoder(&self) -> &ConvEncoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &ConvDecoder {
        &self.decoder
    }

    pub fn latent_size(&self) -> usize {
        self.latent_size
    }

    pub fn mel_size(&self) -> usize {
        self.mel_size
    }

    /// Posterior statistics `(mean, logvar)` without sampling.
    pub fn encode_statistics(&self, x: Tensor<B, 3>) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        let stats = self.encoder.forward(x)?;
        Ok(split_channels(stats, self.latent_size))
    }

    /// `z = mean + exp(logvar) * N(0, 1)`.
    pub fn encode(&self, x: Tensor<B, 3>) -> Result<Encoded> {
        let (mean, logvar) = self.encode_statistics(x)?;
        let z = reparameterize(mean.clone(), logvar.clone());
        Ok(Encoded { z, mean, logvar })
    }

    /// Observation statistics: sigmoid mean, log-variance clamped to [-10, 0].
    pub fn decode_statistics(&self, z: Tensor<B, 3>) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        let rec = self.decoder.forward(z)?;
        let (mean, logvar) = split_channels(rec, self.mel_size);
        Ok((sigmoid(mean), logvar.clamp(LOGVAR_MIN, LOGVAR_MAX)))
    }

    pub fn decode(&self, z: Tensor<B, 3>) -> Result<Decoded> {
        let (mean, logvar) = self.decode_statistics(z)?;
        let y = reparameterize(mean.clone(), logvar.clone());
        Ok(Decoded { y, mean, logvar })
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Result<VaeOutput> {
        let encoded = self.encode(x)?;
        let decoded = self.decode(encoded.z)?;
        Ok(VaeOutput {
            y: decoded.y,
            mean_y: decoded.mean,
            logvar_y: decoded.logvar,
            mean_z: encoded.mean,
            logvar_z: encoded.logvar,
        })
    }

    /// Forward pass plus reconstruction and regularization terms, each the
    /// mean over all elements:
    ///
    /// - rec = logvar_y + (x - mean_y)^2 * exp(-logvar_y)
    /// - reg = mean_z^2 + exp(logvar_z) - logvar_z - 1
    pub fn loss(&self, x: Tensor<B, 3>) -> Result<(VaeOutput, VaeLoss)> {
        let output = self.forward(x.clone())?;
        ensure!(
            x.dims() == output.mean_y.dims(),
            "Reconstruction shape {:?} does not match input {:?}; the frame count must be a multiple of product(ratios)",
            output.mean_y.dims(),
            x.dims()
        );
        let loss = gaussian_losses(
            x,
            output.mean_y.clone(),
            output.logvar_y.clone(),
            output.mean_z.clone(),
            output.logvar_z.clone(),
        );
        Ok((output, loss))
    }
}

/// Split `[B, 2n, T]` at channel `n` into `([B, n, T], [B, n, T])`.
pub fn split_channels(x: Tensor<B, 3>, n: usize) -> (Tensor<B, 3>, Tensor<B, 3>) {
    let first = x.clone().narrow(1, 0, n);
    let second = x.narrow(1, n, n);
    (first, second)
}

/// `mean + exp(logvar) * eps`, `eps ~ N(0, 1)` elementwise.
pub fn reparameterize(mean: Tensor<B, 3>, logvar: Tensor<B, 3>) -> Tensor<B, 3> {
    let noise = Tensor::random(mean.shape(), Distribution::Normal(0.0, 1.0), &mean.device());
    noise * logvar.exp() + mean
}

pub fn gaussian_losses(
    x: Tensor<B, 3>,
    mean_y: Tensor<B, 3>,
    logvar_y: Tensor<B, 3>,
    mean_z: Tensor<B, 3>,
    logvar_z: Tensor<B, 3>,
) -> VaeLoss {
    let rec = logvar_y.clone() + (x - mean_y).powf_scalar(2.0) * logvar_y.neg().exp();
    let reg = mean_z.powf_scalar(2.0) + logvar_z.clone().exp() - logvar_z - 1.0;
    VaeLoss {
        reconstruction: rec.mean().into_scalar().elem::<f32>(),
        regularization: reg.mean().into_scalar().elem::<f32>(),
    }
}
