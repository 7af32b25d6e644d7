//! Layer schedules for the VAE and the executor that runs them.
//!
//! The validated [`VaeConfig`] is turned into an ordered list of
//! [`LayerSpec`] descriptors. The descriptors name and shape every parameter
//! (so the initial [`ParameterStore`] can be built from them), and a
//! [`ConvStack`] applies the loaded layers in sequence.

use anyhow::{Context, Result};
use burn::tensor::Tensor;

use super::config::VaeConfig;
use super::layers::{relu, BatchNorm1D, Conv1D, ConvTranspose1D};
use crate::checkpoint::{initialise, Init, ParamSpec, ParameterStore};
use crate::{Backend, Device};

type B = Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Strided convolution.
    Conv,
    /// Transposed convolution, inverts a strided convolution.
    Transposed,
}

/// One convolution of a stack, optionally followed by `relu -> batchnorm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    /// Parameter prefix, e.g. `encoder.convs.0`
    pub name: String,
    pub kind: LayerKind,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    /// Batch-norm prefix and width, applied after this layer's activation
    pub norm: Option<(String, usize)>,
}

impl LayerSpec {
    /// Weight layout: `[out, in, k]` for convs, `[in, out, k]` for transposed convs.
    pub fn weight_shape(&self) -> Vec<usize> {
        match self.kind {
            LayerKind::Conv => vec![self.out_channels, self.in_channels, self.kernel],
            LayerKind::Transposed => vec![self.in_channels, self.out_channels, self.kernel],
        }
    }

    pub fn parameters(&self) -> Vec<ParamSpec> {
        let weight = self.weight_shape();
        // PyTorch computes the bias bound from weight dims 1 and 2
        let fan_in = weight[1] * weight[2];
        let bound = 1.0 / (fan_in as f32).sqrt();
        let mut specs = vec![
            ParamSpec::new(format!("{}.weight", self.name), weight, Init::XavierNormal),
            ParamSpec::new(
                format!("{}.bias", self.name),
                vec![self.out_channels],
                Init::Uniform(bound),
            ),
        ];
        if let Some((prefix, width)) = &self.norm {
            specs.extend(batch_norm_parameters(prefix, *width));
        }
        specs
    }
}

pub fn batch_norm_parameters(prefix: &str, width: usize) -> Vec<ParamSpec> {
    vec![
        ParamSpec::new(format!("{prefix}.weight"), vec![width], Init::Constant(1.0)),
        ParamSpec::new(format!("{prefix}.bias"), vec![width], Init::Constant(0.0)),
        ParamSpec::new(format!("{prefix}.running_mean"), vec![width], Init::Constant(0.0)),
        ParamSpec::new(format!("{prefix}.running_var"), vec![width], Init::Constant(1.0)),
    ]
}

/// Encoder schedule: `channels[i] -> channels[i+1]` with stride `ratios[i]`.
pub fn encoder_layers(config: &VaeConfig) -> Result<Vec<LayerSpec>> {
    config.validate()?;
    let n = config.ratios.len();
    Ok((0..n)
        .map(|i| LayerSpec {
            name: format!("encoder.convs.{i}"),
            kind: LayerKind::Conv,
            in_channels: config.channels[i],
            out_channels: config.channels[i + 1],
            kernel: config.kernel,
            stride: config.ratios[i],
            padding: config.kernel / 2,
            norm: (i + 1 < n).then(|| (format!("encoder.bns.{i}"), config.channels[i + 1])),
        })
        .collect())
}

/// Decoder schedule: the encoder reversed, with `channels[0]` doubled (mean +
/// logvar output) and `channels[last]` halved (latent input).
pub fn decoder_layers(config: &VaeConfig) -> Result<Vec<LayerSpec>> {
    config.validate()?;
    let mut channels = config.channels.clone();
    let last = channels.len() - 1;
    channels[last] /= 2;
    channels[0] *= 2;

    let n = config.ratios.len();
    Ok((0..n)
        .rev()
        .enumerate()
        .map(|(j, i)| {
            let ratio = config.ratios[i];
            let norm = (j + 1 < n).then(|| (format!("decoder.bns.{j}"), channels[i]));
            if ratio == 1 {
                LayerSpec {
                    name: format!("decoder.convs.{j}"),
                    kind: LayerKind::Conv,
                    in_channels: channels[i + 1],
                    out_channels: channels[i],
                    kernel: config.kernel,
                    stride: 1,
                    padding: config.kernel / 2,
                    norm,
                }
            } else {
                LayerSpec {
                    name: format!("decoder.convs.{j}"),
                    kind: LayerKind::Transposed,
                    in_channels: channels[i + 1],
                    out_channels: channels[i],
                    kernel: 2 * ratio,
                    stride: ratio,
                    padding: ratio / 2,
                    norm,
                }
            }
        })
        .collect())
}

/// Parameter specs of a whole schedule.
pub fn stack_parameters(layers: &[LayerSpec]) -> Vec<ParamSpec> {
    layers.iter().flat_map(LayerSpec::parameters).collect()
}

/// Freshly initialised parameters for the full VAE (encoder + decoder).
pub fn vae_template(config: &VaeConfig) -> Result<ParameterStore> {
    let mut specs = stack_parameters(&encoder_layers(config)?);
    specs.extend(stack_parameters(&decoder_layers(config)?));
    Ok(initialise(&specs, config.seed))
}

enum StackConv {
    Conv(Conv1D),
    Transposed(ConvTranspose1D),
}

impl StackConv {
    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match self {
            StackConv::Conv(conv) => conv.forward(x),
            StackConv::Transposed(conv) => conv.forward(x),
        }
    }
}

struct StackLayer {
    conv: StackConv,
    norm: Option<BatchNorm1D>,
}

/// Homogeneous executor: `conv -> relu -> batchnorm` for every layer but the
/// last, which is a bare convolution.
pub struct ConvStack {
    layers: Vec<StackLayer>,
    in_channels: usize,
    out_channels: usize,
}

impl ConvStack {
    /// Materialise the layers of `specs` from `params`.
    pub fn load(specs: &[LayerSpec], params: &ParameterStore, device: &Device) -> Result<Self> {
        let mut layers = Vec::with_capacity(specs.len());
        for spec in specs {
            let weight = params.tensor::<3>(&format!("{}.weight", spec.name), device)?;
            let bias = params.tensor::<1>(&format!("{}.bias", spec.name), device)?;
            let conv = match spec.kind {
                LayerKind::Conv => StackConv::Conv(
                    Conv1D::new(weight, bias)
                        .with_stride(spec.stride)
                        .with_padding(spec.padding),
                ),
                LayerKind::Transposed => StackConv::Transposed(
                    ConvTranspose1D::new(weight, bias, spec.stride, spec.padding, 0)
                        .with_context(|| format!("Layer '{}'", spec.name))?,
                ),
            };
            let norm = match &spec.norm {
                Some((prefix, _)) => Some(load_batch_norm(params, prefix, device)?),
                None => None,
            };
            layers.push(StackLayer { conv, norm });
        }
        Ok(Self {
            layers,
            in_channels: specs.first().map_or(0, |s| s.in_channels),
            out_channels: specs.last().map_or(0, |s| s.out_channels),
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let mut x = x;
        for layer in &self.layers {
            x = layer.conv.forward(x);
            if let Some(norm) = &layer.norm {
                x = norm.forward(relu(x));
            }
        }
        x
    }
}

pub fn load_batch_norm(params: &ParameterStore, prefix: &str, device: &Device) -> Result<BatchNorm1D> {
    Ok(BatchNorm1D::new(
        params.tensor::<1>(&format!("{prefix}.weight"), device)?,
        params.tensor::<1>(&format!("{prefix}.bias"), device)?,
        params.tensor::<1>(&format!("{prefix}.running_mean"), device)?,
        params.tensor::<1>(&format!("{prefix}.running_var"), device)?,
    ))
}
