//! MelGAN generator: normalized mel frames to waveform.
//!
//! ```text
//! conv_pre (k7) -> [leaky_relu -> ConvTranspose (2r, stride r) -> residual stack] x ratios
//!   -> leaky_relu -> conv_post (k7) -> tanh
//! ```
//!
//! In cached mode every padded convolution takes its left context from the
//! previous call instead of padding symmetrically, and residual shortcuts are
//! delayed to stay aligned with the causal branch.

use anyhow::{ensure, Context, Result};
use burn::tensor::Tensor;

use super::config::VocoderConfig;
use super::layers::{leaky_relu, CausalPad, Conv1D, ConvTranspose1D};
use crate::checkpoint::{initialise, Init, ParamSpec, ParameterStore};
use crate::{Backend, CodecMode, Device};

type B = Backend;

/// Anything that renders mel frames `[1, n_mels, T]` to audio `[1, 1, T * hop]`.
pub trait Vocoder {
    fn decode(&mut self, mel: Tensor<B, 3>) -> Result<Tensor<B, 3>>;

    /// Drop streaming state.
    fn reset(&mut self);

    fn n_mels(&self) -> usize;

    fn hop_length(&self) -> usize;
}

enum Padding {
    /// Reflection padding on both sides.
    Reflect(usize),
    /// `2 * pad` frames of left context from the previous call.
    Cached(CausalPad),
}

/// Convolution with mode-dependent padding.
struct PaddedConv {
    conv: Conv1D,
    padding: Padding,
}

impl PaddedConv {
    fn new(conv: Conv1D, pad: usize, mode: CodecMode) -> Self {
        let padding = match mode {
            CodecMode::Batch => Padding::Reflect(pad),
            CodecMode::Cached => Padding::Cached(CausalPad::new(2 * pad)),
        };
        Self { conv, padding }
    }

    fn forward(&mut self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match &mut self.padding {
            Padding::Reflect(pad) => self.conv.forward_padded(reflect_pad(x, *pad), 0, 0),
            Padding::Cached(cache) => self.conv.forward_padded(cache.apply(x), 0, 0),
        }
    }

    fn reset(&mut self) {
        if let Padding::Cached(cache) = &mut self.padding {
            cache.reset();
        }
    }
}

/// Reflect-pad along time; falls back to zeros when the signal is too short.
fn reflect_pad(x: Tensor<B, 3>, pad: usize) -> Tensor<B, 3> {
    if pad == 0 {
        return x;
    }
    let [batch, channels, time] = x.dims();
    if time <= pad {
        return super::layers::pad_time(x, pad, pad);
    }
    let left = x.clone().slice([0..batch, 0..channels, 1..pad + 1]).flip([2]);
    let right = x
        .clone()
        .slice([0..batch, 0..channels, time - pad - 1..time - 1])
        .flip([2]);
    Tensor::cat(vec![left, x, right], 2)
}

/// Fixed delay of `frames` samples with state carried across calls.
struct Delay {
    pad: CausalPad,
}

impl Delay {
    fn new(frames: usize) -> Self {
        Self {
            pad: CausalPad::new(frames),
        }
    }

    fn forward(&mut self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, channels, time] = x.dims();
        self.pad
            .apply(x)
            .slice([0..batch, 0..channels, 0..time])
    }

    fn reset(&mut self) {
        self.pad.reset();
    }
}

struct ResidualBlock {
    conv1: PaddedConv,
    conv2: Conv1D,
    shortcut: Conv1D,
    /// Only in cached mode: aligns the shortcut with the causal conv1.
    delay: Option<Delay>,
}

impl ResidualBlock {
    fn forward(&mut self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let h = self.conv1.forward(leaky_relu(x.clone()));
        let h = self.conv2.forward(leaky_relu(h));
        let skip = match &mut self.delay {
            Some(delay) => delay.forward(x),
            None => x,
        };
        self.shortcut.forward(skip) + h
    }

    fn reset(&mut self) {
        self.conv1.reset();
        if let Some(delay) = &mut self.delay {
            delay.reset();
        }
    }
}

struct UpsampleStage {
    up: ConvTranspose1D,
    blocks: Vec<ResidualBlock>,
}

pub struct MelGanGenerator {
    conv_pre: PaddedConv,
    stages: Vec<UpsampleStage>,
    conv_post: PaddedConv,
    n_mels: usize,
    hop_length: usize,
}

/// Channel width after `stage` upsampling stages.
fn stage_width(config: &VocoderConfig, stage: usize) -> usize {
    config.ngf << (config.ratios.len() - stage)
}

fn conv_params(name: &str, out_ch: usize, in_ch: usize, kernel: usize) -> Vec<ParamSpec> {
    let bound = 1.0 / ((in_ch * kernel) as f32).sqrt();
    vec![
        ParamSpec::new(format!("{name}.weight"), vec![out_ch, in_ch, kernel], Init::XavierNormal),
        ParamSpec::new(format!("{name}.bias"), vec![out_ch], Init::Uniform(bound)),
    ]
}

/// Parameter specs of the generator.
pub fn vocoder_parameters(config: &VocoderConfig) -> Result<Vec<ParamSpec>> {
    config.validate()?;
    let mut specs = conv_params("decoder.conv_pre", stage_width(config, 0), config.n_mels, 7);
    for (i, &r) in config.ratios.iter().enumerate() {
        let (in_ch, out_ch) = (stage_width(config, i), stage_width(config, i + 1));
        // Transposed weight [in, out, k], bias bound from dims 1 and 2
        let bound = 1.0 / ((out_ch * 2 * r) as f32).sqrt();
        specs.push(ParamSpec::new(
            format!("decoder.ups.{i}.weight"),
            vec![in_ch, out_ch, 2 * r],
            Init::XavierNormal,
        ));
        specs.push(ParamSpec::new(
            format!("decoder.ups.{i}.bias"),
            vec![out_ch],
            Init::Uniform(bound),
        ));
        for j in 0..config.n_residual_layers {
            let prefix = format!("decoder.res.{i}.{j}");
            specs.extend(conv_params(&format!("{prefix}.conv1"), out_ch, out_ch, 3));
            specs.extend(conv_params(&format!("{prefix}.conv2"), out_ch, out_ch, 1));
            specs.extend(conv_params(&format!("{prefix}.shortcut"), out_ch, out_ch, 1));
        }
    }
    specs.extend(conv_params("decoder.conv_post", 1, config.ngf, 7));
    Ok(specs)
}

/// Freshly initialised generator parameters.
pub fn vocoder_template(config: &VocoderConfig) -> Result<ParameterStore> {
    Ok(initialise(&vocoder_parameters(config)?, config.seed))
}

impl MelGanGenerator {
    pub fn load(config: &VocoderConfig, params: &ParameterStore, device: &Device) -> Result<Self> {
        config.validate()?;
        let mode = CodecMode::from_cached_flag(config.use_cached_padding);
        let conv = |name: &str| -> Result<Conv1D> {
            Ok(Conv1D::new(
                params.tensor::<3>(&format!("{name}.weight"), device)?,
                params.tensor::<1>(&format!("{name}.bias"), device)?,
            ))
        };

        let conv_pre = PaddedConv::new(conv("decoder.conv_pre")?, 3, mode);

        let mut stages = Vec::with_capacity(config.ratios.len());
        for (i, &r) in config.ratios.iter().enumerate() {
            let up = ConvTranspose1D::new(
                params.tensor::<3>(&format!("decoder.ups.{i}.weight"), device)?,
                params.tensor::<1>(&format!("decoder.ups.{i}.bias"), device)?,
                r,
                r / 2 + r % 2,
                r % 2,
            )
            .with_context(|| format!("Upsampling stage {i}"))?;

            let mut blocks = Vec::with_capacity(config.n_residual_layers);
            for j in 0..config.n_residual_layers {
                let prefix = format!("decoder.res.{i}.{j}");
                let dilation = 3usize.pow(j as u32);
                blocks.push(ResidualBlock {
                    conv1: PaddedConv::new(
                        conv(&format!("{prefix}.conv1"))?.with_dilation(dilation),
                        dilation,
                        mode,
                    ),
                    conv2: conv(&format!("{prefix}.conv2"))?,
                    shortcut: conv(&format!("{prefix}.shortcut"))?,
                    delay: mode.is_cached().then(|| Delay::new(dilation)),
                });
            }
            stages.push(UpsampleStage { up, blocks });
        }

        let conv_post = PaddedConv::new(conv("decoder.conv_post")?, 3, mode);

        Ok(Self {
            conv_pre,
            stages,
            conv_post,
            n_mels: config.n_mels,
            hop_length: config.hop_length(),
        })
    }
}

impl Vocoder for MelGanGenerator {
    /// Input: mel [B, n_mels, T]
    /// Output: waveform [B, 1, T * hop_length] in [-1, 1]
    fn decode(&mut self, mel: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [_, channels, time] = mel.dims();
        ensure!(
            channels == self.n_mels,
            "Vocoder expects {} mel bins, got {channels}",
            self.n_mels
        );
        ensure!(time > 0, "Vocoder input has no frames");

        let mut x = self.conv_pre.forward(mel);
        for stage in &mut self.stages {
            x = stage.up.forward(leaky_relu(x));
            for block in &mut stage.blocks {
                x = block.forward(x);
            }
        }
        let x = self.conv_post.forward(leaky_relu(x));
        Ok(x.tanh())
    }

    fn reset(&mut self) {
        self.conv_pre.reset();
        for stage in &mut self.stages {
            for block in &mut stage.blocks {
                block.reset();
            }
        }
        self.conv_post.reset();
    }

    fn n_mels(&self) -> usize {
        self.n_mels
    }

    fn hop_length(&self) -> usize {
        self.hop_length
    }
}
