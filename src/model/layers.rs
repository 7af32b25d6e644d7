//! Basic layers: Conv1D, ConvTranspose1D, BatchNorm1D, CausalPad and activations.

use anyhow::{ensure, Result};
use burn::tensor::activation;
use burn::tensor::Tensor;

use crate::Backend;

type B = Backend;

/// Slope of the leaky ReLU used throughout the vocoder.
pub const LEAKY_SLOPE: f64 = 0.2;

pub fn relu(x: Tensor<B, 3>) -> Tensor<B, 3> {
    activation::relu(x)
}

pub fn leaky_relu(x: Tensor<B, 3>) -> Tensor<B, 3> {
    activation::leaky_relu(x, LEAKY_SLOPE)
}

pub fn sigmoid(x: Tensor<B, 3>) -> Tensor<B, 3> {
    activation::sigmoid(x)
}

/// 1D convolution layer with stride, zero padding and dilation.
pub struct Conv1D {
    /// Weight shape: [out_channels, in_channels, kernel_size]
    weight: Tensor<B, 3>,
    bias: Tensor<B, 1>,
    stride: usize,
    padding: usize,
    dilation: usize,
}

impl Conv1D {
    pub fn new(weight: Tensor<B, 3>, bias: Tensor<B, 1>) -> Self {
        Self {
            weight,
            bias,
            stride: 1,
            padding: 0,
            dilation: 1,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride.max(1);
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation.max(1);
        self
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.dims()[2]
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Output length for an input of `t_in` frames with the given padding.
    pub fn output_len(&self, t_in: usize, pad_left: usize, pad_right: usize) -> usize {
        let span = self.dilation * (self.kernel_size() - 1) + 1;
        (t_in + pad_left + pad_right).saturating_sub(span) / self.stride + 1
    }

    /// Convolve with the layer's own symmetric padding.
    ///
    /// Input shape: [B, C_in, T]
    /// Output shape: [B, C_out, T_out]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.forward_padded(x, self.padding, self.padding)
    }

    /// Convolve with explicit (possibly asymmetric) zero padding, using im2col
    /// and a single matmul.
    pub fn forward_padded(&self, x: Tensor<B, 3>, pad_left: usize, pad_right: usize) -> Tensor<B, 3> {
        let [batch, _in_ch, t_in] = x.dims();
        let [out_ch, in_ch, kernel_size] = self.weight.dims();
        let stride = self.stride;
        let dilation = self.dilation;
        let t_out = self.output_len(t_in, pad_left, pad_right);

        // Extra right zeros keep every strided window in bounds
        let extra = stride - 1;
        let x = pad_time(x, pad_left, pad_right + extra);

        // im2col: build [batch, kernel_size * in_ch, t_out] with one slice per kernel position
        let mut cols = Vec::with_capacity(kernel_size);
        for k in 0..kernel_size {
            let start = k * dilation;
            if stride == 1 {
                let col = x.clone().slice([0..batch, 0..in_ch, start..start + t_out]);
                cols.push(col);
            } else {
                // [batch, in_ch, t_out * stride] -> [batch, in_ch, t_out, stride]
                // -> select [:,:,:,0] -> [batch, in_ch, t_out]
                let needed = t_out * stride;
                let shifted = x.clone().slice([0..batch, 0..in_ch, start..start + needed]);
                let strided: Tensor<B, 3> = shifted
                    .reshape([batch, in_ch, t_out, stride])
                    .slice([0..batch, 0..in_ch, 0..t_out, 0..1])
                    .reshape([batch, in_ch, t_out]);
                cols.push(strided);
            }
        }

        // [batch, kernel_size * in_ch, t_out] -> [batch, t_out, kernel_size * in_ch]
        let col = Tensor::cat(cols, 1).swap_dims(1, 2);

        // Reorder weight [out_ch, in_ch, kernel_size] -> [out_ch, kernel_size, in_ch]
        // to match the kernel-major im2col layout
        let w: Tensor<B, 3> = self.weight.clone().swap_dims(1, 2);
        let w_flat: Tensor<B, 2> = w.reshape([out_ch, kernel_size * in_ch]);

        // [batch, t_out, K*C_in] x [1, K*C_in, C_out] -> [batch, t_out, C_out]
        let w_3d: Tensor<B, 3> = w_flat.transpose().unsqueeze_dim(0);
        let out = col.matmul(w_3d);
        let out = out + self.bias.clone().unsqueeze::<3>();

        out.swap_dims(1, 2)
    }
}

/// 1D transposed convolution (PyTorch weight layout `[in, out, kernel]`).
///
/// Computed as zero-insertion upsampling followed by a stride-1 convolution
/// with the flipped, transposed kernel. Output length is
/// `(T - 1) * stride - 2 * padding + kernel + output_padding`.
pub struct ConvTranspose1D {
    /// Equivalent stride-1 convolution, weight [out, in, kernel] flipped in time.
    conv: Conv1D,
    stride: usize,
    padding: usize,
    output_padding: usize,
}

impl ConvTranspose1D {
    pub fn new(
        weight: Tensor<B, 3>,
        bias: Tensor<B, 1>,
        stride: usize,
        padding: usize,
        output_padding: usize,
    ) -> Result<Self> {
        let [_in_ch, _out_ch, kernel_size] = weight.dims();
        ensure!(stride > 0, "Transposed conv stride must be positive");
        ensure!(
            padding < kernel_size,
            "Transposed conv padding {padding} must be smaller than kernel {kernel_size}"
        );
        ensure!(
            output_padding < stride,
            "Output padding {output_padding} must be smaller than stride {stride}"
        );
        let flipped = weight.swap_dims(0, 1).flip([2]);
        Ok(Self {
            conv: Conv1D::new(flipped, bias),
            stride,
            padding,
            output_padding,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }

    pub fn output_len(&self, t_in: usize) -> usize {
        ((t_in.max(1) - 1) * self.stride + self.conv.kernel_size() + self.output_padding)
            .saturating_sub(2 * self.padding)
    }

    /// Input shape: [B, C_in, T]
    /// Output shape: [B, C_out, (T-1)*stride - 2*padding + kernel + output_padding]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, in_ch, t_in] = x.dims();
        let stride = self.stride;

        let x = if stride > 1 {
            let device = x.device();
            let zeros: Tensor<B, 4> = Tensor::zeros([batch, in_ch, t_in, stride - 1], &device);
            let up: Tensor<B, 3> = Tensor::cat(vec![x.reshape([batch, in_ch, t_in, 1]), zeros], 3)
                .reshape([batch, in_ch, t_in * stride]);
            up.slice([0..batch, 0..in_ch, 0..(t_in - 1) * stride + 1])
        } else {
            x
        };

        let edge = self.conv.kernel_size() - 1 - self.padding;
        self.conv
            .forward_padded(x, edge, edge + self.output_padding)
    }
}

/// Batch normalization in inference mode (running statistics, eps=1e-5).
pub struct BatchNorm1D {
    /// weight / sqrt(running_var + eps), shaped [1, C, 1]
    scale: Tensor<B, 3>,
    /// bias - running_mean * scale, shaped [1, C, 1]
    shift: Tensor<B, 3>,
}

impl BatchNorm1D {
    pub const EPS: f64 = 1e-5;

    pub fn new(
        weight: Tensor<B, 1>,
        bias: Tensor<B, 1>,
        running_mean: Tensor<B, 1>,
        running_var: Tensor<B, 1>,
    ) -> Self {
        let [channels] = weight.dims();
        let scale = weight / (running_var + Self::EPS).sqrt();
        let shift = bias - running_mean * scale.clone();
        Self {
            scale: scale.reshape([1, channels, 1]),
            shift: shift.reshape([1, channels, 1]),
        }
    }

    pub fn channels(&self) -> usize {
        self.scale.dims()[1]
    }

    /// (x - mean) / sqrt(var + eps) * weight + bias, per channel.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        x * self.scale.clone() + self.shift.clone()
    }
}

/// Left context cache that replaces symmetric zero padding in cached mode.
///
/// Each call prepends the last `size` frames seen by the previous call
/// (zeros on the first call), so a convolution with `padding = size / 2`
/// becomes causal and chunk boundaries stay seamless.
pub struct CausalPad {
    size: usize,
    cache: Option<Tensor<B, 3>>,
}

impl CausalPad {
    pub fn new(size: usize) -> Self {
        Self { size, cache: None }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn apply(&mut self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        if self.size == 0 {
            return x;
        }
        let [batch, channels, time] = x.dims();
        let left = match self.cache.take() {
            Some(cache) if cache.dims() == [batch, channels, self.size] => cache,
            _ => Tensor::zeros([batch, channels, self.size], &x.device()),
        };
        let padded = Tensor::cat(vec![left, x], 2);
        let total = self.size + time;
        self.cache = Some(
            padded
                .clone()
                .slice([0..batch, 0..channels, total - self.size..total]),
        );
        padded
    }

    pub fn reset(&mut self) {
        self.cache = None;
    }
}

/// Zero-pad along the time axis.
pub fn pad_time(x: Tensor<B, 3>, left: usize, right: usize) -> Tensor<B, 3> {
    if left == 0 && right == 0 {
        return x;
    }
    let [batch, channels, _] = x.dims();
    let device = x.device();
    let mut parts = Vec::with_capacity(3);
    if left > 0 {
        parts.push(Tensor::zeros([batch, channels, left], &device));
    }
    parts.push(x);
    if right > 0 {
        parts.push(Tensor::zeros([batch, channels, right], &device));
    }
    Tensor::cat(parts, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;

    fn tensor3(data: Vec<f32>, shape: [usize; 3]) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(data, shape), &Default::default())
    }

    fn tensor1(data: Vec<f32>) -> Tensor<B, 1> {
        let n = data.len();
        Tensor::from_data(TensorData::new(data, [n]), &Default::default())
    }

    fn values(x: Tensor<B, 3>) -> Vec<f32> {
        x.into_data().to_vec::<f32>().unwrap()
    }

    /// Direct nested-loop transposed convolution (PyTorch semantics).
    fn reference_conv_transpose(
        x: &[f32],
        w: &[f32],
        bias: &[f32],
        (c_in, c_out, k): (usize, usize, usize),
        t: usize,
        stride: usize,
        padding: usize,
    ) -> Vec<f32> {
        let full = (t - 1) * stride + k;
        let mut out = vec![0.0f32; c_out * full];
        for ci in 0..c_in {
            for co in 0..c_out {
                for ti in 0..t {
                    for kk in 0..k {
                        out[co * full + ti * stride + kk] +=
                            x[ci * t + ti] * w[(ci * c_out + co) * k + kk];
                    }
                }
            }
        }
        let t_out = full - 2 * padding;
        let mut cropped = Vec::with_capacity(c_out * t_out);
        for co in 0..c_out {
            for to in 0..t_out {
                cropped.push(out[co * full + padding + to] + bias[co]);
            }
        }
        cropped
    }

    #[test]
    fn conv1d_identity_kernel() {
        // Kernel [0, 1, 0] with padding 1 copies the input
        let conv = Conv1D::new(tensor3(vec![0.0, 1.0, 0.0], [1, 1, 3]), tensor1(vec![0.0]))
            .with_padding(1);
        let x = tensor3(vec![1.0, 2.0, 3.0, 4.0, 5.0], [1, 1, 5]);
        assert_eq!(values(conv.forward(x)), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn conv1d_stride_on_odd_length() {
        // Kernel [1, 1, 1], stride 2, padding 1 on 5 samples -> 3 outputs
        let conv = Conv1D::new(tensor3(vec![1.0; 3], [1, 1, 3]), tensor1(vec![0.5]))
            .with_stride(2)
            .with_padding(1);
        let x = tensor3(vec![1.0, 2.0, 3.0, 4.0, 5.0], [1, 1, 5]);
        let y = conv.forward(x);
        assert_eq!(y.dims(), [1, 1, 3]);
        assert_eq!(values(y), vec![3.5, 9.5, 9.5]);
    }

    #[test]
    fn conv1d_dilation() {
        // Kernel [1, 0, 1] dilated by 2 sums x[t-2] and x[t+2]
        let conv = Conv1D::new(tensor3(vec![1.0, 0.0, 1.0], [1, 1, 3]), tensor1(vec![0.0]))
            .with_dilation(2)
            .with_padding(2);
        let x = tensor3(vec![1.0, 2.0, 3.0, 4.0, 5.0], [1, 1, 5]);
        assert_eq!(values(conv.forward(x)), vec![3.0, 4.0, 6.0, 2.0, 3.0]);
    }

    #[test]
    fn conv_transpose_matches_reference() {
        let (c_in, c_out, k, t, stride, padding) = (2, 3, 4, 5, 2, 1);
        let x: Vec<f32> = (0..c_in * t).map(|i| (i as f32 * 0.37).sin()).collect();
        let w: Vec<f32> = (0..c_in * c_out * k).map(|i| (i as f32 * 0.11).cos()).collect();
        let bias = vec![0.1, -0.2, 0.3];

        let layer = ConvTranspose1D::new(
            tensor3(w.clone(), [c_in, c_out, k]),
            tensor1(bias.clone()),
            stride,
            padding,
            0,
        )
        .unwrap();
        let y = layer.forward(tensor3(x.clone(), [1, c_in, t]));
        assert_eq!(y.dims(), [1, c_out, layer.output_len(t)]);
        assert_eq!(layer.output_len(t), 2 * t);

        let expected = reference_conv_transpose(&x, &w, &bias, (c_in, c_out, k), t, stride, padding);
        for (a, b) in values(y).iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn conv_transpose_rejects_oversized_padding() {
        let w = tensor3(vec![0.0; 4], [1, 1, 4]);
        assert!(ConvTranspose1D::new(w, tensor1(vec![0.0]), 2, 4, 0).is_err());
    }

    #[test]
    fn batch_norm_uses_running_statistics() {
        let bn = BatchNorm1D::new(
            tensor1(vec![2.0, 1.0]),
            tensor1(vec![0.0, 1.0]),
            tensor1(vec![1.0, -1.0]),
            tensor1(vec![4.0, 1.0]),
        );
        let x = tensor3(vec![3.0, 5.0, -1.0, 0.0], [1, 2, 2]);
        let y = values(bn.forward(x));
        let expected = [
            (3.0 - 1.0) / (4.0f32 + 1e-5).sqrt() * 2.0,
            (5.0 - 1.0) / (4.0f32 + 1e-5).sqrt() * 2.0,
            (-1.0 + 1.0) / (1.0f32 + 1e-5).sqrt() + 1.0,
            (0.0 + 1.0) / (1.0f32 + 1e-5).sqrt() + 1.0,
        ];
        for (a, b) in y.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn causal_pad_carries_left_context() {
        let mut pad = CausalPad::new(2);
        let first = values(pad.apply(tensor3(vec![1.0, 2.0, 3.0], [1, 1, 3])));
        assert_eq!(first, vec![0.0, 0.0, 1.0, 2.0, 3.0]);
        let second = values(pad.apply(tensor3(vec![4.0, 5.0, 6.0], [1, 1, 3])));
        assert_eq!(second, vec![2.0, 3.0, 4.0, 5.0, 6.0]);
        pad.reset();
        let third = values(pad.apply(tensor3(vec![7.0], [1, 1, 1])));
        assert_eq!(third, vec![0.0, 0.0, 7.0]);
    }
}
