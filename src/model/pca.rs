//! PCA change of basis for the latent space.
//!
//! A basis is computed once from encoder outputs, persisted next to the run,
//! and then applied on every call:
//!
//! - forward:  `z' = (z^T U) / std`
//! - inverse:  `z  = z'^T (U^T * std)`
//!
//! with channels moved to the last axis for the matmul. Mean centering is
//! supported but off by default.

use anyhow::{ensure, Context, Result};
use burn::tensor::{Tensor, TensorData};
use std::path::Path;
use tracing::{info, warn};

use crate::checkpoint::{ParamTensor, ParameterStore};
use crate::{Backend, Device};

type B = Backend;

/// Smallest standard deviation a computed component may have.
pub const MIN_STD: f32 = 1e-4;

const MAX_SWEEPS: usize = 100;

/// Data-derived basis: per-channel mean, per-component std, and `U` with
/// principal directions as columns (row-major `[L, L]`).
#[derive(Debug, Clone, PartialEq)]
pub struct PcaBasis {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
    pub basis: Vec<f32>,
}

impl PcaBasis {
    pub fn size(&self) -> usize {
        self.mean.len()
    }

    pub fn identity(size: usize) -> Self {
        let mut basis = vec![0.0; size * size];
        for i in 0..size {
            basis[i * size + i] = 1.0;
        }
        Self {
            mean: vec![0.0; size],
            std: vec![1.0; size],
            basis,
        }
    }

    fn check(&self) -> Result<()> {
        let n = self.mean.len();
        ensure!(n > 0, "PCA basis is empty");
        ensure!(
            self.std.len() == n && self.basis.len() == n * n,
            "PCA basis has inconsistent sizes: mean {}, std {}, basis {}",
            n,
            self.std.len(),
            self.basis.len()
        );
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.check()?;
        let n = self.size();
        let mut store = ParameterStore::new();
        store.insert("pca.mean", ParamTensor::new(vec![n], self.mean.clone())?);
        store.insert("pca.std", ParamTensor::new(vec![n], self.std.clone())?);
        store.insert("pca.basis", ParamTensor::new(vec![n, n], self.basis.clone())?);
        store.save(path, "pca")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let store = ParameterStore::load(path)?;
        let take = |name: &str| -> Result<Vec<f32>> {
            Ok(store
                .get(name)
                .with_context(|| format!("PCA file {} has no '{name}'", path.display()))?
                .data
                .clone())
        };
        let basis = Self {
            mean: take("pca.mean")?,
            std: take("pca.std")?,
            basis: take("pca.basis")?,
        };
        basis.check()?;
        Ok(basis)
    }

    /// Compute the basis from encoder outputs, each `[B, L, T]`.
    ///
    /// All batch and time positions are pooled into `N` observations of `L`
    /// channels; `U` holds the eigenvectors of their covariance sorted by
    /// decreasing eigenvalue and `std` the square roots of the eigenvalues,
    /// floored at [`MIN_STD`].
    pub fn compute(samples: &[Tensor<B, 3>]) -> Result<Self> {
        ensure!(!samples.is_empty(), "PCA needs at least one latent sample");
        let size = samples[0].dims()[1];
        let mut rows: Vec<f32> = Vec::new();
        for sample in samples {
            let [batch, channels, time] = sample.dims();
            ensure!(
                channels == size,
                "Latent samples disagree on channel count: {channels} vs {size}"
            );
            let data = sample
                .clone()
                .permute([0, 2, 1])
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| anyhow::anyhow!("Failed to read latent sample: {e:?}"))?;
            debug_assert_eq!(data.len(), batch * time * channels);
            rows.extend(data);
        }
        Self::from_observations(&rows, size)
    }

    /// Compute the basis from row-major observations `[N, size]`.
    pub fn from_observations(rows: &[f32], size: usize) -> Result<Self> {
        ensure!(size > 0, "PCA needs at least one channel");
        ensure!(rows.len() % size == 0, "Observation buffer is not a multiple of {size}");
        let n = rows.len() / size;
        ensure!(n >= 2, "PCA needs at least two observations, got {n}");

        let mut mean = vec![0.0f64; size];
        for row in rows.chunks_exact(size) {
            for (m, &v) in mean.iter_mut().zip(row) {
                *m += v as f64;
            }
        }
        for m in &mut mean {
            *m /= n as f64;
        }

        let mut cov = vec![0.0f64; size * size];
        for row in rows.chunks_exact(size) {
            for i in 0..size {
                let di = row[i] as f64 - mean[i];
                for j in i..size {
                    cov[i * size + j] += di * (row[j] as f64 - mean[j]);
                }
            }
        }
        for i in 0..size {
            for j in i..size {
                let v = cov[i * size + j] / (n - 1) as f64;
                cov[i * size + j] = v;
                cov[j * size + i] = v;
            }
        }

        let (eigenvalues, vectors) = symmetric_eigen(cov, size);

        let mut order: Vec<usize> = (0..size).collect();
        order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

        let mut basis = vec![0.0f32; size * size];
        let mut std = Vec::with_capacity(size);
        let mut floored = 0;
        for (col, &k) in order.iter().enumerate() {
            // Deterministic sign: largest component positive
            let pivot = (0..size)
                .max_by(|&a, &b| vectors[a * size + k].abs().total_cmp(&vectors[b * size + k].abs()))
                .unwrap_or(0);
            let sign = if vectors[pivot * size + k] < 0.0 { -1.0 } else { 1.0 };
            for row in 0..size {
                basis[row * size + col] = (sign * vectors[row * size + k]) as f32;
            }
            let s = eigenvalues[k].max(0.0).sqrt() as f32;
            if s < MIN_STD {
                floored += 1;
            }
            std.push(s.max(MIN_STD));
        }
        if floored > 0 {
            warn!("{floored} PCA components had near-zero variance, std floored at {MIN_STD}");
        }
        info!(components = size, observations = n, "PCA basis computed");

        Ok(Self {
            mean: mean.into_iter().map(|m| m as f32).collect(),
            std,
            basis,
        })
    }
}

/// Cyclic Jacobi eigendecomposition of a symmetric row-major matrix.
///
/// Returns eigenvalues and the eigenvector matrix (eigenvectors as columns).
fn symmetric_eigen(mut a: Vec<f64>, n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut v = vec![0.0f64; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }

    let scale: f64 = a.iter().map(|x| x * x).sum::<f64>().max(f64::MIN_POSITIVE);
    for _ in 0..MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in 0..n {
                if p != q {
                    off += a[p * n + q] * a[p * n + q];
                }
            }
        }
        if off <= 1e-24 * scale {
            break;
        }

        for p in 0..n {
            for q in p + 1..n {
                let apq = a[p * n + q];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[q * n + q] - a[p * n + p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[k * n + p];
                    let akq = a[k * n + q];
                    a[k * n + p] = c * akp - s * akq;
                    a[k * n + q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p * n + k];
                    let aqk = a[q * n + k];
                    a[p * n + k] = c * apk - s * aqk;
                    a[q * n + k] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[k * n + p];
                    let vkq = v[k * n + q];
                    v[k * n + p] = c * vkp - s * vkq;
                    v[k * n + q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let eigenvalues = (0..n).map(|i| a[i * n + i]).collect();
    (eigenvalues, v)
}

/// A [`PcaBasis`] uploaded to the device, ready to apply.
pub struct PcaTransform {
    size: usize,
    /// U, [1, L, L]
    forward: Tensor<B, 3>,
    /// U^T scaled per row by std, [1, L, L]
    inverse: Tensor<B, 3>,
    /// [1, 1, L]
    std: Tensor<B, 3>,
    /// [1, 1, L], only set when centering is enabled
    mean: Option<Tensor<B, 3>>,
}

impl PcaTransform {
    pub fn new(basis: &PcaBasis, centered: bool, device: &Device) -> Result<Self> {
        basis.check()?;
        let n = basis.size();
        let u: Tensor<B, 2> = Tensor::from_data(TensorData::new(basis.basis.clone(), [n, n]), device);
        let std: Tensor<B, 1> = Tensor::from_data(TensorData::new(basis.std.clone(), [n]), device);
        let inverse = u.clone().transpose() * std.clone().reshape([n, 1]);
        let mean = centered.then(|| {
            Tensor::<B, 1>::from_data(TensorData::new(basis.mean.clone(), [n]), device)
                .reshape([1, 1, n])
        });
        Ok(Self {
            size: n,
            forward: u.unsqueeze_dim(0),
            inverse: inverse.unsqueeze_dim(0),
            std: std.reshape([1, 1, n]),
            mean,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_centered(&self) -> bool {
        self.mean.is_some()
    }

    /// Latent `[B, L, T]` to decorrelated, standardized coordinates.
    pub fn forward(&self, z: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        self.check_channels(&z)?;
        let mut z = z.permute([0, 2, 1]);
        if let Some(mean) = &self.mean {
            z = z - mean.clone();
        }
        let z = z.matmul(self.forward.clone()) / self.std.clone();
        Ok(z.permute([0, 2, 1]))
    }

    /// Decorrelated coordinates `[B, L, T]` back to the latent space.
    pub fn inverse(&self, z: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        self.check_channels(&z)?;
        let mut z = z.permute([0, 2, 1]).matmul(self.inverse.clone());
        if let Some(mean) = &self.mean {
            z = z + mean.clone();
        }
        Ok(z.permute([0, 2, 1]))
    }

    fn check_channels(&self, z: &Tensor<B, 3>) -> Result<()> {
        let channels = z.dims()[1];
        ensure!(
            channels == self.size,
            "PCA expects {} latent channels, got {channels}",
            self.size
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution as _, Normal};

    fn values(x: Tensor<B, 3>) -> Vec<f32> {
        x.into_data().to_vec::<f32>().unwrap()
    }

    /// Correlated 3-channel observations: channel 1 follows channel 0, channel 2 is small noise.
    fn correlated_rows(n: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(3);
        let normal = Normal::new(0.0f32, 1.0).unwrap();
        let mut rows = Vec::with_capacity(n * 3);
        for _ in 0..n {
            let a = normal.sample(&mut rng) * 3.0;
            let b = normal.sample(&mut rng) * 0.5;
            let c = normal.sample(&mut rng) * 0.1;
            rows.extend_from_slice(&[a + b, a - b, c]);
        }
        rows
    }

    #[test]
    fn computed_basis_is_orthonormal_and_sorted() {
        let basis = PcaBasis::from_observations(&correlated_rows(4000), 3).unwrap();
        let u = &basis.basis;
        for i in 0..3 {
            for j in 0..3 {
                let dot: f32 = (0..3).map(|r| u[r * 3 + i] * u[r * 3 + j]).sum();
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((dot - expected).abs() < 1e-4, "U^T U [{i}][{j}] = {dot}");
            }
        }
        assert!(basis.std.iter().all(|&s| s > 0.0));
        assert!(basis.std[0] >= basis.std[1] && basis.std[1] >= basis.std[2]);
        // Leading direction is (1, 1, 0) / sqrt(2) with std 3 * sqrt(2)
        let inv_sqrt2 = std::f32::consts::FRAC_1_SQRT_2;
        assert!((u[0] - inv_sqrt2).abs() < 0.02 && (u[3] - inv_sqrt2).abs() < 0.02);
        assert!((basis.std[0] - 3.0 * 2.0f32.sqrt()).abs() < 0.3, "{}", basis.std[0]);
    }

    #[test]
    fn degenerate_channels_get_a_positive_std() {
        // Channel 1 is constant
        let rows: Vec<f32> = (0..50).flat_map(|i| [i as f32, 2.0]).collect();
        let basis = PcaBasis::from_observations(&rows, 2).unwrap();
        assert!(basis.std.iter().all(|&s| s >= MIN_STD));
    }

    #[test]
    fn transform_round_trip() {
        let device = Device::default();
        let basis = PcaBasis::from_observations(&correlated_rows(500), 3).unwrap();
        let z: Tensor<B, 3> = Tensor::random([2, 3, 7], Distribution::Normal(0.0, 2.0), &device);
        for centered in [false, true] {
            let pca = PcaTransform::new(&basis, centered, &device).unwrap();
            let back = pca.inverse(pca.forward(z.clone()).unwrap()).unwrap();
            for (a, b) in values(back).iter().zip(values(z.clone()).iter()) {
                assert!((a - b).abs() < 1e-3, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn forward_whitens_training_data() {
        let device = Device::default();
        let rows = correlated_rows(2000);
        let basis = PcaBasis::from_observations(&rows, 3).unwrap();
        let pca = PcaTransform::new(&basis, false, &device).unwrap();

        // [N, 3] -> [1, 3, N]
        let z: Tensor<B, 3> = Tensor::<B, 2>::from_data(TensorData::new(rows, [2000, 3]), &device)
            .transpose()
            .unsqueeze_dim(0);
        let w = values(pca.forward(z).unwrap());
        for c in 0..3 {
            let xs = &w[c * 2000..(c + 1) * 2000];
            let var = xs.iter().map(|v| v * v).sum::<f32>() / 2000.0;
            assert!((var - 1.0).abs() < 0.1, "component {c} variance {var}");
        }
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let device = Device::default();
        let pca = PcaTransform::new(&PcaBasis::identity(4), false, &device).unwrap();
        let z: Tensor<B, 3> = Tensor::zeros([1, 3, 2], &device);
        assert!(pca.forward(z.clone()).is_err());
        assert!(pca.inverse(z).is_err());
    }

    #[test]
    fn basis_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pca.gguf");
        let basis = PcaBasis::from_observations(&correlated_rows(100), 3).unwrap();
        basis.save(&path).unwrap();
        assert_eq!(PcaBasis::load(&path).unwrap(), basis);
    }

    #[test]
    fn compute_pools_batch_and_time() {
        let device = Device::default();
        let samples: Vec<Tensor<B, 3>> = (0..4)
            .map(|_| Tensor::random([2, 3, 16], Distribution::Normal(0.0, 1.0), &device))
            .collect();
        let basis = PcaBasis::compute(&samples).unwrap();
        assert_eq!(basis.size(), 3);
        assert_eq!(basis.basis.len(), 9);
    }
}
