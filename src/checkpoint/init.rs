//! Parameter initialisation.
//!
//! Every parameter of rank >= 2 gets Xavier-normal values; rank-1 parameters
//! are skipped by that pass and keep their layer defaults (uniform conv bias,
//! unit norm scale, zero shift, unit running variance).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::info;

use super::store::{ParamTensor, ParameterStore};

/// Layer default for a parameter the Xavier pass cannot handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// Xavier-normal, gain 1.
    XavierNormal,
    /// Uniform in `[-bound, bound]`.
    Uniform(f32),
    Constant(f32),
}

/// Name, row-major shape and initialiser of a single parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: Init,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, init: Init) -> Self {
        Self {
            name: name.into(),
            shape,
            init,
        }
    }
}

/// Fan-in/fan-out of a conv-style weight `[d0, d1, k...]`.
pub fn fans(shape: &[usize]) -> (usize, usize) {
    let receptive: usize = shape.iter().skip(2).product();
    let fan_in = shape.get(1).copied().unwrap_or(1) * receptive;
    let fan_out = shape.first().copied().unwrap_or(1) * receptive;
    (fan_in, fan_out)
}

/// Build a store from parameter specs with a seeded RNG.
pub fn initialise(specs: &[ParamSpec], seed: u64) -> ParameterStore {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut store = ParameterStore::new();
    let mut skipped = 0;

    for spec in specs {
        let n: usize = spec.shape.iter().product();
        let init = if spec.shape.len() >= 2 {
            Init::XavierNormal
        } else {
            skipped += 1;
            spec.init
        };
        let data = match init {
            Init::XavierNormal => {
                let (fan_in, fan_out) = fans(&spec.shape);
                let std = (2.0 / (fan_in + fan_out).max(1) as f64).sqrt();
                match Normal::new(0.0, std) {
                    Ok(normal) => (0..n).map(|_| normal.sample(&mut rng) as f32).collect(),
                    Err(_) => vec![0.0; n],
                }
            }
            Init::Uniform(bound) if bound > 0.0 => {
                (0..n).map(|_| rng.gen_range(-bound..bound)).collect()
            }
            Init::Uniform(_) => vec![0.0; n],
            Init::Constant(v) => vec![v; n],
        };
        store.insert(
            spec.name.clone(),
            ParamTensor {
                shape: spec.shape.clone(),
                data,
            },
        );
    }

    info!("Skipped {skipped} parameters during initialisation");
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_init_is_reproducible() {
        let specs = vec![
            ParamSpec::new("conv.weight", vec![8, 4, 3], Init::XavierNormal),
            ParamSpec::new("conv.bias", vec![8], Init::Uniform(0.2)),
            ParamSpec::new("bn.running_var", vec![4], Init::Constant(1.0)),
        ];
        let a = initialise(&specs, 7);
        let b = initialise(&specs, 7);
        assert_eq!(a, b);
        assert_ne!(a, initialise(&specs, 8));

        assert_eq!(a.get("bn.running_var").unwrap().data, vec![1.0; 4]);
        assert!(a
            .get("conv.bias")
            .unwrap()
            .data
            .iter()
            .all(|v| v.abs() <= 0.2));
    }

    #[test]
    fn xavier_variance_is_plausible() {
        let specs = vec![ParamSpec::new("w", vec![64, 64, 3], Init::XavierNormal)];
        let store = initialise(&specs, 0);
        let data = &store.get("w").unwrap().data;
        let var = data.iter().map(|v| v * v).sum::<f32>() / data.len() as f32;
        // 2 / (192 + 192)
        let expected = 2.0 / 384.0;
        assert!((var - expected).abs() < expected * 0.2, "var {var}");
    }

    #[test]
    fn fans_follow_conv_layout() {
        assert_eq!(fans(&[16, 8, 3]), (24, 48));
        assert_eq!(fans(&[5]), (1, 5));
    }
}
