//! Named parameter store with checkpoint overlay.
//!
//! A model is built from a freshly initialised store; a checkpoint is then
//! overlaid on top of it by name. Parameters the checkpoint does not mention
//! keep their initial values, which lets older checkpoints load into newer
//! architectures.

use anyhow::{bail, ensure, Context, Result};
use burn::tensor::{Tensor, TensorData};
use std::collections::BTreeMap;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info};

use super::reader::GgufReader;
use super::writer::GgufWriter;
use crate::{Backend, Device};

type B = Backend;

/// A dense f32 parameter with its row-major shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl ParamTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        ensure!(
            data.len() == expected,
            "Parameter data has {} values, shape {shape:?} needs {expected}",
            data.len()
        );
        Ok(Self { shape, data })
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let n = shape.iter().product();
        Self {
            shape,
            data: vec![value; n],
        }
    }
}

/// Counts reported by [`ParameterStore::overlay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayReport {
    /// Keys present in both maps, value taken from the overlay.
    pub replaced: usize,
    /// Keys only present in the overlay.
    pub added: usize,
    /// Keys only present in the base, kept as they were.
    pub kept: usize,
}

/// Ordered map from parameter path (`encoder.convs.0.weight`) to tensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterStore {
    params: BTreeMap<String, ParamTensor>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ParamTensor) {
        self.params.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ParamTensor> {
        self.params.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamTensor)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Merge `other` into `self`: keys in `other` win, keys only in `self` are kept.
    pub fn overlay(&mut self, other: ParameterStore) -> OverlayReport {
        let before = self.params.len();
        let mut replaced = 0;
        let mut added = 0;
        for (name, tensor) in other.params {
            if self.params.insert(name, tensor).is_some() {
                replaced += 1;
            } else {
                added += 1;
            }
        }
        OverlayReport {
            replaced,
            added,
            kept: before - replaced,
        }
    }

    /// Every parameter here must exist in `template` with the same shape.
    pub fn check_compatible(&self, template: &ParameterStore) -> Result<()> {
        for (name, tensor) in &self.params {
            let Some(expected) = template.params.get(name) else {
                bail!("Unexpected parameter '{name}' is not part of the architecture");
            };
            ensure!(
                expected.shape == tensor.shape,
                "Shape mismatch for '{name}': checkpoint {:?}, architecture {:?}",
                tensor.shape,
                expected.shape
            );
        }
        Ok(())
    }

    /// Initial parameters of `template` overlaid with the checkpoint at `path`.
    pub fn load_over(template: &ParameterStore, path: &Path) -> Result<ParameterStore> {
        let checkpoint = Self::load(path)?;
        checkpoint
            .check_compatible(template)
            .with_context(|| format!("Checkpoint {} does not fit the model", path.display()))?;
        let mut params = template.clone();
        let report = params.overlay(checkpoint);
        info!(
            loaded = report.replaced,
            initial = report.kept,
            "Overlaid checkpoint {}",
            path.display()
        );
        Ok(params)
    }

    /// Read every tensor of a GGUF checkpoint.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open checkpoint: {}", path.display()))?;
        let mut gguf = GgufReader::open(BufReader::new(file))
            .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;
        Self::from_gguf(&mut gguf)
    }

    pub fn from_gguf<R: std::io::Read + std::io::Seek>(gguf: &mut GgufReader<R>) -> Result<Self> {
        debug!(
            "GGUF v{}, {} tensors, architecture {:?}",
            gguf.version(),
            gguf.tensor_count(),
            gguf.metadata_str("general.architecture")
        );
        let names: Vec<String> = gguf.tensor_names().into_iter().map(String::from).collect();
        let mut store = Self::new();
        for name in names {
            let shape = gguf
                .tensor_info(&name)
                .with_context(|| format!("Tensor '{name}' not found"))?
                .row_major_shape();
            let data = gguf.tensor_f32(&name)?;
            let tensor = ParamTensor::new(shape, data).with_context(|| format!("Tensor '{name}'"))?;
            store.insert(name, tensor);
        }
        Ok(store)
    }

    pub fn to_writer(&self, architecture: &str) -> Result<GgufWriter> {
        let mut writer = GgufWriter::new().architecture(architecture);
        for (name, tensor) in &self.params {
            writer.add_tensor(name, &tensor.shape, tensor.data.clone())?;
        }
        Ok(writer)
    }

    pub fn save(&self, path: &Path, architecture: &str) -> Result<()> {
        self.to_writer(architecture)?.write_to(path)
    }

    /// Materialise a parameter as a rank-`D` tensor.
    pub fn tensor<const D: usize>(&self, name: &str, device: &Device) -> Result<Tensor<B, D>> {
        let param = self
            .params
            .get(name)
            .with_context(|| format!("Parameter '{name}' not found"))?;
        let dims: [usize; D] = param.shape.as_slice().try_into().with_context(|| {
            format!(
                "Parameter '{name}' has rank {}, expected {D}",
                param.shape.len()
            )
        })?;
        Ok(Tensor::from_data(
            TensorData::new(param.data.clone(), dims),
            device,
        ))
    }
}
