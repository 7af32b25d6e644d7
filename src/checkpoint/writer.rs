//! GGUF v3 writer for F32 parameter tensors.

use anyhow::{ensure, Context, Result};
use std::io::Write;
use std::path::Path;

use super::reader::{align_up, GgmlDtype, ALIGNMENT, GGUF_MAGIC, GGUF_TYPE_STRING};

struct PendingTensor {
    name: String,
    /// Row-major shape (outermost first).
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Accumulates string metadata and F32 tensors, then serializes them as GGUF v3.
#[derive(Default)]
pub struct GgufWriter {
    metadata: Vec<(String, String)>,
    tensors: Vec<PendingTensor>,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `general.architecture`.
    pub fn architecture(self, name: &str) -> Self {
        self.metadata("general.architecture", name)
    }

    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.push((key.to_string(), value.to_string()));
        self
    }

    /// Queue a tensor. `shape` is row-major; it is stored innermost-first.
    pub fn add_tensor(&mut self, name: &str, shape: &[usize], data: Vec<f32>) -> Result<()> {
        let expected: usize = shape.iter().product();
        ensure!(
            data.len() == expected,
            "Tensor '{name}' has {} values but shape {shape:?} needs {expected}",
            data.len()
        );
        ensure!(
            self.tensors.iter().all(|t| t.name != name),
            "Duplicate tensor '{name}'"
        );
        self.tensors.push(PendingTensor {
            name: name.to_string(),
            shape: shape.to_vec(),
            data,
        });
        Ok(())
    }

    /// Serialize to an in-memory GGUF image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        buf.extend_from_slice(&(self.metadata.len() as u64).to_le_bytes());

        for (key, value) in &self.metadata {
            write_gguf_string(&mut buf, key);
            buf.extend_from_slice(&GGUF_TYPE_STRING.to_le_bytes());
            write_gguf_string(&mut buf, value);
        }

        // Tensor infos, each tensor's data starts on an aligned offset
        let mut data_offset: u64 = 0;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for tensor in &self.tensors {
            write_gguf_string(&mut buf, &tensor.name);
            buf.extend_from_slice(&(tensor.shape.len() as u32).to_le_bytes());
            for &dim in tensor.shape.iter().rev() {
                buf.extend_from_slice(&(dim as u64).to_le_bytes());
            }
            buf.extend_from_slice(&GgmlDtype::F32.code().to_le_bytes());
            buf.extend_from_slice(&data_offset.to_le_bytes());
            offsets.push(data_offset);
            let size = GgmlDtype::F32.byte_size(tensor.data.len() as u64);
            data_offset = align_up(data_offset + size, ALIGNMENT);
        }

        let data_start = align_up(buf.len() as u64, ALIGNMENT) as usize;
        pad_to(&mut buf, data_start);

        for (tensor, offset) in self.tensors.iter().zip(offsets) {
            pad_to(&mut buf, data_start + offset as usize);
            for v in &tensor.data {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }

        buf
    }

    /// Write to disk, creating parent directories as needed.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create GGUF file: {}", tmp.display()))?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move GGUF file into place: {}", path.display()))?;
        Ok(())
    }
}

fn write_gguf_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn pad_to(buf: &mut Vec<u8>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0);
    }
}
