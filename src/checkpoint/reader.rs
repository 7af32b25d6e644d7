//! Lightweight GGUF file reader (v2 and v3).
//!
//! Parses the GGUF header, string metadata, and tensor index to provide
//! random-access to tensor data. Uses `Read + Seek` generics so that the same
//! code works with `BufReader<File>` and `Cursor<&[u8]>`.

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

pub(crate) const GGUF_MAGIC: u32 = 0x46554747; // "GGUF" as little-endian u32
pub(crate) const ALIGNMENT: u64 = 32;

/// Metadata value type code for UTF-8 strings.
pub(crate) const GGUF_TYPE_STRING: u32 = 8;

/// GGML data type codes used in GGUF tensor descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgmlDtype {
    /// 32-bit float (4 bytes per element).
    F32,
    /// 16-bit float (2 bytes per element).
    F16,
}

impl GgmlDtype {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::F32),
            1 => Ok(Self::F16),
            other => bail!("Unsupported GGML dtype code for a parameter tensor: {other}"),
        }
    }

    pub(crate) fn code(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
        }
    }

    /// Byte size for a given number of elements.
    pub fn byte_size(&self, num_elements: u64) -> u64 {
        match self {
            Self::F32 => num_elements * 4,
            Self::F16 => num_elements * 2,
        }
    }

    /// Decode little-endian raw bytes to f32 values.
    pub fn decode(&self, data: &[u8]) -> Vec<f32> {
        match self {
            Self::F32 => data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Self::F16 => data
                .chunks_exact(2)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        }
    }
}

/// Metadata for a single tensor in a GGUF file.
#[derive(Debug, Clone)]
pub struct GgufTensorInfo {
    /// Tensor name as stored in the GGUF file.
    pub name: String,
    /// Dimensions, innermost first (GGUF order).
    dimensions: Vec<u64>,
    dtype: GgmlDtype,
    /// Byte offset relative to the start of the data section.
    offset: u64,
}

impl GgufTensorInfo {
    /// Tensor shape as stored in the file (innermost dimension first).
    pub fn shape(&self) -> &[u64] {
        &self.dimensions
    }

    /// Row-major shape (outermost dimension first), as used by the models.
    pub fn row_major_shape(&self) -> Vec<usize> {
        self.dimensions.iter().rev().map(|&d| d as usize).collect()
    }

    /// The GGML data type of this tensor.
    pub fn dtype(&self) -> GgmlDtype {
        self.dtype
    }

    /// Total number of elements across all dimensions.
    pub fn num_elements(&self) -> u64 {
        self.dimensions.iter().product()
    }

    /// Total byte size of the tensor data.
    pub fn byte_size(&self) -> u64 {
        self.dtype.byte_size(self.num_elements())
    }
}

/// A reader for GGUF v2/v3 files.
///
/// Parses the header and tensor index on construction, then provides
/// random-access to individual tensor data via [`tensor_data`](Self::tensor_data).
pub struct GgufReader<R: Read + Seek> {
    reader: R,
    version: u32,
    tensor_count: u64,
    metadata: HashMap<String, String>,
    tensors: HashMap<String, GgufTensorInfo>,
    /// Tensor names in file order.
    order: Vec<String>,
    data_section_offset: u64,
}

impl GgufReader<Cursor<&[u8]>> {
    /// Open a GGUF file from an in-memory byte slice.
    pub fn from_bytes(data: &[u8]) -> Result<GgufReader<Cursor<&[u8]>>> {
        GgufReader::open(Cursor::new(data))
    }
}

impl<R: Read + Seek> GgufReader<R> {
    /// Parse a GGUF file from the given reader.
    pub fn open(mut reader: R) -> Result<Self> {
        let magic = reader
            .read_u32::<LittleEndian>()
            .context("Failed to read GGUF magic")?;
        if magic != GGUF_MAGIC {
            bail!("Invalid GGUF magic: 0x{magic:08X} (expected 0x{GGUF_MAGIC:08X})");
        }

        let version = reader
            .read_u32::<LittleEndian>()
            .context("Failed to read GGUF version")?;
        if version != 2 && version != 3 {
            bail!("Unsupported GGUF version: {version} (expected 2 or 3)");
        }

        let tensor_count = reader
            .read_u64::<LittleEndian>()
            .context("Failed to read tensor count")?;
        let metadata_kv_count = reader
            .read_u64::<LittleEndian>()
            .context("Failed to read metadata KV count")?;

        // Keep string metadata, skip everything else
        let mut metadata = HashMap::new();
        for i in 0..metadata_kv_count {
            let key = read_gguf_string(&mut reader)
                .with_context(|| format!("Failed to read metadata key {i}"))?;
            let value_type = reader
                .read_u32::<LittleEndian>()
                .with_context(|| format!("Failed to read metadata value type {i}"))?;
            if value_type == GGUF_TYPE_STRING {
                let value = read_gguf_string(&mut reader)
                    .with_context(|| format!("Failed to read metadata value for '{key}'"))?;
                metadata.insert(key, value);
            } else {
                skip_gguf_value(&mut reader, value_type)
                    .with_context(|| format!("Failed to skip metadata value for '{key}'"))?;
            }
        }

        let mut tensors = HashMap::with_capacity(tensor_count as usize);
        let mut order = Vec::with_capacity(tensor_count as usize);
        for i in 0..tensor_count {
            let name = read_gguf_string(&mut reader)
                .with_context(|| format!("Failed to read tensor name {i}"))?;
            let ndims = reader
                .read_u32::<LittleEndian>()
                .with_context(|| format!("Failed to read ndims for tensor {i}"))?;
            let mut dimensions = Vec::with_capacity(ndims as usize);
            for d in 0..ndims {
                dimensions.push(
                    reader
                        .read_u64::<LittleEndian>()
                        .with_context(|| format!("Failed to read dim {d} for tensor {i}"))?,
                );
            }
            let dtype = GgmlDtype::from_u32(
                reader
                    .read_u32::<LittleEndian>()
                    .with_context(|| format!("Failed to read dtype for tensor {i}"))?,
            )
            .with_context(|| format!("Tensor '{name}'"))?;
            let offset = reader
                .read_u64::<LittleEndian>()
                .with_context(|| format!("Failed to read offset for tensor {i}"))?;

            order.push(name.clone());
            tensors.insert(
                name.clone(),
                GgufTensorInfo {
                    name,
                    dimensions,
                    dtype,
                    offset,
                },
            );
        }

        // Data section starts at next 32-byte boundary
        let current_pos = reader.stream_position()?;
        let data_section_offset = align_up(current_pos, ALIGNMENT);

        Ok(Self {
            reader,
            version,
            tensor_count,
            metadata,
            tensors,
            order,
            data_section_offset,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn tensor_count(&self) -> u64 {
        self.tensor_count
    }

    /// String metadata value, e.g. `general.architecture`.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    /// Look up metadata for a tensor by name.
    pub fn tensor_info(&self, name: &str) -> Option<&GgufTensorInfo> {
        self.tensors.get(name)
    }

    /// Tensor names in file order.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Read raw tensor data bytes from the file.
    pub fn tensor_data(&mut self, name: &str) -> Result<Vec<u8>> {
        let info = self
            .tensors
            .get(name)
            .with_context(|| format!("Tensor '{name}' not found in GGUF"))?
            .clone();
        let byte_size = info.byte_size() as usize;
        let abs_offset = self.data_section_offset + info.offset;
        self.reader.seek(SeekFrom::Start(abs_offset))?;
        let mut buf = vec![0u8; byte_size];
        self.reader
            .read_exact(&mut buf)
            .with_context(|| format!("Truncated data for tensor '{name}'"))?;
        Ok(buf)
    }

    /// Read a tensor and decode it to f32.
    pub fn tensor_f32(&mut self, name: &str) -> Result<Vec<f32>> {
        let dtype = self
            .tensor_info(name)
            .with_context(|| format!("Tensor '{name}' not found in GGUF"))?
            .dtype();
        let data = self.tensor_data(name)?;
        Ok(dtype.decode(&data))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_gguf_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = reader.read_u64::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).context("Invalid UTF-8 in GGUF string")
}

fn skip_gguf_value<R: Read + Seek>(reader: &mut R, value_type: u32) -> Result<()> {
    match value_type {
        // u8, i8, bool
        0 | 1 | 7 => {
            reader.read_u8()?;
        }
        // u16, i16
        2 | 3 => {
            reader.seek(SeekFrom::Current(2))?;
        }
        // u32, i32, f32
        4..=6 => {
            reader.seek(SeekFrom::Current(4))?;
        }
        GGUF_TYPE_STRING => {
            let _ = read_gguf_string(reader)?;
        }
        // array
        9 => {
            let elem_type = reader.read_u32::<LittleEndian>()?;
            let count = reader.read_u64::<LittleEndian>()?;
            for _ in 0..count {
                skip_gguf_value(reader, elem_type)?;
            }
        }
        // u64, i64, f64
        10..=12 => {
            reader.seek(SeekFrom::Current(8))?;
        }
        other => bail!("Unknown GGUF metadata value type: {other}"),
    }
    Ok(())
}

pub(crate) fn align_up(offset: u64, alignment: u64) -> u64 {
    offset.div_ceil(alignment) * alignment
}
