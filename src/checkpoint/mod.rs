//! Checkpoint storage.
//!
//! Parameters are exchanged as GGUF files of F32/F16 tensors keyed by
//! parameter path. A [`ParameterStore`] holds them in memory and implements
//! the overlay-by-name loading used for every model in the crate.

pub mod init;
pub mod reader;
pub mod store;
pub mod writer;

#[cfg(test)]
mod tests;

pub use init::{initialise, Init, ParamSpec};
pub use reader::{GgmlDtype, GgufReader, GgufTensorInfo};
pub use store::{OverlayReport, ParamTensor, ParameterStore};
pub use writer::GgufWriter;
