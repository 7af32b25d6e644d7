//! Audio front-end: WAV I/O, resampling, mel features and the streaming buffer.

pub mod buffer;
pub mod frontend;
pub mod io;
pub mod mel;
pub mod resample;

pub use buffer::CausalBuffer;
pub use frontend::MelFrontend;
pub use io::{load_wav, load_wav_at, save_wav, AudioBuffer};
pub use mel::{MelConfig, MelSpectrogram};
pub use resample::resample;
