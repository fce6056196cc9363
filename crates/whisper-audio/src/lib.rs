//! # whisper-audio
//!
//! Whisper-style building blocks for VIA:
//! - Conv1D stem (2x temporal compression) + sinusoidal positions
//! - Pre-norm Transformer encoder with self-attention
//! - Decoder-style stack (causal self-attention + cross-attention over audio),
//!   used by the temporal connector
//!
//! Encoder input is `[batch, frames, n_mels]`; output is
//! `[batch, max_source_positions, d_model]`.

pub mod config;
pub mod decoder;
pub mod layers;
pub mod model;
pub mod position;

pub use config::WhisperConfig;
pub use decoder::WhisperDecoder;
pub use model::WhisperEncoder;
