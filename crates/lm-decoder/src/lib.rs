//! Causal language model decoder crate for VIA.
//!
//! This crate provides the Llama/Mistral decoder whose token embedding
//! space the audio connector is trained to match.

pub mod config;
pub mod layers;
pub mod model;

pub use config::{DecoderKind, LmConfig};
pub use layers::{Attention, DecoderLayer, MLP, RmsNorm, RotaryEmbedding};
pub use model::{CausalLm, LmDecoder};
