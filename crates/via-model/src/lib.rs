//! VIA model crate.
//!
//! Whisper encoder features are turned into "virtual tokens" in the
//! embedding space of a causal LM:
//!
//! ```text
//! mel [B, frames, mels]
//!   → WhisperEncoder           [B, T, d]
//!   → TemporalConnector        [B, TimeGroup, d]   (learned queries, cross-attention)
//!   → TimeGroupProjector       [B, TimeGroup / G, H]
//!   → LossComposer             (pseudo-logits against the LM embedding table)
//! ```

pub mod config;
pub mod connector;
pub mod distance;
pub mod init;
pub mod loss;
pub mod model;
pub mod projector;
pub mod prompt;
pub mod trainable;

pub use config::{LossConfig, LossObjective, ViaConfig};
pub use connector::TemporalConnector;
pub use loss::LossComposer;
pub use model::ViaModel;
pub use projector::TimeGroupProjector;
pub use prompt::{PromptTemplate, WrappedText};
pub use trainable::{ParamGroup, TrainableGroups, TrainableMask};
