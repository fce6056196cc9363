//! Configuration for the Whisper encoder and decoder stack.

use serde::{Deserialize, Serialize};
use std::path::Path;

use via_core::{ViaError, ViaResult};

/// Configuration shared by the Whisper encoder and the decoder-style stack.
///
/// Field names follow HuggingFace `WhisperConfig` so `config.json` can be
/// deserialized directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhisperConfig {
    /// Number of Mel filter bins (input dimension).
    pub num_mel_bins: usize,

    /// Model dimension (hidden size).
    pub d_model: usize,

    /// Number of encoder layers.
    pub encoder_layers: usize,

    /// Number of encoder attention heads.
    pub encoder_attention_heads: usize,

    /// Encoder feed-forward dimension.
    pub encoder_ffn_dim: usize,

    /// Number of decoder (connector) layers.
    pub decoder_layers: usize,

    /// Number of decoder attention heads.
    pub decoder_attention_heads: usize,

    /// Decoder feed-forward dimension.
    pub decoder_ffn_dim: usize,

    /// Encoder output length (mel frames / 2).
    pub max_source_positions: usize,

    /// Size of the learned position table of the decoder stack.
    pub max_target_positions: usize,

    /// Layer normalization epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// Dropout probability (applied only when a key is passed).
    #[serde(default)]
    pub dropout: f32,
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self::whisper_medium()
    }
}

impl WhisperConfig {
    /// openai/whisper-tiny.
    pub fn whisper_tiny() -> Self {
        Self {
            num_mel_bins: 80,
            d_model: 384,
            encoder_layers: 4,
            encoder_attention_heads: 6,
            encoder_ffn_dim: 1536,
            decoder_layers: 4,
            decoder_attention_heads: 6,
            decoder_ffn_dim: 1536,
            max_source_positions: 1500,
            max_target_positions: 448,
            layer_norm_eps: 1e-5,
            dropout: 0.0,
        }
    }

    /// openai/whisper-medium.
    pub fn whisper_medium() -> Self {
        Self {
            num_mel_bins: 80,
            d_model: 1024,
            encoder_layers: 24,
            encoder_attention_heads: 16,
            encoder_ffn_dim: 4096,
            decoder_layers: 24,
            decoder_attention_heads: 16,
            decoder_ffn_dim: 4096,
            max_source_positions: 1500,
            max_target_positions: 448,
            layer_norm_eps: 1e-5,
            dropout: 0.0,
        }
    }

    /// Number of mel frames the encoder accepts (conv2 has stride 2).
    pub fn expected_mel_frames(&self) -> usize {
        self.max_source_positions * 2
    }

    /// Head dimension of the encoder.
    pub fn encoder_head_dim(&self) -> usize {
        self.d_model / self.encoder_attention_heads
    }

    /// Head dimension of the decoder stack.
    pub fn decoder_head_dim(&self) -> usize {
        self.d_model / self.decoder_attention_heads
    }

    /// Check dimensional invariants.
    pub fn validate(&self) -> ViaResult<()> {
        if self.encoder_attention_heads == 0 || self.d_model % self.encoder_attention_heads != 0 {
            return Err(ViaError::Config(format!(
                "d_model {} is not divisible by encoder_attention_heads {}",
                self.d_model, self.encoder_attention_heads
            )));
        }
        if self.decoder_attention_heads == 0 || self.d_model % self.decoder_attention_heads != 0 {
            return Err(ViaError::Config(format!(
                "d_model {} is not divisible by decoder_attention_heads {}",
                self.d_model, self.decoder_attention_heads
            )));
        }
        if self.d_model % 2 != 0 {
            return Err(ViaError::Config(format!(
                "sinusoidal positions need an even d_model, got {}",
                self.d_model
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ViaError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    /// Parse a HuggingFace Whisper `config.json` value.
    pub fn from_hf_value(value: &serde_json::Value) -> ViaResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Load configuration from a HuggingFace Whisper `config.json`.
    pub fn from_hf_config(path: impl AsRef<Path>) -> ViaResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        Self::from_hf_value(&value)
    }
}
