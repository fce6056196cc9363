//! Configuration for the causal LM decoder.

use serde::{Deserialize, Serialize};
use std::path::Path;

use via_core::{ViaError, ViaResult};

/// Decoder family, selected once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    #[default]
    Llama,
    Mistral,
}

impl DecoderKind {
    /// Map HuggingFace `model_type` to a decoder family.
    pub fn from_model_type(model_type: &str) -> ViaResult<Self> {
        match model_type {
            "llama" => Ok(Self::Llama),
            "mistral" => Ok(Self::Mistral),
            other => Err(ViaError::Config(format!(
                "unsupported decoder model_type '{other}'"
            ))),
        }
    }

    pub fn model_type(self) -> &'static str {
        match self {
            Self::Llama => "llama",
            Self::Mistral => "mistral",
        }
    }
}

/// Configuration for the LLM decoder.
///
/// Field names follow HuggingFace `LlamaConfig` / `MistralConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmConfig {
    /// Hidden size.
    pub hidden_size: usize,

    /// Number of hidden layers.
    pub num_hidden_layers: usize,

    /// Number of attention heads.
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA).
    pub num_key_value_heads: usize,

    /// Intermediate size for MLP.
    pub intermediate_size: usize,

    /// Vocabulary size.
    pub vocab_size: usize,

    /// Maximum sequence length.
    pub max_position_embeddings: usize,

    /// RMS norm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// RoPE theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// Share the input embedding table with the LM head.
    #[serde(default)]
    pub tie_word_embeddings: bool,

    /// Mistral sliding attention window (`None` = full causal attention).
    #[serde(default)]
    pub sliding_window: Option<usize>,
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10_000.0
}

impl Default for LmConfig {
    fn default() -> Self {
        Self::llama3_8b()
    }
}

impl LmConfig {
    /// Meta Llama 3 8B.
    pub fn llama3_8b() -> Self {
        Self {
            hidden_size: 4096,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            num_key_value_heads: 8,
            intermediate_size: 14336,
            vocab_size: 128256,
            max_position_embeddings: 8192,
            rms_norm_eps: 1e-5,
            rope_theta: 500_000.0,
            tie_word_embeddings: false,
            sliding_window: None,
        }
    }

    /// Mistral 7B v0.1.
    pub fn mistral_7b() -> Self {
        Self {
            hidden_size: 4096,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            num_key_value_heads: 8,
            intermediate_size: 14336,
            vocab_size: 32000,
            max_position_embeddings: 32768,
            rms_norm_eps: 1e-5,
            rope_theta: 10_000.0,
            tie_word_embeddings: false,
            sliding_window: Some(4096),
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Same configuration with another vocabulary size.
    pub fn with_vocab_size(&self, vocab_size: usize) -> Self {
        Self {
            vocab_size,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> ViaResult<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(ViaError::Config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_key_value_heads == 0 || self.num_attention_heads % self.num_key_value_heads != 0
        {
            return Err(ViaError::Config(format!(
                "num_attention_heads {} is not divisible by num_key_value_heads {}",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(ViaError::Config(format!(
                "rotary embeddings need an even head_dim, got {}",
                self.head_dim()
            )));
        }
        if self.sliding_window == Some(0) {
            return Err(ViaError::Config("sliding_window must be positive".into()));
        }
        Ok(())
    }

    /// Parse a HuggingFace decoder `config.json` value.
    pub fn from_hf_value(value: &serde_json::Value) -> ViaResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Load configuration from HuggingFace config.json.
    pub fn from_hf_config(path: impl AsRef<Path>) -> ViaResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        Self::from_hf_value(&value)
    }
}
