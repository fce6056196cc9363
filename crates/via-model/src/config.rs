//! VIA model configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use lm_decoder::{DecoderKind, LmConfig};
use via_core::{ViaError, ViaResult};
use whisper_audio::WhisperConfig;

/// Training objective of [`crate::ViaModel::compute_loss`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossObjective {
    /// Pseudo-logit cross-entropy plus weighted embedding regression.
    #[default]
    Hybrid,
    /// Match the decoder's final hidden state on audio and on text.
    Distillation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Weight of the embedding regression term.
    #[serde(default = "default_embedding_weight")]
    pub embedding_weight: f64,

    #[serde(default)]
    pub objective: LossObjective,
}

fn default_embedding_weight() -> f64 {
    0.025
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            embedding_weight: default_embedding_weight(),
            objective: LossObjective::Hybrid,
        }
    }
}

/// Full model configuration.
///
/// Configurations are values: derived variants are built with the `with_*`
/// methods instead of being changed in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViaConfig {
    /// Audio encoder and connector stack.
    pub encoder: WhisperConfig,

    /// Language model decoder.
    pub decoder: LmConfig,

    #[serde(default)]
    pub decoder_kind: DecoderKind,

    /// Number of learned query positions.
    #[serde(default = "default_time_group")]
    pub time_group: usize,

    /// Adjacent virtual tokens merged before projection.
    #[serde(default = "default_grouping_factor")]
    pub grouping_factor: usize,

    #[serde(default = "default_pre_audio_prompt")]
    pub pre_audio_prompt: Vec<u32>,

    #[serde(default = "default_pre_text_prompt")]
    pub pre_text_prompt: Vec<u32>,

    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,

    #[serde(default)]
    pub loss: LossConfig,

    /// Also train the connector transformer (not only queries and projection).
    #[serde(default)]
    pub train_connector: bool,
}

fn default_time_group() -> usize {
    448
}

fn default_grouping_factor() -> usize {
    4
}

// Llama 3 chat header: <|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\n
fn default_pre_audio_prompt() -> Vec<u32> {
    vec![128000, 128006, 882, 128007, 271]
}

// <|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n
fn default_pre_text_prompt() -> Vec<u32> {
    vec![128009, 128006, 78191, 128007, 271]
}

fn default_pad_token_id() -> u32 {
    128002
}

/// VIA keys of the merged HF config, next to `encoder`/`decoder`.
#[derive(Deserialize)]
struct ConnectorSettings {
    #[serde(default = "default_time_group")]
    time_group: usize,

    #[serde(default = "default_pre_audio_prompt")]
    pre_audio_prompt: Vec<u32>,

    #[serde(default = "default_pre_text_prompt")]
    pre_text_prompt: Vec<u32>,

    #[serde(default = "default_pad_token_id")]
    pad_token_id: u32,

    #[serde(default)]
    loss: LossConfig,

    #[serde(default)]
    train_connector: bool,
}

impl Default for ViaConfig {
    fn default() -> Self {
        Self {
            encoder: WhisperConfig::whisper_medium(),
            decoder: LmConfig::llama3_8b(),
            decoder_kind: DecoderKind::Llama,
            time_group: default_time_group(),
            grouping_factor: default_grouping_factor(),
            pre_audio_prompt: default_pre_audio_prompt(),
            pre_text_prompt: default_pre_text_prompt(),
            pad_token_id: default_pad_token_id(),
            loss: LossConfig::default(),
            train_connector: false,
        }
    }
}

impl ViaConfig {
    /// Virtual tokens per example after grouping.
    pub fn reduced_positions(&self) -> usize {
        self.time_group / self.grouping_factor
    }

    /// Width of one group before projection.
    pub fn grouped_embed(&self) -> usize {
        self.encoder.d_model * self.grouping_factor
    }

    pub fn with_encoder(self, encoder: WhisperConfig) -> Self {
        Self { encoder, ..self }
    }

    pub fn with_decoder(self, decoder: LmConfig) -> Self {
        Self { decoder, ..self }
    }

    pub fn with_decoder_kind(self, decoder_kind: DecoderKind) -> Self {
        Self {
            decoder_kind,
            ..self
        }
    }

    pub fn with_time_group(self, time_group: usize) -> Self {
        Self { time_group, ..self }
    }

    pub fn with_grouping_factor(self, grouping_factor: usize) -> Self {
        Self {
            grouping_factor,
            ..self
        }
    }

    pub fn with_loss(self, loss: LossConfig) -> Self {
        Self { loss, ..self }
    }

    pub fn with_train_connector(self, train_connector: bool) -> Self {
        Self {
            train_connector,
            ..self
        }
    }

    /// Check every invariant; violations are configuration errors.
    pub fn validate(&self) -> ViaResult<()> {
        self.encoder.validate()?;
        self.decoder.validate()?;

        if self.grouping_factor == 0 || self.time_group == 0 {
            return Err(ViaError::Config(format!(
                "time_group ({}) and grouping_factor ({}) must be positive",
                self.time_group, self.grouping_factor
            )));
        }
        if self.time_group % self.grouping_factor != 0 {
            return Err(ViaError::Config(format!(
                "time_group {} is not divisible by grouping_factor {}",
                self.time_group, self.grouping_factor
            )));
        }
        if self.time_group > self.encoder.max_target_positions {
            return Err(ViaError::Config(format!(
                "time_group {} exceeds the connector position table ({})",
                self.time_group, self.encoder.max_target_positions
            )));
        }
        if !self.loss.embedding_weight.is_finite() || self.loss.embedding_weight < 0.0 {
            return Err(ViaError::Config(format!(
                "embedding_weight must be finite and non-negative, got {}",
                self.loss.embedding_weight
            )));
        }

        if self.loss.objective == LossObjective::Distillation {
            if self.pre_text_prompt.is_empty() {
                return Err(ViaError::Config(
                    "distillation needs a non-empty pre_text_prompt".into(),
                ));
            }
            let vocab = self.decoder.vocab_size as u32;
            let out_of_vocab = self
                .pre_audio_prompt
                .iter()
                .chain(&self.pre_text_prompt)
                .chain(std::iter::once(&self.pad_token_id))
                .find(|&&id| id >= vocab);
            if let Some(id) = out_of_vocab {
                return Err(ViaError::Config(format!(
                    "prompt token {id} is outside the decoder vocabulary ({vocab})"
                )));
            }
        }
        Ok(())
    }

    /// Merged HF config: `{"encoder": .., "decoder": .., "time_dialation": G, ..}`.
    ///
    /// The connector and loss settings are stored next to the HF keys.
    pub fn to_hf_config(&self) -> ViaResult<serde_json::Value> {
        let mut decoder = serde_json::to_value(&self.decoder)?;
        if let Some(obj) = decoder.as_object_mut() {
            obj.insert(
                "model_type".into(),
                self.decoder_kind.model_type().into(),
            );
        }
        Ok(serde_json::json!({
            "encoder": serde_json::to_value(&self.encoder)?,
            "decoder": decoder,
            "time_dialation": self.grouping_factor,
            "time_group": self.time_group,
            "pad_token_id": self.pad_token_id,
            "pre_audio_prompt": self.pre_audio_prompt,
            "pre_text_prompt": self.pre_text_prompt,
            "loss": serde_json::to_value(&self.loss)?,
            "train_connector": self.train_connector,
        }))
    }

    /// Inverse of [`Self::to_hf_config`]; missing VIA keys take defaults.
    pub fn from_hf_value(value: &serde_json::Value) -> ViaResult<Self> {
        let encoder = value
            .get("encoder")
            .ok_or_else(|| ViaError::Config("merged config has no 'encoder'".into()))?;
        let decoder = value
            .get("decoder")
            .ok_or_else(|| ViaError::Config("merged config has no 'decoder'".into()))?;
        let grouping_factor = value
            .get("time_dialation")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ViaError::Config("merged config has no 'time_dialation'".into()))?;

        let decoder_kind = match decoder.get("model_type").and_then(|v| v.as_str()) {
            Some(model_type) => DecoderKind::from_model_type(model_type)?,
            None => DecoderKind::Llama,
        };

        let settings: ConnectorSettings = serde_json::from_value(value.clone())?;

        Ok(Self {
            encoder: WhisperConfig::from_hf_value(encoder)?,
            decoder: LmConfig::from_hf_value(decoder)?,
            decoder_kind,
            time_group: settings.time_group,
            grouping_factor: grouping_factor as usize,
            pre_audio_prompt: settings.pre_audio_prompt,
            pre_text_prompt: settings.pre_text_prompt,
            pad_token_id: settings.pad_token_id,
            loss: settings.loss,
            train_connector: settings.train_connector,
        })
    }

    pub fn from_hf_config(path: impl AsRef<Path>) -> ViaResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        Self::from_hf_value(&value)
    }

    pub fn save_hf_config(&self, path: impl AsRef<Path>) -> ViaResult<()> {
        let content = serde_json::to_string_pretty(&self.to_hf_config()?)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}
