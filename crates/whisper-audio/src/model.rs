//! Whisper audio encoder.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Module, VarBuilder, conv1d};
use tracing::debug;

use via_core::random::{maybe_dropout, maybe_split};
use via_core::{AudioEncoder, PrngKey, ViaError, ViaResult};

use crate::config::WhisperConfig;
use crate::layers::{EncoderLayer, LayerNorm};
use crate::position::SinusoidsPositionEmbedding;

/// Whisper audio encoder.
///
/// 1. Conv1D stem: conv1 (stride 1) + conv2 (stride 2), GELU after each
/// 2. Sinusoidal positional embedding
/// 3. Pre-norm Transformer encoder layers
/// 4. Final layer normalization
#[derive(Debug, Clone)]
pub struct WhisperEncoder {
    config: WhisperConfig,
    conv1: Conv1d,
    conv2: Conv1d,
    positional_embedding: SinusoidsPositionEmbedding,
    layers: Vec<EncoderLayer>,
    layer_norm: LayerNorm,
    dtype: DType,
}

impl WhisperEncoder {
    /// Create a new encoder; weights live under `vb` (`conv1`, `layers.N`, `layer_norm`).
    pub fn new(config: WhisperConfig, vb: VarBuilder) -> ViaResult<Self> {
        config.validate()?;
        let d_model = config.d_model;

        let conv1_cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv1d(config.num_mel_bins, d_model, 3, conv1_cfg, vb.pp("conv1"))?;
        let conv2_cfg = Conv1dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv2 = conv1d(d_model, d_model, 3, conv2_cfg, vb.pp("conv2"))?;

        let positional_embedding = SinusoidsPositionEmbedding::new(
            config.max_source_positions,
            d_model,
            10000.0,
            vb.device(),
            vb.dtype(),
        )?;

        let layers = (0..config.encoder_layers)
            .map(|i| EncoderLayer::new(&config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let layer_norm = LayerNorm::new(d_model, config.layer_norm_eps, vb.pp("layer_norm"))?;

        Ok(Self {
            dtype: vb.dtype(),
            config,
            conv1,
            conv2,
            positional_embedding,
            layers,
            layer_norm,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `mel` - Mel spectrogram `[batch, frames, n_mels]`, `frames == 2 * max_source_positions`
    /// * `key` - dropout key (`None` in evaluation)
    ///
    /// # Returns
    /// Audio embeddings `[batch, max_source_positions, d_model]`
    pub fn forward(&self, mel: &Tensor, key: Option<PrngKey>) -> ViaResult<Tensor> {
        let (_batch, frames, n_mels) = mel.dims3()?;
        if frames != self.config.expected_mel_frames() || n_mels != self.config.num_mel_bins {
            return Err(ViaError::Config(format!(
                "encoder expects [batch, {}, {}] mel features, got [_, {frames}, {n_mels}]",
                self.config.expected_mel_frames(),
                self.config.num_mel_bins
            )));
        }

        let mel = if mel.dtype() != self.dtype {
            mel.to_dtype(self.dtype)?
        } else {
            mel.clone()
        };

        // [batch, frames, mels] -> [batch, mels, frames]
        let x = mel.transpose(1, 2)?.contiguous()?;
        let x = self.conv1.forward(&x)?.gelu_erf()?;
        let x = self.conv2.forward(&x)?.gelu_erf()?;
        let x = x.transpose(1, 2)?.contiguous()?; // [batch, t, d_model]

        let t = x.dim(1)?;
        let pos = self.positional_embedding.forward(t)?.unsqueeze(0)?;
        let x = x.broadcast_add(&pos)?;

        let keys = maybe_split(key, self.layers.len() + 1);
        let mut hidden_states = maybe_dropout(&x, self.config.dropout, keys[0])?;
        for (layer, layer_key) in self.layers.iter().zip(keys.into_iter().skip(1)) {
            hidden_states = layer.forward(&hidden_states, layer_key)?;
        }
        let out = self.layer_norm.forward(&hidden_states)?;

        if via_core::debug::enabled() {
            debug!("WhisperEncoder: frames={frames}, out={:?}", out.dims());
        }
        Ok(out)
    }

    /// Get the configuration.
    pub fn config(&self) -> &WhisperConfig {
        &self.config
    }

    /// Device of the encoder weights.
    pub fn device(&self) -> &Device {
        self.conv1.weight().device()
    }
}

impl AudioEncoder for WhisperEncoder {
    fn expected_frames(&self) -> usize {
        self.config.expected_mel_frames()
    }

    fn output_positions(&self) -> usize {
        self.config.max_source_positions
    }

    fn output_dim(&self) -> usize {
        self.config.d_model
    }

    fn encode(&self, mel: &Tensor, key: Option<PrngKey>) -> ViaResult<Tensor> {
        self.forward(mel, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> WhisperConfig {
        WhisperConfig {
            num_mel_bins: 8,
            d_model: 16,
            encoder_layers: 2,
            encoder_attention_heads: 2,
            encoder_ffn_dim: 32,
            decoder_layers: 1,
            decoder_attention_heads: 2,
            decoder_ffn_dim: 32,
            max_source_positions: 6,
            max_target_positions: 16,
            layer_norm_eps: 1e-5,
            dropout: 0.0,
        }
    }

    #[test]
    fn test_encoder_output_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = WhisperEncoder::new(tiny_config(), vb.pp("encoder")).unwrap();

        // 12 mel frames -> 6 positions (stride-2 conv)
        let mel = Tensor::zeros((3, 12, 8), DType::F32, &device).unwrap();
        let out = encoder.encode(&mel, None).unwrap();
        assert_eq!(out.dims(), &[3, 6, 16]);
        assert_eq!(encoder.output_positions(), 6);
    }

    #[test]
    fn test_encoder_rejects_wrong_length() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = WhisperEncoder::new(tiny_config(), vb).unwrap();

        let mel = Tensor::zeros((1, 10, 8), DType::F32, &device).unwrap();
        assert!(matches!(encoder.encode(&mel, None), Err(ViaError::Config(_))));
    }
}
