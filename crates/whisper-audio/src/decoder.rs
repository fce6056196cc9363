//! Decoder-style Whisper stack without a token head.
//!
//! Used by the temporal connector: learned queries attend causally among
//! themselves and fully over the encoder output.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use via_core::mask;
use via_core::random::maybe_split;
use via_core::{PrngKey, ViaError, ViaResult};

use crate::config::WhisperConfig;
use crate::layers::{DecoderLayer, LayerNorm};
use crate::position::LearnedPositionEmbedding;

/// Whisper decoder stack: `embed_positions`, `layers.N`, `layer_norm`.
#[derive(Debug, Clone)]
pub struct WhisperDecoder {
    config: WhisperConfig,
    embed_positions: LearnedPositionEmbedding,
    layers: Vec<DecoderLayer>,
    layer_norm: LayerNorm,
}

impl WhisperDecoder {
    pub fn new(config: WhisperConfig, vb: VarBuilder) -> ViaResult<Self> {
        config.validate()?;
        let embed_positions = LearnedPositionEmbedding::new(
            config.max_target_positions,
            config.d_model,
            vb.pp("embed_positions"),
        )?;
        let layers = (0..config.decoder_layers)
            .map(|i| DecoderLayer::new(&config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let layer_norm =
            LayerNorm::new(config.d_model, config.layer_norm_eps, vb.pp("layer_norm"))?;

        Ok(Self {
            config,
            embed_positions,
            layers,
            layer_norm,
        })
    }

    /// Learned position embeddings for positions `0..len`: `[len, d_model]`.
    pub fn position_embeds(&self, len: usize) -> ViaResult<Tensor> {
        if len > self.config.max_target_positions {
            return Err(ViaError::Config(format!(
                "{len} query positions exceed max_target_positions {}",
                self.config.max_target_positions
            )));
        }
        Ok(self.embed_positions.forward(len)?)
    }

    /// Run the stack.
    ///
    /// - `hidden_states`: `[B, Q, d_model]` (positions already added)
    /// - `context`: `[B, T, d_model]` encoder output
    /// - `attn_mask`: optional explicit mask (`[B, Q]` or `[B, Q, Q]`), AND-ed with the causal mask
    pub fn transformer(
        &self,
        hidden_states: &Tensor,
        context: &Tensor,
        attn_mask: Option<&Tensor>,
        key: Option<PrngKey>,
    ) -> ViaResult<Tensor> {
        let (batch, q_len, _) = hidden_states.dims3()?;
        let (ctx_batch, _, ctx_dim) = context.dims3()?;
        if ctx_batch != batch || ctx_dim != self.config.d_model {
            return Err(ViaError::Shape(format!(
                "context {:?} does not match queries {:?}",
                context.dims(),
                hidden_states.dims()
            )));
        }

        let causal = mask::causal_mask(q_len, hidden_states.device())?;
        let combined = mask::combine(&causal, attn_mask)
            .map_err(|e| ViaError::Shape(e.to_string()))?;
        let additive = mask::to_additive(&combined)?;

        let keys = maybe_split(key, self.layers.len());
        let mut hidden_states = hidden_states.clone();
        for (layer, layer_key) in self.layers.iter().zip(keys) {
            hidden_states = layer.forward(&hidden_states, context, Some(&additive), layer_key)?;
        }
        Ok(self.layer_norm.forward(&hidden_states)?)
    }

    pub fn config(&self) -> &WhisperConfig {
        &self.config
    }
}
