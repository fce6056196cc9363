//! Temporal connector: learned queries attending over audio features.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use via_core::{PrngKey, ViaError, ViaResult};
use whisper_audio::WhisperDecoder;

use crate::config::ViaConfig;

/// `query_tokens [TimeGroup, d]` plus a Whisper decoder stack (`connector.*`).
///
/// Output length is always `TimeGroup`, whatever the batch size.
#[derive(Debug, Clone)]
pub struct TemporalConnector {
    query_tokens: Tensor,
    stack: WhisperDecoder,
    time_group: usize,
    source_positions: usize,
}

impl TemporalConnector {
    /// `vb` is the model root: queries live at `query_tokens`, the stack
    /// under `connector`.
    pub fn new(config: &ViaConfig, vb: VarBuilder) -> ViaResult<Self> {
        let query_tokens = vb.get_with_hints(
            (config.time_group, config.encoder.d_model),
            "query_tokens",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let stack = WhisperDecoder::new(config.encoder.clone(), vb.pp("connector"))?;
        Ok(Self {
            query_tokens,
            stack,
            time_group: config.time_group,
            source_positions: config.encoder.max_source_positions,
        })
    }

    /// Query tokens with their learned positions added: `[TimeGroup, d]`.
    pub fn queries(&self) -> ViaResult<Tensor> {
        let positions = self.stack.position_embeds(self.time_group)?;
        let positions = positions.to_dtype(self.query_tokens.dtype())?;
        Ok((&self.query_tokens + positions)?)
    }

    /// - `audio_features`: `[B, T, d]`, `T` must equal the encoder output length
    /// - `attn_mask`: optional `[B, TimeGroup]` mask over queries
    ///
    /// Returns `[B, TimeGroup, d]`.
    pub fn forward(
        &self,
        audio_features: &Tensor,
        attn_mask: Option<&Tensor>,
        key: Option<PrngKey>,
    ) -> ViaResult<Tensor> {
        let (batch, time, dim) = audio_features.dims3()?;
        if time != self.source_positions {
            return Err(ViaError::Config(format!(
                "audio features have {time} positions, encoder produces {}",
                self.source_positions
            )));
        }

        let queries = self
            .queries()?
            .unsqueeze(0)?
            .broadcast_as((batch, self.time_group, dim))?
            .contiguous()?;
        self.stack.transformer(&queries, audio_features, attn_mask, key)
    }

    pub fn time_group(&self) -> usize {
        self.time_group
    }
}
