//! Llama/Mistral causal LM.

use candle_core::{Device, DType, Result, Tensor, Var};
use candle_nn::{Embedding, Init, Linear, Module, VarBuilder, VarMap, linear_no_bias};
use tracing::{debug, info};

use via_core::{PrngKey, ViaError, ViaResult, mask};

use crate::config::{DecoderKind, LmConfig};
use crate::layers::{DecoderLayer, RmsNorm, RotaryEmbedding};

const EMBED_TOKENS: &str = "model.embed_tokens.weight";
const LM_HEAD: &str = "lm_head.weight";

/// Causal decoder with HF parameter names (`model.embed_tokens`,
/// `model.layers.N`, `model.norm`, `lm_head`).
#[derive(Debug, Clone)]
pub struct CausalLm {
    config: LmConfig,
    prefix: String,
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Option<Linear>,
}

impl CausalLm {
    pub fn new(config: LmConfig, vb: VarBuilder) -> ViaResult<Self> {
        config.validate()?;
        let model_vb = vb.pp("model");

        let embed_weight = model_vb.pp("embed_tokens").get_with_hints(
            (config.vocab_size, config.hidden_size),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let embed_tokens = Embedding::new(embed_weight, config.hidden_size);

        // RoPE одинаковый для всех слоев: строим таблицы один раз и делимся ими.
        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            vb.device(),
        )?;

        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::new(&config, model_vb.pp(format!("layers.{i}")), rope.clone()))
            .collect::<Result<Vec<_>>>()?;

        let norm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, model_vb.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        debug!(
            layers = config.num_hidden_layers,
            vocab = config.vocab_size,
            tied = config.tie_word_embeddings,
            "decoder built"
        );

        Ok(Self {
            config,
            prefix: vb.prefix(),
            embed_tokens,
            layers,
            norm,
            lm_head,
        })
    }

    /// Token ids `[batch, seq]` (u32) → embeddings `[batch, seq, hidden]`.
    pub fn embed(&self, input_ids: &Tensor) -> ViaResult<Tensor> {
        Ok(self.embed_tokens.forward(input_ids)?)
    }

    /// Input embedding table `[vocab, hidden]`.
    pub fn token_embeddings(&self) -> &Tensor {
        self.embed_tokens.embeddings()
    }

    /// Final hidden states (after the last norm) for pre-computed embeddings.
    ///
    /// The structural mask is causal (restricted to the sliding window when
    /// the config has one) and is AND-ed with `attn_mask` (`[batch, seq]` or
    /// `[batch, seq, seq]`).
    pub fn transformer(&self, embeds: &Tensor, attn_mask: Option<&Tensor>) -> ViaResult<Tensor> {
        let (_, seq_len, hidden) = embeds.dims3()?;
        if hidden != self.config.hidden_size {
            return Err(ViaError::Shape(format!(
                "embeddings have width {hidden}, decoder expects {}",
                self.config.hidden_size
            )));
        }

        let structural =
            mask::sliding_window_mask(seq_len, self.config.sliding_window, embeds.device())?;
        let combined = mask::combine(&structural, attn_mask)
            .map_err(|e| ViaError::Shape(e.to_string()))?;
        let additive = mask::to_additive(&combined)?;

        let mut hidden_states = embeds.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            hidden_states = layer.forward(&hidden_states, Some(&additive))?;
            if via_core::debug::enabled() {
                eprintln!(
                    "DEBUG decoder layer {}: hidden_states {:?} {:?}",
                    i,
                    hidden_states.dims(),
                    hidden_states.dtype()
                );
            }
        }
        Ok(self.norm.forward(&hidden_states)?)
    }

    /// Hidden states → logits `[batch, seq, vocab]`.
    pub fn logits(&self, hidden_states: &Tensor) -> ViaResult<Tensor> {
        let logits = match &self.lm_head {
            Some(head) => head.forward(hidden_states)?,
            None => hidden_states.broadcast_matmul(&self.token_embeddings().t()?)?,
        };
        Ok(logits)
    }

    /// Resize the vocabulary.
    ///
    /// Rows shared by both sizes are copied; new rows are drawn from
    /// `N(0, 0.02)` with `key`. The tables are replaced inside `varmap`, and
    /// the returned decoder is rebuilt from `vb`, which must be backed by the
    /// same `varmap` and point at the same prefix.
    pub fn resize_vocab(
        &self,
        new_size: usize,
        key: PrngKey,
        varmap: &VarMap,
        vb: VarBuilder,
    ) -> ViaResult<Self> {
        if new_size == 0 {
            return Err(ViaError::Config("vocabulary size must be positive".into()));
        }
        if vb.prefix() != self.prefix {
            return Err(ViaError::Parameter(format!(
                "rebuild prefix '{}' differs from decoder prefix '{}'",
                vb.prefix(),
                self.prefix
            )));
        }

        resize_table(varmap, &self.full_name(EMBED_TOKENS), new_size, key.fold_in("embed_tokens"))?;
        if !self.config.tie_word_embeddings {
            resize_table(varmap, &self.full_name(LM_HEAD), new_size, key.fold_in("lm_head"))?;
        }

        info!(
            from = self.config.vocab_size,
            to = new_size,
            "resized decoder vocabulary"
        );
        Self::new(self.config.with_vocab_size(new_size), vb)
    }

    fn full_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    pub fn config(&self) -> &LmConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        self.token_embeddings().device()
    }

    pub fn dtype(&self) -> DType {
        self.token_embeddings().dtype()
    }
}

fn resize_table(varmap: &VarMap, name: &str, new_rows: usize, key: PrngKey) -> ViaResult<()> {
    let mut data = varmap
        .data()
        .lock()
        .map_err(|_| ViaError::Parameter("parameter store lock poisoned".into()))?;
    let old = data
        .get(name)
        .ok_or_else(|| ViaError::Parameter(format!("missing parameter '{name}'")))?
        .as_tensor()
        .clone();

    let (old_rows, hidden) = old.dims2()?;
    let kept = old.narrow(0, 0, old_rows.min(new_rows))?;
    let table = if new_rows > old_rows {
        let fresh = key
            .normal((new_rows - old_rows, hidden), 0.0, 0.02, old.device())?
            .to_dtype(old.dtype())?;
        Tensor::cat(&[&kept, &fresh], 0)?
    } else {
        kept.copy()?
    };

    data.insert(name.to_string(), Var::from_tensor(&table)?);
    Ok(())
}

/// Decoder family as a closed set of variants with one capability surface.
#[derive(Debug, Clone)]
pub enum LmDecoder {
    Llama(CausalLm),
    Mistral(CausalLm),
}

impl LmDecoder {
    pub fn new(kind: DecoderKind, config: LmConfig, vb: VarBuilder) -> ViaResult<Self> {
        match kind {
            DecoderKind::Llama => {
                let config = if config.sliding_window.is_some() {
                    tracing::warn!("llama decoder ignores sliding_window");
                    LmConfig {
                        sliding_window: None,
                        ..config
                    }
                } else {
                    config
                };
                Ok(Self::Llama(CausalLm::new(config, vb)?))
            }
            DecoderKind::Mistral => Ok(Self::Mistral(CausalLm::new(config, vb)?)),
        }
    }

    pub fn kind(&self) -> DecoderKind {
        match self {
            Self::Llama(_) => DecoderKind::Llama,
            Self::Mistral(_) => DecoderKind::Mistral,
        }
    }

    fn inner(&self) -> &CausalLm {
        match self {
            Self::Llama(lm) | Self::Mistral(lm) => lm,
        }
    }

    pub fn embed(&self, input_ids: &Tensor) -> ViaResult<Tensor> {
        self.inner().embed(input_ids)
    }

    pub fn token_embeddings(&self) -> &Tensor {
        self.inner().token_embeddings()
    }

    pub fn transformer(&self, embeds: &Tensor, attn_mask: Option<&Tensor>) -> ViaResult<Tensor> {
        self.inner().transformer(embeds, attn_mask)
    }

    pub fn logits(&self, hidden_states: &Tensor) -> ViaResult<Tensor> {
        self.inner().logits(hidden_states)
    }

    /// Same family, resized vocabulary. See [`CausalLm::resize_vocab`].
    pub fn resize_vocab(
        &self,
        new_size: usize,
        key: PrngKey,
        varmap: &VarMap,
        vb: VarBuilder,
    ) -> ViaResult<Self> {
        let resized = self.inner().resize_vocab(new_size, key, varmap, vb)?;
        Ok(match self {
            Self::Llama(_) => Self::Llama(resized),
            Self::Mistral(_) => Self::Mistral(resized),
        })
    }

    pub fn config(&self) -> &LmConfig {
        self.inner().config()
    }

    pub fn vocab_size(&self) -> usize {
        self.config().vocab_size
    }

    pub fn hidden_size(&self) -> usize {
        self.config().hidden_size
    }
}
