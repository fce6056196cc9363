//! Neural network layers for the Whisper encoder and decoder stack.
//!
//! Based on the HF Whisper module structure:
//! - LayerNorm with bias
//! - Multi-head attention: q/v/out projections with bias, k without
//! - FFN with fc1/fc2 (GELU activation)
//! - Pre-norm residual blocks

use candle_core::{D, DType, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear, linear_no_bias};
use via_core::PrngKey;
use via_core::random::{maybe_dropout, maybe_split};

/// LayerNorm layer with learnable weight and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Create a new LayerNorm layer.
    pub fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(hidden_size, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    /// Apply LayerNorm to the input tensor.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Вычисления в float32 для стабильности, затем каст обратно.
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;

        let mean = x_f32.mean_keepdim(D::Minus1)?;
        let x_centered = x_f32.broadcast_sub(&mean)?;
        let variance = x_centered.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x_centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x_normed = x_normed.to_dtype(input_dtype)?;

        let w = self.weight.to_dtype(input_dtype)?;
        let b = self.bias.to_dtype(input_dtype)?;
        x_normed.broadcast_mul(&w)?.broadcast_add(&b)
    }
}

/// Multi-head attention (self- or cross-).
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    /// Create a new attention layer.
    pub fn new(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let q_proj = linear(hidden_size, hidden_size, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(hidden_size, hidden_size, vb.pp("k_proj"))?;
        let v_proj = linear(hidden_size, hidden_size, vb.pp("v_proj"))?;
        let out_proj = linear(hidden_size, hidden_size, vb.pp("out_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
            head_dim: hidden_size / num_heads,
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        x.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, Q, dim]`: queries
    /// - `context`: `[B, K, dim]`: keys/values for cross-attention; `None` for self-attention
    /// - `mask`: additive f32 mask broadcastable to `[B, H, Q, K]`
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;
        let kv_input = context.unwrap_or(hidden_states);

        // Whisper: масштаб head_dim^-0.25 отдельно на q и k.
        let scale = (self.head_dim as f64).powf(-0.25);
        let q = self
            .split_heads(&self.q_proj.forward(hidden_states)?)?
            .affine(scale, 0.0)?;
        let k = self
            .split_heads(&self.k_proj.forward(kv_input)?)?
            .affine(scale, 0.0)?;
        let v = self.split_heads(&self.v_proj.forward(kv_input)?)?;

        let attn_weights = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;

        // Softmax в float32 для стабильности.
        let attn_f32 = attn_weights.to_dtype(DType::F32)?;
        let attn_f32 = match mask {
            Some(mask) => attn_f32.broadcast_add(mask)?,
            None => attn_f32,
        };
        let attn_weights =
            candle_nn::ops::softmax(&attn_f32, D::Minus1)?.to_dtype(v.dtype())?;

        let attn_output = attn_weights.matmul(&v)?;
        let attn_output = attn_output.transpose(1, 2)?.contiguous()?.reshape((
            batch_size,
            seq_len,
            self.num_heads * self.head_dim,
        ))?;

        self.out_proj.forward(&attn_output)
    }
}

/// Feed-Forward Network with GELU activation.
///
/// Structure: fc1 -> GELU -> fc2
#[derive(Debug, Clone)]
pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    pub fn new(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(hidden_size, intermediate_size, vb.pp("fc1"))?;
        let fc2 = linear(intermediate_size, hidden_size, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(x)?.gelu_erf()?;
        self.fc2.forward(&hidden)
    }
}

/// Transformer encoder layer (pre-norm).
///
/// - self_attn_layer_norm -> self_attn -> residual
/// - final_layer_norm -> mlp -> residual
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    self_attn: Attention,
    mlp: FeedForward,
    self_attn_layer_norm: LayerNorm,
    final_layer_norm: LayerNorm,
    dropout: f32,
}

impl EncoderLayer {
    pub fn new(config: &crate::WhisperConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.d_model;
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attn: Attention::new(d, config.encoder_attention_heads, vb.pp("self_attn"))?,
            mlp: FeedForward::new(d, config.encoder_ffn_dim, vb.clone())?,
            self_attn_layer_norm: LayerNorm::new(d, eps, vb.pp("self_attn_layer_norm"))?,
            final_layer_norm: LayerNorm::new(d, eps, vb.pp("final_layer_norm"))?,
            dropout: config.dropout,
        })
    }

    pub fn forward(&self, hidden_states: &Tensor, key: Option<PrngKey>) -> Result<Tensor> {
        let keys = maybe_split(key, 2);

        let residual = hidden_states;
        let h = self.self_attn_layer_norm.forward(hidden_states)?;
        let h = self.self_attn.forward(&h, None, None)?;
        let h = maybe_dropout(&h, self.dropout, keys[0])?;
        let hidden_states = (residual + h)?;

        let residual = &hidden_states;
        let h = self.final_layer_norm.forward(&hidden_states)?;
        let h = self.mlp.forward(&h)?;
        let h = maybe_dropout(&h, self.dropout, keys[1])?;
        residual + h
    }
}

/// Decoder-style layer: causal self-attention, cross-attention, FFN.
///
/// - self_attn_layer_norm -> self_attn(mask) -> residual
/// - encoder_attn_layer_norm -> encoder_attn(context) -> residual
/// - final_layer_norm -> mlp -> residual
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: Attention,
    encoder_attn: Attention,
    mlp: FeedForward,
    self_attn_layer_norm: LayerNorm,
    encoder_attn_layer_norm: LayerNorm,
    final_layer_norm: LayerNorm,
    dropout: f32,
}

impl DecoderLayer {
    pub fn new(config: &crate::WhisperConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.d_model;
        let eps = config.layer_norm_eps;
        let heads = config.decoder_attention_heads;
        Ok(Self {
            self_attn: Attention::new(d, heads, vb.pp("self_attn"))?,
            encoder_attn: Attention::new(d, heads, vb.pp("encoder_attn"))?,
            mlp: FeedForward::new(d, config.decoder_ffn_dim, vb.clone())?,
            self_attn_layer_norm: LayerNorm::new(d, eps, vb.pp("self_attn_layer_norm"))?,
            encoder_attn_layer_norm: LayerNorm::new(d, eps, vb.pp("encoder_attn_layer_norm"))?,
            final_layer_norm: LayerNorm::new(d, eps, vb.pp("final_layer_norm"))?,
            dropout: config.dropout,
        })
    }

    /// - `hidden_states`: `[B, Q, dim]`
    /// - `context`: `[B, T, dim]` audio features
    /// - `mask`: additive self-attention mask `[B|1, 1, Q, Q]`
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        context: &Tensor,
        mask: Option<&Tensor>,
        key: Option<PrngKey>,
    ) -> Result<Tensor> {
        let keys = maybe_split(key, 3);

        let residual = hidden_states;
        let h = self.self_attn_layer_norm.forward(hidden_states)?;
        let h = self.self_attn.forward(&h, None, mask)?;
        let h = maybe_dropout(&h, self.dropout, keys[0])?;
        let hidden_states = (residual + h)?;

        let residual = &hidden_states;
        let h = self.encoder_attn_layer_norm.forward(&hidden_states)?;
        let h = self.encoder_attn.forward(&h, Some(context), None)?;
        let h = maybe_dropout(&h, self.dropout, keys[1])?;
        let hidden_states = (residual + h)?;

        let residual = &hidden_states;
        let h = self.final_layer_norm.forward(&hidden_states)?;
        let h = self.mlp.forward(&h)?;
        let h = maybe_dropout(&h, self.dropout, keys[2])?;
        residual + h
    }
}
