//! Neural network layers for the Llama/Mistral decoder.

use candle_core::{D, DType, Device, IndexOp, Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder, linear_no_bias};

use crate::config::LmConfig;

/// RMS Normalization layer.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((size,), "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // HF-совместимо: вычисления в f32, затем каст обратно.
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;
        let variance = x_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x_f32.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x_normed = x_normed.to_dtype(input_dtype)?;
        let w = if self.weight.dtype() != input_dtype {
            self.weight.to_dtype(input_dtype)?
        } else {
            self.weight.clone()
        };
        x_normed.broadcast_mul(&w)
    }
}

/// Rotary Position Embedding (rotate_half variant).
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (theta.powf(i as f64 / head_dim as f64) as f32))
            .collect();

        let inv_freq = Tensor::new(inv_freq, device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions, device)?.unsqueeze(1)?;

        let freqs = positions.matmul(&inv_freq.unsqueeze(0)?)?; // [seq, head_dim/2]

        // rotate_half работает по половинам вектора: cos/sin размера [seq, head_dim].
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok(Self {
            cos: emb.cos()?,
            sin: emb.sin()?,
        })
    }

    /// `x`: `[batch, heads, seq, head_dim]`, positions start at zero.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(2)?;
        let max_len = self.cos.dim(0)?;
        if seq_len > max_len {
            candle_core::bail!("sequence of {seq_len} exceeds max_position_embeddings {max_len}");
        }
        let x_dtype = x.dtype();

        // cos/sin: [seq, head_dim] -> [1, 1, seq, head_dim]
        let cos = self.cos.i(0..seq_len)?.to_dtype(x_dtype)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.i(0..seq_len)?.to_dtype(x_dtype)?.unsqueeze(0)?.unsqueeze(0)?;

        // rotate_half: cat(-x2, x1)
        let head_dim = x.dim(3)?;
        let half = head_dim / 2;
        let x1 = x.i((.., .., .., 0..half))?;
        let x2 = x.i((.., .., .., half..head_dim))?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

        x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
    }
}

/// Grouped Query Attention layer.
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rope: RotaryEmbedding,
}

impl Attention {
    pub fn new(config: &LmConfig, vb: VarBuilder, rope: RotaryEmbedding) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim();

        Ok(Self {
            q_proj: linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?,
            num_heads,
            num_kv_heads,
            head_dim,
            rope,
        })
    }

    /// - `x`: `[batch, seq, hidden]`
    /// - `mask`: additive f32 mask broadcastable to `[batch, heads, seq, seq]`
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        // Transpose to [batch, heads, seq, head_dim]
        let q = q
            .reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.rope.apply(&q)?;
        let k = self.rope.apply(&k)?;

        // GQA: порядок голов [kv0,kv0, kv1,kv1, ...], как в HF `repeat_kv`.
        let kv_repeat = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, kv_repeat)?;
        let v = candle_transformers::utils::repeat_kv(v, kv_repeat)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?;

        // HF делает softmax в float32 для стабильности.
        let attn_f32 = attn.to_dtype(DType::F32)?;
        let attn_f32 = match mask {
            Some(mask) => attn_f32.broadcast_add(mask)?,
            None => attn_f32,
        };
        let attn = candle_nn::ops::softmax(&attn_f32, D::Minus1)?.to_dtype(v.dtype())?;
        let out = attn.matmul(&v)?;

        let out = out.transpose(1, 2)?.contiguous()?;
        let out = out.reshape((batch_size, seq_len, self.num_heads * self.head_dim))?;

        self.o_proj.forward(&out)
    }
}

/// SwiGLU MLP layer.
#[derive(Debug, Clone)]
pub struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    pub fn new(config: &LmConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let intermediate_size = config.intermediate_size;

        Ok(Self {
            gate_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.silu()?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

/// Transformer decoder layer.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    pub fn new(config: &LmConfig, vb: VarBuilder, rope: RotaryEmbedding) -> Result<Self> {
        let eps = config.rms_norm_eps;
        Ok(Self {
            self_attn: Attention::new(config, vb.pp("self_attn"), rope)?,
            mlp: MLP::new(config, vb.pp("mlp"))?,
            input_layernorm: RmsNorm::new(config.hidden_size, eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RmsNorm::new(
                config.hidden_size,
                eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        // Pre-norm attention
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, mask)?;
        let x = (residual + x)?;

        // Pre-norm MLP
        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        residual + x
    }
}
