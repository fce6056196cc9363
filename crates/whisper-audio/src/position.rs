//! Position embeddings for the Whisper encoder and decoder stack.

use candle_core::{DType, Device, Result, Tensor, bail};
use candle_nn::VarBuilder;

/// Sinusoidal Position Embedding.
///
/// Generates sin/cos positional embeddings with log-spaced timescales.
/// Used by the encoder after the conv stem.
#[derive(Debug, Clone)]
pub struct SinusoidsPositionEmbedding {
    embedding: Tensor,
}

impl SinusoidsPositionEmbedding {
    /// Create a new sinusoidal position embedding.
    ///
    /// # Arguments
    /// * `max_length` - Maximum sequence length
    /// * `channels` - Embedding dimension (must be even)
    /// * `max_timescale` - Maximum timescale for frequencies (default: 10000.0)
    /// * `device` - Device to create tensor on
    /// * `dtype` - Data type for the embedding
    pub fn new(
        max_length: usize,
        channels: usize,
        max_timescale: f32,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if channels % 2 != 0 {
            bail!("SinusoidsPositionEmbedding needs even channels, got {channels}");
        }

        let half_channels = channels / 2;
        let log_timescale_increment =
            (max_timescale as f64).ln() / (half_channels as f64 - 1.0).max(1.0);

        let inv_timescales: Vec<f32> = (0..half_channels)
            .map(|i| (-log_timescale_increment * i as f64).exp() as f32)
            .collect();

        // scaled_time[pos, i] = pos * inv_timescales[i]; layout [sin | cos]
        let mut embedding_data = vec![0.0_f32; max_length * channels];
        for pos in 0..max_length {
            for (i, inv) in inv_timescales.iter().enumerate() {
                let scaled = pos as f32 * inv;
                embedding_data[pos * channels + i] = scaled.sin();
                embedding_data[pos * channels + half_channels + i] = scaled.cos();
            }
        }

        let embedding = Tensor::from_vec(embedding_data, (max_length, channels), device)?
            .to_dtype(dtype)?;
        Ok(Self { embedding })
    }

    /// Positional embedding `[seq_len, channels]`.
    pub fn forward(&self, seq_len: usize) -> Result<Tensor> {
        let max_length = self.embedding.dim(0)?;
        if seq_len > max_length {
            bail!("sequence length {seq_len} exceeds position table {max_length}");
        }
        self.embedding.narrow(0, 0, seq_len)
    }
}

/// Learned absolute position table (`embed_positions.weight`).
#[derive(Debug, Clone)]
pub struct LearnedPositionEmbedding {
    weight: Tensor,
}

impl LearnedPositionEmbedding {
    pub fn new(max_length: usize, channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (max_length, channels),
            "weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(Self { weight })
    }

    /// Embeddings for positions `0..seq_len`: `[seq_len, channels]`.
    pub fn forward(&self, seq_len: usize) -> Result<Tensor> {
        let max_length = self.weight.dim(0)?;
        if seq_len > max_length {
            bail!("sequence length {seq_len} exceeds position table {max_length}");
        }
        self.weight.narrow(0, 0, seq_len)
    }
}
