//! Tiny configuration shared by the integration tests.

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use lm_decoder::LmConfig;
use via_core::AudioTextExample;
use via_model::ViaConfig;
use whisper_audio::WhisperConfig;

pub const PAD: u32 = 0;
pub const MEL_FRAMES: usize = 12;
pub const MEL_BINS: usize = 8;

pub fn tiny_config() -> ViaConfig {
    let encoder = WhisperConfig {
        num_mel_bins: MEL_BINS,
        d_model: 16,
        encoder_layers: 1,
        encoder_attention_heads: 2,
        encoder_ffn_dim: 32,
        decoder_layers: 1,
        decoder_attention_heads: 2,
        decoder_ffn_dim: 32,
        max_source_positions: MEL_FRAMES / 2,
        max_target_positions: 16,
        layer_norm_eps: 1e-5,
        dropout: 0.0,
    };
    let decoder = LmConfig {
        hidden_size: 12,
        num_hidden_layers: 1,
        num_attention_heads: 2,
        num_key_value_heads: 1,
        intermediate_size: 24,
        vocab_size: 20,
        max_position_embeddings: 64,
        rms_norm_eps: 1e-5,
        rope_theta: 10_000.0,
        tie_word_embeddings: false,
        sliding_window: None,
    };
    ViaConfig {
        pre_audio_prompt: vec![1, 2],
        pre_text_prompt: vec![3, 4],
        pad_token_id: PAD,
        ..ViaConfig::default()
            .with_encoder(encoder)
            .with_decoder(decoder)
            .with_time_group(16)
            .with_grouping_factor(4)
    }
}

pub fn zero_mel(batch: usize, device: &Device) -> Tensor {
    Tensor::zeros((batch, MEL_FRAMES, MEL_BINS), DType::F32, device).unwrap()
}

/// Batch of two examples with right padding.
pub fn example(device: &Device) -> AudioTextExample {
    let tokens = Tensor::new(&[[5u32, 6, 7, PAD], [8, 9, PAD, PAD]], device).unwrap();
    AudioTextExample::from_padded_tokens(zero_mel(2, device), tokens, PAD).unwrap()
}
