//! Общие типы данных: обучающий пример и политика редукции loss.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{ViaError, ViaResult};

/// Один батч обучающих данных "аудио + текст".
///
/// Все тензоры живут один шаг обучения.
#[derive(Debug, Clone)]
pub struct AudioTextExample {
    /// Mel-спектрограмма `[batch, frames, n_mels]`.
    pub audio: Tensor,
    /// Токены текста `[batch, positions]`, `u32`.
    pub tokens: Tensor,
    /// Маска loss `[batch, positions]`, `u8` (1 = позиция участвует в loss).
    pub loss_mask: Tensor,
    /// Явная маска внимания коннектора `[batch, time_group]`, `u8`.
    ///
    /// Объединяется (логическое И) с causal-маской.
    pub attn_mask: Option<Tensor>,
}

impl AudioTextExample {
    /// Собрать пример с проверкой согласованности форм.
    pub fn new(audio: Tensor, tokens: Tensor, loss_mask: Tensor) -> ViaResult<Self> {
        let (batch, _frames, _mels) = audio.dims3()?;
        let (tok_batch, positions) = tokens.dims2()?;
        if tok_batch != batch {
            return Err(ViaError::Shape(format!(
                "audio batch {batch} != tokens batch {tok_batch}"
            )));
        }
        if loss_mask.dims() != [tok_batch, positions] {
            return Err(ViaError::Shape(format!(
                "loss_mask shape {:?} != tokens shape {:?}",
                loss_mask.dims(),
                tokens.dims()
            )));
        }
        let tokens = if tokens.dtype() != DType::U32 {
            tokens.to_dtype(DType::U32)?
        } else {
            tokens
        };
        let loss_mask = if loss_mask.dtype() != DType::U8 {
            loss_mask.ne(0u8)?
        } else {
            loss_mask
        };
        Ok(Self {
            audio,
            tokens,
            loss_mask,
            attn_mask: None,
        })
    }

    /// Пример, где loss считается по всем не-pad позициям.
    pub fn from_padded_tokens(audio: Tensor, tokens: Tensor, pad_token_id: u32) -> ViaResult<Self> {
        let tokens = if tokens.dtype() != DType::U32 {
            tokens.to_dtype(DType::U32)?
        } else {
            tokens
        };
        let loss_mask = tokens.ne(pad_token_id)?;
        Self::new(audio, tokens, loss_mask)
    }

    /// Добавить явную маску внимания `[batch, time_group]`.
    pub fn with_attn_mask(self, attn_mask: Tensor) -> ViaResult<Self> {
        let (batch, _) = attn_mask.dims2()?;
        if batch != self.batch_size()? {
            return Err(ViaError::Shape(format!(
                "attn_mask batch {batch} != example batch {}",
                self.batch_size()?
            )));
        }
        let attn_mask = if attn_mask.dtype() != DType::U8 {
            attn_mask.ne(0u8)?
        } else {
            attn_mask
        };
        Ok(Self {
            attn_mask: Some(attn_mask),
            ..self
        })
    }

    /// Размер батча.
    pub fn batch_size(&self) -> ViaResult<usize> {
        Ok(self.tokens.dim(0)?)
    }

    /// Количество текстовых позиций.
    pub fn num_positions(&self) -> ViaResult<usize> {
        Ok(self.tokens.dim(1)?)
    }
}

/// Функция редукции loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Среднее по позициям маски.
    Mean,
    /// Сумма по позициям маски.
    Sum,
}

/// По каким осям сворачивать per-position loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReductionAxis {
    /// Все оси: скаляр.
    #[default]
    All,
    /// Только позиции: по значению на пример `[batch]`.
    Position,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_example_shapes_are_checked() {
        let device = Device::Cpu;
        let audio = Tensor::zeros((2, 16, 8), DType::F32, &device).unwrap();
        let tokens = Tensor::zeros((2, 4), DType::U32, &device).unwrap();
        let bad_mask = Tensor::ones((2, 3), DType::U8, &device).unwrap();
        assert!(AudioTextExample::new(audio.clone(), tokens.clone(), bad_mask).is_err());

        let mask = Tensor::ones((2, 4), DType::U8, &device).unwrap();
        let example = AudioTextExample::new(audio, tokens, mask).unwrap();
        assert_eq!(example.batch_size().unwrap(), 2);
        assert_eq!(example.num_positions().unwrap(), 4);
    }

    #[test]
    fn test_padded_tokens_mask() {
        let device = Device::Cpu;
        let audio = Tensor::zeros((1, 16, 8), DType::F32, &device).unwrap();
        let tokens = Tensor::new(&[[5u32, 6, 0, 0]], &device).unwrap();
        let example = AudioTextExample::from_padded_tokens(audio, tokens, 0).unwrap();
        let mask: Vec<Vec<u8>> = example.loss_mask.to_vec2().unwrap();
        assert_eq!(mask, vec![vec![1, 1, 0, 0]]);
    }
}
