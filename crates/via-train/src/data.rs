//! Источники обучающих батчей.
//!
//! Оба источника реализуют `Iterator<Item = ViaResult<AudioTextExample>>`; resume
//! пропускает уже потребленные батчи через `Iterator::nth`.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::info;

use via_core::{AudioTextExample, ViaError, ViaResult};
use via_model::ViaConfig;

/// Нулевая mel-спектрограмма + фиксированная последовательность токенов.
///
/// Для smoke-запусков и тестов; бесконечный.
#[derive(Debug, Clone)]
pub struct SyntheticExamples {
    example: AudioTextExample,
}

impl SyntheticExamples {
    pub fn new(
        config: &ViaConfig,
        batch_size: usize,
        tokens: &[u32],
        device: &Device,
    ) -> ViaResult<Self> {
        if tokens.is_empty() || tokens.len() > config.reduced_positions() {
            return Err(ViaError::Data(format!(
                "synthetic sequence must have 1..={} tokens, got {}",
                config.reduced_positions(),
                tokens.len()
            )));
        }
        let mel = Tensor::zeros(
            (
                batch_size,
                config.encoder.expected_mel_frames(),
                config.encoder.num_mel_bins,
            ),
            DType::F32,
            device,
        )?;
        let row = Tensor::new(tokens, device)?.unsqueeze(0)?;
        let tokens = row.broadcast_as((batch_size, tokens.len()))?.contiguous()?;
        let example = AudioTextExample::from_padded_tokens(mel, tokens, config.pad_token_id)?;
        Ok(Self { example })
    }

    /// Токены `1..=n`, где `n` равно числу виртуальных токенов (с учетом словаря).
    pub fn for_config(config: &ViaConfig, batch_size: usize, device: &Device) -> ViaResult<Self> {
        let vocab = config.decoder.vocab_size as u32;
        let tokens: Vec<u32> = (0..config.reduced_positions() as u32)
            .map(|i| (i + 1) % vocab)
            .map(|t| if t == config.pad_token_id { (t + 1) % vocab } else { t })
            .collect();
        Self::new(config, batch_size, &tokens, device)
    }
}

impl Iterator for SyntheticExamples {
    type Item = ViaResult<AudioTextExample>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(Ok(self.example.clone()))
    }
}

/// Предтокенизированный набор в одном safetensors-файле.
///
/// Тензоры: `mel [N, frames, mels]`, `tokens [N, positions]`, опционально
/// `loss_mask [N, positions]` (по умолчанию все не-pad позиции) и
/// `attn_mask [N, time_group]`. Неполный последний батч отбрасывается.
#[derive(Debug, Clone)]
pub struct SafetensorsExamples {
    mel: Tensor,
    tokens: Tensor,
    loss_mask: Tensor,
    attn_mask: Option<Tensor>,
    batch_size: usize,
    num_batches: usize,
    cursor: usize,
    cycle: bool,
}

impl SafetensorsExamples {
    pub fn load(
        path: impl AsRef<Path>,
        batch_size: usize,
        pad_token_id: u32,
        cycle: bool,
        device: &Device,
    ) -> ViaResult<Self> {
        let path = path.as_ref();
        if batch_size == 0 {
            return Err(ViaError::Data("batch_size must be positive".into()));
        }
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let mut take = |name: &str| tensors.remove(name);

        let mel = take("mel")
            .ok_or_else(|| ViaError::Data(format!("{} has no 'mel' tensor", path.display())))?
            .to_dtype(DType::F32)?;
        let tokens = take("tokens")
            .ok_or_else(|| ViaError::Data(format!("{} has no 'tokens' tensor", path.display())))?
            .to_dtype(DType::U32)?;
        let loss_mask = match take("loss_mask") {
            Some(mask) => mask.ne(0u8)?,
            None => tokens.ne(pad_token_id)?,
        };
        let attn_mask = take("attn_mask").map(|m| m.ne(0u8)).transpose()?;

        let num_examples = tokens.dim(0)?;
        if mel.dim(0)? != num_examples || loss_mask.dims() != tokens.dims() {
            return Err(ViaError::Data(format!(
                "inconsistent dataset shapes: mel {:?}, tokens {:?}, loss_mask {:?}",
                mel.dims(),
                tokens.dims(),
                loss_mask.dims()
            )));
        }
        let num_batches = num_examples / batch_size;
        if num_batches == 0 {
            return Err(ViaError::Data(format!(
                "{num_examples} examples are fewer than one batch of {batch_size}"
            )));
        }

        info!(
            path = %path.display(),
            examples = num_examples,
            batches = num_batches,
            "loaded dataset"
        );

        Ok(Self {
            mel,
            tokens,
            loss_mask,
            attn_mask,
            batch_size,
            num_batches,
            cursor: 0,
            cycle,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    fn batch(&self, index: usize) -> ViaResult<AudioTextExample> {
        let start = index * self.batch_size;
        let example = AudioTextExample::new(
            self.mel.narrow(0, start, self.batch_size)?,
            self.tokens.narrow(0, start, self.batch_size)?,
            self.loss_mask.narrow(0, start, self.batch_size)?,
        )?;
        match &self.attn_mask {
            Some(mask) => example.with_attn_mask(mask.narrow(0, start, self.batch_size)?),
            None => Ok(example),
        }
    }
}

impl Iterator for SafetensorsExamples {
    type Item = ViaResult<AudioTextExample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.num_batches {
            if !self.cycle {
                return None;
            }
            self.cursor = 0;
        }
        let item = self.batch(self.cursor);
        self.cursor += 1;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_safetensors_batches() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.safetensors");

        let mel = Tensor::zeros((5, 4, 2), DType::F32, &device).unwrap();
        let tokens = Tensor::new(
            &[[1u32, 2, 0], [3, 0, 0], [4, 5, 6], [7, 8, 0], [9, 9, 9]],
            &device,
        )
        .unwrap();
        let tensors = HashMap::from([("mel".to_string(), mel), ("tokens".to_string(), tokens)]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let data = SafetensorsExamples::load(&path, 2, 0, false, &device).unwrap();
        assert_eq!(data.num_batches(), 2);
        let batches: Vec<AudioTextExample> = data.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 2);
        let mask: Vec<Vec<u8>> = batches[0].loss_mask.to_vec2().unwrap();
        assert_eq!(mask, vec![vec![1, 1, 0], vec![1, 0, 0]]);

        let mut cycling = SafetensorsExamples::load(&path, 2, 0, true, &device).unwrap();
        let third = cycling.nth(2).unwrap().unwrap();
        let first_row: Vec<Vec<u32>> = third.tokens.to_vec2().unwrap();
        assert_eq!(first_row[0], vec![1, 2, 0]);
    }

    #[test]
    fn test_too_small_dataset() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.safetensors");
        let tensors = HashMap::from([
            (
                "mel".to_string(),
                Tensor::zeros((1, 4, 2), DType::F32, &device).unwrap(),
            ),
            (
                "tokens".to_string(),
                Tensor::new(&[[1u32]], &device).unwrap(),
            ),
        ]);
        candle_core::safetensors::save(&tensors, &path).unwrap();
        assert!(matches!(
            SafetensorsExamples::load(&path, 2, 0, false, &device),
            Err(ViaError::Data(_))
        ));
    }
}
