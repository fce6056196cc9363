//! Chat prompt around audio and text sequences.

use candle_core::{Device, Tensor};

use via_core::{ViaError, ViaResult};

use crate::config::ViaConfig;

/// `prefix ++ body ++ suffix` with padding moved to the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    prefix: Vec<u32>,
    suffix: Vec<u32>,
    pad_token_id: u32,
}

/// Prompted text tokens and the index of the last non-pad token per row.
#[derive(Debug, Clone)]
pub struct WrappedText {
    pub tokens: Tensor,
    pub last_index: Vec<usize>,
}

impl PromptTemplate {
    pub fn new(prefix: Vec<u32>, suffix: Vec<u32>, pad_token_id: u32) -> ViaResult<Self> {
        if suffix.is_empty() {
            return Err(ViaError::Config("prompt suffix must not be empty".into()));
        }
        if prefix.contains(&pad_token_id) || suffix.contains(&pad_token_id) {
            return Err(ViaError::Config(format!(
                "pad token {pad_token_id} appears inside the prompt"
            )));
        }
        Ok(Self {
            prefix,
            suffix,
            pad_token_id,
        })
    }

    pub fn from_config(config: &ViaConfig) -> ViaResult<Self> {
        Self::new(
            config.pre_audio_prompt.clone(),
            config.pre_text_prompt.clone(),
            config.pad_token_id,
        )
    }

    pub fn prefix_ids(&self, device: &Device) -> ViaResult<Tensor> {
        Ok(Tensor::new(self.prefix.as_slice(), device)?)
    }

    pub fn suffix_ids(&self, device: &Device) -> ViaResult<Tensor> {
        Ok(Tensor::new(self.suffix.as_slice(), device)?)
    }

    /// `[P, H]`, `[B, N, H]`, `[S, H]` → `[B, P + N + S, H]`.
    pub fn wrap_embeddings(
        &self,
        prefix: &Tensor,
        body: &Tensor,
        suffix: &Tensor,
    ) -> ViaResult<Tensor> {
        let (batch, _, hidden) = body.dims3()?;
        let prefix = prefix
            .unsqueeze(0)?
            .broadcast_as((batch, self.prefix.len(), hidden))?
            .contiguous()?;
        let suffix = suffix
            .unsqueeze(0)?
            .broadcast_as((batch, self.suffix.len(), hidden))?
            .contiguous()?;
        Ok(Tensor::cat(&[&prefix, body, &suffix], 1)?)
    }

    /// Wrap `[B, N]` text tokens and push padding to the back (stable).
    ///
    /// The last non-pad token of every row must be the last suffix token;
    /// otherwise the row had padding inside the prompt region.
    pub fn wrap_text(&self, tokens: &Tensor) -> ViaResult<WrappedText> {
        let rows: Vec<Vec<u32>> = tokens.to_dtype(candle_core::DType::U32)?.to_vec2()?;
        let expected_last = self.suffix[self.suffix.len() - 1];

        let mut flat = Vec::new();
        let mut last_index = Vec::with_capacity(rows.len());
        for (row_idx, row) in rows.iter().enumerate() {
            let wrapped: Vec<u32> = self
                .prefix
                .iter()
                .chain(row)
                .chain(&self.suffix)
                .copied()
                .collect();
            let (mut kept, pads): (Vec<u32>, Vec<u32>) =
                wrapped.into_iter().partition(|&t| t != self.pad_token_id);

            let last = kept.len() - 1;
            if kept[last] != expected_last {
                return Err(ViaError::Shape(format!(
                    "row {row_idx}: last non-pad token {} is not the prompt end {expected_last}",
                    kept[last]
                )));
            }
            last_index.push(last);
            kept.extend(pads);
            flat.extend(kept);
        }

        let seq_len = self.prefix.len() + tokens.dim(1)? + self.suffix.len();
        let tokens = Tensor::from_vec(flat, (rows.len(), seq_len), tokens.device())?;
        Ok(WrappedText { tokens, last_index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_text_pushes_padding_back() {
        let template = PromptTemplate::new(vec![1, 2], vec![3, 4], 0).unwrap();
        let tokens = Tensor::new(&[[7u32, 8, 0], [9, 0, 0]], &Device::Cpu).unwrap();
        let wrapped = template.wrap_text(&tokens).unwrap();
        let rows: Vec<Vec<u32>> = wrapped.tokens.to_vec2().unwrap();
        assert_eq!(rows[0], vec![1, 2, 7, 8, 3, 4, 0]);
        assert_eq!(rows[1], vec![1, 2, 9, 3, 4, 0, 0]);
        assert_eq!(wrapped.last_index, vec![5, 4]);
    }

    #[test]
    fn test_pad_inside_prompt_rejected() {
        assert!(PromptTemplate::new(vec![1, 0], vec![3], 0).is_err());
        assert!(PromptTemplate::new(vec![1], vec![], 0).is_err());
    }

    #[test]
    fn test_wrap_embeddings_shape() {
        let template = PromptTemplate::new(vec![1, 2], vec![3], 0).unwrap();
        let device = Device::Cpu;
        let prefix = Tensor::zeros((2, 4), candle_core::DType::F32, &device).unwrap();
        let body = Tensor::ones((3, 5, 4), candle_core::DType::F32, &device).unwrap();
        let suffix = Tensor::zeros((1, 4), candle_core::DType::F32, &device).unwrap();
        let out = template.wrap_embeddings(&prefix, &body, &suffix).unwrap();
        assert_eq!(out.dims(), &[3, 8, 4]);
    }
}
