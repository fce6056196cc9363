//! Hybrid loss: pseudo-logit cross-entropy plus weighted embedding
//! regression, masked and reduced.

use candle_core::{D, DType, Result, Tensor};

use via_core::{Reduction, ReductionAxis};

/// Per-position squared Euclidean distance `[B, P]` (f32).
pub fn embedding_regression(virtual_tokens: &Tensor, real_embeds: &Tensor) -> Result<Tensor> {
    let v = virtual_tokens.to_dtype(DType::F32)?;
    let r = real_embeds.to_dtype(DType::F32)?;
    (v - r)?.sqr()?.sum(D::Minus1)
}

/// Per-position negative log-likelihood `[B, P]`; logits are upcast to f32.
pub fn token_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let targets = targets.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?.contiguous()?;
    log_probs.gather(&targets, D::Minus1)?.squeeze(D::Minus1)?.neg()
}

/// Masked reduction shared by every objective.
///
/// - `None`: the masked per-position tensor (masked-out positions are zero)
/// - `Mean`: `Σ(l·m) / Σm`. An all-zero mask gives NaN; callers must not
///   pass one.
/// - `Sum`: `Σ(l·m)`
///
/// `ReductionAxis::Position` reduces only the last axis (per-example values).
pub fn reduce(
    loss: &Tensor,
    mask: &Tensor,
    reduction: Option<Reduction>,
    axis: ReductionAxis,
) -> Result<Tensor> {
    let mask = mask.to_dtype(DType::F32)?;
    let masked = (loss.to_dtype(DType::F32)? * &mask)?;
    match (reduction, axis) {
        (None, _) => Ok(masked),
        (Some(Reduction::Sum), ReductionAxis::All) => masked.sum_all(),
        (Some(Reduction::Sum), ReductionAxis::Position) => masked.sum(D::Minus1),
        (Some(Reduction::Mean), ReductionAxis::All) => masked.sum_all()?.div(&mask.sum_all()?),
        (Some(Reduction::Mean), ReductionAxis::Position) => {
            masked.sum(D::Minus1)?.div(&mask.sum(D::Minus1)?)
        }
    }
}

/// Combines the two loss terms with a fixed embedding weight.
#[derive(Debug, Clone, Copy)]
pub struct LossComposer {
    embedding_weight: f64,
}

impl LossComposer {
    pub fn new(embedding_weight: f64) -> Self {
        Self { embedding_weight }
    }

    pub fn embedding_weight(&self) -> f64 {
        self.embedding_weight
    }

    /// Unmasked per-position loss `[B, P]`: `CE + w · regression`.
    pub fn per_position(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        virtual_tokens: &Tensor,
        real_embeds: &Tensor,
    ) -> Result<Tensor> {
        let ce = token_cross_entropy(logits, targets)?;
        let regression = embedding_regression(virtual_tokens, real_embeds)?;
        ce + regression.affine(self.embedding_weight, 0.0)?
    }

    /// Total loss.
    ///
    /// - `logits`: `[B, P, V]` pseudo-logits
    /// - `targets`: `[B, P]` token ids
    /// - `virtual_tokens`, `real_embeds`: `[B, P, H]`
    /// - `loss_mask`: `[B, P]`, nonzero where the position counts
    #[allow(clippy::too_many_arguments)]
    pub fn compose(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        virtual_tokens: &Tensor,
        real_embeds: &Tensor,
        loss_mask: &Tensor,
        reduction: Option<Reduction>,
        axis: ReductionAxis,
    ) -> Result<Tensor> {
        let loss = self.per_position(logits, targets, virtual_tokens, real_embeds)?;
        reduce(&loss, loss_mask, reduction, axis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let targets = Tensor::new(&[[0u32, 3]], &device).unwrap();
        let ce: Vec<Vec<f32>> = token_cross_entropy(&logits, &targets)
            .unwrap()
            .to_vec2()
            .unwrap();
        for v in ce.into_iter().flatten() {
            assert!((v - 4f32.ln()).abs() < 1e-5);
        }
    }

    #[test]
    fn test_cross_entropy_upcasts_bf16() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[2f32, 0.0]]], &device)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        let targets = Tensor::new(&[[0u32]], &device).unwrap();
        let ce = token_cross_entropy(&logits, &targets).unwrap();
        assert_eq!(ce.dtype(), DType::F32);
    }

    #[test]
    fn test_regression_is_squared_distance() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[[1f32, 2.0]]], &device).unwrap();
        let b = Tensor::new(&[[[4f32, 6.0]]], &device).unwrap();
        let d: Vec<Vec<f32>> = embedding_regression(&a, &b).unwrap().to_vec2().unwrap();
        assert_eq!(d, vec![vec![25.0]]);
    }

    #[test]
    fn test_reduce_variants() {
        let device = Device::Cpu;
        let loss = Tensor::new(&[[1f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &device).unwrap();
        let mask = Tensor::new(&[[1u8, 1, 0], [1, 0, 0]], &device).unwrap();

        let none: Vec<Vec<f32>> = reduce(&loss, &mask, None, ReductionAxis::All)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(none, vec![vec![1.0, 2.0, 0.0], vec![4.0, 0.0, 0.0]]);

        let sum: f32 = reduce(&loss, &mask, Some(Reduction::Sum), ReductionAxis::All)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(sum, 7.0);

        let mean: f32 = reduce(&loss, &mask, Some(Reduction::Mean), ReductionAxis::All)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((mean - 7.0 / 3.0).abs() < 1e-6);

        let per_example: Vec<f32> =
            reduce(&loss, &mask, Some(Reduction::Mean), ReductionAxis::Position)
                .unwrap()
                .to_vec1()
                .unwrap();
        assert_eq!(per_example, vec![1.5, 4.0]);
    }

    #[test]
    fn test_empty_mask_mean_is_nan() {
        let device = Device::Cpu;
        let loss = Tensor::new(&[[1f32, 2.0]], &device).unwrap();
        let mask = Tensor::new(&[[0u8, 0]], &device).unwrap();
        let mean: f32 = reduce(&loss, &mask, Some(Reduction::Mean), ReductionAxis::All)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(mean.is_nan());
    }

    #[test]
    fn test_compose_weights_regression() {
        let device = Device::Cpu;
        let composer = LossComposer::new(0.5);
        let logits = Tensor::zeros((1, 1, 2), DType::F32, &device).unwrap();
        let targets = Tensor::new(&[[1u32]], &device).unwrap();
        let v = Tensor::new(&[[[0f32, 0.0]]], &device).unwrap();
        let r = Tensor::new(&[[[2f32, 0.0]]], &device).unwrap();
        let mask = Tensor::new(&[[1u8]], &device).unwrap();
        let total: f32 = composer
            .compose(&logits, &targets, &v, &r, &mask, Some(Reduction::Sum), ReductionAxis::All)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((total - (2f32.ln() + 2.0)).abs() < 1e-5);
    }
}
