//! Distance head: logits from negative squared Euclidean distance to every
//! row of the decoder embedding table.

use candle_core::{D, DType, Result, Tensor};

/// `score(v, e) = 2·v·e − ‖v‖² − ‖e‖²`, computed in f32.
///
/// - `virtual_tokens`: `[B, P, H]`
/// - `token_embeddings`: `[V, H]`
///
/// Returns `[B, P, V]`.
pub fn pseudo_logits(virtual_tokens: &Tensor, token_embeddings: &Tensor) -> Result<Tensor> {
    let v = virtual_tokens.to_dtype(DType::F32)?;
    let e = token_embeddings.to_dtype(DType::F32)?;

    let dot = v.broadcast_matmul(&e.t()?)?;
    let v_sq = v.sqr()?.sum_keepdim(D::Minus1)?; // [B, P, 1]
    let e_sq = e.sqr()?.sum(D::Minus1)?; // [V]

    dot.affine(2.0, 0.0)?
        .broadcast_sub(&v_sq)?
        .broadcast_sub(&e_sq)
}

/// Direct `−‖v − e‖²`; materializes `[B, P, V, H]`.
pub fn neg_squared_distance(virtual_tokens: &Tensor, token_embeddings: &Tensor) -> Result<Tensor> {
    let v = virtual_tokens.to_dtype(DType::F32)?.unsqueeze(2)?;
    let e = token_embeddings.to_dtype(DType::F32)?;
    v.broadcast_sub(&e)?.sqr()?.sum(D::Minus1)?.neg()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_nearest_embedding_scores_highest() {
        let device = Device::Cpu;
        let table = Tensor::new(&[[0f32, 0.0], [1.0, 0.0], [0.0, 3.0]], &device).unwrap();
        let virtual_tokens = Tensor::new(&[[[0.9f32, 0.1], [0.1, 2.5]]], &device).unwrap();
        let logits = pseudo_logits(&virtual_tokens, &table).unwrap();
        assert_eq!(logits.dims(), &[1, 2, 3]);
        let best: Vec<Vec<u32>> = logits
            .argmax(D::Minus1)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .unsqueeze(1)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(best, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_exact_match_scores_zero() {
        let device = Device::Cpu;
        let table = Tensor::new(&[[0.5f32, -1.0, 2.0]], &device).unwrap();
        let virtual_tokens = table.unsqueeze(0).unwrap();
        let score: f32 = pseudo_logits(&virtual_tokens, &table)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        assert!(score.abs() < 1e-6);
    }
}
