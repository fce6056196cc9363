//! Attention masks.
//!
//! Boolean masks are `u8` tensors (1 = may attend). They are combined with a
//! logical AND and converted to an additive f32 mask `[b|1, 1, q, k]` right
//! before the softmax.

use candle_core::{DType, Device, Result, Tensor, bail};

/// Lower-triangular mask `[seq_len, seq_len]`: position `i` sees `j <= i`.
pub fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    sliding_window_mask(seq_len, None, device)
}

/// Causal mask restricted to the last `window` positions (Mistral-style).
pub fn sliding_window_mask(
    seq_len: usize,
    window: Option<usize>,
    device: &Device,
) -> Result<Tensor> {
    let mask: Vec<u8> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| {
                let visible = j <= i && window.map_or(true, |w| i - j < w);
                u8::from(visible)
            })
        })
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)
}

/// Bring an explicit mask to `[b, 1, q, k]`.
///
/// Accepts `[b, k]` (key padding) or `[b, q, k]`.
fn explicit_to_4d(mask: &Tensor, q_len: usize, k_len: usize) -> Result<Tensor> {
    let mask = if mask.dtype() != DType::U8 {
        mask.ne(0u8)?
    } else {
        mask.clone()
    };
    match mask.rank() {
        2 => {
            let (b, k) = mask.dims2()?;
            if k != k_len {
                bail!("attention mask covers {k} positions, expected {k_len}");
            }
            mask.reshape((b, 1, 1, k))
        }
        3 => {
            let (b, q, k) = mask.dims3()?;
            if q != q_len || k != k_len {
                bail!("attention mask is {q}x{k}, expected {q_len}x{k_len}");
            }
            mask.reshape((b, 1, q, k))
        }
        rank => bail!("attention mask must have rank 2 or 3, got {rank}"),
    }
}

/// Logical AND of a `[q, k]` structural mask and an optional explicit mask.
pub fn combine(structural: &Tensor, explicit: Option<&Tensor>) -> Result<Tensor> {
    let (q_len, k_len) = structural.dims2()?;
    let structural = structural.reshape((1, 1, q_len, k_len))?;
    match explicit {
        None => Ok(structural),
        Some(explicit) => {
            let explicit = explicit_to_4d(explicit, q_len, k_len)?;
            structural.broadcast_mul(&explicit)
        }
    }
}

/// Boolean mask → additive f32 mask (0 visible, `f32::MIN` hidden).
pub fn to_additive(mask: &Tensor) -> Result<Tensor> {
    let zeros = Tensor::zeros(mask.shape(), DType::F32, mask.device())?;
    let hidden = Tensor::full(f32::MIN, mask.shape(), mask.device())?;
    mask.where_cond(&zeros, &hidden)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask() {
        let mask: Vec<Vec<u8>> = causal_mask(3, &Device::Cpu).unwrap().to_vec2().unwrap();
        assert_eq!(mask, vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]);
    }

    #[test]
    fn test_sliding_window_mask() {
        let mask: Vec<Vec<u8>> = sliding_window_mask(4, Some(2), &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(mask[3], vec![0, 0, 1, 1]);
        assert_eq!(mask[1], vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_combine_is_logical_and() {
        let device = Device::Cpu;
        let causal = causal_mask(3, &device).unwrap();
        // У второго примера последняя позиция - паддинг.
        let padding = Tensor::new(&[[1u8, 1, 1], [1, 1, 0]], &device).unwrap();
        let combined = combine(&causal, Some(&padding)).unwrap();
        assert_eq!(combined.dims(), &[2, 1, 3, 3]);
        let second: Vec<Vec<u8>> = combined.get(1).unwrap().get(0).unwrap().to_vec2().unwrap();
        assert_eq!(second, vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 0]]);
    }

    #[test]
    fn test_combine_rejects_wrong_length() {
        let device = Device::Cpu;
        let causal = causal_mask(3, &device).unwrap();
        let padding = Tensor::new(&[[1u8, 1]], &device).unwrap();
        assert!(combine(&causal, Some(&padding)).is_err());
    }

    #[test]
    fn test_additive_mask() {
        let device = Device::Cpu;
        let mask = Tensor::new(&[1u8, 0], &device).unwrap();
        let additive: Vec<f32> = to_additive(&mask).unwrap().to_vec1().unwrap();
        assert_eq!(additive, vec![0.0, f32::MIN]);
    }
}
