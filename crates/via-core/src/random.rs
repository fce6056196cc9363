//! Явные PRNG-ключи.
//!
//! Вся случайность (инициализация параметров, dropout, расширение словаря)
//! передаётся аргументом в виде [`PrngKey`]. Один и тот же ключ всегда даёт
//! одни и те же значения, поэтому прогоны воспроизводимы побитово.

use candle_core::{Device, Result, Shape, Tensor};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Splittable random key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrngKey(u64);

impl PrngKey {
    /// Root key from a seed.
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Raw key value.
    pub fn value(&self) -> u64 {
        self.0
    }

    fn rng(self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.0)
    }

    /// Derive `n` independent child keys.
    pub fn split(self, n: usize) -> Vec<PrngKey> {
        // Отдельный поток ChaCha, чтобы дочерние ключи не совпадали с сэмплами.
        let mut rng = self.rng();
        rng.set_stream(1);
        (0..n).map(|_| PrngKey(rng.next_u64())).collect()
    }

    /// Derive two child keys.
    pub fn split2(self) -> (PrngKey, PrngKey) {
        let keys = self.split(2);
        (keys[0], keys[1])
    }

    /// Derive a child key bound to a name (e.g. a parameter path).
    pub fn fold_in(self, data: &str) -> PrngKey {
        // FNV-1a: стабилен между платформами и версиями toolchain.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ self.0;
        for byte in data.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let mut rng = ChaCha8Rng::seed_from_u64(hash);
        rng.set_stream(2);
        PrngKey(rng.next_u64())
    }

    /// F32 tensor with samples from `N(mean, std²)`.
    pub fn normal<S: Into<Shape>>(
        self,
        shape: S,
        mean: f32,
        std: f32,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let distr = Normal::new(mean, std).map_err(candle_core::Error::wrap)?;
        let mut rng = self.rng();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| distr.sample(&mut rng))
            .collect();
        Tensor::from_vec(data, shape, device)
    }

    /// F32 tensor with samples from `U[0, 1)`.
    pub fn uniform<S: Into<Shape>>(self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let mut rng = self.rng();
        let data: Vec<f32> = (0..shape.elem_count()).map(|_| rng.gen::<f32>()).collect();
        Tensor::from_vec(data, shape, device)
    }

    /// Inverted dropout with drop probability `p`.
    pub fn dropout(self, x: &Tensor, p: f32) -> Result<Tensor> {
        if p <= 0.0 {
            return Ok(x.clone());
        }
        if p >= 1.0 {
            return x.zeros_like();
        }
        let keep = self
            .uniform(x.dims(), x.device())?
            .ge(p)?
            .to_dtype(x.dtype())?;
        x.broadcast_mul(&keep)?
            .affine(1.0 / (1.0 - f64::from(p)), 0.0)
    }
}

/// Split an optional key; `None` stays `None` (evaluation mode).
pub fn maybe_split(key: Option<PrngKey>, n: usize) -> Vec<Option<PrngKey>> {
    match key {
        Some(key) => key.split(n).into_iter().map(Some).collect(),
        None => vec![None; n],
    }
}

/// Dropout that is a no-op without a key.
pub fn maybe_dropout(x: &Tensor, p: f32, key: Option<PrngKey>) -> Result<Tensor> {
    match key {
        Some(key) => key.dropout(x, p),
        None => Ok(x.clone()),
    }
}
