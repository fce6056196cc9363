//! Политика точности вычислений.

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

/// Какой dtype использовать для параметров и прямого прохода.
///
/// Loss всегда считается в f32 независимо от политики.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionPolicy {
    /// BF16 на GPU (Metal/CUDA), F32 на CPU.
    #[default]
    Auto,
    /// Всегда F32.
    F32,
    /// Всегда BF16.
    Bf16,
}

impl PrecisionPolicy {
    /// Выбрать dtype для устройства.
    pub fn resolve(self, device: &Device) -> DType {
        match self {
            // BF16 matmul на CPU в candle не поддерживается.
            Self::Auto => {
                if device.is_metal() || device.is_cuda() {
                    DType::BF16
                } else {
                    DType::F32
                }
            }
            Self::F32 => DType::F32,
            Self::Bf16 => DType::BF16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_is_f32_on_cpu() {
        assert_eq!(PrecisionPolicy::Auto.resolve(&Device::Cpu), DType::F32);
        assert_eq!(PrecisionPolicy::Bf16.resolve(&Device::Cpu), DType::BF16);
    }

    #[test]
    fn test_policy_serde() {
        let p: PrecisionPolicy = serde_json::from_str("\"bf16\"").unwrap();
        assert_eq!(p, PrecisionPolicy::Bf16);
    }
}
