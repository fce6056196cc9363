//! Time-group projector: merge `G` adjacent virtual tokens and map them to
//! the decoder width.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder, linear};

use via_core::{ViaError, ViaResult};

use crate::config::ViaConfig;

#[derive(Debug, Clone)]
pub struct TimeGroupProjector {
    grouping_factor: usize,
    projection: Linear,
}

impl TimeGroupProjector {
    /// `vb` points at `projection` (`weight [H, d*G]`, `bias [H]`).
    pub fn new(config: &ViaConfig, vb: VarBuilder) -> ViaResult<Self> {
        if config.grouping_factor == 0 || config.time_group % config.grouping_factor != 0 {
            return Err(ViaError::Config(format!(
                "time_group {} is not divisible by grouping_factor {}",
                config.time_group, config.grouping_factor
            )));
        }
        let projection = linear(config.grouped_embed(), config.decoder.hidden_size, vb)?;
        Ok(Self {
            grouping_factor: config.grouping_factor,
            projection,
        })
    }

    /// `[B, TG, d]` → `[B, TG / G, d * G]`.
    pub fn group(&self, x: &Tensor) -> ViaResult<Tensor> {
        let (batch, time_group, dim) = x.dims3()?;
        if time_group % self.grouping_factor != 0 {
            return Err(ViaError::Shape(format!(
                "{time_group} positions cannot be grouped by {}",
                self.grouping_factor
            )));
        }
        Ok(x.contiguous()?.reshape((
            batch,
            time_group / self.grouping_factor,
            dim * self.grouping_factor,
        ))?)
    }

    /// `[B, TG, d]` → `[B, TG / G, H]`.
    pub fn forward(&self, x: &Tensor) -> ViaResult<Tensor> {
        let grouped = self.group(x)?;
        Ok(self.projection.forward(&grouped)?)
    }

    pub fn grouping_factor(&self) -> usize {
        self.grouping_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn config() -> ViaConfig {
        let encoder = whisper_audio::WhisperConfig {
            d_model: 4,
            ..whisper_audio::WhisperConfig::whisper_tiny()
        };
        let decoder = lm_decoder::LmConfig {
            hidden_size: 6,
            ..lm_decoder::LmConfig::llama3_8b()
        };
        ViaConfig::default()
            .with_encoder(encoder)
            .with_decoder(decoder)
            .with_time_group(8)
            .with_grouping_factor(4)
    }

    #[test]
    fn test_group_concatenates_adjacent_positions() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let projector = TimeGroupProjector::new(&config(), vb.pp("projection")).unwrap();

        let x = Tensor::arange(0f32, 32.0, &device)
            .unwrap()
            .reshape((1, 8, 4))
            .unwrap();
        let grouped = projector.group(&x).unwrap();
        assert_eq!(grouped.dims(), &[1, 2, 16]);
        let second: Vec<f32> = grouped.i((0, 1)).unwrap().to_vec1().unwrap();
        assert_eq!(second, (16..32).map(|v| v as f32).collect::<Vec<_>>());

        let out = projector.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 2, 6]);
    }

    #[test]
    fn test_rejects_indivisible_config() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let bad = config().with_time_group(10);
        assert!(matches!(
            TimeGroupProjector::new(&bad, vb),
            Err(ViaError::Config(_))
        ));
    }
}
