//! # via-train
//!
//! Цикл обучения VIA-коннектора:
//!
//! - [`TrainConfig`]: конфигурация запуска (JSON)
//! - [`Trainer`]: AdamW по обучаемым параметрам, логирование, eval, чекпоинты
//! - [`Checkpointer`]: `step-N/{model.safetensors, config.json, trainer_state.json}`
//! - Источники данных: [`SyntheticExamples`], [`SafetensorsExamples`]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod trainer;

pub use checkpoint::{Checkpointer, TrainerState};
pub use config::{OptimizerConfig, TrainConfig};
pub use data::{SafetensorsExamples, SyntheticExamples};
pub use trainer::{TrainSummary, Trainer, token_log_probs};
