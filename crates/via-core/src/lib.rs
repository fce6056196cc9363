//! # via-core
//!
//! Базовые типы, трейты и определения ошибок для VIA (audio → LLM connector).
//!
//! Этот крейт предоставляет фундаментальные абстракции для всех остальных
//! крейтов в workspace:
//!
//! - Унифицированная обработка ошибок через [`ViaError`]
//! - Явные PRNG-ключи [`PrngKey`] (никакого глобального RNG)
//! - Общие типы данных ([`AudioTextExample`], [`Reduction`])
//! - Trait [`AudioEncoder`]: контракт аудио-энкодера
//! - Булевы маски внимания и их перевод в аддитивную форму ([`mask`])
//! - Политика точности вычислений [`PrecisionPolicy`]

pub mod config;
pub mod debug;
pub mod error;
pub mod mask;
pub mod random;
pub mod traits;
pub mod types;

pub use config::PrecisionPolicy;
pub use error::{ViaError, ViaResult};
pub use random::PrngKey;
pub use traits::AudioEncoder;
pub use types::{AudioTextExample, Reduction, ReductionAxis};
