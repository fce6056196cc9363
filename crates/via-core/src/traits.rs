//! Контракты внешних компонентов.

use candle_core::Tensor;

use crate::error::ViaResult;
use crate::random::PrngKey;

/// Аудио-энкодер: mel-фреймы → эмбеддинги по кадрам.
///
/// Реализация обязана отклонять вход, длина которого не совпадает с
/// [`AudioEncoder::expected_frames`] (ошибка конфигурации, а не рантайма).
pub trait AudioEncoder {
    /// Ожидаемое количество mel-фреймов на входе.
    fn expected_frames(&self) -> usize;

    /// Количество позиций на выходе.
    fn output_positions(&self) -> usize;

    /// Размерность выходных эмбеддингов.
    fn output_dim(&self) -> usize;

    /// `[batch, frames, n_mels]` → `[batch, output_positions, output_dim]`.
    ///
    /// `key = None` отключает dropout (режим оценки).
    fn encode(&self, mel: &Tensor, key: Option<PrngKey>) -> ViaResult<Tensor>;
}
