//! Цикл обучения.

use std::time::Instant;

use candle_core::{D, DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::{info, warn};

use via_core::{AudioTextExample, PrngKey, Reduction, ReductionAxis, ViaError, ViaResult};
use via_model::{LossObjective, TrainableMask, ViaModel};

use crate::checkpoint::{Checkpointer, TrainerState};
use crate::config::TrainConfig;

/// Итог запуска [`Trainer::train`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainSummary {
    pub steps: usize,
    pub last_loss: Option<f32>,
    pub last_eval_loss: Option<f32>,
}

/// AdamW только по обучаемым параметрам маски.
pub struct Trainer {
    config: TrainConfig,
    model: ViaModel,
    mask: TrainableMask,
    optimizer: AdamW,
    state: TrainerState,
    checkpointer: Option<Checkpointer>,
    eval_set: Vec<AudioTextExample>,
}

impl Trainer {
    /// Собрать модель (случайная инициализация или `initialize_from`),
    /// оптимизатор и, если есть чекпоинт, продолжить с него.
    pub fn new(config: TrainConfig, device: &Device) -> ViaResult<Self> {
        config.validate()?;
        let dtype = config.precision.resolve(device);
        let (model_key, training_key) = PrngKey::new(config.seed).split2();

        let model_config = config.resolved_model_config()?;
        let model = match &config.initialize_from {
            Some(path) => {
                info!(path = %path.display(), "initializing from pretrained weights");
                ViaModel::from_safetensors(model_config, path, dtype, device)?
            }
            None => {
                info!("no pretrained weights, starting from scratch");
                ViaModel::init(model_config, model_key, dtype, device)?
            }
        };

        let mask = model.trainable_mask()?;
        let vars = mask.trainable_vars(model.varmap())?;
        let params = ParamsAdamW {
            lr: config.optimizer.learning_rate_at(0, config.num_train_steps),
            beta1: config.optimizer.beta1,
            beta2: config.optimizer.beta2,
            eps: config.optimizer.eps,
            weight_decay: config.optimizer.weight_decay,
        };
        let optimizer = AdamW::new(vars, params)?;

        let checkpointer = config
            .checkpoint_dir
            .as_ref()
            .map(|dir| Checkpointer::new(dir, config.checkpoint_every));

        let mut state = TrainerState {
            step: 0,
            key: training_key,
        };
        if let Some(checkpointer) = &checkpointer {
            if let Some(restored) = checkpointer.restore(&model)? {
                // Моменты AdamW не сохраняются: после resume они стартуют с нуля.
                state = restored;
            }
        }

        info!(
            parameter_count = model.parameter_count(),
            trainable_leaves = mask.num_trainable_leaves(),
            trainable_groups = ?mask.trainable_groups(),
            dtype = ?dtype,
            step = state.step,
            "trainer ready"
        );

        Ok(Self {
            config,
            model,
            mask,
            optimizer,
            state,
            checkpointer,
            eval_set: Vec::new(),
        })
    }

    /// Батчи для периодической оценки (`eval_every`).
    pub fn with_eval_set(self, eval_set: Vec<AudioTextExample>) -> Self {
        Self { eval_set, ..self }
    }

    /// Один шаг оптимизации; возвращает средний loss батча.
    pub fn step(&mut self, example: &AudioTextExample) -> ViaResult<f32> {
        let step = self.state.step;
        let lr = self
            .config
            .optimizer
            .learning_rate_at(step, self.config.num_train_steps);
        self.optimizer.set_learning_rate(lr);

        let key = self.state.key.fold_in(&format!("step-{step}"));
        let loss = self.model.compute_loss(
            example,
            Some(key),
            Some(Reduction::Mean),
            ReductionAxis::All,
        )?;
        self.optimizer.backward_step(&loss)?;
        self.state.step += 1;

        Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }

    /// Средний loss по батчам без dropout.
    pub fn evaluate<'a>(
        &self,
        batches: impl IntoIterator<Item = &'a AudioTextExample>,
    ) -> ViaResult<f32> {
        let mut total = 0.0f64;
        let mut count = 0usize;
        for example in batches {
            let loss = self.model.compute_loss(
                example,
                None,
                Some(Reduction::Mean),
                ReductionAxis::All,
            )?;
            total += f64::from(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?);
            count += 1;
        }
        if count == 0 {
            return Err(ViaError::Data("evaluation set is empty".into()));
        }
        Ok((total / count as f64) as f32)
    }

    /// Обучать до `num_train_steps`.
    ///
    /// При продолжении с чекпоинта первые `step` батчей источника
    /// пропускаются, чтобы порядок данных совпал с прерванным запуском.
    pub fn train<I>(&mut self, data: I) -> ViaResult<TrainSummary>
    where
        I: IntoIterator<Item = ViaResult<AudioTextExample>>,
    {
        let mut data = data.into_iter();
        if self.state.step > 0 {
            info!(batches = self.state.step, "seeking data for resume");
            if let Some(batch) = data.nth(self.state.step - 1) {
                batch?;
            }
        }

        let mut summary = TrainSummary {
            steps: self.state.step,
            last_loss: None,
            last_eval_loss: None,
        };
        let mut window_start = Instant::now();
        let mut window_steps = 0usize;

        while self.state.step < self.config.num_train_steps {
            let example = data.next().ok_or_else(|| {
                ViaError::Data(format!("data source exhausted at step {}", self.state.step))
            })??;

            let loss = self.step(&example)?;
            if !loss.is_finite() {
                warn!(step = self.state.step, loss, "non-finite loss");
            }
            summary.last_loss = Some(loss);
            window_steps += 1;

            let step = self.state.step;
            if step % self.config.log_every == 0 {
                let elapsed = window_start.elapsed().as_secs_f64();
                let examples = window_steps * example.batch_size()?;
                info!(
                    step,
                    loss,
                    examples_per_sec = examples as f64 / elapsed.max(1e-9),
                    "train"
                );
                window_start = Instant::now();
                window_steps = 0;
            }

            if let Some(every) = self.config.eval_every {
                if step % every == 0 && !self.eval_set.is_empty() {
                    let eval_loss = self.evaluate(&self.eval_set)?;
                    info!(step, eval_loss, "eval");
                    summary.last_eval_loss = Some(eval_loss);
                }
            }

            if let Some(checkpointer) = &self.checkpointer {
                if checkpointer.should_save(step) {
                    checkpointer.save(&self.model, &self.state)?;
                }
            }
        }

        if let Some(checkpointer) = &self.checkpointer {
            let already_saved = checkpointer.should_save(self.state.step);
            if self.state.step > 0 && !already_saved {
                checkpointer.save(&self.model, &self.state)?;
            }
        }

        summary.steps = self.state.step;
        Ok(summary)
    }

    pub fn model(&self) -> &ViaModel {
        &self.model
    }

    pub fn mask(&self) -> &TrainableMask {
        &self.mask
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }
}

/// Loss по токенам, сдвинутый на одну позицию вперед: `[batch, positions]`.
///
/// Значение на позиции `i` относится к токену, предсказанному после `i - 1`.
/// Только для гибридной цели (у дистилляции нет оси позиций).
pub fn token_log_probs(model: &ViaModel, example: &AudioTextExample) -> ViaResult<Tensor> {
    if model.config().loss.objective != LossObjective::Hybrid {
        return Err(ViaError::Config(
            "per-token log-probs need the hybrid objective".into(),
        ));
    }
    let loss = model.compute_loss(example, None, None, ReductionAxis::All)?;
    Ok(loss.roll(1, D::Minus1)?)
}
