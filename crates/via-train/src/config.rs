//! Конфигурация обучения.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use via_core::{PrecisionPolicy, ViaError, ViaResult};
use via_model::ViaConfig;

/// Параметры AdamW и расписания learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Линейный разогрев, шагов.
    #[serde(default)]
    pub warmup_steps: usize,
    /// Нижняя граница косинусного затухания (доля от `learning_rate`).
    #[serde(default = "default_min_lr_ratio")]
    pub min_lr_ratio: f64,
}

fn default_learning_rate() -> f64 {
    1e-4
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_eps() -> f64 {
    1e-8
}
fn default_min_lr_ratio() -> f64 {
    0.1
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            warmup_steps: 0,
            min_lr_ratio: default_min_lr_ratio(),
        }
    }
}

impl OptimizerConfig {
    /// Learning rate на шаге `step` (0-based): разогрев, затем косинус до
    /// `min_lr_ratio * learning_rate` к шагу `total_steps`.
    pub fn learning_rate_at(&self, step: usize, total_steps: usize) -> f64 {
        if step < self.warmup_steps {
            return self.learning_rate * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let decay_steps = total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        let min_lr = self.learning_rate * self.min_lr_ratio;
        min_lr + (self.learning_rate - min_lr) * cosine
    }
}

/// Конфигурация запуска обучения.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default)]
    pub model: ViaConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub seed: u64,

    pub num_train_steps: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub precision: PrecisionPolicy,

    /// Логировать loss каждые N шагов.
    #[serde(default = "default_log_every")]
    pub log_every: usize,

    /// Оценка на eval-наборе каждые N шагов (`None` = выключено).
    #[serde(default)]
    pub eval_every: Option<usize>,

    /// Каталог чекпоинтов (`None` = без чекпоинтов и без resume).
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,

    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// Стартовые веса (safetensors) вместо случайной инициализации.
    #[serde(default)]
    pub initialize_from: Option<PathBuf>,

    /// Взять архитектуру из `config.json` рядом с `initialize_from`.
    #[serde(default)]
    pub use_hf_model_config: bool,
}

fn default_batch_size() -> usize {
    16
}
fn default_log_every() -> usize {
    10
}
fn default_checkpoint_every() -> usize {
    1000
}

impl TrainConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> ViaResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ViaResult<()> {
        if self.batch_size == 0 {
            return Err(ViaError::Config("batch_size must be positive".into()));
        }
        if self.log_every == 0 {
            return Err(ViaError::Config("log_every must be positive".into()));
        }
        if self.eval_every == Some(0) {
            return Err(ViaError::Config("eval_every must be positive".into()));
        }
        if self.checkpoint_dir.is_some() && self.checkpoint_every == 0 {
            return Err(ViaError::Config("checkpoint_every must be positive".into()));
        }
        if self.use_hf_model_config && self.initialize_from.is_none() {
            return Err(ViaError::Config(
                "use_hf_model_config requires initialize_from".into(),
            ));
        }
        Ok(())
    }

    /// Итоговая конфигурация модели.
    ///
    /// С `use_hf_model_config` архитектура (encoder, decoder, time_group, grouping) берется
    /// из `config.json` рядом с весами; промпты, loss и флаги обучения остаются
    /// из `model`. Исходная конфигурация не меняется.
    pub fn resolved_model_config(&self) -> ViaResult<ViaConfig> {
        match (&self.initialize_from, self.use_hf_model_config) {
            (Some(weights), true) => {
                let dir = weights.parent().unwrap_or_else(|| Path::new("."));
                let hf = ViaConfig::from_hf_config(dir.join("config.json"))?;
                Ok(ViaConfig {
                    encoder: hf.encoder,
                    decoder: hf.decoder,
                    decoder_kind: hf.decoder_kind,
                    time_group: hf.time_group,
                    grouping_factor: hf.grouping_factor,
                    ..self.model.clone()
                })
            }
            _ => Ok(self.model.clone()),
        }
    }
}
