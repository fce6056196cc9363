//! Чекпоинты: `dir/step-N/{model.safetensors, config.json, trainer_state.json}`.
//!
//! `trainer_state.json` пишется последним, поэтому каталог без него считается
//! незавершенным и при resume пропускается.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use via_core::{PrngKey, ViaError, ViaResult};
use via_model::ViaModel;

const MODEL_FILE: &str = "model.safetensors";
const CONFIG_FILE: &str = "config.json";
const STATE_FILE: &str = "trainer_state.json";

/// Состояние цикла обучения, необходимое для продолжения.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Количество выполненных шагов.
    pub step: usize,
    /// Базовый ключ обучения; ключ шага выводится из него и номера шага.
    pub key: PrngKey,
}

#[derive(Debug, Clone)]
pub struct Checkpointer {
    dir: PathBuf,
    every: usize,
}

impl Checkpointer {
    pub fn new(dir: impl Into<PathBuf>, every: usize) -> Self {
        Self {
            dir: dir.into(),
            every,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn step_dir(&self, step: usize) -> PathBuf {
        self.dir.join(format!("step-{step}"))
    }

    pub fn should_save(&self, step: usize) -> bool {
        self.every > 0 && step > 0 && step % self.every == 0
    }

    pub fn save(&self, model: &ViaModel, state: &TrainerState) -> ViaResult<PathBuf> {
        let dir = self.step_dir(state.step);
        std::fs::create_dir_all(&dir)?;

        model.save(dir.join(MODEL_FILE))?;
        model.config().save_hf_config(dir.join(CONFIG_FILE))?;
        std::fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(state)?)?;

        info!(step = state.step, path = %dir.display(), "saved checkpoint");
        Ok(dir)
    }

    /// Последний завершенный чекпоинт.
    pub fn latest(&self) -> ViaResult<Option<(PathBuf, TrainerState)>> {
        if !self.dir.exists() {
            return Ok(None);
        }

        let mut best: Option<(usize, PathBuf)> = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("step-"))
                .and_then(|n| n.parse::<usize>().ok());
            let Some(step) = step else { continue };
            if !path.join(STATE_FILE).exists() {
                warn!(path = %path.display(), "skipping incomplete checkpoint");
                continue;
            }
            if best.as_ref().map_or(true, |(s, _)| step > *s) {
                best = Some((step, path));
            }
        }

        match best {
            Some((_, path)) => {
                let content = std::fs::read_to_string(path.join(STATE_FILE))?;
                let state: TrainerState = serde_json::from_str(&content)?;
                Ok(Some((path, state)))
            }
            None => Ok(None),
        }
    }

    /// Загрузить веса последнего чекпоинта в `model`.
    pub fn restore(&self, model: &ViaModel) -> ViaResult<Option<TrainerState>> {
        let Some((path, state)) = self.latest()? else {
            return Ok(None);
        };
        let weights = path.join(MODEL_FILE);
        if !weights.exists() {
            return Err(ViaError::Checkpoint(format!(
                "{} has trainer state but no weights",
                path.display()
            )));
        }
        model.load_weights(&weights)?;
        info!(step = state.step, path = %path.display(), "restored checkpoint");
        Ok(Some(state))
    }
}
