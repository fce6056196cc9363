//! via-train
//!
//! CLI для обучения VIA-коннектора и подсчета per-token log-probs.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use via_core::{PrngKey, ViaError};
use via_model::{ParamGroup, ViaConfig, ViaModel};
use via_train::{SafetensorsExamples, SyntheticExamples, TrainConfig, Trainer, token_log_probs};

#[derive(Parser)]
#[command(name = "via-train")]
#[command(author, version, about = "VIA: audio-to-LLM connector training", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the connector
    Train {
        /// Training config (JSON)
        #[arg(long)]
        config: PathBuf,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Pre-tokenized dataset (safetensors). Без него: синтетические батчи.
        #[arg(long)]
        data: Option<PathBuf>,

        /// Eval dataset (safetensors), используется при `eval_every`
        #[arg(long)]
        eval_data: Option<PathBuf>,
    },

    /// Build the model and print parameter counts per group
    Params {
        /// Training config (JSON)
        #[arg(long)]
        config: PathBuf,
    },

    /// Per-token log-probs (hybrid objective) for a dataset
    LogProbs {
        /// HF-style config.json of the trained model
        #[arg(long)]
        config: PathBuf,

        /// Model weights (safetensors)
        #[arg(long)]
        weights: PathBuf,

        /// Pre-tokenized dataset (safetensors)
        #[arg(long)]
        data: PathBuf,

        /// Output file (safetensors, tensor `log_probs`)
        #[arg(long)]
        out: PathBuf,

        #[arg(long, default_value_t = 8)]
        batch_size: usize,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            device,
            data,
            eval_data,
        } => {
            let config = TrainConfig::from_json_file(&config)
                .with_context(|| format!("не удалось прочитать {}", config.display()))?;
            let device = create_device(&device)?;
            let batch_size = config.batch_size;
            let pad = config.model.pad_token_id;

            let start = Instant::now();
            let mut trainer = Trainer::new(config, &device)?;

            if let Some(path) = eval_data {
                let eval_set = SafetensorsExamples::load(&path, batch_size, pad, false, &device)?
                    .collect::<Result<Vec<_>, ViaError>>()?;
                info!(batches = eval_set.len(), "eval set loaded");
                trainer = trainer.with_eval_set(eval_set);
            }

            let summary = match data {
                Some(path) => {
                    let examples = SafetensorsExamples::load(&path, batch_size, pad, true, &device)?;
                    trainer.train(examples)?
                }
                None => {
                    info!("no --data given, training on synthetic batches");
                    let examples =
                        SyntheticExamples::for_config(trainer.model().config(), batch_size, &device)?;
                    trainer.train(examples)?
                }
            };

            println!("Steps: {}", summary.steps);
            if let Some(loss) = summary.last_loss {
                println!("Last loss: {loss:.4}");
            }
            if let Some(loss) = summary.last_eval_loss {
                println!("Last eval loss: {loss:.4}");
            }
            println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());
        }

        Commands::Params { config } => {
            let config = TrainConfig::from_json_file(&config)?;
            let model_config = config.resolved_model_config()?;
            let model = ViaModel::init(
                model_config,
                PrngKey::new(config.seed),
                candle_core::DType::F32,
                &candle_core::Device::Cpu,
            )?;
            let mask = model.trainable_mask()?;

            let mut per_group: BTreeMap<ParamGroup, usize> = BTreeMap::new();
            let vars = model
                .varmap()
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("varmap lock poisoned"))?;
            for (name, var) in vars.iter() {
                if let Some(group) = mask.group_of(name) {
                    *per_group.entry(group).or_default() += var.elem_count();
                }
            }

            let groups = mask.groups();
            for (group, count) in per_group {
                let flag = if groups.is_trainable(group) {
                    "trainable"
                } else {
                    "frozen"
                };
                println!("{:<20} {count:>14} {flag}", format!("{group:?}"));
            }
            println!("{:<20} {:>14}", "total", model.parameter_count());
        }

        Commands::LogProbs {
            config,
            weights,
            data,
            out,
            batch_size,
            device,
        } => {
            let device = create_device(&device)?;
            let model_config = ViaConfig::from_hf_config(&config)?;
            let pad = model_config.pad_token_id;
            let model =
                ViaModel::from_safetensors(model_config, &weights, candle_core::DType::F32, &device)?;

            let mut rows = Vec::new();
            for example in SafetensorsExamples::load(&data, batch_size, pad, false, &device)? {
                rows.push(token_log_probs(&model, &example?)?);
            }
            let log_probs = candle_core::Tensor::cat(&rows, 0)?;
            info!(shape = ?log_probs.dims(), out = %out.display(), "writing log-probs");

            let tensors = HashMap::from([("log_probs".to_string(), log_probs)]);
            candle_core::safetensors::save(&tensors, &out)?;
        }
    }

    Ok(())
}

fn create_device(device: &str) -> Result<candle_core::Device> {
    match device {
        "metal" => {
            // candle может запаниковать при инициализации Metal; глушим hook на время попытки.
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(|_| {}));
            let res = std::panic::catch_unwind(|| candle_core::Device::new_metal(0));
            std::panic::set_hook(prev_hook);

            match res {
                Ok(Ok(dev)) => Ok(dev),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!(
                    "Инициализация Metal недоступна в этом окружении. Попробуйте --device cpu."
                )),
            }
        }
        "cuda" => Ok(candle_core::Device::new_cuda(0)?),
        _ => Ok(candle_core::Device::Cpu),
    }
}
