//! The assembled VIA model.

use std::path::Path;

use candle_core::{D, DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::info;

use lm_decoder::LmDecoder;
use via_core::random::maybe_split;
use via_core::{AudioEncoder, AudioTextExample, PrngKey, Reduction, ReductionAxis, ViaError, ViaResult};
use whisper_audio::WhisperEncoder;

use crate::config::{LossObjective, ViaConfig};
use crate::connector::TemporalConnector;
use crate::distance::pseudo_logits;
use crate::init::{initialize_parameters, parameter_count};
use crate::loss::{LossComposer, reduce};
use crate::projector::TimeGroupProjector;
use crate::prompt::PromptTemplate;
use crate::trainable::{TrainableGroups, TrainableMask};

/// Encoder, connector, projector and decoder over one parameter store.
///
/// Parameter names: `query_tokens`, `projection.*`, `encoder.*`,
/// `connector.*`, `decoder.*`.
#[derive(Clone)]
pub struct ViaModel {
    config: ViaConfig,
    varmap: VarMap,
    dtype: DType,
    device: Device,
    encoder: WhisperEncoder,
    connector: TemporalConnector,
    projector: TimeGroupProjector,
    decoder: LmDecoder,
    /// Built up front only for distillation, the objective that uses it.
    prompt: Option<PromptTemplate>,
    composer: LossComposer,
}

impl std::fmt::Debug for ViaModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViaModel")
            .field("config", &self.config)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl ViaModel {
    fn build(config: ViaConfig, varmap: VarMap, dtype: DType, device: &Device) -> ViaResult<Self> {
        config.validate()?;
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let encoder = WhisperEncoder::new(config.encoder.clone(), vb.pp("encoder"))?;
        let connector = TemporalConnector::new(&config, vb.clone())?;
        let projector = TimeGroupProjector::new(&config, vb.pp("projection"))?;
        let decoder = LmDecoder::new(config.decoder_kind, config.decoder.clone(), vb.pp("decoder"))?;
        let prompt = match config.loss.objective {
            LossObjective::Distillation => Some(PromptTemplate::from_config(&config)?),
            LossObjective::Hybrid => None,
        };
        let composer = LossComposer::new(config.loss.embedding_weight);

        Ok(Self {
            config,
            varmap,
            dtype,
            device: device.clone(),
            encoder,
            connector,
            projector,
            decoder,
            prompt,
            composer,
        })
    }

    /// Fresh model with every parameter drawn from `key`.
    pub fn init(config: ViaConfig, key: PrngKey, dtype: DType, device: &Device) -> ViaResult<Self> {
        let model = Self::build(config, VarMap::new(), dtype, device)?;
        initialize_parameters(&model.varmap, key)?;
        info!(
            parameters = model.parameter_count(),
            decoder = ?model.decoder.kind(),
            dtype = ?dtype,
            "initialized VIA model"
        );
        Ok(model)
    }

    /// Model with weights read from a safetensors file.
    ///
    /// Every parameter must be present in the file; tensors are cast to
    /// `dtype`.
    pub fn from_safetensors(
        config: ViaConfig,
        path: impl AsRef<Path>,
        dtype: DType,
        device: &Device,
    ) -> ViaResult<Self> {
        let model = Self::build(config, VarMap::new(), dtype, device)?;
        model.load_weights(path.as_ref())?;
        info!(
            path = %path.as_ref().display(),
            parameters = model.parameter_count(),
            "loaded VIA model"
        );
        Ok(model)
    }

    /// Overwrite parameters in place from a safetensors file.
    pub fn load_weights(&self, path: impl AsRef<Path>) -> ViaResult<()> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &self.device)?;
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| ViaError::Parameter("parameter store lock poisoned".into()))?;

        for (name, var) in data.iter() {
            let tensor = tensors.get(name).ok_or_else(|| {
                ViaError::Checkpoint(format!("{} has no tensor '{name}'", path.display()))
            })?;
            if tensor.dims() != var.as_tensor().dims() {
                return Err(ViaError::Checkpoint(format!(
                    "'{name}' has shape {:?} in {}, model expects {:?}",
                    tensor.dims(),
                    path.display(),
                    var.as_tensor().dims()
                )));
            }
            var.set(&tensor.to_dtype(var.dtype())?)?;
        }
        Ok(())
    }

    /// Write every parameter to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> ViaResult<()> {
        self.varmap.save(path.as_ref())?;
        Ok(())
    }

    /// Mask for connector-only training (plus the connector stack when
    /// `train_connector` is set).
    pub fn trainable_mask(&self) -> ViaResult<TrainableMask> {
        TrainableMask::build(
            &self.varmap,
            TrainableGroups::connector_only(self.config.train_connector),
        )
    }

    pub fn parameter_count(&self) -> usize {
        parameter_count(&self.varmap)
    }

    /// mel `[B, frames, mels]` → virtual tokens `[B, TimeGroup / G, H]`.
    pub fn virtual_tokens(
        &self,
        mel: &Tensor,
        attn_mask: Option<&Tensor>,
        key: Option<PrngKey>,
    ) -> ViaResult<Tensor> {
        let keys = maybe_split(key, 2);
        let mel = mel.to_dtype(self.dtype)?;
        let audio_features = self.encoder.encode(&mel, keys[0])?;
        let queries = self.connector.forward(&audio_features, attn_mask, keys[1])?;
        self.projector.forward(&queries)
    }

    /// Same model with a resized decoder vocabulary.
    ///
    /// Consumes `self`: the embedding tables are replaced in the shared
    /// parameter store.
    pub fn resize_vocab(self, new_size: usize, key: PrngKey) -> ViaResult<Self> {
        let vb = VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device);
        let decoder = self
            .decoder
            .resize_vocab(new_size, key, &self.varmap, vb.pp("decoder"))?;
        let config = self.config.clone().with_decoder(decoder.config().clone());
        Ok(Self {
            config,
            decoder,
            ..self
        })
    }

    /// Decoder hidden states for the prompted audio and the prompted text.
    ///
    /// Returns `(audio [B, H], text [B, H])`: the last position of the audio
    /// sequence and the last non-pad position of the text sequence. A prompt
    /// that contains the pad token is a configuration error.
    pub fn forward(
        &self,
        mel: &Tensor,
        input_ids: &Tensor,
        attn_mask: Option<&Tensor>,
        key: Option<PrngKey>,
    ) -> ViaResult<(Tensor, Tensor)> {
        let prompt = match &self.prompt {
            Some(prompt) => prompt.clone(),
            None => PromptTemplate::from_config(&self.config)?,
        };
        let virtual_tokens = self.virtual_tokens(mel, attn_mask, key)?;

        let prefix = self.decoder.embed(&prompt.prefix_ids(&self.device)?)?;
        let suffix = self.decoder.embed(&prompt.suffix_ids(&self.device)?)?;
        let audio_embeds = prompt.wrap_embeddings(&prefix, &virtual_tokens, &suffix)?;

        let wrapped = prompt.wrap_text(input_ids)?;
        let text_embeds = self.decoder.embed(&wrapped.tokens)?;

        let audio = self.decoder.transformer(&audio_embeds, None)?;
        let text = self.decoder.transformer(&text_embeds, None)?;

        let audio_len = audio.dim(1)?;
        let audio_last = audio.i((.., audio_len - 1, ..))?;
        let text_last = wrapped
            .last_index
            .iter()
            .enumerate()
            .map(|(row, &pos)| text.i((row, pos)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let text_last = Tensor::stack(&text_last, 0)?;

        Ok((audio_last, text_last))
    }

    /// Training objective.
    ///
    /// With `reduction = None` the unreduced loss is returned: `[B, P]` per
    /// position for the hybrid objective, `[B]` for distillation.
    pub fn compute_loss(
        &self,
        example: &AudioTextExample,
        key: Option<PrngKey>,
        reduction: Option<Reduction>,
        axis: ReductionAxis,
    ) -> ViaResult<Tensor> {
        match self.config.loss.objective {
            LossObjective::Hybrid => self.hybrid_loss(example, key, reduction, axis),
            LossObjective::Distillation => self.distillation_loss(example, key, reduction, axis),
        }
    }

    fn hybrid_loss(
        &self,
        example: &AudioTextExample,
        key: Option<PrngKey>,
        reduction: Option<Reduction>,
        axis: ReductionAxis,
    ) -> ViaResult<Tensor> {
        let virtual_tokens =
            self.virtual_tokens(&example.audio, example.attn_mask.as_ref(), key)?;

        let positions = example.num_positions()?;
        let available = virtual_tokens.dim(1)?;
        if positions > available {
            return Err(ViaError::Shape(format!(
                "{positions} text positions but only {available} virtual tokens"
            )));
        }
        let virtual_tokens = virtual_tokens.narrow(1, 0, positions)?;

        let real_embeds = self.decoder.embed(&example.tokens)?;
        let logits = pseudo_logits(&virtual_tokens, self.decoder.token_embeddings())?;

        Ok(self.composer.compose(
            &logits,
            &example.tokens,
            &virtual_tokens,
            &real_embeds,
            &example.loss_mask,
            reduction,
            axis,
        )?)
    }

    fn distillation_loss(
        &self,
        example: &AudioTextExample,
        key: Option<PrngKey>,
        reduction: Option<Reduction>,
        axis: ReductionAxis,
    ) -> ViaResult<Tensor> {
        let (audio, text) =
            self.forward(&example.audio, &example.tokens, example.attn_mask.as_ref(), key)?;
        let diff = (audio.to_dtype(DType::F32)? - text.to_dtype(DType::F32)?)?;
        let loss = diff.sqr()?.sum(D::Minus1)?; // [B]
        // Одно значение на пример: ось позиций уже свернута.
        match (reduction, axis) {
            (None, _) | (Some(_), ReductionAxis::Position) => Ok(loss),
            (Some(_), ReductionAxis::All) => {
                Ok(reduce(&loss, &loss.ones_like()?, reduction, axis)?)
            }
        }
    }

    pub fn config(&self) -> &ViaConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn decoder(&self) -> &LmDecoder {
        &self.decoder
    }

    pub fn encoder(&self) -> &WhisperEncoder {
        &self.encoder
    }

    pub fn connector(&self) -> &TemporalConnector {
        &self.connector
    }

    pub fn projector(&self) -> &TimeGroupProjector {
        &self.projector
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
