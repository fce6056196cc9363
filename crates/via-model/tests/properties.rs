//! Behavioural properties of the connector, projector, distance head, loss
//! and trainable mask on a tiny randomly initialized model.

mod common;

use candle_core::{DType, Device, Tensor};
use via_core::{AudioTextExample, PrngKey, Reduction, ReductionAxis, ViaError};
use via_model::distance::{neg_squared_distance, pseudo_logits};
use via_model::{TimeGroupProjector, ViaModel};

use common::{example, tiny_config, zero_mel};

fn model() -> ViaModel {
    ViaModel::init(tiny_config(), PrngKey::new(0), DType::F32, &Device::Cpu).unwrap()
}

fn scalar(t: &Tensor) -> f32 {
    t.to_scalar::<f32>().unwrap()
}

#[test]
fn test_connector_output_has_time_group_positions() {
    let model = model();
    let device = Device::Cpu;
    for batch in [1, 3] {
        let features = Tensor::randn(0f32, 1.0, (batch, 6, 16), &device).unwrap();
        let out = model.connector().forward(&features, None, None).unwrap();
        assert_eq!(out.dims(), &[batch, 16, 16]);
    }
}

#[test]
fn test_connector_rejects_wrong_feature_length() {
    let model = model();
    let features = Tensor::zeros((1, 5, 16), DType::F32, &Device::Cpu).unwrap();
    let err = model.connector().forward(&features, None, None).unwrap_err();
    assert!(matches!(err, ViaError::Config(_)));
}

#[test]
fn test_connector_mask_combines_with_causal_mask() {
    let model = model();
    let device = Device::Cpu;
    let features = Tensor::randn(0f32, 1.0, (1, 6, 16), &device).unwrap();
    let mut visible = vec![1u8; 16];
    visible[8..].fill(0);
    let half = Tensor::from_vec(visible, (1, 16), &device).unwrap();
    let full = Tensor::ones((1, 16), DType::U8, &device).unwrap();

    let unmasked = model.connector().forward(&features, None, None).unwrap();
    let with_full = model.connector().forward(&features, Some(&full), None).unwrap();
    let with_half = model.connector().forward(&features, Some(&half), None).unwrap();

    let rows = |t: &Tensor| -> Vec<Vec<f32>> { t.squeeze(0).unwrap().to_vec2().unwrap() };
    let (unmasked, with_full, with_half) = (rows(&unmasked), rows(&with_full), rows(&with_half));
    let row_diff = |a: &[f32], b: &[f32]| {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0f32, f32::max)
    };

    // An all-ones mask leaves only the causal structure.
    for (a, b) in unmasked.iter().zip(&with_full) {
        assert!(row_diff(a, b) < 1e-6);
    }
    // Queries before the hidden keys see the same causal prefix.
    for q in 0..8 {
        assert!(row_diff(&with_full[q], &with_half[q]) < 1e-6, "query {q}");
    }
    for q in 8..16 {
        assert!(row_diff(&with_full[q], &with_half[q]) > 1e-6, "query {q}");
    }
}

#[test]
fn test_example_attn_mask_reaches_the_loss() {
    let model = model();
    let device = Device::Cpu;
    let mut visible = vec![1u8; 2 * 16];
    for row in visible.chunks_mut(16) {
        row[8..].fill(0);
    }
    let half = Tensor::from_vec(visible, (2, 16), &device).unwrap();

    let plain = example(&device);
    let masked = example(&device).with_attn_mask(half).unwrap();
    let loss = |ex: &AudioTextExample| {
        scalar(
            &model
                .compute_loss(ex, None, Some(Reduction::Mean), ReductionAxis::All)
                .unwrap(),
        )
    };
    assert_ne!(loss(&plain), loss(&masked));
}

#[test]
fn test_encoder_rejects_wrong_mel_length() {
    let model = model();
    let mel = Tensor::zeros((1, 10, 8), DType::F32, &Device::Cpu).unwrap();
    assert!(matches!(
        model.virtual_tokens(&mel, None, None),
        Err(ViaError::Config(_))
    ));
}

#[test]
fn test_projector_reduces_positions() {
    let model = model();
    let device = Device::Cpu;
    let virtual_tokens = model
        .virtual_tokens(&zero_mel(2, &device), None, None)
        .unwrap();
    assert_eq!(virtual_tokens.dims(), &[2, 16 / 4, 12]);
}

#[test]
fn test_indivisible_time_group_fails_at_configuration() {
    let config = tiny_config().with_time_group(14);
    assert!(matches!(config.validate(), Err(ViaError::Config(_))));
    assert!(matches!(
        ViaModel::init(config.clone(), PrngKey::new(0), DType::F32, &Device::Cpu),
        Err(ViaError::Config(_))
    ));

    let varmap = candle_nn::VarMap::new();
    let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    assert!(TimeGroupProjector::new(&config, vb).is_err());
}

#[test]
fn test_pseudo_logits_match_direct_distance() {
    let device = Device::Cpu;
    let key = PrngKey::new(42);
    let (kv, ke) = key.split2();
    let virtual_tokens = kv.normal((2usize, 5usize, 12usize), 0.0, 1.0, &device).unwrap();
    let table = ke.normal((20usize, 12usize), 0.0, 1.0, &device).unwrap();

    let fast = pseudo_logits(&virtual_tokens, &table).unwrap();
    let direct = neg_squared_distance(&virtual_tokens, &table).unwrap();
    assert_eq!(fast.dims(), &[2, 5, 20]);

    let diff = scalar(&(fast - direct).unwrap().abs().unwrap().max_all().unwrap());
    assert!(diff < 1e-4, "max diff {diff}");
}

#[test]
fn test_unreduced_loss_mean_matches_mean_reduction() {
    let model = model();
    let example = example(&Device::Cpu);

    let unreduced = model
        .compute_loss(&example, None, None, ReductionAxis::All)
        .unwrap();
    assert_eq!(unreduced.dims(), &[2, 4]);

    let mask = example.loss_mask.to_dtype(DType::F32).unwrap();
    let manual = scalar(&unreduced.sum_all().unwrap()) / scalar(&mask.sum_all().unwrap());

    let mean = scalar(
        &model
            .compute_loss(&example, None, Some(Reduction::Mean), ReductionAxis::All)
            .unwrap(),
    );
    assert!((manual - mean).abs() < 1e-5 * mean.abs().max(1.0));

    // Паддинг не вносит вклад.
    let values: Vec<Vec<f32>> = unreduced.to_vec2().unwrap();
    assert_eq!(values[0][3], 0.0);
    assert_eq!(values[1][2], 0.0);
    assert!(values[0][0] > 0.0);
}

#[test]
fn test_per_example_reduction() {
    let model = model();
    let example = example(&Device::Cpu);
    let per_example = model
        .compute_loss(&example, None, Some(Reduction::Sum), ReductionAxis::Position)
        .unwrap();
    assert_eq!(per_example.dims(), &[2]);

    let total = scalar(
        &model
            .compute_loss(&example, None, Some(Reduction::Sum), ReductionAxis::All)
            .unwrap(),
    );
    let summed = scalar(&per_example.sum_all().unwrap());
    assert!((total - summed).abs() < 1e-4 * total.abs().max(1.0));
}

#[test]
fn test_text_longer_than_virtual_tokens_is_error() {
    let model = model();
    let device = Device::Cpu;
    let tokens = Tensor::ones((1, 5), DType::U32, &device).unwrap();
    let example = AudioTextExample::from_padded_tokens(zero_mel(1, &device), tokens, 0).unwrap();
    assert!(matches!(
        model.compute_loss(&example, None, Some(Reduction::Mean), ReductionAxis::All),
        Err(ViaError::Shape(_))
    ));
}

#[test]
fn test_trainable_mask_mirrors_parameter_store() {
    let model = model();
    let leaves = model.varmap().all_vars().len();

    let mask = model.trainable_mask().unwrap();
    assert_eq!(mask.len(), leaves);
    assert_eq!(mask.trainable_groups().len(), 3);
    assert_eq!(mask.num_trainable_leaves(), 3);
    assert_eq!(mask.is_trainable("query_tokens"), Some(true));
    assert_eq!(mask.is_trainable("projection.weight"), Some(true));
    assert_eq!(mask.is_trainable("projection.bias"), Some(true));
    assert_eq!(
        mask.is_trainable("decoder.model.embed_tokens.weight"),
        Some(false)
    );

    let with_connector = ViaModel::init(
        tiny_config().with_train_connector(true),
        PrngKey::new(0),
        DType::F32,
        &Device::Cpu,
    )
    .unwrap();
    let mask = with_connector.trainable_mask().unwrap();
    assert_eq!(mask.len(), leaves);
    assert_eq!(mask.trainable_groups().len(), 4);
    assert!(mask.num_trainable_leaves() > 3);
    assert_eq!(mask.is_trainable("connector.layer_norm.weight"), Some(true));
}

#[test]
fn test_compute_loss_is_deterministic() {
    let device = Device::Cpu;
    let run = || {
        let model = ViaModel::init(tiny_config(), PrngKey::new(7), DType::F32, &device).unwrap();
        let loss = model
            .compute_loss(
                &example(&device),
                Some(PrngKey::new(8)),
                Some(Reduction::Mean),
                ReductionAxis::All,
            )
            .unwrap();
        scalar(&loss).to_bits()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_dropout_key_changes_loss() {
    let device = Device::Cpu;
    let config = tiny_config();
    let config = config.clone().with_encoder(whisper_audio::WhisperConfig {
        dropout: 0.5,
        ..config.encoder
    });
    let model = ViaModel::init(config, PrngKey::new(7), DType::F32, &device).unwrap();
    let example = example(&device);
    let loss = |key| {
        scalar(
            &model
                .compute_loss(&example, key, Some(Reduction::Mean), ReductionAxis::All)
                .unwrap(),
        )
    };
    assert_eq!(loss(None).to_bits(), loss(None).to_bits());
    assert_ne!(loss(Some(PrngKey::new(1))), loss(None));
}
