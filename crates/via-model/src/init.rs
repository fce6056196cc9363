//! Keyed parameter initialization.

use candle_nn::VarMap;
use tracing::debug;

use via_core::{PrngKey, ViaError, ViaResult};

/// Standard deviation for weights, embeddings and query tokens.
pub const INIT_STD: f32 = 0.02;

/// Re-initialize every parameter of `varmap` from `key`.
///
/// - `*.bias` → 0
/// - `*norm*.weight` → 1
/// - everything else → `N(0, 0.02)` drawn with `key.fold_in(name)`
///
/// Each leaf depends only on `key` and its own name, so the result does not
/// depend on construction order. Returns the number of parameters touched.
pub fn initialize_parameters(varmap: &VarMap, key: PrngKey) -> ViaResult<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| ViaError::Parameter("parameter store lock poisoned".into()))?;

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    for name in &names {
        let var = &data[*name];
        let current = var.as_tensor();
        let value = match leaf_kind(name) {
            LeafKind::Bias => current.zeros_like()?,
            LeafKind::NormWeight => current.ones_like()?,
            LeafKind::Weight => key
                .fold_in(name)
                .normal(current.dims(), 0.0, INIT_STD, current.device())?
                .to_dtype(current.dtype())?,
        };
        var.set(&value)?;
    }

    debug!(parameters = names.len(), "initialized parameters");
    Ok(names.len())
}

#[derive(Debug, PartialEq, Eq)]
enum LeafKind {
    Bias,
    NormWeight,
    Weight,
}

fn leaf_kind(name: &str) -> LeafKind {
    let mut parts = name.rsplit('.');
    let leaf = parts.next().unwrap_or(name);
    let module = parts.next().unwrap_or("");
    if leaf == "bias" {
        LeafKind::Bias
    } else if module.contains("norm") {
        LeafKind::NormWeight
    } else {
        LeafKind::Weight
    }
}

/// Total number of scalar parameters.
pub fn parameter_count(varmap: &VarMap) -> usize {
    varmap
        .all_vars()
        .iter()
        .map(|var| var.as_tensor().elem_count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_leaf_kind() {
        assert_eq!(leaf_kind("projection.bias"), LeafKind::Bias);
        assert_eq!(
            leaf_kind("decoder.model.layers.0.input_layernorm.weight"),
            LeafKind::NormWeight
        );
        assert_eq!(leaf_kind("connector.layer_norm.weight"), LeafKind::NormWeight);
        assert_eq!(leaf_kind("query_tokens"), LeafKind::Weight);
        assert_eq!(leaf_kind("encoder.conv1.weight"), LeafKind::Weight);
    }

    #[test]
    fn test_initialization_is_keyed_and_order_independent() {
        let build = |names: &[&str]| {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            for name in names {
                vb.get_with_hints((3usize, 4usize), name, Init::Const(7.0)).unwrap();
            }
            initialize_parameters(&varmap, PrngKey::new(11)).unwrap();
            varmap
        };
        let a = build(&["a.weight", "b.weight", "c.layer_norm.weight"]);
        let b = build(&["c.layer_norm.weight", "b.weight", "a.weight"]);

        let get = |varmap: &VarMap, name: &str| -> Vec<f32> {
            varmap.data().lock().unwrap()[name]
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap()
        };
        assert_eq!(get(&a, "a.weight"), get(&b, "a.weight"));
        assert_ne!(get(&a, "a.weight"), get(&a, "b.weight"));
        assert!(get(&a, "c.layer_norm.weight").iter().all(|&v| v == 1.0));
        assert_eq!(parameter_count(&a), 36);
    }
}
