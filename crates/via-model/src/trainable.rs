//! Which parameters the optimizer updates.
//!
//! Every parameter name maps to exactly one [`ParamGroup`]; flags are set per
//! group by [`TrainableGroups`]. Building the mask fails on any name that
//! does not belong to a group, and selecting variables fails when the
//! parameter store no longer matches the mask.

use std::collections::BTreeMap;

use candle_core::Var;
use candle_nn::VarMap;

use via_core::{ViaError, ViaResult};

/// Named parameter groups of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamGroup {
    QueryTokens,
    ProjectionWeight,
    ProjectionBias,
    Connector,
    Encoder,
    Decoder,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 6] = [
        ParamGroup::QueryTokens,
        ParamGroup::ProjectionWeight,
        ParamGroup::ProjectionBias,
        ParamGroup::Connector,
        ParamGroup::Encoder,
        ParamGroup::Decoder,
    ];

    /// Group of a parameter name, `None` if the name is not part of the model.
    pub fn classify(name: &str) -> Option<Self> {
        match name {
            "query_tokens" => Some(Self::QueryTokens),
            "projection.weight" => Some(Self::ProjectionWeight),
            "projection.bias" => Some(Self::ProjectionBias),
            n if n.starts_with("connector.") => Some(Self::Connector),
            n if n.starts_with("encoder.") => Some(Self::Encoder),
            n if n.starts_with("decoder.") => Some(Self::Decoder),
            _ => None,
        }
    }
}

/// Trainable flag for every group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainableGroups {
    pub query_tokens: bool,
    pub projection_weight: bool,
    pub projection_bias: bool,
    pub connector: bool,
    pub encoder: bool,
    pub decoder: bool,
}

impl TrainableGroups {
    /// Queries and projection; the connector stack only when asked.
    pub fn connector_only(train_connector: bool) -> Self {
        Self {
            query_tokens: true,
            projection_weight: true,
            projection_bias: true,
            connector: train_connector,
            encoder: false,
            decoder: false,
        }
    }

    pub fn is_trainable(&self, group: ParamGroup) -> bool {
        match group {
            ParamGroup::QueryTokens => self.query_tokens,
            ParamGroup::ProjectionWeight => self.projection_weight,
            ParamGroup::ProjectionBias => self.projection_bias,
            ParamGroup::Connector => self.connector,
            ParamGroup::Encoder => self.encoder,
            ParamGroup::Decoder => self.decoder,
        }
    }
}

/// Per-parameter flags, one entry for every parameter in the store.
#[derive(Debug, Clone)]
pub struct TrainableMask {
    entries: BTreeMap<String, (ParamGroup, bool)>,
    groups: TrainableGroups,
}

impl TrainableMask {
    pub fn build(varmap: &VarMap, groups: TrainableGroups) -> ViaResult<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| ViaError::Parameter("parameter store lock poisoned".into()))?;

        let mut entries = BTreeMap::new();
        for name in data.keys() {
            let group = ParamGroup::classify(name).ok_or_else(|| {
                ViaError::Parameter(format!("parameter '{name}' belongs to no group"))
            })?;
            entries.insert(name.clone(), (group, groups.is_trainable(group)));
        }

        for group in ParamGroup::ALL {
            if !entries.values().any(|(g, _)| *g == group) {
                return Err(ViaError::Parameter(format!(
                    "no parameters found for group {group:?}"
                )));
            }
        }

        Ok(Self { entries, groups })
    }

    /// Number of leaves, equal to the number of parameters in the store.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_trainable_leaves(&self) -> usize {
        self.entries.values().filter(|(_, t)| *t).count()
    }

    pub fn is_trainable(&self, name: &str) -> Option<bool> {
        self.entries.get(name).map(|(_, t)| *t)
    }

    pub fn group_of(&self, name: &str) -> Option<ParamGroup> {
        self.entries.get(name).map(|(g, _)| *g)
    }

    pub fn groups(&self) -> TrainableGroups {
        self.groups
    }

    /// Groups with the trainable flag set.
    pub fn trainable_groups(&self) -> Vec<ParamGroup> {
        ParamGroup::ALL
            .into_iter()
            .filter(|g| self.groups.is_trainable(*g))
            .collect()
    }

    /// Trainable parameter names in sorted order.
    pub fn trainable_names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, (_, t))| *t)
            .map(|(name, _)| name.as_str())
    }

    /// Trainable variables of `varmap`, in name order.
    ///
    /// The store must hold exactly the parameters the mask was built from.
    pub fn trainable_vars(&self, varmap: &VarMap) -> ViaResult<Vec<Var>> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| ViaError::Parameter("parameter store lock poisoned".into()))?;

        if let Some(extra) = data.keys().find(|name| !self.entries.contains_key(*name)) {
            return Err(ViaError::Parameter(format!(
                "parameter '{extra}' is not covered by the trainable mask"
            )));
        }
        if data.len() != self.entries.len() {
            return Err(ViaError::Parameter(format!(
                "trainable mask has {} leaves, parameter store has {}",
                self.entries.len(),
                data.len()
            )));
        }

        self.trainable_names()
            .map(|name| {
                data.get(name)
                    .cloned()
                    .ok_or_else(|| ViaError::Parameter(format!("missing parameter '{name}'")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn store() -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for name in [
            "query_tokens",
            "projection.weight",
            "projection.bias",
            "connector.layer_norm.weight",
            "encoder.conv1.weight",
            "decoder.model.norm.weight",
        ] {
            vb.get_with_hints(2usize, name, Init::Const(0.0)).unwrap();
        }
        varmap
    }

    fn every_group() -> TrainableGroups {
        TrainableGroups {
            encoder: true,
            decoder: true,
            ..TrainableGroups::connector_only(true)
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            ParamGroup::classify("connector.layers.0.fc1.weight"),
            Some(ParamGroup::Connector)
        );
        assert_eq!(ParamGroup::classify("projection.bias"), Some(ParamGroup::ProjectionBias));
        assert_eq!(ParamGroup::classify("query_tokens_extra"), None);
    }

    #[test]
    fn test_connector_only_mask() {
        let varmap = store();
        let mask = TrainableMask::build(&varmap, TrainableGroups::connector_only(false)).unwrap();
        assert_eq!(mask.len(), 6);
        assert_eq!(mask.num_trainable_leaves(), 3);
        assert_eq!(mask.trainable_groups().len(), 3);
        assert_eq!(mask.is_trainable("encoder.conv1.weight"), Some(false));
        assert_eq!(mask.trainable_vars(&varmap).unwrap().len(), 3);

        let with_connector =
            TrainableMask::build(&varmap, TrainableGroups::connector_only(true)).unwrap();
        assert_eq!(with_connector.trainable_groups().len(), 4);
    }

    #[test]
    fn test_unknown_parameter_is_error() {
        let varmap = store();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(2usize, "stray", Init::Const(0.0)).unwrap();
        assert!(matches!(
            TrainableMask::build(&varmap, every_group()),
            Err(ViaError::Parameter(_))
        ));
    }

    #[test]
    fn test_store_mismatch_is_error() {
        let varmap = store();
        let mask = TrainableMask::build(&varmap, every_group()).unwrap();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(2usize, "decoder.lm_head.weight", Init::Const(0.0))
            .unwrap();
        assert!(matches!(
            mask.trainable_vars(&varmap),
            Err(ViaError::Parameter(_))
        ));
    }
}
