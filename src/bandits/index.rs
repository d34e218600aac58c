use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ufc::BanditReference, ConfigurationError};

/// Index from `(flag key, variation value)` to the bandit serving that variation.
///
/// Built once per configuration load and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BanditVariationIndex {
    /// flag key → variation value → bandit key
    flags: HashMap<String, HashMap<String, String>>,
    /// bandit key → model version
    model_versions: HashMap<String, String>,
}

/// Minimal persisted form of [`BanditVariationIndex`].
///
/// Only the derived mapping is stored, not the reference list it was built from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedBanditIndex {
    #[allow(missing_docs)]
    #[serde(default)]
    pub flags: HashMap<String, HashMap<String, String>>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub model_versions: HashMap<String, String>,
}

impl BanditVariationIndex {
    /// Build the index from bandit references keyed by bandit key.
    ///
    /// Fails if the same `(flag key, variation value)` pair routes to two different bandits.
    pub fn from_references(
        references: &HashMap<String, BanditReference>,
    ) -> Result<BanditVariationIndex, ConfigurationError> {
        let mut index = BanditVariationIndex::default();

        // Walk bandits in key order so the reported conflict does not depend on map iteration.
        let mut bandit_keys = references.keys().collect::<Vec<_>>();
        bandit_keys.sort();

        for bandit_key in bandit_keys {
            let reference = &references[bandit_key];
            index
                .model_versions
                .insert(bandit_key.clone(), reference.model_version.clone());

            for variation in &reference.flag_variations {
                let by_value = index.flags.entry(variation.flag_key.clone()).or_default();
                match by_value.get(&variation.variation_value) {
                    Some(existing) if existing != bandit_key => {
                        return Err(ConfigurationError::AmbiguousBanditVariation {
                            flag_key: variation.flag_key.clone(),
                            variation_value: variation.variation_value.clone(),
                            existing: existing.clone(),
                            conflicting: bandit_key.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        by_value.insert(variation.variation_value.clone(), bandit_key.clone());
                    }
                }
            }
        }

        Ok(index)
    }

    /// Bandit key serving `variation_value` of `flag_key`, if any.
    pub fn bandit_for(&self, flag_key: &str, variation_value: &str) -> Option<&str> {
        self.flags
            .get(flag_key)?
            .get(variation_value)
            .map(String::as_str)
    }

    #[allow(missing_docs)]
    pub fn is_bandit_flag(&self, flag_key: &str) -> bool {
        self.flags.contains_key(flag_key)
    }

    #[allow(missing_docs)]
    pub fn has_any(&self) -> bool {
        !self.flags.is_empty()
    }

    /// Model version per bandit key.
    pub fn model_versions(&self) -> &HashMap<String, String> {
        &self.model_versions
    }

    /// Snapshot for the persistent cache document.
    pub fn to_persisted(&self) -> PersistedBanditIndex {
        PersistedBanditIndex {
            flags: self.flags.clone(),
            model_versions: self.model_versions.clone(),
        }
    }

    /// Restore an index saved with [`BanditVariationIndex::to_persisted`].
    pub fn from_persisted(persisted: PersistedBanditIndex) -> BanditVariationIndex {
        BanditVariationIndex {
            flags: persisted.flags,
            model_versions: persisted.model_versions,
        }
    }
}
