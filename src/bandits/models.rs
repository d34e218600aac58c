use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ufc::Timestamp, ConfigurationError};

/// Response format from the bandits endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BanditResponse {
    #[allow(missing_docs)]
    pub bandits: HashMap<String, BanditConfiguration>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditConfiguration {
    pub bandit_key: String,
    #[serde(default)]
    pub model_name: String,
    pub model_version: String,
    pub model_data: BanditModelData,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BanditModelData {
    /// Exploration-decay parameter. Higher values concentrate probability on the best action.
    pub gamma: f64,
    /// Score of actions without coefficients.
    pub default_action_score: f64,
    /// Minimum total probability mass reserved for non-best actions, in `[0, 1]`.
    pub action_probability_floor: f64,
    #[allow(missing_docs)]
    #[serde(default)]
    pub coefficients: HashMap<String, BanditCoefficients>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditCoefficients {
    #[serde(default)]
    pub action_key: String,
    pub intercept: f64,
    #[serde(default)]
    pub subject_numeric_coefficients: Vec<BanditNumericAttributeCoefficient>,
    #[serde(default)]
    pub subject_categorical_coefficients: Vec<BanditCategoricalAttributeCoefficient>,
    #[serde(default)]
    pub action_numeric_coefficients: Vec<BanditNumericAttributeCoefficient>,
    #[serde(default)]
    pub action_categorical_coefficients: Vec<BanditCategoricalAttributeCoefficient>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditNumericAttributeCoefficient {
    pub attribute_key: String,
    pub coefficient: f64,
    pub missing_value_coefficient: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct BanditCategoricalAttributeCoefficient {
    pub attribute_key: String,
    pub value_coefficients: HashMap<String, f64>,
    pub missing_value_coefficient: f64,
}

impl BanditResponse {
    /// Validate every bandit model.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.bandits
            .iter()
            .try_for_each(|(key, bandit)| bandit.model_data.validate(key))
    }
}

impl BanditModelData {
    /// Reject models whose parameters would make weighting meaningless (negative or non-finite
    /// gamma, floor outside `[0, 1]`, non-finite coefficients).
    pub fn validate(&self, bandit_key: &str) -> Result<(), ConfigurationError> {
        let malformed = |reason: String| ConfigurationError::MalformedBanditModel {
            bandit_key: bandit_key.to_owned(),
            reason,
        };

        if !self.gamma.is_finite() || self.gamma < 0.0 {
            return Err(malformed(format!("gamma must be finite and >= 0, got {}", self.gamma)));
        }
        if !(0.0..=1.0).contains(&self.action_probability_floor) {
            return Err(malformed(format!(
                "actionProbabilityFloor must be in [0, 1], got {}",
                self.action_probability_floor
            )));
        }
        if !self.default_action_score.is_finite() {
            return Err(malformed("defaultActionScore must be finite".to_owned()));
        }

        for (action_key, coefficients) in &self.coefficients {
            if !coefficients.all_finite() {
                return Err(malformed(format!(
                    "coefficients for action {action_key:?} must be finite"
                )));
            }
        }

        Ok(())
    }
}

impl BanditCoefficients {
    fn all_finite(&self) -> bool {
        let numeric_finite = |coefs: &[BanditNumericAttributeCoefficient]| {
            coefs
                .iter()
                .all(|c| c.coefficient.is_finite() && c.missing_value_coefficient.is_finite())
        };
        let categorical_finite = |coefs: &[BanditCategoricalAttributeCoefficient]| {
            coefs.iter().all(|c| {
                c.missing_value_coefficient.is_finite()
                    && c.value_coefficients.values().all(|v| v.is_finite())
            })
        };

        self.intercept.is_finite()
            && numeric_finite(&self.subject_numeric_coefficients)
            && numeric_finite(&self.action_numeric_coefficients)
            && categorical_finite(&self.subject_categorical_coefficients)
            && categorical_finite(&self.action_categorical_coefficients)
    }
}
