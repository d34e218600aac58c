use std::collections::HashMap;

use serde::Serialize;

use crate::{
    bandits::{
        BanditCategoricalAttributeCoefficient, BanditModelData, BanditNumericAttributeCoefficient,
    },
    sharder::Sharder,
    Actions, ContextAttributes, EvaluationError,
};

/// Outcome of scoring, weighing, and selecting an action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BanditEvaluation {
    #[allow(missing_docs)]
    pub flag_key: String,
    #[allow(missing_docs)]
    pub subject_key: String,
    #[allow(missing_docs)]
    pub subject_attributes: ContextAttributes,
    /// Selected action.
    pub action_key: String,
    /// Context of the selected action as supplied by the caller.
    pub action_attributes: ContextAttributes,
    /// Score of the selected action.
    pub action_score: f64,
    /// Probability the selected action had of being selected.
    pub action_weight: f64,
    #[allow(missing_docs)]
    pub gamma: f64,
    /// Distance between best and selected actions' scores.
    pub optimality_gap: f64,
}

impl BanditModelData {
    /// Score every action, weigh the scores, and pick one action deterministically for the
    /// subject.
    ///
    /// The same inputs always select the same action. Fails if `actions` is empty.
    pub fn evaluate(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &ContextAttributes,
        actions: &Actions,
        sharder: &impl Sharder,
        total_shards: u64,
    ) -> Result<BanditEvaluation, EvaluationError> {
        if actions.is_empty() {
            return Err(EvaluationError::NoActionsSupplied);
        }

        let scores = self.score_actions(subject_attributes, actions);
        let (_, best_score) = best_action(&scores).ok_or(EvaluationError::NoActionsSupplied)?;
        let weights = weigh_actions(&scores, self.gamma, self.action_probability_floor);

        // Pseudo-random deterministic shuffle of actions. Shuffling is unique per subject, so when
        // weights change slightly, large swatches of subjects are not reassigned from one action
        // to the same other action.
        let shuffled_actions = {
            let mut shuffled_actions = actions.keys().map(String::as_str).collect::<Vec<_>>();
            // Sort actions by their shard value. Use action key as tie breaker.
            shuffled_actions.sort_by_cached_key(|&action_key| {
                let hash = sharder.get_shard(
                    &format!("{flag_key}-{subject_key}-{action_key}"),
                    total_shards,
                );
                (hash, action_key)
            });
            shuffled_actions
        };

        let position = (sharder.get_shard(&format!("{flag_key}-{subject_key}"), total_shards)
            as f64)
            / (total_shards as f64);

        let selected_action = select_action(
            shuffled_actions
                .iter()
                .map(|&action_key| (action_key, weights[action_key])),
            position,
        )?;

        let action_score = scores[selected_action];

        Ok(BanditEvaluation {
            flag_key: flag_key.to_owned(),
            subject_key: subject_key.to_owned(),
            subject_attributes: subject_attributes.clone(),
            action_key: selected_action.to_owned(),
            action_attributes: actions
                .get(selected_action)
                .cloned()
                .unwrap_or_default(),
            action_score,
            action_weight: weights[selected_action],
            gamma: self.gamma,
            optimality_gap: best_score - action_score,
        })
    }

    /// Score every action against the subject.
    pub fn score_actions(
        &self,
        subject_attributes: &ContextAttributes,
        actions: &Actions,
    ) -> HashMap<String, f64> {
        actions
            .iter()
            .map(|(key, attributes)| {
                (
                    key.clone(),
                    self.score_action(key, attributes, subject_attributes),
                )
            })
            .collect()
    }

    fn score_action(
        &self,
        action_key: &str,
        action_attributes: &ContextAttributes,
        subject_attributes: &ContextAttributes,
    ) -> f64 {
        let Some(coefficients) = self.coefficients.get(action_key) else {
            return self.default_action_score;
        };

        coefficients.intercept
            + score_attributes(
                subject_attributes,
                &coefficients.subject_numeric_coefficients,
                &coefficients.subject_categorical_coefficients,
            )
            + score_attributes(
                action_attributes,
                &coefficients.action_numeric_coefficients,
                &coefficients.action_categorical_coefficients,
            )
    }
}

/// Convert scores into a probability distribution (FALCON).
///
/// Every non-best action receives `max(floor / n, 1 / (n + gamma * (best - score)))`. The best
/// action receives the remainder, so weights always sum to 1.
pub fn weigh_actions(
    scores: &HashMap<String, f64>,
    gamma: f64,
    action_probability_floor: f64,
) -> HashMap<String, f64> {
    let Some((best_action, best_score)) = best_action(scores) else {
        return HashMap::new();
    };

    let n_actions = scores.len() as f64;
    let min_probability = action_probability_floor / n_actions;

    let mut weights = HashMap::with_capacity(scores.len());
    let mut remainder_weight = 1.0;
    for (action, score) in scores {
        if action != best_action {
            let weight = min_probability.max(1.0 / (n_actions + gamma * (best_score - score)));
            weights.insert(action.clone(), weight);
            remainder_weight -= weight;
        }
    }

    weights.insert(best_action.to_owned(), f64::max(remainder_weight, 0.0));

    weights
}

/// Highest-scored action. Ties go to the lexicographically smallest key, so the choice does not
/// depend on map iteration order.
fn best_action(scores: &HashMap<String, f64>) -> Option<(&str, f64)> {
    scores
        .iter()
        .max_by(|a, b| {
            f64::total_cmp(a.1, b.1).then_with(|| {
                // Reversed, so that before-ordered name is considered higher and wins.
                Ord::cmp(a.0, b.0).reverse()
            })
        })
        .map(|(k, v)| (k.as_str(), *v))
}

/// Walk `(action, weight)` pairs accumulating weight and return the first action whose
/// cumulative weight exceeds `position`.
fn select_action<'a>(
    weighted_actions: impl IntoIterator<Item = (&'a str, f64)>,
    position: f64,
) -> Result<&'a str, EvaluationError> {
    let mut cumulative_weight = 0.0;
    for (action_key, weight) in weighted_actions {
        cumulative_weight += weight;
        if cumulative_weight > position {
            return Ok(action_key);
        }
    }

    log::warn!(target: "decision_core",
               cumulative_weight,
               position;
               "action weights do not cover selection position");
    Err(EvaluationError::ActionSelectionFailed {
        cumulative_weight,
        position,
    })
}

fn score_attributes(
    attributes: &ContextAttributes,
    numeric_coefficients: &[BanditNumericAttributeCoefficient],
    categorical_coefficients: &[BanditCategoricalAttributeCoefficient],
) -> f64 {
    numeric_coefficients
        .iter()
        .map(|coef| {
            attributes
                .numeric
                .get(&coef.attribute_key)
                .copied()
                // fend against infinite/NaN attributes as they poison the calculation down the line
                .filter(|n| n.is_finite())
                .map(|value| value * coef.coefficient)
                .unwrap_or(coef.missing_value_coefficient)
        })
        .chain(categorical_coefficients.iter().map(|coef| {
            attributes
                .categorical
                .get(&coef.attribute_key)
                .and_then(|value| coef.value_coefficients.get(value))
                .copied()
                .unwrap_or(coef.missing_value_coefficient)
        }))
        .sum()
}
