use serde::Serialize;

use crate::{
    events::{AssignmentEvent, BanditEvent},
    sharder::Md5Sharder,
    ufc::{Timestamp, VariationType},
    Actions, Configuration, ContextAttributes, EvaluationError, SdkMetadata,
};

use super::get_assignment;

/// Result of evaluating a bandit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BanditResult {
    /// Selected variation from the feature flag.
    pub variation: String,
    /// Selected action if any.
    pub action: Option<String>,
    /// Flag assignment event that needs to be logged to analytics storage.
    pub assignment_event: Option<AssignmentEvent>,
    /// Bandit assignment event that needs to be logged to analytics storage.
    pub bandit_event: Option<BanditEvent>,
}

/// Evaluate the specified string feature flag for the given subject. If resulting variation is
/// a bandit, evaluate the bandit to return the action.
///
/// Falls back to `default_variation` when the flag yields no assignment. Fails on a blank subject
/// key, an empty `actions` set for a bandit variation, or when the referenced bandit model is
/// missing from the configuration.
#[allow(clippy::too_many_arguments)]
pub fn get_bandit_action(
    configuration: Option<&Configuration>,
    flag_key: &str,
    subject_key: &str,
    subject_attributes: &ContextAttributes,
    actions: &Actions,
    default_variation: &str,
    now: Timestamp,
    sdk_meta: &SdkMetadata,
) -> Result<BanditResult, EvaluationError> {
    let assignment = get_assignment(
        configuration,
        flag_key,
        subject_key,
        &subject_attributes.to_generic_attributes(),
        Some(VariationType::String),
        now,
        sdk_meta,
    )?;

    let (variation, assignment_event) = match assignment {
        Some(assignment) => {
            let variation = assignment
                .value
                .as_str()
                .ok_or(EvaluationError::UnexpectedConfigurationError)?
                .to_owned();
            (variation, assignment.event)
        }
        None => (default_variation.to_owned(), None),
    };

    let bandit_key = configuration.and_then(|c| c.get_bandit_key(flag_key, &variation));
    let (Some(configuration), Some(bandit_key)) = (configuration, bandit_key) else {
        // It's not a bandit variation, just return it.
        return Ok(BanditResult {
            variation,
            action: None,
            assignment_event,
            bandit_event: None,
        });
    };

    let Some(bandit) = configuration.get_bandit(bandit_key) else {
        // We've evaluated a flag that resulted in a bandit but now we cannot find the bandit
        // configuration and we cannot proceed.
        log::warn!(target: "decision_core", bandit_key; "unable to find bandit configuration");
        return Err(EvaluationError::UnexpectedConfigurationError);
    };

    let total_shards = configuration
        .get_flag(flag_key)
        .map(|flag| flag.total_shards)
        .unwrap_or(crate::ufc::DEFAULT_TOTAL_SHARDS);

    let evaluation = bandit
        .model_data
        .evaluate(
            flag_key,
            subject_key,
            subject_attributes,
            actions,
            &Md5Sharder,
            total_shards,
        )
        .map_err(|err| {
            log::warn!(target: "decision_core",
                       flag_key,
                       subject_key,
                       bandit_key;
                       "bandit evaluation failed: {err}");
            err
        })?;

    log::trace!(target: "decision_core",
                flag_key,
                subject_key,
                bandit_key,
                action:display = evaluation.action_key;
                "evaluated a bandit");

    let bandit_event = BanditEvent {
        flag_key: flag_key.to_owned(),
        bandit_key: bandit_key.to_owned(),
        subject: subject_key.to_owned(),
        action: evaluation.action_key.clone(),
        action_probability: evaluation.action_weight,
        optimality_gap: evaluation.optimality_gap,
        model_version: bandit.model_version.clone(),
        timestamp: now,
        subject_numeric_attributes: subject_attributes.numeric.clone(),
        subject_categorical_attributes: subject_attributes.categorical.clone(),
        action_numeric_attributes: evaluation.action_attributes.numeric,
        action_categorical_attributes: evaluation.action_attributes.categorical,
        meta_data: sdk_meta.into(),
    };

    Ok(BanditResult {
        variation,
        action: Some(evaluation.action_key),
        assignment_event,
        bandit_event: Some(bandit_event),
    })
}
