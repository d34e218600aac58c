use std::{borrow::Cow, collections::HashMap};

use serde::Serialize;

use crate::{
    events::AssignmentEvent,
    sharder::{Md5Sharder, Sharder},
    ufc::{
        find_matching_rule, Allocation, AssignmentValue, Flag, Shard, Split, Timestamp, TryParse,
        Variation, VariationType,
    },
    AttributeValue, Attributes, Configuration, EvaluationError, SdkMetadata,
};

/// Outcome of evaluating a flag for a subject: the selected variation plus what is needed to log
/// the assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagEvaluation<'a> {
    #[allow(missing_docs)]
    pub variation: &'a Variation,
    /// Key of the allocation that matched.
    pub allocation_key: &'a str,
    /// Whether the assignment should be logged.
    pub do_log: bool,
    /// Extra logging entries of the matched split.
    pub extra_logging: &'a HashMap<String, String>,
}

/// Assigned value along with an optional event for logging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    /// Assignment value that should be returned to the user.
    pub value: AssignmentValue,
    /// Optional assignment event that should be logged to storage.
    pub event: Option<AssignmentEvent>,
}

/// Evaluate the specified feature flag for the given subject and return assigned variation and
/// an optional assignment event for logging.
///
/// `Ok(None)` means the default value should be used: configuration is not loaded yet, the flag is
/// unknown or disabled, or no allocation/split matched.
pub fn get_assignment(
    configuration: Option<&Configuration>,
    flag_key: &str,
    subject_key: &str,
    subject_attributes: &Attributes,
    expected_type: Option<VariationType>,
    now: Timestamp,
    sdk_meta: &SdkMetadata,
) -> Result<Option<Assignment>, EvaluationError> {
    let result = eval_flag(
        configuration,
        flag_key,
        subject_key,
        subject_attributes,
        expected_type,
        now,
        sdk_meta,
    );

    match &result {
        Ok(Some(assignment)) => {
            log::trace!(target: "decision_core",
                        flag_key,
                        subject_key,
                        assignment:serde = assignment.value;
                        "evaluated a flag");
        }
        Ok(None) => {
            log::trace!(target: "decision_core",
                        flag_key,
                        subject_key;
                        "returning default assignment");
        }
        Err(err) => {
            log::warn!(target: "decision_core",
                       flag_key,
                       subject_key;
                       "error occurred while evaluating a flag: {err}");
        }
    }

    result
}

fn eval_flag(
    configuration: Option<&Configuration>,
    flag_key: &str,
    subject_key: &str,
    subject_attributes: &Attributes,
    expected_type: Option<VariationType>,
    now: Timestamp,
    sdk_meta: &SdkMetadata,
) -> Result<Option<Assignment>, EvaluationError> {
    if subject_key.trim().is_empty() {
        return Err(EvaluationError::BlankSubjectKey);
    }

    let Some(configuration) = configuration else {
        log::warn!(target: "decision_core",
                   flag_key,
                   subject_key;
                   "evaluating a flag before configuration has been loaded");
        return Ok(None);
    };

    let flag = match configuration.flags.flags.get(flag_key) {
        None => return Ok(None),
        Some(TryParse::ParseFailed(_)) => {
            return Err(EvaluationError::UnexpectedConfigurationParseError)
        }
        Some(TryParse::Parsed(flag)) => flag,
    };

    if let Some(ty) = expected_type {
        flag.verify_type(ty)?;
    }

    let Some(evaluation) = flag.eval(subject_key, subject_attributes, &Md5Sharder, now)? else {
        return Ok(None);
    };

    let value = evaluation
        .variation
        .value
        .to_assignment_value(flag.variation_type)
        .ok_or_else(|| {
            log::warn!(target: "decision_core",
                       flag_key,
                       subject_key,
                       variation_key:display = evaluation.variation.key;
                       "internal: unable to convert variation value to {:?}", flag.variation_type);
            EvaluationError::UnexpectedConfigurationError
        })?;

    let event = evaluation.do_log.then(|| AssignmentEvent {
        feature_flag: flag_key.to_owned(),
        allocation: evaluation.allocation_key.to_owned(),
        experiment: format!("{flag_key}-{}", evaluation.allocation_key),
        variation: evaluation.variation.key.clone(),
        subject: subject_key.to_owned(),
        subject_attributes: subject_attributes.clone(),
        timestamp: now,
        meta_data: sdk_meta.into(),
        extra_logging: evaluation.extra_logging.clone(),
    });

    Ok(Some(Assignment { value, event }))
}

impl Flag {
    fn verify_type(&self, ty: VariationType) -> Result<(), EvaluationError> {
        if self.variation_type == ty {
            Ok(())
        } else {
            Err(EvaluationError::TypeMismatch {
                expected: ty,
                found: self.variation_type,
            })
        }
    }

    /// Find the variation `subject_key` is assigned to.
    ///
    /// Allocations are tried in order. The first allocation that is active at `now`, passes its
    /// rules, and has a split covering the subject decides the variation. Returns `Ok(None)` if the
    /// flag is disabled or nothing matches.
    pub fn eval<'a>(
        &'a self,
        subject_key: &str,
        subject_attributes: &Attributes,
        sharder: &impl Sharder,
        now: Timestamp,
    ) -> Result<Option<FlagEvaluation<'a>>, EvaluationError> {
        if !self.enabled {
            return Ok(None);
        }

        // Augmenting subject_attributes with id, so that subject_key can be used in the rules.
        let attributes = if subject_attributes.contains_key("id") {
            Cow::Borrowed(subject_attributes)
        } else {
            let mut attributes = subject_attributes.clone();
            attributes.insert("id".to_owned(), AttributeValue::from(subject_key));
            Cow::Owned(attributes)
        };

        let Some((allocation, split)) = self.allocations.iter().find_map(|allocation| {
            allocation
                .get_matching_split(subject_key, &attributes, sharder, self.total_shards, now)
                .map(|split| (allocation, split))
        }) else {
            return Ok(None);
        };

        let variation = self.variations.get(&split.variation_key).ok_or_else(|| {
            log::warn!(target: "decision_core",
                       flag_key:display = self.key,
                       subject_key,
                       variation_key:display = split.variation_key;
                       "internal: unable to find variation");
            EvaluationError::UnexpectedConfigurationError
        })?;

        Ok(Some(FlagEvaluation {
            variation,
            allocation_key: &allocation.key,
            do_log: allocation.do_log,
            extra_logging: &split.extra_logging,
        }))
    }
}

impl Allocation {
    /// `start_at` is inclusive, `end_at` is exclusive. Missing bounds are open.
    pub fn is_active(&self, now: Timestamp) -> bool {
        self.start_at.map_or(true, |start_at| start_at <= now)
            && self.end_at.map_or(true, |end_at| now < end_at)
    }

    fn get_matching_split(
        &self,
        subject_key: &str,
        subject_attributes: &Attributes,
        sharder: &impl Sharder,
        total_shards: u64,
        now: Timestamp,
    ) -> Option<&Split> {
        if !self.is_active(now) {
            return None;
        }

        let is_allowed_by_rules =
            self.rules.is_empty() || find_matching_rule(subject_attributes, &self.rules).is_some();
        if !is_allowed_by_rules {
            return None;
        }

        self.splits
            .iter()
            .find(|split| split.matches(subject_key, sharder, total_shards))
    }
}

impl Split {
    /// Return `true` if `subject_key` matches the given split.
    ///
    /// A split without shards matches every subject. Otherwise the subject must fall into at least
    /// one of its shards.
    pub fn matches(&self, subject_key: &str, sharder: &impl Sharder, total_shards: u64) -> bool {
        if self.shards.is_empty() {
            return true;
        }
        self.shards
            .iter()
            .any(|shard| shard.matches(subject_key, sharder, total_shards))
    }
}

impl Shard {
    /// Return `true` if `subject_key` falls into any of the shard's ranges.
    pub fn matches(&self, subject_key: &str, sharder: &impl Sharder, total_shards: u64) -> bool {
        let h = sharder.get_shard(&format!("{}-{}", self.salt, subject_key), total_shards);
        self.ranges.iter().any(|range| range.contains(h))
    }
}
