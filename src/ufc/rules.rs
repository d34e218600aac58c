use std::cmp::Ordering;

use regex::RegexBuilder;
use semver::Version;

use crate::{
    ufc::{Condition, ConditionOperator, ConditionValue, Rule, Value},
    AttributeValue, Attributes,
};

/// Find the first rule (in list order) whose conditions all hold for `attributes`.
///
/// Returns `None` if no rule matches, including when `rules` is empty. Callers that treat "no
/// rules at all" as an unconditional match must check for that before calling.
pub fn find_matching_rule<'a>(attributes: &Attributes, rules: &'a [Rule]) -> Option<&'a Rule> {
    rules.iter().find(|rule| rule.eval(attributes))
}

impl Rule {
    /// Logical AND of all conditions. An empty rule matches everything.
    pub fn eval(&self, attributes: &Attributes) -> bool {
        self.conditions
            .iter()
            .all(|condition| condition.eval(attributes))
    }
}

impl Condition {
    /// Evaluate the condition against `attributes`. Never fails: type mismatches and bad operands
    /// evaluate to `false`.
    pub fn eval(&self, attributes: &Attributes) -> bool {
        self.operator
            .eval(attributes.get(&self.attribute), &self.value)
    }
}

impl ConditionOperator {
    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    fn eval(&self, attribute: Option<&AttributeValue>, condition_value: &ConditionValue) -> bool {
        self.try_eval(attribute, condition_value).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(
        &self,
        attribute: Option<&AttributeValue>,
        condition_value: &ConditionValue,
    ) -> Option<bool> {
        match self {
            Self::Matches | Self::NotMatches => {
                let s = attribute?.to_label()?;
                let regex = match condition_value {
                    ConditionValue::Single(Value::String(pattern)) => RegexBuilder::new(pattern)
                        .case_insensitive(true)
                        .build()
                        .ok()?,
                    _ => return None,
                };
                let matches = regex.is_match(&s);
                Some(if *self == Self::Matches {
                    matches
                } else {
                    !matches
                })
            }

            Self::OneOf | Self::NotOneOf => {
                let s = attribute?.to_label()?.to_lowercase();
                let values = match condition_value {
                    ConditionValue::Multiple(v) => v,
                    _ => return None,
                };
                let is_one_of = values.iter().any(|v| v.to_lowercase() == s);
                let has_to_be_one_of = *self == Self::OneOf;
                Some(is_one_of == has_to_be_one_of)
            }

            Self::IsNull => {
                let is_null = attribute.is_none() || attribute == Some(&AttributeValue::Null);
                let expected_null = !matches!(
                    condition_value,
                    ConditionValue::Single(Value::Boolean(false))
                );
                Some(is_null == expected_null)
            }

            Self::Gte | Self::Gt | Self::Lte | Self::Lt => {
                let ordering = compare_numbers(attribute?, condition_value)
                    .or_else(|| compare_versions(attribute?, condition_value))?;

                Some(match self {
                    Self::Gt => ordering == Ordering::Greater,
                    Self::Gte => ordering != Ordering::Less,
                    Self::Lt => ordering == Ordering::Less,
                    Self::Lte => ordering != Ordering::Greater,
                    _ => {
                        // unreachable
                        return None;
                    }
                })
            }
        }
    }
}

fn compare_numbers(attribute: &AttributeValue, condition_value: &ConditionValue) -> Option<Ordering> {
    let condition_value = match condition_value {
        ConditionValue::Single(Value::Number(n)) => *n,
        ConditionValue::Single(Value::String(s)) => s.trim().parse().ok()?,
        _ => return None,
    };

    let attribute_value = match attribute {
        AttributeValue::Number(n) => *n,
        AttributeValue::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };

    attribute_value.partial_cmp(&condition_value)
}

fn compare_versions(
    attribute: &AttributeValue,
    condition_value: &ConditionValue,
) -> Option<Ordering> {
    let ConditionValue::Single(Value::String(condition_version)) = condition_value else {
        return None;
    };
    let AttributeValue::String(attribute_version) = attribute else {
        return None;
    };

    match (
        Version::parse(attribute_version),
        Version::parse(condition_version),
    ) {
        (Ok(a), Ok(c)) => Some(a.cmp(&c)),
        _ => compare_dotted_versions(attribute_version, condition_version),
    }
}

/// Compare versions that are not strict semver (e.g., "1.2" or "10.0.1.4") segment by segment.
/// Missing trailing segments count as zero.
fn compare_dotted_versions(a: &str, b: &str) -> Option<Ordering> {
    let parse = |s: &str| {
        s.trim()
            .split('.')
            .map(|segment| segment.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()
    };
    let a = parse(a)?;
    let b = parse(b)?;

    let len = a.len().max(b.len());
    let segment = |v: &[u64], i: usize| v.get(i).copied().unwrap_or(0);
    Some(
        (0..len)
            .map(|i| segment(&a, i).cmp(&segment(&b, i)))
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
    )
}
