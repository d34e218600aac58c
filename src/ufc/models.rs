use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

use super::AssignmentValue;

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Default modulus for flag and bandit sharding.
pub const DEFAULT_TOTAL_SHARDS: u64 = 10_000;

/// Universal Flag Configuration. This the response format from the flags endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UniversalFlagConfig {
    /// When configuration was last updated on the server.
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    /// Environment this configuration belongs to.
    #[serde(default)]
    pub environment: Option<Environment>,
    /// Flags configuration.
    ///
    /// Value is wrapped in `TryParse` so that if we fail to parse one flag (e.g., new server
    /// format), we can still serve other flags.
    pub flags: HashMap<String, TryParse<Flag>>,
    /// Connects string feature flag variations to bandits. Bandit models are served separately.
    #[serde(default)]
    pub bandit_references: HashMap<String, BanditReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    /// Name of the environment.
    pub name: String,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
///
/// This can be helpful to isolate errors in a subtree. e.g., if configuration for one flag parses,
/// the rest of the flags are still usable.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}
impl<T> TryParse<T> {
    #[allow(missing_docs)]
    pub fn as_parsed(&self) -> Option<&T> {
        self.into()
    }
}
impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}
impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Flag {
    pub key: String,
    pub enabled: bool,
    pub variation_type: VariationType,
    pub variations: HashMap<String, Variation>,
    /// Evaluated in order; the first active, matching allocation wins.
    pub allocations: Vec<Allocation>,
    /// Modulus for sharding. Never zero: such a flag fails to parse.
    #[serde(
        default = "default_total_shards",
        deserialize_with = "deserialize_total_shards"
    )]
    pub total_shards: u64,
}

fn default_total_shards() -> u64 {
    DEFAULT_TOTAL_SHARDS
}

fn deserialize_total_shards<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<u64, D::Error> {
    match u64::deserialize(deserializer)? {
        0 => Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Unsigned(0),
            &"a positive number of shards",
        )),
        total_shards => Ok(total_shards),
    }
}

/// Type of the variation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum VariationType {
    String,
    Integer,
    Numeric,
    Boolean,
    Json,
}

/// Subset of [`serde_json::Value`].
///
/// Unlike [`AssignmentValue`], `Value` is untagged, so we don't know the exact type until we
/// combine it with [`VariationType`] from the flag level.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum Value {
    /// Boolean maps to [`AssignmentValue::Boolean`].
    Boolean(bool),
    /// Number maps to either [`AssignmentValue::Integer`] or [`AssignmentValue::Numeric`].
    Number(f64),
    /// String maps to either [`AssignmentValue::String`] or [`AssignmentValue::Json`].
    String(String),
    /// Inline JSON document (object or array) for JSON variations.
    Json(serde_json::Value),
}

impl Value {
    /// Try to convert `Value` to [`AssignmentValue`] under the given [`VariationType`].
    pub fn to_assignment_value(&self, ty: VariationType) -> Option<AssignmentValue> {
        Some(match ty {
            VariationType::String => AssignmentValue::String(self.as_string()?.to_owned()),
            VariationType::Integer => AssignmentValue::Integer(self.as_integer()?),
            VariationType::Numeric => AssignmentValue::Numeric(self.as_number()?),
            VariationType::Boolean => AssignmentValue::Boolean(self.as_boolean()?),
            VariationType::Json => AssignmentValue::Json(self.to_json()?),
        })
    }

    fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    fn as_integer(&self) -> Option<i64> {
        let f = self.as_number()?;
        let i = f as i64;
        if i as f64 == f {
            Some(i)
        } else {
            None
        }
    }

    pub(crate) fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Self::String(s) => serde_json::from_str(s).ok(),
            Self::Json(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Variation {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Allocation {
    pub key: String,
    /// Empty (or absent) rules match unconditionally.
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Inclusive.
    #[serde(default)]
    pub start_at: Option<Timestamp>,
    /// Exclusive.
    #[serde(default)]
    pub end_at: Option<Timestamp>,
    pub splits: Vec<Split>,
    #[serde(default = "default_do_log")]
    pub do_log: bool,
}

fn default_do_log() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, From, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Rule {
    pub conditions: Vec<Condition>,
}

/// `Condition` is a check that given user `attribute` matches the condition `value` under the given
/// `operator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Condition {
    pub operator: ConditionOperator,
    pub attribute: String,
    pub value: ConditionValue,
}

/// Possible condition types.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    /// Matches regex (case-insensitive). Condition value must be a regex string.
    Matches,
    /// Regex does not match. Condition value must be a regex string.
    NotMatches,
    /// Greater than or equal. Attribute and condition value must either be numbers or version
    /// strings.
    Gte,
    /// Greater than. Attribute and condition value must either be numbers or version strings.
    Gt,
    /// Less than or equal. Attribute and condition value must either be numbers or version
    /// strings.
    Lte,
    /// Less than. Attribute and condition value must either be numbers or version strings.
    Lt,
    /// One of values. Condition value must be a list of strings. Match is case-insensitive.
    OneOf,
    /// Not one of values. Condition value must be a list of strings. Match is case-insensitive.
    ///
    /// Null/absent attributes fail this condition automatically. (i.e., `null NOT_ONE_OF ["hello"]`
    /// is `false`)
    NotOneOf,
    /// Null check.
    ///
    /// If condition value is `false`, this is a not-null check. Any other value is a null check.
    IsNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum ConditionValue {
    // Only string arrays are currently supported. Must come before `Single`, which would otherwise
    // swallow arrays as `Value::Json`.
    Multiple(Vec<String>),
    Single(Value),
}

impl<T: Into<Value>> From<T> for ConditionValue {
    fn from(value: T) -> Self {
        Self::Single(value.into())
    }
}
impl From<Vec<String>> for ConditionValue {
    fn from(value: Vec<String>) -> Self {
        Self::Multiple(value)
    }
}
impl From<Vec<&str>> for ConditionValue {
    fn from(value: Vec<&str>) -> Self {
        Self::Multiple(value.into_iter().map(str::to_owned).collect())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Split {
    pub shards: Vec<Shard>,
    pub variation_key: String,
    #[serde(default)]
    pub extra_logging: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Shard {
    pub salt: String,
    pub ranges: Vec<ShardRange>,
}

/// Half-open interval `[start, end)` over the shard space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ShardRange {
    pub start: u64,
    pub end: u64,
}
impl ShardRange {
    /// Returns `true` if `start <= v < end`.
    pub fn contains(&self, v: u64) -> bool {
        self.start <= v && v < self.end
    }
}

/// All flag variations served by a single bandit.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BanditReference {
    #[allow(missing_docs)]
    pub model_version: String,
    /// Variations that route to this bandit.
    pub flag_variations: Vec<BanditFlagVariation>,
}

/// `BanditFlagVariation` associates a variation in feature flag with a bandit.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BanditFlagVariation {
    /// Key of the bandit.
    pub key: String,
    /// Key of the flag.
    pub flag_key: String,
    /// Allocation that serves the variation.
    pub allocation_key: String,
    /// Today it's the same as `variation_value`.
    pub variation_key: String,
    /// String variation value.
    pub variation_value: String,
}
