use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a HashMap representing key-value pairs of attributes.
///
/// Keys are strings representing attribute names.
///
/// # Examples
/// ```
/// # use decision_core::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("username".to_owned(), "john_doe".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Enum representing possible values of an attribute for a subject.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, and `bool` types.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl AttributeValue {
    #[allow(missing_docs)]
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    /// Convert an arbitrary JSON value. Arrays and objects are not supported attribute types and
    /// yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<AttributeValue> {
        match value {
            serde_json::Value::Null => Some(AttributeValue::Null),
            serde_json::Value::Bool(b) => Some(AttributeValue::Boolean(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(AttributeValue::Number),
            serde_json::Value::String(s) => Some(AttributeValue::String(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// String form used by set-membership operators. Booleans become `"true"`/`"false"`, integral
    /// numbers drop the fractional part.
    pub(crate) fn to_label(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Number(n) => Some(n.to_string()),
            AttributeValue::Boolean(b) => Some(b.to_string()),
            AttributeValue::Null => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// `ContextAttributes` are subject or action attributes split by their semantics.
///
/// Numeric and categorical mappings are disjoint: auto-classification puts every key in exactly
/// one of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextAttributes {
    /// Numeric attributes are quantitative (e.g., real numbers) and define a scale.
    ///
    /// Not all numbers are numeric attributes. If a number is used to represent an enumeration or
    /// on/off values, it is a categorical attribute.
    #[serde(alias = "numericAttributes", default)]
    pub numeric: HashMap<String, f64>,
    /// Categorical attributes are attributes that have a finite set of values that are not directly
    /// comparable (i.e., enumeration).
    #[serde(alias = "categoricalAttributes", default)]
    pub categorical: HashMap<String, String>,
}

impl From<Attributes> for ContextAttributes {
    fn from(value: Attributes) -> Self {
        ContextAttributes::from_iter(value)
    }
}

impl<K, V> FromIterator<(K, V)> for ContextAttributes
where
    K: Into<String>,
    V: Into<AttributeValue>,
{
    /// Auto-classify attributes: finite numbers are numeric, strings and booleans are categorical.
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(ContextAttributes::default(), |mut acc, (key, value)| {
                let key = key.into();
                match value.into() {
                    AttributeValue::String(value) => {
                        acc.categorical.insert(key, value);
                    }
                    AttributeValue::Number(value) if value.is_finite() => {
                        acc.numeric.insert(key, value);
                    }
                    AttributeValue::Number(value) => {
                        log::warn!(target: "decision_core",
                                   attribute:display = key,
                                   value;
                                   "dropping non-finite numeric attribute");
                    }
                    AttributeValue::Boolean(value) => {
                        // Keeps assignment evaluation inside bandit evaluation consistent with
                        // evaluating the flag from generic `Attributes`.
                        acc.categorical.insert(key, value.to_string());
                    }
                    AttributeValue::Null => {
                        // Nulls are missing values and are ignored.
                    }
                }
                acc
            })
    }
}

impl ContextAttributes {
    /// Build from explicitly typed inputs.
    ///
    /// Entries in `numeric` that are not finite numbers are dropped with a warning. Entries in
    /// `categorical` keep their label form (numbers and booleans are stringified); nulls are
    /// dropped.
    pub fn from_typed<K1, K2>(
        numeric: impl IntoIterator<Item = (K1, AttributeValue)>,
        categorical: impl IntoIterator<Item = (K2, AttributeValue)>,
    ) -> ContextAttributes
    where
        K1: Into<String>,
        K2: Into<String>,
    {
        let mut result = ContextAttributes::default();

        for (key, value) in numeric {
            let key = key.into();
            match value {
                AttributeValue::Number(n) if n.is_finite() => {
                    result.numeric.insert(key, n);
                }
                other => {
                    log::warn!(target: "decision_core",
                               attribute:display = key,
                               value:serde = other;
                               "dropping non-numeric value supplied as numeric attribute");
                }
            }
        }

        for (key, value) in categorical {
            let key = key.into();
            if let Some(label) = value.to_label() {
                result.numeric.remove(&key);
                result.categorical.insert(key, label);
            }
        }

        result
    }

    /// Auto-classify a raw JSON object. Arrays and nested objects are unsupported and dropped with
    /// a warning.
    pub fn from_json_map(map: &serde_json::Map<String, serde_json::Value>) -> ContextAttributes {
        map.iter()
            .filter_map(|(key, value)| match AttributeValue::from_json(value) {
                Some(value) => Some((key.clone(), value)),
                None => {
                    log::warn!(target: "decision_core",
                               attribute:display = key;
                               "dropping attribute of unsupported type");
                    None
                }
            })
            .collect()
    }

    /// Convert contextual attributes to generic `Attributes`.
    pub fn to_generic_attributes(&self) -> Attributes {
        let mut result = HashMap::with_capacity(self.numeric.len() + self.categorical.len());
        for (key, value) in self.numeric.iter() {
            result.insert(key.clone(), AttributeValue::Number(*value));
        }
        for (key, value) in self.categorical.iter() {
            result.insert(key.clone(), AttributeValue::String(value.clone()));
        }
        result
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.numeric.is_empty() && self.categorical.is_empty()
    }
}

/// Candidate actions for bandit evaluation, keyed by action key.
///
/// Can be built from bare action keys (no context), from generic attributes (auto-classified), or
/// from typed [`ContextAttributes`].
///
/// ```
/// # use decision_core::{Actions, Attributes};
/// # use std::collections::HashMap;
/// let bare: Actions = ["nike", "adidas"].into_iter().collect();
/// let generic: Actions = HashMap::from([
///     ("nike".to_owned(), Attributes::from([("brand_affinity".to_owned(), 0.4.into())])),
/// ]).into();
/// assert_eq!(bare.len(), 2);
/// assert_eq!(generic.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Actions(HashMap<String, ContextAttributes>);

impl Actions {
    #[allow(missing_docs)]
    pub fn new() -> Actions {
        Actions::default()
    }

    #[allow(missing_docs)]
    pub fn insert(&mut self, key: impl Into<String>, attributes: impl Into<ContextAttributes>) {
        self.0.insert(key.into(), attributes.into());
    }

    #[allow(missing_docs)]
    pub fn get(&self, key: &str) -> Option<&ContextAttributes> {
        self.0.get(key)
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[allow(missing_docs)]
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContextAttributes)> {
        self.0.iter()
    }

    #[allow(missing_docs)]
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

impl From<HashMap<String, ContextAttributes>> for Actions {
    fn from(value: HashMap<String, ContextAttributes>) -> Self {
        Actions(value)
    }
}

impl From<HashMap<String, Attributes>> for Actions {
    fn from(value: HashMap<String, Attributes>) -> Self {
        Actions(value.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<S: Into<String>> FromIterator<S> for Actions {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Actions(
            iter.into_iter()
                .map(|key| (key.into(), ContextAttributes::default()))
                .collect(),
        )
    }
}
