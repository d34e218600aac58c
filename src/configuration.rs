//! Immutable configuration snapshot and its persisted cache document.
use std::{
    collections::HashSet,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    bandits::{BanditConfiguration, BanditResponse, BanditVariationIndex, PersistedBanditIndex},
    ufc::{Flag, Timestamp, TryParse, UniversalFlagConfig},
    ConfigurationError,
};

/// Key under which the configuration document is stored in a [`ConfigurationCache`].
///
/// [`ConfigurationCache`]: crate::configuration_cache::ConfigurationCache
pub const CONFIGURATION_CACHE_KEY: &str = "decision_core.configuration";

/// Cache documents written with a different version are ignored.
pub const CACHE_DOCUMENT_VERSION: u32 = 1;

/// Remote configuration. It's a central piece that defines client behavior.
///
/// A snapshot is never mutated. Refreshes produce a new `Configuration` that replaces the previous
/// one wholesale, so a reader holding a snapshot always sees consistent data.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// When flags were last fetched or revalidated. `None` is treated as infinitely old.
    pub fetched_at: Option<Timestamp>,
    /// Validator of the flags response, sent back on the next conditional fetch.
    pub e_tag: Option<String>,
    /// Flags configuration.
    pub flags: Arc<UniversalFlagConfig>,
    /// Bandits configuration.
    pub bandits: Option<Arc<BanditResponse>>,
    /// Flag variation → bandit key index.
    pub bandit_index: Arc<BanditVariationIndex>,
    flags_response: Arc<str>,
    bandits_response: Option<Arc<CachedResponse>>,
}

/// Raw response as stored in the cache document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    /// Response body, verbatim.
    pub response: String,
    /// RFC 3339 timestamp. Missing or unparseable values mean "stale".
    #[serde(default)]
    pub fetched_at: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub e_tag: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheDocument {
    version: u32,
    config: CachedResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bandits: Option<CachedResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bandit_index: Option<PersistedBanditIndex>,
}

impl Configuration {
    /// Assemble a snapshot from parsed responses and check its integrity.
    ///
    /// `bandit_index` is a previously persisted index. When absent, the index is built from the
    /// flags' bandit references.
    pub(crate) fn from_parts(
        flags: UniversalFlagConfig,
        flags_response: CachedResponse,
        bandits: Option<(BanditResponse, CachedResponse)>,
        bandit_index: Option<BanditVariationIndex>,
    ) -> Result<Configuration, ConfigurationError> {
        let bandit_index = match bandit_index {
            Some(index) => index,
            None => BanditVariationIndex::from_references(&flags.bandit_references)?,
        };

        let (bandits, bandits_response) = match bandits {
            Some((bandits, response)) => {
                bandits.validate()?;
                (Some(Arc::new(bandits)), Some(Arc::new(response)))
            }
            None if bandit_index.has_any() => {
                return Err(ConfigurationError::MissingBanditModels);
            }
            None => (None, None),
        };

        Ok(Configuration {
            fetched_at: flags_response.fetched_at.as_deref().and_then(parse_timestamp),
            e_tag: flags_response.e_tag,
            flags: Arc::new(flags),
            bandits,
            bandit_index: Arc::new(bandit_index),
            flags_response: flags_response.response.into(),
            bandits_response,
        })
    }

    /// Build a snapshot from raw server responses.
    ///
    /// Returns `Ok(None)` if either body is empty or malformed. Such payloads are not an update.
    pub fn from_server_response(
        flags_response: String,
        e_tag: Option<String>,
        bandits_response: Option<String>,
        fetched_at: Timestamp,
    ) -> Result<Option<Configuration>, ConfigurationError> {
        let Some(flags) = parse_response::<UniversalFlagConfig>("flags", &flags_response) else {
            return Ok(None);
        };
        let fetched_at = Some(fetched_at.to_rfc3339());

        let bandits = match bandits_response {
            Some(body) => {
                let Some(bandits) = parse_response::<BanditResponse>("bandits", &body) else {
                    return Ok(None);
                };
                Some((
                    bandits,
                    CachedResponse {
                        response: body,
                        fetched_at: fetched_at.clone(),
                        e_tag: None,
                    },
                ))
            }
            None => None,
        };

        Configuration::from_parts(
            flags,
            CachedResponse {
                response: flags_response,
                fetched_at,
                e_tag,
            },
            bandits,
            None,
        )
        .map(Some)
    }

    /// Same data with the freshness clock moved to `now`.
    ///
    /// A validator sent along with the not-modified response replaces the stored one.
    pub(crate) fn revalidated(&self, now: Timestamp, e_tag: Option<String>) -> Configuration {
        Configuration {
            fetched_at: Some(now),
            e_tag: e_tag.or_else(|| self.e_tag.clone()),
            ..self.clone()
        }
    }

    /// Bandits of this snapshot, for reuse when model versions did not change between fetches.
    pub(crate) fn reusable_bandits(&self) -> Option<(BanditResponse, CachedResponse)> {
        let bandits = self.bandits.as_deref()?.clone();
        let response = self.bandits_response.as_deref()?.clone();
        Some((bandits, response))
    }

    /// Return flag configuration if it's present and parsed successfully.
    pub fn get_flag(&self, flag_key: &str) -> Option<&Flag> {
        self.flags.flags.get(flag_key).and_then(TryParse::as_parsed)
    }

    /// Return bandit configuration for the given key.
    ///
    /// Returns `None` if bandits are missing or bandit does not exist.
    pub fn get_bandit(&self, bandit_key: &str) -> Option<&BanditConfiguration> {
        self.bandits.as_ref()?.bandits.get(bandit_key)
    }

    /// Return a bandit key for the specified flag key and string flag variation.
    pub fn get_bandit_key(&self, flag_key: &str, variation_value: &str) -> Option<&str> {
        self.bandit_index.bandit_for(flag_key, variation_value)
    }

    #[allow(missing_docs)]
    pub fn is_bandit_flag(&self, flag_key: &str) -> bool {
        self.bandit_index.is_bandit_flag(flag_key)
    }

    /// Get a set of all available flags. Note that this may return both disabled flags and flags
    /// with bad configuration.
    pub fn flag_keys(&self) -> HashSet<String> {
        self.flags.flags.keys().cloned().collect()
    }

    /// Serialize into the cache document.
    pub fn to_cache_document(&self) -> serde_json::Result<String> {
        serde_json::to_string(&CacheDocument {
            version: CACHE_DOCUMENT_VERSION,
            config: CachedResponse {
                response: self.flags_response.to_string(),
                fetched_at: self.fetched_at.map(|t| t.to_rfc3339()),
                e_tag: self.e_tag.clone(),
            },
            bandits: self.bandits_response.as_deref().cloned(),
            bandit_index: Some(self.bandit_index.to_persisted()),
        })
    }

    /// Restore a snapshot from a cache document.
    ///
    /// Unreadable documents, documents of another version, and malformed responses are a cache
    /// miss (`Ok(None)`).
    pub fn from_cache_document(document: &str) -> Result<Option<Configuration>, ConfigurationError> {
        let document = match serde_json::from_str::<CacheDocument>(document) {
            Ok(document) => document,
            Err(err) => {
                log::warn!(target: "decision_core", "ignoring unreadable cache document: {err}");
                return Ok(None);
            }
        };

        if document.version != CACHE_DOCUMENT_VERSION {
            log::debug!(target: "decision_core",
                        version = document.version;
                        "ignoring cache document of another version");
            return Ok(None);
        }

        let Some(flags) = parse_response::<UniversalFlagConfig>("flags", &document.config.response)
        else {
            return Ok(None);
        };

        let bandits = match document.bandits {
            Some(cached) => {
                let Some(bandits) = parse_response::<BanditResponse>("bandits", &cached.response)
                else {
                    return Ok(None);
                };
                Some((bandits, cached))
            }
            None => None,
        };

        Configuration::from_parts(
            flags,
            document.config,
            bandits,
            document.bandit_index.map(BanditVariationIndex::from_persisted),
        )
        .map(Some)
    }
}

/// Decode a response body. Empty and malformed bodies yield `None` with a warning.
pub(crate) fn parse_response<T: DeserializeOwned>(kind: &str, body: &str) -> Option<T> {
    if body.trim().is_empty() {
        log::warn!(target: "decision_core", kind; "received empty configuration response");
        return None;
    }
    match serde_json::from_str(body) {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!(target: "decision_core",
                       kind;
                       "failed to parse configuration response: {err}");
            None
        }
    }
}

fn parse_timestamp(value: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::{Configuration, CACHE_DOCUMENT_VERSION};
    use crate::ConfigurationError;

    const FLAGS: &str = r#"{
        "flags": {
            "kill-switch": {
                "key": "kill-switch",
                "enabled": true,
                "variationType": "BOOLEAN",
                "variations": {"on": {"key": "on", "value": true}},
                "allocations": [],
                "totalShards": 10000
            },
            "broken": {"key": "broken"}
        }
    }"#;

    fn bandit_flags() -> String {
        json!({
            "flags": {},
            "banditReferences": {
                "banner_bandit": {
                    "modelVersion": "v1",
                    "flagVariations": [{
                        "key": "banner_bandit",
                        "flagKey": "banner_flag",
                        "allocationKey": "training",
                        "variationKey": "banner_bandit",
                        "variationValue": "banner_bandit"
                    }]
                }
            }
        })
        .to_string()
    }

    fn bandits(gamma: f64) -> String {
        json!({
            "bandits": {
                "banner_bandit": {
                    "banditKey": "banner_bandit",
                    "modelName": "falcon",
                    "modelVersion": "v1",
                    "modelData": {
                        "gamma": gamma,
                        "defaultActionScore": 0.0,
                        "actionProbabilityFloor": 0.0,
                        "coefficients": {}
                    }
                }
            }
        })
        .to_string()
    }

    #[test]
    fn isolates_broken_flags() {
        let configuration = Configuration::from_server_response(
            FLAGS.to_owned(),
            Some("etag-1".to_owned()),
            None,
            Utc::now(),
        )
        .unwrap()
        .unwrap();

        assert!(configuration.get_flag("kill-switch").is_some());
        assert!(configuration.get_flag("broken").is_none());
        assert_eq!(configuration.flag_keys().len(), 2);
        assert_eq!(configuration.e_tag.as_deref(), Some("etag-1"));
    }

    #[test]
    fn malformed_or_empty_response_is_not_an_update() {
        for body in ["", "   ", "{not json"] {
            let result =
                Configuration::from_server_response(body.to_owned(), None, None, Utc::now());
            assert!(matches!(result, Ok(None)), "{body:?}");
        }
    }

    #[test]
    fn bandit_references_require_models() {
        let result = Configuration::from_server_response(bandit_flags(), None, None, Utc::now());
        assert_eq!(result.unwrap_err(), ConfigurationError::MissingBanditModels);
    }

    #[test]
    fn rejects_invalid_bandit_model() {
        let result = Configuration::from_server_response(
            bandit_flags(),
            None,
            Some(bandits(-1.0)),
            Utc::now(),
        );
        assert!(matches!(
            result,
            Err(ConfigurationError::MalformedBanditModel { .. })
        ));
    }

    #[test]
    fn indexes_bandit_variations() {
        let configuration = Configuration::from_server_response(
            bandit_flags(),
            None,
            Some(bandits(1.0)),
            Utc::now(),
        )
        .unwrap()
        .unwrap();

        assert!(configuration.is_bandit_flag("banner_flag"));
        assert_eq!(
            configuration.get_bandit_key("banner_flag", "banner_bandit"),
            Some("banner_bandit")
        );
        assert_eq!(
            configuration
                .get_bandit("banner_bandit")
                .map(|b| b.model_version.as_str()),
            Some("v1")
        );
    }

    #[test]
    fn cache_document_round_trip() {
        let fetched_at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
        let configuration = Configuration::from_server_response(
            bandit_flags(),
            Some("etag-7".to_owned()),
            Some(bandits(1.0)),
            fetched_at,
        )
        .unwrap()
        .unwrap();

        let document = configuration.to_cache_document().unwrap();
        let value: serde_json::Value = serde_json::from_str(&document).unwrap();
        assert_eq!(value["version"], json!(CACHE_DOCUMENT_VERSION));
        assert_eq!(value["config"]["eTag"], json!("etag-7"));
        assert_eq!(
            value["banditIndex"]["flags"]["banner_flag"]["banner_bandit"],
            json!("banner_bandit")
        );

        let restored = Configuration::from_cache_document(&document)
            .unwrap()
            .unwrap();
        assert_eq!(restored.fetched_at, Some(fetched_at));
        assert_eq!(restored.e_tag.as_deref(), Some("etag-7"));
        assert_eq!(restored.bandit_index, configuration.bandit_index);
        assert!(restored.get_bandit("banner_bandit").is_some());
    }

    #[test]
    fn restores_persisted_index_instead_of_rebuilding() {
        let document = json!({
            "version": CACHE_DOCUMENT_VERSION,
            "config": {"response": FLAGS, "fetchedAt": null, "eTag": null},
            "banditIndex": {"flags": {}, "modelVersions": {}},
        })
        .to_string();

        let restored = Configuration::from_cache_document(&document)
            .unwrap()
            .unwrap();
        assert!(!restored.bandit_index.has_any());
        assert_eq!(restored.fetched_at, None);
    }

    #[test]
    fn other_versions_are_a_cache_miss() {
        let document = json!({
            "version": CACHE_DOCUMENT_VERSION + 1,
            "config": {"response": FLAGS},
        })
        .to_string();
        assert!(matches!(
            Configuration::from_cache_document(&document),
            Ok(None)
        ));
        assert!(matches!(
            Configuration::from_cache_document("garbage"),
            Ok(None)
        ));
    }

    #[test]
    fn unparseable_fetched_at_means_unknown_age() {
        let document = json!({
            "version": CACHE_DOCUMENT_VERSION,
            "config": {"response": FLAGS, "fetchedAt": "yesterday"},
        })
        .to_string();
        let restored = Configuration::from_cache_document(&document)
            .unwrap()
            .unwrap();
        assert_eq!(restored.fetched_at, None);
    }

    #[test]
    fn revalidation_only_moves_the_clock() {
        let configuration =
            Configuration::from_server_response(FLAGS.to_owned(), None, None, Utc::now())
                .unwrap()
                .unwrap();
        let later = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        let revalidated = configuration.revalidated(later, None);
        assert_eq!(revalidated.fetched_at, Some(later));
        assert_eq!(revalidated.e_tag, configuration.e_tag);
        assert!(std::sync::Arc::ptr_eq(
            &revalidated.flags,
            &configuration.flags
        ));
    }
}
