//! Keeps the [`ConfigurationStore`] populated and fresh.
//!
//! The loader owns the refresh policy: a snapshot older than `max_age` is stale, and a stale (or
//! missing) snapshot is refreshed with a conditional fetch using the last ETag. Only one refresh
//! runs at a time.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::Utc;

use crate::{
    bandits::{BanditConfiguration, BanditResponse, BanditVariationIndex},
    configuration::{parse_response, CachedResponse, CONFIGURATION_CACHE_KEY},
    configuration_cache::ConfigurationCache,
    configuration_fetcher::ConfigurationFetcher,
    configuration_store::ConfigurationStore,
    ufc::{Flag, Timestamp, UniversalFlagConfig},
    Configuration, ConfigurationError, Error, Result, TransportError,
};

/// Freshness of the active snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationState {
    /// No configuration has been loaded yet.
    Empty,
    /// Younger than the age limit.
    Fresh,
    /// At or past the age limit, or of unknown age.
    Stale,
}

/// What a refresh did to the active snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new snapshot replaced the previous one.
    Updated,
    /// Server copy is unchanged. Only the freshness clock moved.
    NotModified,
    /// Response was empty or malformed. Previous snapshot retained.
    NoUpdate,
}

/// Loads configuration from the persistent cache and the fetcher into a [`ConfigurationStore`].
pub struct ConfigurationLoader {
    store: Arc<ConfigurationStore>,
    fetcher: Box<dyn ConfigurationFetcher>,
    cache: Arc<dyn ConfigurationCache>,
    max_age: Duration,
    refresh_lock: Mutex<()>,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We latch this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl ConfigurationLoader {
    #[allow(missing_docs)]
    pub fn new(
        store: Arc<ConfigurationStore>,
        fetcher: Box<dyn ConfigurationFetcher>,
        cache: Arc<dyn ConfigurationCache>,
        max_age: Duration,
    ) -> ConfigurationLoader {
        ConfigurationLoader {
            store,
            fetcher,
            cache,
            max_age,
            refresh_lock: Mutex::new(()),
            unauthorized: AtomicBool::new(false),
        }
    }

    /// Active snapshot, without any freshness check.
    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.store.get_configuration()
    }

    #[allow(missing_docs)]
    pub fn is_unauthorized(&self) -> bool {
        self.unauthorized.load(Ordering::Relaxed)
    }

    /// Freshness of the active snapshot at `now`.
    pub fn state_at(&self, now: Timestamp) -> ConfigurationState {
        let Some(configuration) = self.store.get_configuration() else {
            return ConfigurationState::Empty;
        };
        let Some(fetched_at) = configuration.fetched_at else {
            return ConfigurationState::Stale;
        };

        // A fetch timestamp in the future (clock skew) counts as just fetched.
        let age = now
            .signed_duration_since(fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if age >= self.max_age {
            ConfigurationState::Stale
        } else {
            ConfigurationState::Fresh
        }
    }

    /// Refresh configuration if it's missing or stale.
    pub fn reload_if_expired(&self) -> Result<()> {
        self.reload_if_expired_at(Utc::now())
    }

    /// [`ConfigurationLoader::reload_if_expired`] with an explicit clock.
    ///
    /// An empty store is first populated from the persistent cache. The network is only consulted
    /// if that leaves the store empty or stale.
    pub fn reload_if_expired_at(&self, now: Timestamp) -> Result<()> {
        if self.state_at(now) == ConfigurationState::Fresh {
            return Ok(());
        }

        let _guard = self.lock_refresh();

        // Another caller may have refreshed while we were waiting for the lock.
        match self.state_at(now) {
            ConfigurationState::Fresh => return Ok(()),
            ConfigurationState::Empty => {
                if self.load_from_cache()? && self.state_at(now) == ConfigurationState::Fresh {
                    return Ok(());
                }
            }
            ConfigurationState::Stale => {}
        }

        self.refresh_locked(now).map(|_| ())
    }

    /// Unconditionally fetch configuration.
    pub fn refresh(&self) -> Result<RefreshOutcome> {
        self.refresh_at(Utc::now())
    }

    /// [`ConfigurationLoader::refresh`] with an explicit clock.
    pub fn refresh_at(&self, now: Timestamp) -> Result<RefreshOutcome> {
        let _guard = self.lock_refresh();
        self.refresh_locked(now)
    }

    /// Populate an empty store from the persistent cache.
    ///
    /// Returns `Ok(true)` if a snapshot was restored. Unreadable caches and documents are a miss.
    /// A cached configuration that fails integrity checks is an error.
    pub fn load_from_cache(&self) -> Result<bool> {
        if self.store.get_configuration().is_some() {
            return Ok(false);
        }

        let document = match self.cache.get(CONFIGURATION_CACHE_KEY) {
            Ok(Some(document)) => document,
            Ok(None) => return Ok(false),
            Err(err) => {
                log::warn!(target: "decision_core", "failed to read configuration cache: {err}");
                return Ok(false);
            }
        };

        match Configuration::from_cache_document(&document)? {
            Some(configuration) => {
                log::debug!(target: "decision_core", "restored configuration from cache");
                self.store.set_configuration(Arc::new(configuration));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Return flag configuration, refreshing stale configuration first.
    ///
    /// Refresh failures are logged and the current snapshot is used.
    pub fn get_flag(&self, flag_key: &str) -> Option<Flag> {
        self.read_through()?.get_flag(flag_key).cloned()
    }

    /// Return bandit configuration, refreshing stale configuration first.
    pub fn get_bandit(&self, bandit_key: &str) -> Option<BanditConfiguration> {
        self.read_through()?.get_bandit(bandit_key).cloned()
    }

    #[allow(missing_docs)]
    pub fn is_bandit_flag(&self, flag_key: &str) -> bool {
        self.configuration()
            .is_some_and(|configuration| configuration.is_bandit_flag(flag_key))
    }

    /// Key of the bandit serving `variation_value` of `flag_key`.
    pub fn get_bandit_by_variation(&self, flag_key: &str, variation_value: &str) -> Option<String> {
        self.configuration()?
            .get_bandit_key(flag_key, variation_value)
            .map(str::to_owned)
    }

    fn read_through(&self) -> Option<Arc<Configuration>> {
        if let Err(err) = self.reload_if_expired() {
            log::warn!(target: "decision_core", "failed to refresh configuration: {err}");
        }
        self.configuration()
    }

    fn lock_refresh(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        self.refresh_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_locked(&self, now: Timestamp) -> Result<RefreshOutcome> {
        if self.is_unauthorized() {
            return Err(Error::Unauthorized);
        }

        let current = self.store.get_configuration();
        let last_e_tag = current.as_ref().and_then(|c| c.e_tag.as_deref());

        let response = self
            .fetcher
            .fetch_flags(last_e_tag)
            .map_err(|err| self.transport_error(err))?;

        if !response.is_modified {
            let Some(current) = current else {
                log::debug!(target: "decision_core", "not-modified response without a configuration");
                return Ok(RefreshOutcome::NoUpdate);
            };
            log::debug!(target: "decision_core", "configuration not modified");
            let revalidated = Arc::new(current.revalidated(now, response.e_tag));
            self.store.set_configuration(revalidated.clone());
            self.persist(&revalidated);
            return Ok(RefreshOutcome::NotModified);
        }

        let Some(body) = response.body else {
            log::warn!(target: "decision_core", "modified response without a body");
            return Ok(RefreshOutcome::NoUpdate);
        };
        let Some(flags) = parse_response::<UniversalFlagConfig>("flags", &body) else {
            return Ok(RefreshOutcome::NoUpdate);
        };
        let fetched_at = Some(now.to_rfc3339());

        // Routing conflicts reject the payload before any bandit models are requested.
        let bandit_index = BanditVariationIndex::from_references(&flags.bandit_references)
            .map_err(|err| self.rejected(err))?;

        let bandits = if flags.bandit_references.is_empty() {
            None
        } else {
            let reusable = current
                .as_ref()
                .filter(|c| c.bandit_index.model_versions() == bandit_index.model_versions())
                .and_then(|c| c.reusable_bandits());

            match reusable {
                Some(bandits) => {
                    log::debug!(target: "decision_core", "bandit models unchanged, skipping fetch");
                    Some(bandits)
                }
                None => {
                    let response = self
                        .fetcher
                        .fetch_bandits()
                        .map_err(|err| self.transport_error(err))?;
                    let Some(bandits) =
                        parse_response::<BanditResponse>("bandits", &response.body)
                    else {
                        return Ok(RefreshOutcome::NoUpdate);
                    };
                    Some((
                        bandits,
                        CachedResponse {
                            response: response.body,
                            fetched_at: fetched_at.clone(),
                            e_tag: response.e_tag,
                        },
                    ))
                }
            }
        };

        let configuration = Configuration::from_parts(
            flags,
            CachedResponse {
                response: body,
                fetched_at,
                e_tag: response.e_tag,
            },
            bandits,
            Some(bandit_index),
        )
        .map_err(|err| self.rejected(err))?;

        let configuration = Arc::new(configuration);
        self.store.set_configuration(configuration.clone());
        self.persist(&configuration);
        log::debug!(target: "decision_core", "configuration updated");

        Ok(RefreshOutcome::Updated)
    }

    fn rejected(&self, err: ConfigurationError) -> Error {
        log::warn!(target: "decision_core",
                   "rejecting configuration, keeping previous one: {err}");
        Error::Configuration(err)
    }

    fn transport_error(&self, err: TransportError) -> Error {
        if err.is_unauthorized() {
            self.unauthorized.store(true, Ordering::Relaxed);
            Error::Unauthorized
        } else {
            log::warn!(target: "decision_core",
                       status = err.status,
                       recoverable = err.is_recoverable();
                       "failed to fetch configuration: {}", err.message);
            Error::Transport(err)
        }
    }

    fn persist(&self, configuration: &Configuration) {
        let result = configuration
            .to_cache_document()
            .map_err(std::io::Error::from)
            .and_then(|document| self.cache.set(CONFIGURATION_CACHE_KEY, &document));
        if let Err(err) = result {
            log::warn!(target: "decision_core", "failed to write configuration cache: {err}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc, Mutex,
        },
        time::Duration,
    };

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::{ConfigurationLoader, ConfigurationState, RefreshOutcome};
    use crate::{
        configuration::CONFIGURATION_CACHE_KEY,
        configuration_cache::{ConfigurationCache, InMemoryConfigurationCache},
        configuration_fetcher::{BanditsResponse, ConfigurationFetcher, FlagsResponse},
        configuration_store::ConfigurationStore,
        ufc::Timestamp,
        ConfigurationError, Error, TransportError,
    };

    /// Replays scripted responses and records what was requested.
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pub flags: Mutex<VecDeque<Result<FlagsResponse, TransportError>>>,
        pub bandits: Mutex<VecDeque<Result<BanditsResponse, TransportError>>>,
        pub sent_e_tags: Mutex<Vec<Option<String>>>,
        pub bandit_fetches: Mutex<usize>,
    }

    impl FakeFetcher {
        pub(crate) fn with_flags(
            responses: impl IntoIterator<Item = Result<FlagsResponse, TransportError>>,
        ) -> FakeFetcher {
            FakeFetcher {
                flags: Mutex::new(responses.into_iter().collect()),
                ..FakeFetcher::default()
            }
        }
    }

    impl ConfigurationFetcher for Arc<FakeFetcher> {
        fn fetch_flags(&self, last_e_tag: Option<&str>) -> Result<FlagsResponse, TransportError> {
            self.sent_e_tags
                .lock()
                .unwrap()
                .push(last_e_tag.map(str::to_owned));
            self.flags
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::network("no scripted response")))
        }

        fn fetch_bandits(&self) -> Result<BanditsResponse, TransportError> {
            *self.bandit_fetches.lock().unwrap() += 1;
            self.bandits
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::network("no scripted response")))
        }
    }

    struct BrokenCache;

    impl ConfigurationCache for BrokenCache {
        fn get(&self, _key: &str) -> std::io::Result<Option<String>> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"))
        }

        fn set(&self, _key: &str, _value: &str) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"))
        }

        fn clear(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn flags_body(variation: &str) -> String {
        json!({
            "flags": {
                "color": {
                    "key": "color",
                    "enabled": true,
                    "variationType": "STRING",
                    "variations": {variation: {"key": variation, "value": variation}},
                    "allocations": [{
                        "key": "all",
                        "splits": [{"variationKey": variation, "shards": []}]
                    }],
                    "totalShards": 10000
                }
            }
        })
        .to_string()
    }

    fn bandit_flags_body(model_version: &str) -> String {
        json!({
            "flags": {},
            "banditReferences": {
                "bandit": {
                    "modelVersion": model_version,
                    "flagVariations": [{
                        "key": "bandit",
                        "flagKey": "bandit_flag",
                        "allocationKey": "all",
                        "variationKey": "bandit",
                        "variationValue": "bandit"
                    }]
                }
            }
        })
        .to_string()
    }

    fn bandits_body(model_version: &str) -> String {
        json!({
            "bandits": {
                "bandit": {
                    "banditKey": "bandit",
                    "modelName": "falcon",
                    "modelVersion": model_version,
                    "modelData": {
                        "gamma": 1.0,
                        "defaultActionScore": 0.0,
                        "actionProbabilityFloor": 0.0,
                        "coefficients": {}
                    }
                }
            }
        })
        .to_string()
    }

    pub(crate) fn modified(body: String, e_tag: &str) -> Result<FlagsResponse, TransportError> {
        Ok(FlagsResponse {
            body: Some(body),
            is_modified: true,
            e_tag: Some(e_tag.to_owned()),
        })
    }

    fn not_modified() -> Result<FlagsResponse, TransportError> {
        Ok(FlagsResponse {
            body: None,
            is_modified: false,
            e_tag: None,
        })
    }

    fn at(minute: u32, second: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, minute, second).unwrap()
    }

    fn loader(
        fetcher: &Arc<FakeFetcher>,
        cache: Arc<dyn ConfigurationCache>,
    ) -> ConfigurationLoader {
        ConfigurationLoader::new(
            Arc::new(ConfigurationStore::new()),
            Box::new(fetcher.clone()),
            cache,
            Duration::from_secs(30),
        )
    }

    fn color(loader: &ConfigurationLoader) -> Option<String> {
        let configuration = loader.configuration()?;
        let flag = configuration.get_flag("color")?;
        flag.variations.keys().next().cloned()
    }

    #[test]
    fn empty_to_fresh_to_stale() {
        let fetcher = Arc::new(FakeFetcher::with_flags([modified(flags_body("red"), "e1")]));
        let loader = loader(&fetcher, Arc::new(InMemoryConfigurationCache::new()));

        assert_eq!(loader.state_at(at(0, 0)), ConfigurationState::Empty);

        loader.reload_if_expired_at(at(0, 0)).unwrap();
        assert_eq!(loader.state_at(at(0, 0)), ConfigurationState::Fresh);
        assert_eq!(loader.state_at(at(0, 29)), ConfigurationState::Fresh);
        assert_eq!(loader.state_at(at(0, 30)), ConfigurationState::Stale);
        assert_eq!(color(&loader).as_deref(), Some("red"));

        // Fresh configuration is not refetched.
        loader.reload_if_expired_at(at(0, 10)).unwrap();
        assert_eq!(fetcher.sent_e_tags.lock().unwrap().len(), 1);
    }

    #[test]
    fn not_modified_only_moves_the_clock() {
        let fetcher = Arc::new(FakeFetcher::with_flags([
            modified(flags_body("red"), "e1"),
            not_modified(),
        ]));
        let loader = loader(&fetcher, Arc::new(InMemoryConfigurationCache::new()));

        loader.reload_if_expired_at(at(0, 0)).unwrap();
        let before = loader.configuration().unwrap();

        loader.reload_if_expired_at(at(1, 0)).unwrap();
        let after = loader.configuration().unwrap();

        assert_eq!(
            *fetcher.sent_e_tags.lock().unwrap(),
            vec![None, Some("e1".to_owned())]
        );
        assert!(Arc::ptr_eq(&before.flags, &after.flags));
        assert_eq!(after.fetched_at, Some(at(1, 0)));
        assert_eq!(after.e_tag.as_deref(), Some("e1"));
        assert_eq!(loader.state_at(at(1, 10)), ConfigurationState::Fresh);
    }

    #[test]
    fn modified_response_replaces_configuration() {
        let fetcher = Arc::new(FakeFetcher::with_flags([
            modified(flags_body("red"), "e1"),
            modified(flags_body("blue"), "e2"),
        ]));
        let loader = loader(&fetcher, Arc::new(InMemoryConfigurationCache::new()));

        assert_eq!(loader.refresh_at(at(0, 0)).unwrap(), RefreshOutcome::Updated);
        assert_eq!(loader.refresh_at(at(0, 5)).unwrap(), RefreshOutcome::Updated);
        assert_eq!(color(&loader).as_deref(), Some("blue"));
        assert_eq!(loader.configuration().unwrap().e_tag.as_deref(), Some("e2"));
    }

    #[test]
    fn malformed_response_keeps_previous_configuration() {
        let fetcher = Arc::new(FakeFetcher::with_flags([
            modified(flags_body("red"), "e1"),
            modified("{oops".to_owned(), "e2"),
            modified(String::new(), "e3"),
        ]));
        let loader = loader(&fetcher, Arc::new(InMemoryConfigurationCache::new()));

        loader.refresh_at(at(0, 0)).unwrap();
        assert_eq!(loader.refresh_at(at(1, 0)).unwrap(), RefreshOutcome::NoUpdate);
        assert_eq!(loader.refresh_at(at(2, 0)).unwrap(), RefreshOutcome::NoUpdate);
        assert_eq!(color(&loader).as_deref(), Some("red"));
        assert_eq!(loader.configuration().unwrap().e_tag.as_deref(), Some("e1"));
    }

    #[test]
    fn transport_failure_keeps_previous_configuration() {
        let fetcher = Arc::new(FakeFetcher::with_flags([
            modified(flags_body("red"), "e1"),
            Err(TransportError::from_status(503, "Service Unavailable")),
        ]));
        let loader = loader(&fetcher, Arc::new(InMemoryConfigurationCache::new()));

        loader.refresh_at(at(0, 0)).unwrap();
        match loader.refresh_at(at(1, 0)) {
            Err(Error::Transport(err)) => assert!(err.is_recoverable()),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(color(&loader).as_deref(), Some("red"));
        assert!(!loader.is_unauthorized());
    }

    #[test]
    fn unauthorized_latches() {
        let fetcher = Arc::new(FakeFetcher::with_flags([
            Err(TransportError::from_status(401, "Unauthorized")),
            modified(flags_body("red"), "e1"),
        ]));
        let loader = loader(&fetcher, Arc::new(InMemoryConfigurationCache::new()));

        assert!(matches!(
            loader.reload_if_expired_at(at(0, 0)),
            Err(Error::Unauthorized)
        ));
        assert!(loader.is_unauthorized());
        assert!(matches!(
            loader.refresh_at(at(1, 0)),
            Err(Error::Unauthorized)
        ));
        // Second scripted response was never requested.
        assert_eq!(fetcher.sent_e_tags.lock().unwrap().len(), 1);
    }

    #[test]
    fn integrity_error_keeps_previous_configuration() {
        let ambiguous = json!({
            "flags": {},
            "banditReferences": {
                "a": {"modelVersion": "1", "flagVariations": [{
                    "key": "a", "flagKey": "f", "allocationKey": "x",
                    "variationKey": "v", "variationValue": "v"
                }]},
                "b": {"modelVersion": "1", "flagVariations": [{
                    "key": "b", "flagKey": "f", "allocationKey": "x",
                    "variationKey": "v", "variationValue": "v"
                }]}
            }
        })
        .to_string();
        let fetcher = Arc::new(FakeFetcher::with_flags([
            modified(flags_body("red"), "e1"),
            modified(ambiguous, "e2"),
        ]));
        fetcher
            .bandits
            .lock()
            .unwrap()
            .push_back(Err(TransportError::from_status(401, "Unauthorized")));
        let loader = loader(&fetcher, Arc::new(InMemoryConfigurationCache::new()));

        loader.refresh_at(at(0, 0)).unwrap();
        assert!(matches!(
            loader.refresh_at(at(1, 0)),
            Err(Error::Configuration(
                ConfigurationError::AmbiguousBanditVariation { .. }
            ))
        ));
        assert_eq!(color(&loader).as_deref(), Some("red"));
        // Rejected before bandit models were requested.
        assert_eq!(*fetcher.bandit_fetches.lock().unwrap(), 0);
        assert!(!loader.is_unauthorized());
    }

    #[test]
    fn not_modified_adopts_returned_e_tag() {
        let fetcher = Arc::new(FakeFetcher::with_flags([
            modified(flags_body("red"), "e1"),
            Ok(FlagsResponse {
                body: None,
                is_modified: false,
                e_tag: Some("e1-gzip".to_owned()),
            }),
            not_modified(),
        ]));
        let loader = loader(&fetcher, Arc::new(InMemoryConfigurationCache::new()));

        loader.refresh_at(at(0, 0)).unwrap();
        assert_eq!(loader.refresh_at(at(1, 0)).unwrap(), RefreshOutcome::NotModified);
        assert_eq!(
            loader.configuration().unwrap().e_tag.as_deref(),
            Some("e1-gzip")
        );

        // No validator in the response: the stored one is kept.
        assert_eq!(loader.refresh_at(at(2, 0)).unwrap(), RefreshOutcome::NotModified);
        assert_eq!(
            *fetcher.sent_e_tags.lock().unwrap(),
            vec![None, Some("e1".to_owned()), Some("e1-gzip".to_owned())]
        );
        assert_eq!(
            loader.configuration().unwrap().e_tag.as_deref(),
            Some("e1-gzip")
        );
    }

    /// Holds every flags request until the test lets it through.
    struct GatedFetcher {
        gate: Mutex<mpsc::Receiver<()>>,
        calls: AtomicUsize,
        responses: Mutex<VecDeque<Result<FlagsResponse, TransportError>>>,
    }

    impl ConfigurationFetcher for Arc<GatedFetcher> {
        fn fetch_flags(&self, _last_e_tag: Option<&str>) -> Result<FlagsResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.lock().unwrap().recv().unwrap();
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::network("no scripted response")))
        }

        fn fetch_bandits(&self) -> Result<BanditsResponse, TransportError> {
            Err(TransportError::network("no bandits"))
        }
    }

    #[test]
    fn concurrent_reloads_share_one_fetch() {
        let (release, gate) = mpsc::channel();
        let fetcher = Arc::new(GatedFetcher {
            gate: Mutex::new(gate),
            calls: AtomicUsize::new(0),
            responses: Mutex::new(VecDeque::from([
                modified(flags_body("red"), "e1"),
                modified(flags_body("blue"), "e2"),
            ])),
        });
        let loader = ConfigurationLoader::new(
            Arc::new(ConfigurationStore::new()),
            Box::new(fetcher.clone()),
            Arc::new(InMemoryConfigurationCache::new()),
            Duration::from_secs(30),
        );

        release.send(()).unwrap();
        loader.reload_if_expired_at(at(0, 0)).unwrap();
        assert_eq!(loader.state_at(at(1, 0)), ConfigurationState::Stale);

        std::thread::scope(|scope| {
            let readers = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        loader.reload_if_expired_at(at(1, 0)).unwrap();
                        color(&loader)
                    })
                })
                .collect::<Vec<_>>();

            // Let the other readers pile up behind the request in flight.
            while fetcher.calls.load(Ordering::SeqCst) < 2 {
                std::thread::yield_now();
            }
            std::thread::sleep(Duration::from_millis(50));

            // A second request would fail on the closed channel instead of hanging.
            release.send(()).unwrap();
            drop(release);

            for reader in readers {
                assert_eq!(reader.join().unwrap().as_deref(), Some("blue"));
            }
        });

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bandits_fetched_only_when_model_versions_change() {
        let fetcher = Arc::new(FakeFetcher::with_flags([
            modified(bandit_flags_body("v1"), "e1"),
            modified(bandit_flags_body("v1"), "e2"),
            modified(bandit_flags_body("v2"), "e3"),
        ]));
        fetcher.bandits.lock().unwrap().extend([
            Ok(BanditsResponse {
                body: bandits_body("v1"),
                e_tag: None,
            }),
            Ok(BanditsResponse {
                body: bandits_body("v2"),
                e_tag: None,
            }),
        ]);
        let loader = loader(&fetcher, Arc::new(InMemoryConfigurationCache::new()));

        loader.refresh_at(at(0, 0)).unwrap();
        loader.refresh_at(at(1, 0)).unwrap();
        assert_eq!(*fetcher.bandit_fetches.lock().unwrap(), 1);

        loader.refresh_at(at(2, 0)).unwrap();
        assert_eq!(*fetcher.bandit_fetches.lock().unwrap(), 2);
        assert_eq!(
            loader
                .get_bandit_by_variation("bandit_flag", "bandit")
                .as_deref(),
            Some("bandit")
        );
        assert!(loader.is_bandit_flag("bandit_flag"));
        assert_eq!(
            loader
                .configuration()
                .unwrap()
                .get_bandit("bandit")
                .unwrap()
                .model_version,
            "v2"
        );
    }

    #[test]
    fn no_bandit_fetch_without_references() {
        let fetcher = Arc::new(FakeFetcher::with_flags([modified(flags_body("red"), "e1")]));
        let loader = loader(&fetcher, Arc::new(InMemoryConfigurationCache::new()));
        loader.refresh_at(at(0, 0)).unwrap();
        assert_eq!(*fetcher.bandit_fetches.lock().unwrap(), 0);
    }

    #[test]
    fn restores_from_cache_before_fetching() {
        let cache: Arc<dyn ConfigurationCache> = Arc::new(InMemoryConfigurationCache::new());

        let first = Arc::new(FakeFetcher::with_flags([modified(flags_body("red"), "e1")]));
        loader(&first, cache.clone()).refresh_at(at(0, 0)).unwrap();
        assert!(cache.get(CONFIGURATION_CACHE_KEY).unwrap().is_some());

        // Cached copy is fresh: no network.
        let second = Arc::new(FakeFetcher::default());
        let restored = loader(&second, cache.clone());
        restored.reload_if_expired_at(at(0, 10)).unwrap();
        assert_eq!(color(&restored).as_deref(), Some("red"));
        assert!(second.sent_e_tags.lock().unwrap().is_empty());

        // Cached copy is stale: revalidated with its ETag.
        let third = Arc::new(FakeFetcher::with_flags([not_modified()]));
        let revalidated = loader(&third, cache);
        revalidated.reload_if_expired_at(at(5, 0)).unwrap();
        assert_eq!(
            *third.sent_e_tags.lock().unwrap(),
            vec![Some("e1".to_owned())]
        );
        assert_eq!(revalidated.state_at(at(5, 1)), ConfigurationState::Fresh);
    }

    #[test]
    fn cache_failures_are_not_fatal() {
        let fetcher = Arc::new(FakeFetcher::with_flags([modified(flags_body("red"), "e1")]));
        let loader = loader(&fetcher, Arc::new(BrokenCache));

        assert!(!loader.load_from_cache().unwrap());
        loader.reload_if_expired_at(at(0, 0)).unwrap();
        assert_eq!(color(&loader).as_deref(), Some("red"));
    }

    #[test]
    fn missing_fetch_timestamp_is_stale() {
        let cache = Arc::new(InMemoryConfigurationCache::new());
        cache
            .set(
                CONFIGURATION_CACHE_KEY,
                &json!({
                    "version": crate::configuration::CACHE_DOCUMENT_VERSION,
                    "config": {"response": flags_body("red")},
                })
                .to_string(),
            )
            .unwrap();

        let fetcher = Arc::new(FakeFetcher::default());
        let loader = loader(&fetcher, cache);
        assert!(loader.load_from_cache().unwrap());
        assert_eq!(loader.state_at(at(0, 0)), ConfigurationState::Stale);
    }

    #[test]
    fn get_flag_reads_through() {
        let fetcher = Arc::new(FakeFetcher::with_flags([modified(flags_body("red"), "e1")]));
        let loader = loader(&fetcher, Arc::new(InMemoryConfigurationCache::new()));

        let flag = loader.get_flag("color").unwrap();
        assert_eq!(flag.key, "color");
        assert!(loader.get_flag("unknown").is_none());
        assert!(loader.get_bandit("bandit").is_none());
    }
}
