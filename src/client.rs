use std::sync::Arc;

use chrono::Utc;

use crate::{
    bandits::BanditConfiguration,
    configuration_fetcher::{
        ConfigurationFetcher, HttpConfigurationFetcher, HttpConfigurationFetcherConfig,
    },
    configuration_loader::ConfigurationLoader,
    configuration_store::ConfigurationStore,
    eval::{self, BanditResult},
    poller::{PollerThread, PollerThreadConfig},
    ufc::{AssignmentValue, Flag, VariationType},
    Actions, AssignmentLogger, Attributes, ClientConfig, Configuration, ContextAttributes, Result,
    SdkMetadata,
};

/// A client evaluating feature flags and bandits against one configuration source.
///
/// In order to create a client instance, first create [`ClientConfig`]. Clients share nothing:
/// several of them can live in one process, each with its own store, transport, and cache.
///
/// # Examples
/// ```
/// # use decision_core::{Client, ClientConfig};
/// let client = Client::new(ClientConfig::from_api_key("api-key")).unwrap();
/// ```
pub struct Client<'a> {
    loader: Arc<ConfigurationLoader>,
    assignment_logger: Box<dyn AssignmentLogger + Send + Sync + 'a>,
    poller: PollerThreadConfig,
    sdk_metadata: SdkMetadata,
}

impl<'a> Client<'a> {
    /// Create a new `Client` using the specified configuration.
    ///
    /// No request is made until configuration is first needed.
    pub fn new(config: ClientConfig<'a>) -> Result<Self> {
        let sdk_metadata = SdkMetadata::CURRENT;

        let fetcher: Box<dyn ConfigurationFetcher> = match config.fetcher {
            Some(fetcher) => fetcher,
            None => Box::new(HttpConfigurationFetcher::new(
                HttpConfigurationFetcherConfig {
                    base_url: config.base_url,
                    api_key: config.api_key,
                    sdk_metadata,
                },
            )?),
        };

        let loader = ConfigurationLoader::new(
            Arc::new(ConfigurationStore::new()),
            fetcher,
            config.cache,
            config.max_age,
        );

        Ok(Client {
            loader: Arc::new(loader),
            assignment_logger: config.assignment_logger,
            poller: config.poller,
            sdk_metadata,
        })
    }

    /// Get variation assignment for the given subject.
    ///
    /// Returns `Ok(None)` when the default value should be used: configuration is not loaded
    /// yet, the flag is unknown or disabled, or no allocation matched the subject.
    pub fn get_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<AssignmentValue>> {
        self.get_assignment_inner(flag_key, subject_key, subject_attributes, None)
    }

    /// Get string assignment. Fails if the flag is not a string flag.
    pub fn get_string_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<String>> {
        let value = self.get_assignment_inner(
            flag_key,
            subject_key,
            subject_attributes,
            Some(VariationType::String),
        )?;
        Ok(value.and_then(|value| match value {
            AssignmentValue::String(s) => Some(s),
            _ => None,
        }))
    }

    /// Get integer assignment. Fails if the flag is not an integer flag.
    pub fn get_integer_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<i64>> {
        let value = self.get_assignment_inner(
            flag_key,
            subject_key,
            subject_attributes,
            Some(VariationType::Integer),
        )?;
        Ok(value.as_ref().and_then(AssignmentValue::as_integer))
    }

    /// Get numeric assignment. Fails if the flag is not a numeric flag.
    pub fn get_numeric_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<f64>> {
        let value = self.get_assignment_inner(
            flag_key,
            subject_key,
            subject_attributes,
            Some(VariationType::Numeric),
        )?;
        Ok(value.as_ref().and_then(AssignmentValue::as_numeric))
    }

    /// Get boolean assignment. Fails if the flag is not a boolean flag.
    pub fn get_boolean_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<bool>> {
        let value = self.get_assignment_inner(
            flag_key,
            subject_key,
            subject_attributes,
            Some(VariationType::Boolean),
        )?;
        Ok(value.as_ref().and_then(AssignmentValue::as_boolean))
    }

    /// Get JSON assignment. Fails if the flag is not a JSON flag.
    pub fn get_json_assignment(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
    ) -> Result<Option<serde_json::Value>> {
        let value = self.get_assignment_inner(
            flag_key,
            subject_key,
            subject_attributes,
            Some(VariationType::Json),
        )?;
        Ok(value.and_then(|value| match value {
            AssignmentValue::Json(json) => Some(json),
            _ => None,
        }))
    }

    fn get_assignment_inner(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &Attributes,
        expected_type: Option<VariationType>,
    ) -> Result<Option<AssignmentValue>> {
        let configuration = self.loader.configuration();

        let assignment = eval::get_assignment(
            configuration.as_deref(),
            flag_key,
            subject_key,
            subject_attributes,
            expected_type,
            Utc::now(),
            &self.sdk_metadata,
        )?;

        let Some(assignment) = assignment else {
            return Ok(None);
        };

        if let Some(event) = assignment.event {
            log::trace!(target: "decision_core",
                        event:serde;
                        "logging assignment");
            self.assignment_logger.log_assignment(event);
        }

        Ok(Some(assignment.value))
    }

    /// Evaluate a string flag and, if the assigned variation is served by a bandit, select one of
    /// `actions` for the subject.
    ///
    /// `default_variation` is used when the flag yields no assignment. Assignment and bandit
    /// events are passed to the assignment logger.
    pub fn get_bandit_action(
        &self,
        flag_key: &str,
        subject_key: &str,
        subject_attributes: &ContextAttributes,
        actions: &Actions,
        default_variation: &str,
    ) -> Result<BanditResult> {
        let configuration = self.loader.configuration();

        let result = eval::get_bandit_action(
            configuration.as_deref(),
            flag_key,
            subject_key,
            subject_attributes,
            actions,
            default_variation,
            Utc::now(),
            &self.sdk_metadata,
        )?;

        if let Some(event) = &result.assignment_event {
            self.assignment_logger.log_assignment(event.clone());
        }
        if let Some(event) = &result.bandit_event {
            log::trace!(target: "decision_core",
                        event:serde;
                        "logging bandit action");
            self.assignment_logger.log_bandit_action(event.clone());
        }

        Ok(result)
    }

    /// Return flag configuration, refreshing stale configuration first.
    pub fn get_flag(&self, flag_key: &str) -> Option<Flag> {
        self.loader.get_flag(flag_key)
    }

    /// Return bandit configuration, refreshing stale configuration first.
    pub fn get_bandit(&self, bandit_key: &str) -> Option<BanditConfiguration> {
        self.loader.get_bandit(bandit_key)
    }

    /// Returns `true` if any variation of the flag is served by a bandit.
    pub fn is_bandit_flag(&self, flag_key: &str) -> bool {
        self.loader.is_bandit_flag(flag_key)
    }

    /// Key of the bandit serving `variation_value` of `flag_key`, if any.
    pub fn get_bandit_by_variation(&self, flag_key: &str, variation_value: &str) -> Option<String> {
        self.loader.get_bandit_by_variation(flag_key, variation_value)
    }

    /// Currently active configuration snapshot.
    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.loader.configuration()
    }

    /// Fetch configuration if it's missing or older than the configured max age.
    pub fn reload_if_expired(&self) -> Result<()> {
        self.loader.reload_if_expired()
    }

    /// Serve configuration from the persistent cache until the first fetch completes.
    ///
    /// Returns `Ok(true)` if a cached configuration was restored.
    pub fn load_from_cache(&self) -> Result<bool> {
        self.loader.load_from_cache()
    }

    /// Start a poller thread to fetch configuration from the server.
    pub fn start_poller_thread(&self) -> Result<PollerThread> {
        PollerThread::start(self.loader.clone(), self.poller)
    }
}
