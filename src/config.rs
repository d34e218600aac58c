use std::{sync::Arc, time::Duration};

use crate::{
    assignment_logger::NoopAssignmentLogger,
    configuration_cache::{ConfigurationCache, InMemoryConfigurationCache},
    configuration_fetcher::ConfigurationFetcher,
    poller::PollerThreadConfig,
    AssignmentLogger, Client, Result,
};

/// Configuration for [`Client`].
pub struct ClientConfig<'a> {
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) max_age: Duration,
    pub(crate) cache: Arc<dyn ConfigurationCache>,
    pub(crate) fetcher: Option<Box<dyn ConfigurationFetcher>>,
    pub(crate) assignment_logger: Box<dyn AssignmentLogger + Send + Sync + 'a>,
    pub(crate) poller: PollerThreadConfig,
}

impl<'a> ClientConfig<'a> {
    /// Create a default configuration using the specified API key.
    ///
    /// ```
    /// # use decision_core::ClientConfig;
    /// ClientConfig::from_api_key("api-key");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            max_age: ClientConfig::DEFAULT_MAX_AGE,
            cache: Arc::new(InMemoryConfigurationCache::new()),
            fetcher: None,
            assignment_logger: Box::new(NoopAssignmentLogger),
            poller: PollerThreadConfig::default(),
        }
    }

    /// Set assignment logger to pass variation assignments to your data warehouse.
    ///
    /// ```
    /// # use decision_core::ClientConfig;
    /// let mut config = ClientConfig::from_api_key("api-key");
    /// config.assignment_logger(|event| {
    ///   println!("{:?}", event);
    /// });
    /// ```
    pub fn assignment_logger(
        &mut self,
        assignment_logger: impl AssignmentLogger + Send + Sync + 'a,
    ) -> &mut Self {
        self.assignment_logger = Box::new(assignment_logger);
        self
    }

    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://fscdn.eppo.cloud/api";

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(&mut self, base_url: impl Into<String>) -> &mut Self {
        self.base_url = base_url.into();
        self
    }

    /// Default age after which configuration is considered stale.
    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30);

    /// Age after which configuration is considered stale and refreshed on the next read.
    pub fn max_age(&mut self, max_age: Duration) -> &mut Self {
        self.max_age = max_age;
        self
    }

    /// Persist configuration in `cache` so that a restarted process can serve it before the
    /// first fetch completes.
    pub fn cache(&mut self, cache: impl ConfigurationCache + 'static) -> &mut Self {
        self.cache = Arc::new(cache);
        self
    }

    /// Replace the HTTP transport, e.g. to route requests through a proxy layer of your own.
    pub fn configuration_fetcher(
        &mut self,
        fetcher: impl ConfigurationFetcher + 'static,
    ) -> &mut Self {
        self.fetcher = Some(Box::new(fetcher));
        self
    }

    /// Delay between refreshes of the poller thread.
    pub fn poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poller.interval = interval;
        self
    }

    /// Maximum random amount subtracted from the poll interval.
    pub fn poll_jitter(&mut self, jitter: Duration) -> &mut Self {
        self.poller.jitter = jitter;
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// Fails if the base URL is invalid.
    ///
    /// ```
    /// # use decision_core::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_api_key("api-key").to_client().unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client<'a>> {
        Client::new(self)
    }
}
