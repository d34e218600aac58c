//! Transport boundary: fetching raw configuration responses from the server.
use reqwest::{
    header::{ETAG, IF_NONE_MATCH},
    StatusCode, Url,
};

use crate::{Error, Result, SdkMetadata, TransportError};

/// Result of a conditional flags fetch.
///
/// `is_modified == false` with `body == None` signals that the server copy matches the ETag sent.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagsResponse {
    #[allow(missing_docs)]
    pub body: Option<String>,
    #[allow(missing_docs)]
    pub is_modified: bool,
    #[allow(missing_docs)]
    pub e_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct BanditsResponse {
    pub body: String,
    pub e_tag: Option<String>,
}

/// Source of raw configuration responses.
///
/// Any HTTP status >= 400 must be reported as a [`TransportError`] carrying the status, so that
/// the loader can classify it.
pub trait ConfigurationFetcher: Send + Sync {
    /// Fetch flags, sending `last_e_tag` as the cache validator when present.
    fn fetch_flags(&self, last_e_tag: Option<&str>) -> std::result::Result<FlagsResponse, TransportError>;

    /// Fetch bandit models. Only called when flags reference bandits.
    fn fetch_bandits(&self) -> std::result::Result<BanditsResponse, TransportError>;
}

#[allow(missing_docs)]
pub struct HttpConfigurationFetcherConfig {
    pub base_url: String,
    pub api_key: String,
    pub sdk_metadata: SdkMetadata,
}

const UFC_ENDPOINT: &str = "/flag-config/v1/config";
const BANDIT_ENDPOINT: &str = "/flag-config/v1/bandits";

/// A [`ConfigurationFetcher`] that talks to the configuration server over HTTP.
pub struct HttpConfigurationFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    flags_url: Url,
    bandits_url: Url,
}

impl HttpConfigurationFetcher {
    /// Fails with [`Error::InvalidBaseUrl`] if the base URL cannot be parsed.
    pub fn new(config: HttpConfigurationFetcherConfig) -> Result<HttpConfigurationFetcher> {
        let endpoint = |path: &str| {
            Url::parse_with_params(
                &format!("{}{}", config.base_url, path),
                &[
                    ("apiKey", config.api_key.as_str()),
                    ("sdkName", config.sdk_metadata.name),
                    ("sdkVersion", config.sdk_metadata.version),
                ],
            )
            .map_err(Error::InvalidBaseUrl)
        };

        Ok(HttpConfigurationFetcher {
            client: reqwest::blocking::Client::new(),
            flags_url: endpoint(UFC_ENDPOINT)?,
            bandits_url: endpoint(BANDIT_ENDPOINT)?,
        })
    }

    fn get(
        &self,
        url: &Url,
        e_tag: Option<&str>,
    ) -> std::result::Result<reqwest::blocking::Response, TransportError> {
        let mut request = self.client.get(url.clone());
        if let Some(e_tag) = e_tag {
            request = request.header(IF_NONE_MATCH, e_tag);
        }

        let response = request.send()?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            if status == StatusCode::UNAUTHORIZED {
                log::warn!(target: "decision_core", "client is not authorized. Check your API key");
            } else {
                log::warn!(target: "decision_core",
                           status = status.as_u16();
                           "received error response while fetching configuration");
            }
            return Err(TransportError::from_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown status"),
            ));
        }

        Ok(response)
    }
}

fn e_tag_header(response: &reqwest::blocking::Response) -> Option<String> {
    response
        .headers()
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

impl ConfigurationFetcher for HttpConfigurationFetcher {
    fn fetch_flags(&self, last_e_tag: Option<&str>) -> std::result::Result<FlagsResponse, TransportError> {
        log::debug!(target: "decision_core", "fetching flags configuration");
        let response = self.get(&self.flags_url, last_e_tag)?;

        if response.status() == StatusCode::NOT_MODIFIED {
            log::debug!(target: "decision_core", "flags configuration not modified");
            return Ok(FlagsResponse {
                body: None,
                is_modified: false,
                e_tag: e_tag_header(&response).or_else(|| last_e_tag.map(str::to_owned)),
            });
        }

        let e_tag = e_tag_header(&response);
        let body = response.text()?;

        log::debug!(target: "decision_core", "successfully fetched flags configuration");
        Ok(FlagsResponse {
            body: Some(body),
            is_modified: true,
            e_tag,
        })
    }

    fn fetch_bandits(&self) -> std::result::Result<BanditsResponse, TransportError> {
        log::debug!(target: "decision_core", "fetching bandits configuration");
        let response = self.get(&self.bandits_url, None)?;

        let e_tag = e_tag_header(&response);
        let body = response.text()?;

        log::debug!(target: "decision_core", "successfully fetched bandits configuration");
        Ok(BanditsResponse { body, e_tag })
    }
}
