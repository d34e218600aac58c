use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ufc::VariationType;

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the decision core.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A single evaluation failed.
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    /// Loaded configuration failed an integrity check. The previous snapshot is retained.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Configuration could not be fetched.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

/// Errors that abort a single evaluation call. They never affect the active configuration or
/// other concurrent evaluations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EvaluationError {
    /// Subject key is empty or whitespace.
    #[error("subject key must not be blank")]
    BlankSubjectKey,

    /// Bandit evaluation was requested with no actions to choose from.
    #[error("no actions supplied for bandit evaluation")]
    NoActionsSupplied,

    /// Cumulative action weights never covered the selection position.
    #[error("unable to select an action (cumulative weight {cumulative_weight} <= position {position})")]
    ActionSelectionFailed {
        /// Sum of all action weights.
        cumulative_weight: f64,
        /// Position drawn for the subject.
        position: f64,
    },

    /// Requested flag has a different type.
    #[error("invalid flag type (expected: {expected:?}, found: {found:?})")]
    TypeMismatch {
        /// Expected type of the flag.
        expected: VariationType,
        /// Actual type of the flag.
        found: VariationType,
    },

    /// Flag configuration could not be parsed. Other flags are still usable.
    #[error("error parsing configuration for the flag")]
    UnexpectedConfigurationParseError,

    /// Flag configuration is internally inconsistent (e.g., split references unknown variation).
    #[error("configuration error, flag is misconfigured")]
    UnexpectedConfigurationError,
}

/// Integrity violations detected while building a configuration snapshot.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// The same flag variation routes to two different bandits.
    #[error("flag {flag_key:?} variation {variation_value:?} maps to both {existing:?} and {conflicting:?} bandits")]
    AmbiguousBanditVariation {
        #[allow(missing_docs)]
        flag_key: String,
        #[allow(missing_docs)]
        variation_value: String,
        /// Bandit key already registered for the pair.
        existing: String,
        /// Bandit key that tried to claim the same pair.
        conflicting: String,
    },

    /// Bandit model parameters are out of range or non-finite.
    #[error("bandit {bandit_key:?} has malformed model: {reason}")]
    MalformedBanditModel {
        #[allow(missing_docs)]
        bandit_key: String,
        #[allow(missing_docs)]
        reason: String,
    },

    /// Flags reference bandits but the bandit models are absent.
    #[error("flag configuration references bandits but no bandit models were loaded")]
    MissingBanditModels,
}

/// Failure reported by a [`ConfigurationFetcher`](crate::configuration_fetcher::ConfigurationFetcher).
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("transport error (status: {status:?}): {message}")]
pub struct TransportError {
    /// HTTP status code, if the server responded at all.
    pub status: Option<u16>,
    /// Human-readable description.
    pub message: String,
}

impl TransportError {
    /// Failure with an HTTP status attached.
    pub fn from_status(status: u16, message: impl Into<String>) -> TransportError {
        TransportError {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Failure without a response (connection refused, timeout, DNS, ...).
    pub fn network(message: impl Into<String>) -> TransportError {
        TransportError {
            status: None,
            message: message.into(),
        }
    }

    /// Returns `true` if retrying later may succeed.
    ///
    /// 408, 409, and all 5xx are recoverable, as are failures without a status. All other 4xx
    /// are not.
    pub fn is_recoverable(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => is_recoverable_status(status),
        }
    }

    /// Returns `true` for 401 responses.
    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }
}

/// Classify an HTTP status code.
pub fn is_recoverable_status(status: u16) -> bool {
    match status {
        408 | 409 => true,
        400..=499 => false,
        _ => true,
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        TransportError {
            status: value.status().map(|s| s.as_u16()),
            message: value.without_url().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{is_recoverable_status, TransportError};

    #[test]
    fn classifies_status_codes() {
        assert!(is_recoverable_status(408));
        assert!(is_recoverable_status(409));
        assert!(is_recoverable_status(500));
        assert!(is_recoverable_status(503));
        assert!(is_recoverable_status(599));

        assert!(!is_recoverable_status(400));
        assert!(!is_recoverable_status(401));
        assert!(!is_recoverable_status(403));
        assert!(!is_recoverable_status(404));
        assert!(!is_recoverable_status(429));
    }

    #[test]
    fn network_failures_are_recoverable() {
        assert!(TransportError::network("connection reset").is_recoverable());
    }

    #[test]
    fn unauthorized_is_not_recoverable() {
        let err = TransportError::from_status(401, "unauthorized");
        assert!(err.is_unauthorized());
        assert!(!err.is_recoverable());
    }
}
