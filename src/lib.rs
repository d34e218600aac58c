//! `decision_core` evaluates feature flags and contextual bandits against a remotely managed
//! configuration.
//!
//! # Overview
//!
//! [`Configuration`] is an immutable snapshot of everything the server provides: [flag
//! configurations](ufc::UniversalFlagConfig), [bandit models](bandits::BanditResponse), and the
//! [index](bandits::BanditVariationIndex) routing flag variations to bandits. Refreshes replace the
//! snapshot as a whole, so a reader always works with consistent data.
//!
//! [`eval`] contains pure evaluation functions. They take a snapshot and return an assignment
//! (or a bandit action) along with [`events`] to be logged. They perform no I/O.
//!
//! [`ConfigurationLoader`](configuration_loader::ConfigurationLoader) keeps a
//! [`ConfigurationStore`](configuration_store::ConfigurationStore) fresh: it restores the snapshot
//! from a [`ConfigurationCache`](configuration_cache::ConfigurationCache), revalidates it with the
//! server through a [`ConfigurationFetcher`](configuration_fetcher::ConfigurationFetcher) once it
//! is older than the configured max age, and persists every new snapshot.
//!
//! [`Client`] ties these together and passes events to an [`AssignmentLogger`]. It is an explicit
//! context object: there is no global state and several clients can coexist.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! "No matching allocation" is not an error: assignment functions return `Ok(None)` and the caller
//! should use its default value. Errors indicate invalid input (e.g., blank subject key) or
//! configuration problems and usually need developer's attention.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with target `decision_core`
//! and structured key-values. Install a `log`-compatible logger to see them.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod bandits;
pub mod configuration_cache;
pub mod configuration_fetcher;
pub mod configuration_loader;
pub mod configuration_store;
pub mod eval;
pub mod events;
pub mod sharder;
pub mod ufc;

mod assignment_logger;
mod attributes;
mod client;
mod config;
mod configuration;
mod error;
mod poller;
mod sdk_metadata;

pub use assignment_logger::AssignmentLogger;
pub use attributes::{Actions, AttributeValue, Attributes, ContextAttributes};
pub use client::Client;
pub use config::ClientConfig;
pub use configuration::{
    CachedResponse, Configuration, CACHE_DOCUMENT_VERSION, CONFIGURATION_CACHE_KEY,
};
pub use error::{
    is_recoverable_status, ConfigurationError, Error, EvaluationError, Result, TransportError,
};
pub use poller::{PollerThread, PollerThreadConfig};
pub use sdk_metadata::SdkMetadata;
