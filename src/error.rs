//! Error types for the dashcache library.

use thiserror::Error;

/// Errors that can occur while installing, activating or serving the cache.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure talking to the network (offline, DNS, timeout).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error in the on-disk store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A precache fetch answered with a non-success status.
    #[error("Unexpected status {status} for {url}")]
    Status {
        /// URL that was fetched.
        url: String,
        /// Status code the server answered with.
        status: u16,
    },

    /// A URL could not be parsed or resolved against the upstream origin.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store backend rejected an operation or holds corrupt data.
    #[error("Store error: {0}")]
    Store(String),

    /// An operation was invoked in the wrong lifecycle state.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Neither the network nor the store could answer the request.
    #[error("No response available for {url}")]
    NoResponse {
        /// URL of the request that went unanswered.
        url: String,
    },
}

/// A specialized `Result` type for dashcache operations.
pub type Result<T> = std::result::Result<T, Error>;
