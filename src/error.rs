//! Error types and result handling for the changes feed client.
//!
//! The taxonomy splits along one axis that matters for the stream's behavior:
//! whether an error is *retryable* (handled internally by the reconnection
//! machinery and never surfaced unless the retry budget runs out) or *fatal*
//! (surfaced to the consumer exactly once, after which the stream is done).
//!
//! Lines that fail to decode as JSON are not errors at all. They are dropped
//! silently by the parser; see [`crate::client::parse`].

use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`ChangesError`].
pub type Result<T> = std::result::Result<T, ChangesError>;

/// Errors produced while following a `_changes` feed.
#[derive(Debug, Error)]
pub enum ChangesError {
    /// Connection-level failure: refused, reset, DNS, TLS.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("received status {code} from couch")]
    Status {
        /// HTTP status code carried by the response.
        code: u16,
    },

    /// No response arrived within the request grace window.
    #[error("no response within {grace:?}")]
    RequestTimeout {
        /// The grace window that elapsed.
        grace: Duration,
    },

    /// Nothing came down the feed within the inactivity window.
    #[error("no activity on the feed within {window:?}")]
    Inactivity {
        /// The inactivity window that elapsed.
        window: Duration,
    },

    /// The response body ended before a terminal marker was seen.
    ///
    /// CouchDB closes the connection like this when it shuts down
    /// gracefully; the condition is synthesized into a retryable error.
    #[error("remote closed the feed before a terminal marker")]
    RemoteClosed,

    /// The reconnect budget is spent. Fatal; surfaced exactly once.
    #[error("giving up after {attempts} reconnect attempts: {last}")]
    RetriesExhausted {
        /// How many reconnect attempts were made.
        attempts: u32,
        /// The failure that ended the final attempt.
        #[source]
        last: Box<ChangesError>,
    },

    /// Configuration could not be resolved into a usable stream.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The database URI did not parse.
    #[error("invalid database URI: {0}")]
    Url(#[from] url::ParseError),
}

impl ChangesError {
    /// Whether the reconnection machinery should absorb this error.
    ///
    /// Retryable errors feed the backoff controller; everything else is
    /// surfaced to the consumer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChangesError::Transport(_)
                | ChangesError::Status { .. }
                | ChangesError::RequestTimeout { .. }
                | ChangesError::Inactivity { .. }
                | ChangesError::RemoteClosed
        )
    }
}
