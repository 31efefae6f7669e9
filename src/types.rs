//! Core feed types: sequence cursors, change records and consumer events.
//!
//! # Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Seq`] | Opaque feed position token (`since`) |
//! | [`ChangeRecord`] | One decoded line of the `_changes` feed |
//! | [`FeedEvent`] | Closed set of notifications delivered to the consumer |

use crate::error::ChangesError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Opaque feed position token.
///
/// CouchDB 1.x hands out integer sequences; 2.x and Cloudant hand out opaque
/// strings such as `"1-g1AAAA..."`. The client never interprets the token, it
/// only carries it back as the `since` parameter on reconnect.
///
/// # Examples
///
/// ```
/// use changes_stream::Seq;
///
/// let numeric = Seq::from(42u64);
/// assert_eq!(numeric.to_string(), "42");
///
/// let opaque = Seq::from("1-g1AAAA");
/// assert_eq!(opaque.to_string(), "1-g1AAAA");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seq {
    /// Integer sequence (CouchDB 1.x).
    Number(u64),
    /// Opaque string sequence (CouchDB 2.x+, Cloudant).
    Text(String),
}

impl Default for Seq {
    fn default() -> Self {
        Seq::Number(0)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seq::Number(n) => write!(f, "{n}"),
            Seq::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for Seq {
    fn from(n: u64) -> Self {
        Seq::Number(n)
    }
}

impl From<&str> for Seq {
    fn from(s: &str) -> Self {
        Seq::Text(s.to_string())
    }
}

impl From<String> for Seq {
    fn from(s: String) -> Self {
        Seq::Text(s)
    }
}

impl Seq {
    /// The JSON value form used in query snapshots and POST bodies.
    pub(crate) fn to_value(&self) -> Value {
        match self {
            Seq::Number(n) => Value::from(*n),
            Seq::Text(s) => Value::from(s.as_str()),
        }
    }
}

/// One revision entry in a change's `changes` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rev {
    /// Revision identifier, e.g. `"1-967a00dff5e02add41819138abb3284d"`.
    pub rev: String,
}

/// A single decoded line of the `_changes` feed.
///
/// Ordinary changes carry `seq`, `id` and `changes`; the terminal marker the
/// server sends before closing a bounded feed carries only `last_seq`. Fields
/// this client does not interpret are preserved in `extra` so consumers see
/// the full object the server sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Position of this change in the feed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<Seq>,

    /// Identifier of the changed document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Revisions touched by this change.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<Rev>,

    /// Full document body, present when `include_docs` is in effect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,

    /// Whether the change is a deletion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    /// Terminal sequence; only set on the feed's closing marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<Seq>,

    /// Changes remaining after this one, when the server reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<i64>,

    /// Fields the client does not interpret, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChangeRecord {
    /// Whether this record is the feed's terminal marker.
    ///
    /// A decode carrying a terminal sequence and no per-record id signals
    /// that the feed has no more changes and the connection will end.
    pub fn is_terminal(&self) -> bool {
        self.last_seq.is_some() && self.id.is_none()
    }
}

/// Notifications delivered to the consumer.
///
/// A closed, tagged set instead of loose string event names: every
/// notification the stream can emit is one of these variants, delivered
/// through a single [`Subscription`](crate::Subscription).
///
/// Ordering: [`Change`](FeedEvent::Change), [`End`](FeedEvent::End) and
/// [`Error`](FeedEvent::Error) are delivered in feed order and participate in
/// backpressure. The lifecycle notifications ([`Heartbeat`](FeedEvent::Heartbeat),
/// [`Pause`](FeedEvent::Pause), [`Resume`](FeedEvent::Resume),
/// [`Retry`](FeedEvent::Retry)) are delivered out of band so they arrive even
/// while the consumer is lagging.
#[derive(Debug)]
pub enum FeedEvent {
    /// An accepted change record, in feed order.
    Change(ChangeRecord),
    /// The server sent an empty keep-alive line.
    Heartbeat,
    /// The consumer fell behind; delivery and transport reads are paused.
    Pause,
    /// The consumer caught up; delivery resumed.
    Resume,
    /// A reconnect was scheduled after a recoverable failure.
    Retry {
        /// 1-based attempt number within the current failure episode.
        attempt: u32,
        /// Delay before the reconnect fires.
        delay: Duration,
    },
    /// Fatal error; the stream is in its terminal error state.
    Error(ChangesError),
    /// The feed ended cleanly after its terminal marker.
    ///
    /// An explicit destroy does not produce an event; the subscription
    /// simply closes.
    End,
}

impl FeedEvent {
    /// Whether this event terminates the stream.
    pub fn is_final(&self) -> bool {
        matches!(self, FeedEvent::Error(_) | FeedEvent::End)
    }
}
