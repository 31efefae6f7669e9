//! Stream configuration: feed parameters, connection policy and filtering.
//!
//! [`ChangesConfig`] is the full surface a consumer can set. It is resolved
//! once, at spawn time, into an internal normalized form; after that the
//! stream re-derives an immutable query snapshot from it before every
//! request, so nothing a request observes can change mid-attempt.
//!
//! # Examples
//!
//! ```
//! use changes_stream::{ChangesConfig, Heartbeat, ReconnectPolicy, Seq};
//! use std::time::Duration;
//!
//! let config = ChangesConfig {
//!     include_docs: true,
//!     since: Seq::from(7_895_113u64),
//!     heartbeat: Heartbeat::Interval(Duration::from_secs(10)),
//!     reconnect: ReconnectPolicy {
//!         retries: 10,
//!         ..ReconnectPolicy::default()
//!     },
//!     ..ChangesConfig::new("http://127.0.0.1:5984/registry")
//! };
//! # let _ = config;
//! ```

use crate::error::{ChangesError, Result};
use crate::types::Seq;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Heartbeat interval used when the consumer asks for the default.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Fixed grace added on top of the heartbeat interval before a silent
/// connection is declared dead. Also the floor spacing between reconnects,
/// so backoff never fires faster than health-check detection.
pub(crate) const TIMER_GRACE: Duration = Duration::from_secs(5);

/// Server heartbeat setting.
///
/// A number is an explicit interval, a boolean selects the default interval
/// or disables heartbeats entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Heartbeat {
    /// Heartbeats at the default interval (30 s).
    #[default]
    On,
    /// No heartbeats requested from the server.
    Off,
    /// Heartbeats at an explicit interval.
    Interval(Duration),
}

impl Heartbeat {
    /// The requested interval, or `None` when heartbeats are disabled.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Heartbeat::On => Some(DEFAULT_HEARTBEAT),
            Heartbeat::Off => None,
            Heartbeat::Interval(d) => Some(*d),
        }
    }
}

impl From<bool> for Heartbeat {
    fn from(on: bool) -> Self {
        if on {
            Heartbeat::On
        } else {
            Heartbeat::Off
        }
    }
}

impl From<Duration> for Heartbeat {
    fn from(interval: Duration) -> Self {
        Heartbeat::Interval(interval)
    }
}

/// Client-side filter closure.
///
/// Invoked with a deep copy of the change's document and of the query
/// parameters in effect for the current request, so the closure cannot
/// observe or mutate internal stream state. Returning `false` drops the
/// record.
pub type FilterFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// How changes are filtered before delivery.
#[derive(Clone, Default)]
pub enum Filter {
    /// No filtering.
    #[default]
    None,
    /// A server-side filter function by name, e.g. `"app/important"`.
    Name(String),
    /// Restrict the feed to an explicit list of document ids (`_doc_ids`).
    DocIds(Vec<String>),
    /// A client-side filter closure over the full document.
    Func(FilterFn),
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::None => f.write_str("Filter::None"),
            Filter::Name(name) => write!(f, "Filter::Name({name:?})"),
            Filter::DocIds(ids) => write!(f, "Filter::DocIds({} ids)", ids.len()),
            Filter::Func(_) => f.write_str("Filter::Func(..)"),
        }
    }
}

/// Reconnection policy: delay bounds and the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Smallest delay between reconnect attempts.
    pub min_delay: Duration,
    /// Largest delay between reconnect attempts.
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up.
    pub retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            retries: 5,
        }
    }
}

/// Configuration for a [`ChangesStream`](crate::ChangesStream).
///
/// Only `db` is required; construct with [`ChangesConfig::new`] and override
/// fields with struct update syntax.
#[derive(Debug, Clone)]
pub struct ChangesConfig {
    /// Base URI of the database, e.g. `http://127.0.0.1:5984/registry`.
    pub db: String,
    /// Initial feed position.
    pub since: Seq,
    /// Feed mode. Only `"continuous"` makes sense for this client.
    pub feed: String,
    /// Server heartbeat setting.
    pub heartbeat: Heartbeat,
    /// Change style reported by the server.
    pub style: String,
    /// Filtering mode.
    pub filter: Filter,
    /// Ask the server to include full documents in each change.
    pub include_docs: bool,
    /// Server-side view to filter through (`_view` filtering).
    pub view: Option<String>,
    /// Server-side feed timeout in milliseconds.
    pub timeout: Option<u64>,
    /// Maximum number of changes the server should send.
    pub limit: Option<u64>,
    /// Extra query parameters passed through untouched. Recognized feed
    /// parameters take precedence over entries here.
    pub query_params: BTreeMap<String, String>,
    /// Bound on connection establishment.
    pub request_timeout: Duration,
    /// How long the feed may stay silent before the connection is replaced.
    pub inactivity: Duration,
    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
    /// Force POST requests with the parameter set as a JSON body.
    pub use_post: bool,
    /// Capacity of the delivery channel; the consumer lagging by this many
    /// records pauses the stream.
    pub high_water_mark: usize,
}

impl ChangesConfig {
    /// Configuration for `db` with every other field at its default.
    pub fn new(db: impl Into<String>) -> Self {
        ChangesConfig {
            db: db.into(),
            since: Seq::default(),
            feed: "continuous".to_string(),
            heartbeat: Heartbeat::On,
            style: "main_only".to_string(),
            filter: Filter::None,
            include_docs: false,
            view: None,
            timeout: None,
            limit: None,
            query_params: BTreeMap::new(),
            request_timeout: Duration::from_secs(2 * 60),
            inactivity: Duration::from_secs(60 * 60),
            reconnect: ReconnectPolicy::default(),
            use_post: false,
            high_water_mark: 16,
        }
    }

    /// Normalize into the internal form the driver runs on.
    pub(crate) fn resolve(self) -> Result<ResolvedConfig> {
        if self.db.is_empty() {
            return Err(ChangesError::Config("database URI is required".into()));
        }

        let mut db = self.db;
        if !db.ends_with('/') {
            db.push('/');
        }
        let changes_url = Url::parse(&db)?.join("_changes")?;

        let heartbeat = self.heartbeat.interval();
        let detection_window = heartbeat.unwrap_or(DEFAULT_HEARTBEAT) + TIMER_GRACE;

        // Keep reconnects no faster than health-check detection, preserving
        // the configured delay span above the patched floor.
        let span = self
            .reconnect
            .max_delay
            .saturating_sub(self.reconnect.min_delay);
        let min_delay = self.reconnect.min_delay.max(detection_window);
        let max_delay = self.reconnect.max_delay.max(min_delay + span);
        let reconnect = ReconnectPolicy {
            min_delay,
            max_delay,
            retries: self.reconnect.retries,
        };

        let (filter_name, doc_ids, client_filter) = match self.filter {
            Filter::None => (None, None, None),
            Filter::Name(name) => (Some(name), None, None),
            Filter::DocIds(ids) => (Some("_doc_ids".to_string()), Some(ids), None),
            Filter::Func(f) => (None, None, Some(f)),
        };

        // A client-side filter needs the full document to run against.
        let include_docs = self.include_docs || client_filter.is_some();
        // An id list always travels in the request body.
        let use_post = doc_ids.is_none() && self.use_post;

        let mut hasher = DefaultHasher::new();
        db.hash(&mut hasher);

        Ok(ResolvedConfig {
            changes_url,
            since: self.since,
            feed: self.feed,
            heartbeat,
            style: self.style,
            filter_name,
            doc_ids,
            client_filter,
            include_docs,
            view: self.view,
            timeout: self.timeout,
            limit: self.limit,
            query_params: self.query_params,
            request_timeout: self.request_timeout,
            request_window: detection_window,
            inactivity: self.inactivity,
            reconnect,
            use_post,
            high_water_mark: self.high_water_mark.max(1),
            jitter_seed: hasher.finish(),
        })
    }
}

/// Normalized configuration the driver runs on. Immutable for the life of
/// the stream; per-request state is snapshotted from it.
pub(crate) struct ResolvedConfig {
    pub changes_url: Url,
    pub since: Seq,
    pub feed: String,
    pub heartbeat: Option<Duration>,
    pub style: String,
    pub filter_name: Option<String>,
    pub doc_ids: Option<Vec<String>>,
    pub client_filter: Option<FilterFn>,
    pub include_docs: bool,
    pub view: Option<String>,
    pub timeout: Option<u64>,
    pub limit: Option<u64>,
    pub query_params: BTreeMap<String, String>,
    pub request_timeout: Duration,
    /// Grace window for the first response: heartbeat interval + fixed grace.
    pub request_window: Duration,
    pub inactivity: Duration,
    pub reconnect: ReconnectPolicy,
    pub use_post: bool,
    pub high_water_mark: usize,
    pub jitter_seed: u64,
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("changes_url", &self.changes_url)
            .field("since", &self.since)
            .field("feed", &self.feed)
            .field("heartbeat", &self.heartbeat)
            .field("style", &self.style)
            .field("filter_name", &self.filter_name)
            .field("doc_ids", &self.doc_ids)
            .field("client_filter", &self.client_filter.as_ref().map(|_| "<fn>"))
            .field("include_docs", &self.include_docs)
            .field("view", &self.view)
            .field("timeout", &self.timeout)
            .field("limit", &self.limit)
            .field("query_params", &self.query_params)
            .field("request_timeout", &self.request_timeout)
            .field("request_window", &self.request_window)
            .field("inactivity", &self.inactivity)
            .field("reconnect", &self.reconnect)
            .field("use_post", &self.use_post)
            .field("high_water_mark", &self.high_water_mark)
            .field("jitter_seed", &self.jitter_seed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Seq;

    #[test]
    fn db_is_required() {
        let err = ChangesConfig::new("").resolve().unwrap_err();
        assert!(matches!(err, ChangesError::Config(_)));
    }

    #[test]
    fn trailing_slash_is_appended() {
        let resolved = ChangesConfig::new("http://127.0.0.1:5984/db")
            .resolve()
            .unwrap();
        assert_eq!(
            resolved.changes_url.as_str(),
            "http://127.0.0.1:5984/db/_changes"
        );
    }

    #[test]
    fn heartbeat_coercions() {
        assert_eq!(Heartbeat::from(true).interval(), Some(DEFAULT_HEARTBEAT));
        assert_eq!(Heartbeat::from(false).interval(), None);
        assert_eq!(
            Heartbeat::from(Duration::from_secs(10)).interval(),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn reconnect_floor_tracks_heartbeat() {
        let resolved = ChangesConfig::new("http://h/db").resolve().unwrap();
        // Default heartbeat 30s + 5s grace beats the default 100ms floor.
        assert_eq!(resolved.reconnect.min_delay, Duration::from_secs(35));
        // The configured span (29.9s) is preserved above the new floor.
        assert_eq!(
            resolved.reconnect.max_delay,
            Duration::from_secs(35) + Duration::from_millis(29_900)
        );
    }

    #[test]
    fn explicit_short_heartbeat_lowers_the_floor() {
        let config = ChangesConfig {
            heartbeat: Heartbeat::Interval(Duration::from_millis(500)),
            ..ChangesConfig::new("http://h/db")
        };
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.reconnect.min_delay, Duration::from_millis(5_500));
        assert_eq!(resolved.request_window, Duration::from_millis(5_500));
    }

    #[test]
    fn doc_ids_filter_normalizes() {
        let config = ChangesConfig {
            filter: Filter::DocIds(vec!["a".into(), "b".into()]),
            use_post: true,
            ..ChangesConfig::new("http://h/db")
        };
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.filter_name.as_deref(), Some("_doc_ids"));
        assert_eq!(
            resolved.doc_ids,
            Some(vec!["a".to_string(), "b".to_string()])
        );
        // The id list itself is the body; use_post does not stack on top.
        assert!(!resolved.use_post);
    }

    #[test]
    fn client_filter_forces_include_docs() {
        let config = ChangesConfig {
            filter: Filter::Func(Arc::new(|_doc, _query| true)),
            ..ChangesConfig::new("http://h/db")
        };
        let resolved = config.resolve().unwrap();
        assert!(resolved.include_docs);
        assert!(resolved.filter_name.is_none());
        assert!(resolved.client_filter.is_some());
    }

    #[test]
    fn since_carries_through() {
        let config = ChangesConfig {
            since: Seq::from("1-g1AAAA"),
            ..ChangesConfig::new("http://h/db")
        };
        assert_eq!(config.resolve().unwrap().since, Seq::from("1-g1AAAA"));
    }
}
