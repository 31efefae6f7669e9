//! Wire-level request building for the `_changes` endpoint.
//!
//! Before every attempt the stream derives an immutable [`QuerySnapshot`]
//! from its configuration and current cursor, then turns it into a
//! [`RequestPlan`]: the method, URL and optional body of exactly one HTTP
//! request. Nothing a request observes is shared with the next attempt.
//!
//! # Request Shapes
//!
//! | Configuration | Method | Query string | Body |
//! |---------------|--------|--------------|------|
//! | default | GET | parameter set | none |
//! | `_doc_ids` filter | POST | parameter set | JSON id list |
//! | `use_post` | POST | none | JSON parameter set |
//!
//! Body-bearing requests carry `content-type: application/json`; every
//! request carries `accept: application/json`.

use crate::config::ResolvedConfig;
use crate::types::Seq;
use serde_json::{Map, Value};
use url::Url;

/// HTTP method of a feed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Parameter-only request.
    Get,
    /// Body-bearing request.
    Post,
}

/// Immutable per-attempt snapshot of the recognized feed parameters.
///
/// Only recognized, set, non-false parameters appear. A client-side filter
/// closure is not a server concern and never appears here.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    params: Map<String, Value>,
}

impl QuerySnapshot {
    pub(crate) fn build(config: &ResolvedConfig, since: &Seq) -> Self {
        let mut params = Map::new();

        // Passthrough extras first; recognized parameters override them.
        for (key, value) in &config.query_params {
            params.insert(key.clone(), Value::from(value.as_str()));
        }

        if let Some(heartbeat) = config.heartbeat {
            params.insert(
                "heartbeat".to_string(),
                Value::from(heartbeat.as_millis() as u64),
            );
        }
        params.insert("feed".to_string(), Value::from(config.feed.as_str()));
        if let Some(name) = &config.filter_name {
            params.insert("filter".to_string(), Value::from(name.as_str()));
        }
        if config.include_docs {
            params.insert("include_docs".to_string(), Value::Bool(true));
        }
        if let Some(view) = &config.view {
            params.insert("view".to_string(), Value::from(view.as_str()));
        }
        params.insert("style".to_string(), Value::from(config.style.as_str()));
        params.insert("since".to_string(), since.to_value());
        if let Some(timeout) = config.timeout {
            params.insert("timeout".to_string(), Value::from(timeout));
        }
        if let Some(limit) = config.limit {
            params.insert("limit".to_string(), Value::from(limit));
        }

        QuerySnapshot { params }
    }

    /// The parameter set as a JSON object.
    ///
    /// This is the POST body in `use_post` mode and the query argument
    /// handed to client-side filter closures.
    pub fn to_value(&self) -> Value {
        Value::Object(self.params.clone())
    }

    /// Query-string pairs, with JSON values rendered to their string form.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, String)> {
        self.params.iter().map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.as_str(), rendered)
        })
    }

    /// Look up a parameter by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

/// Everything needed to issue one `_changes` request.
#[derive(Debug, Clone)]
pub struct RequestPlan {
    /// HTTP method.
    pub method: Method,
    /// Full request URL, query string included for parameter-only requests.
    pub url: Url,
    /// JSON body for body-bearing requests.
    pub body: Option<String>,
    /// The parameter snapshot this plan was derived from.
    pub snapshot: QuerySnapshot,
}

impl RequestPlan {
    pub(crate) fn build(config: &ResolvedConfig, since: &Seq) -> Self {
        let snapshot = QuerySnapshot::build(config, since);

        let mut url = config.changes_url.clone();
        if !config.use_post {
            let mut query = url.query_pairs_mut();
            for (key, value) in snapshot.pairs() {
                query.append_pair(key, &value);
            }
        }

        let (method, body) = if let Some(ids) = &config.doc_ids {
            (Method::Post, Some(Value::from(ids.clone()).to_string()))
        } else if config.use_post {
            (Method::Post, Some(snapshot.to_value().to_string()))
        } else {
            (Method::Get, None)
        };

        RequestPlan {
            method,
            url,
            body,
            snapshot,
        }
    }
}
