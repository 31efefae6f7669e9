#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # Following a `_changes` feed
//!
//! CouchDB exposes every database's history as an append-only feed of
//! per-document change notifications. In `continuous` mode the server keeps
//! the HTTP response open indefinitely and writes one JSON object per line
//! as changes happen, with empty heartbeat lines during idle stretches.
//!
//! This crate turns that unbounded, arbitrarily chunked byte stream into an
//! ordered sequence of [`ChangeRecord`]s, and keeps it flowing:
//!
//! 1. **Chunking never matters**: lines are reassembled across any chunk
//!    boundaries, including splits inside multi-byte characters.
//! 2. **Failures never lose position**: transport errors, silent
//!    disconnects and non-success statuses trigger reconnection with
//!    bounded, jittered backoff, resuming from the last seen sequence.
//! 3. **Slow consumers never overflow**: a consumer that stops taking
//!    records pauses transport reads; delivery resumes exactly where it
//!    left off.
//!
//! ## Quick Start
//!
//! ```ignore
//! use changes_stream::{ChangesConfig, ChangesStream, FeedEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ChangesConfig {
//!         include_docs: true,
//!         ..ChangesConfig::new("http://127.0.0.1:5984/registry")
//!     };
//!
//!     let (stream, mut subscription) = ChangesStream::spawn(config)?;
//!
//!     while let Some(event) = subscription.next().await {
//!         match event {
//!             FeedEvent::Change(change) => println!("{:?} {:?}", change.seq, change.id),
//!             FeedEvent::Error(err) => return Err(err.into()),
//!             FeedEvent::End => break,
//!             _ => {}
//!         }
//!     }
//!
//!     stream.destroy();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - **[client]** - the stream driver, transport and sink seams, decoding
//! - **[config]** - feed parameters, connection policy, filtering
//! - **[protocol]** - `_changes` query snapshots and request plans
//! - **[types]** - cursors, change records, consumer events
//! - **[error]** - error taxonomy and retryability

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use client::{ChangesStream, ConnectionState, Subscription};
pub use config::{ChangesConfig, Filter, FilterFn, Heartbeat, ReconnectPolicy};
pub use error::{ChangesError, Result};
pub use types::{ChangeRecord, FeedEvent, Rev, Seq};
