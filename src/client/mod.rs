//! The changes feed client.
//!
//! This module contains everything between the wire and the consumer:
//!
//! - **Decode** arbitrarily chunked bytes into complete feed lines
//! - **Classify** each line as heartbeat, change record or garbage
//! - **Dispatch** accepted records in order, with cursor tracking,
//!   client-side filtering and backpressure
//! - **Reconnect** after failures with bounded, jittered backoff,
//!   resuming from the last seen sequence
//!
//! # Module Organization
//!
//! ```text
//! client/
//! ├── stream       - ChangesStream driver and connection state machine
//! ├── transport    - Transport/FeedBody interfaces and the reqwest impl
//! ├── subscription - RecordSink interface and the consumer Subscription
//! ├── dispatch     - ordered dispatch and the flow-control bridge
//! ├── decoder      - incremental byte-to-line decoding
//! ├── parser       - feed line classification
//! └── backoff      - reconnect scheduling
//! ```
//!
//! # Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ChangesStream`] | Handle to a running feed follower |
//! | [`Subscription`] | Consumer side: ordered feed events |
//! | [`Transport`] | Injectable "deliver bytes, signal end/error" seam |
//! | [`RecordSink`] | Injectable "accept records, report readiness" seam |
//! | [`LineDecoder`] | Chunk-boundary-proof line reassembly |
//! | [`ReconnectAttempt`] | Backoff schedule for one failure episode |

mod backoff;
mod decoder;
mod dispatch;
mod parser;
mod stream;
mod subscription;
mod transport;

pub use backoff::ReconnectAttempt;
pub use decoder::LineDecoder;
pub use parser::{parse, Parsed};
pub use stream::{ChangesStream, ConnectionState};
pub use subscription::{channel, ChannelSink, Offer, RecordSink, Subscription};
pub use transport::{FeedBody, HttpTransport, Transport};
