//! Ordered dispatch of parsed feed items.
//!
//! The dispatcher consumes what the parser produced, advances the cursor,
//! applies the optional client-side filter, and forwards accepted records
//! downstream. It is also the flow-control bridge: when the sink reports
//! the consumer is not ready, the dispatcher holds the one in-flight record
//! and waits. Because the driver only reads the transport through this
//! path, a waiting dispatcher *is* a paused transport; the two can never
//! disagree.

use crate::client::parser::Parsed;
use crate::client::subscription::{Offer, RecordSink};
use crate::config::FilterFn;
use crate::error::ChangesError;
use crate::types::{ChangeRecord, FeedEvent, Seq};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// What the stream should do after dispatching one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// Keep streaming.
    Continue,
    /// Terminal marker forwarded; tear down cleanly.
    Finished,
    /// The consumer is gone; tear down silently.
    Closed,
}

pub(crate) struct Dispatcher {
    sink: Box<dyn RecordSink>,
    cursor: Arc<Mutex<Seq>>,
    filter: Option<FilterFn>,
}

impl Dispatcher {
    pub fn new(
        sink: Box<dyn RecordSink>,
        cursor: Arc<Mutex<Seq>>,
        filter: Option<FilterFn>,
    ) -> Self {
        Dispatcher {
            sink,
            cursor,
            filter,
        }
    }

    /// Dispatch one parsed feed item.
    pub async fn on_parsed(&mut self, parsed: Parsed, query: &Value) -> DispatchOutcome {
        match parsed {
            Parsed::Heartbeat => {
                self.sink.notify(FeedEvent::Heartbeat);
                DispatchOutcome::Continue
            }
            Parsed::Malformed => DispatchOutcome::Continue,
            Parsed::Record(record) => self.on_record(record, query).await,
        }
    }

    async fn on_record(&mut self, record: ChangeRecord, query: &Value) -> DispatchOutcome {
        // Cursor first: a retry must resume from this record even if the
        // filter drops it below.
        if let Some(seq) = record.seq.clone().or_else(|| record.last_seq.clone()) {
            *self.cursor.lock() = seq;
        }

        let terminal = record.is_terminal();

        if !terminal {
            if let Some(filter) = &self.filter {
                // The filter runs against value copies; it cannot observe
                // or mutate stream state through them.
                let doc = record.doc.clone().unwrap_or(Value::Null);
                let query = query.clone();
                if !filter(&doc, &query) {
                    return DispatchOutcome::Continue;
                }
            }
        }

        match self.sink.try_data(FeedEvent::Change(record)) {
            Offer::Accepted => {}
            Offer::Full(event) => {
                // One record rides out the stall; nothing more is read
                // from the transport until the consumer takes it.
                self.sink.notify(FeedEvent::Pause);
                tracing::debug!("consumer lagging, transport reads paused");
                if !self.sink.data(event).await {
                    return DispatchOutcome::Closed;
                }
                self.sink.notify(FeedEvent::Resume);
            }
            Offer::Closed => return DispatchOutcome::Closed,
        }

        if terminal {
            DispatchOutcome::Finished
        } else {
            DispatchOutcome::Continue
        }
    }

    /// Ordered end-of-feed notification, after the terminal marker.
    pub async fn finish(&mut self) {
        let _ = self.sink.data(FeedEvent::End).await;
    }

    /// Surface a fatal error. Called exactly once, on the way to the
    /// terminal error state.
    pub async fn fatal(&mut self, err: ChangesError) {
        let _ = self.sink.data(FeedEvent::Error(err)).await;
    }

    /// Announce a scheduled reconnect.
    pub fn notify_retry(&mut self, attempt: u32, delay: Duration) {
        self.sink.notify(FeedEvent::Retry { attempt, delay });
    }
}
