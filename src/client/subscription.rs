//! Consumer-side delivery: the record sink interface and the subscription
//! handle.
//!
//! # Overview
//!
//! The stream hands events to a [`RecordSink`]; the consumer reads them from
//! a [`Subscription`]. The channel-backed pair shipped here keeps two lanes:
//!
//! - an **ordered lane** (bounded) for [`FeedEvent::Change`],
//!   [`FeedEvent::End`] and [`FeedEvent::Error`]: feed order is preserved
//!   and a full lane is the consumer's "not ready" signal;
//! - a **control lane** (unbounded) for heartbeats and pause/resume/retry
//!   notifications, which must arrive even while the consumer lags.
//!
//! The sink is an interface so tests can observe delivery directly instead
//! of patching stream internals.
//!
//! # Examples
//!
//! ```ignore
//! use changes_stream::{ChangesConfig, ChangesStream, FeedEvent};
//!
//! let (stream, mut subscription) = ChangesStream::spawn(config)?;
//! while let Some(event) = subscription.next().await {
//!     match event {
//!         FeedEvent::Change(change) => println!("{:?}", change.id),
//!         FeedEvent::End => break,
//!         _ => {}
//!     }
//! }
//! ```

use crate::types::FeedEvent;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Outcome of a non-blocking delivery attempt.
#[derive(Debug)]
pub enum Offer {
    /// The consumer took the event.
    Accepted,
    /// The consumer cannot accept more right now; the event is handed back.
    Full(FeedEvent),
    /// The consumer is gone.
    Closed,
}

/// Downstream consumer interface: accepts ordered events, reports readiness.
#[async_trait]
pub trait RecordSink: Send {
    /// Ordered, non-blocking delivery.
    fn try_data(&mut self, event: FeedEvent) -> Offer;

    /// Ordered delivery that waits for the consumer to become ready.
    ///
    /// Returns `false` when the consumer is gone.
    async fn data(&mut self, event: FeedEvent) -> bool;

    /// Out-of-band lifecycle notification; never subject to backpressure.
    ///
    /// Returns `false` when the consumer is gone.
    fn notify(&mut self, event: FeedEvent) -> bool;
}

/// Create a connected sink/subscription pair.
///
/// `capacity` bounds the ordered lane; a consumer lagging by `capacity`
/// events makes `try_data` report [`Offer::Full`].
pub fn channel(capacity: usize) -> (ChannelSink, Subscription) {
    let (data_tx, data_rx) = mpsc::channel(capacity);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    (
        ChannelSink {
            data: data_tx,
            control: control_tx,
        },
        Subscription {
            data: data_rx,
            control: control_rx,
        },
    )
}

/// Channel-backed [`RecordSink`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    data: mpsc::Sender<FeedEvent>,
    control: mpsc::UnboundedSender<FeedEvent>,
}

#[async_trait]
impl RecordSink for ChannelSink {
    fn try_data(&mut self, event: FeedEvent) -> Offer {
        match self.data.try_send(event) {
            Ok(()) => Offer::Accepted,
            Err(mpsc::error::TrySendError::Full(event)) => Offer::Full(event),
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    async fn data(&mut self, event: FeedEvent) -> bool {
        self.data.send(event).await.is_ok()
    }

    fn notify(&mut self, event: FeedEvent) -> bool {
        self.control.send(event).is_ok()
    }
}

/// Consumer handle for a changes stream.
///
/// Yields [`FeedEvent`]s until the stream ends; also usable as a
/// [`futures::Stream`] with `StreamExt` combinators. Dropping the
/// subscription tears the stream down.
///
/// Control notifications are drained preferentially, so a `Pause` arrives
/// promptly even while accepted changes are still queued.
#[derive(Debug)]
pub struct Subscription {
    data: mpsc::Receiver<FeedEvent>,
    control: mpsc::UnboundedReceiver<FeedEvent>,
}

impl Subscription {
    /// Receive the next event.
    ///
    /// `None` means the stream is gone: every event, including any final
    /// [`FeedEvent::End`] or [`FeedEvent::Error`], has been delivered.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        futures::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }
}

impl Stream for Subscription {
    type Item = FeedEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let control_done = match this.control.poll_recv(cx) {
            Poll::Ready(Some(event)) => return Poll::Ready(Some(event)),
            Poll::Ready(None) => true,
            Poll::Pending => false,
        };

        match this.data.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(event)),
            Poll::Ready(None) if control_done => Poll::Ready(None),
            // The driver still holds the control lane; wait on it.
            Poll::Ready(None) => Poll::Pending,
            Poll::Pending => Poll::Pending,
        }
    }
}
