//! The stream driver: connection lifecycle, health timers and the retry
//! state machine.
//!
//! One [`ChangesStream`] follows one feed. All stream state (the cursor,
//! the partial-line buffer, the single active timer) lives inside one
//! spawned driver task; transport bytes, timer expiries and consumer
//! readiness are all awaited from that task, so callbacks are serialized by
//! construction and records reach the consumer in decode order.
//!
//! # Lifecycle
//!
//! ```text
//! idle → requesting → streaming ⇄ retrying → requesting
//!             │            │
//!             └──────┬─────┘
//!                    ▼
//!        destroyed / failed   (absorbing)
//! ```
//!
//! While requesting, the request timer (heartbeat interval + grace) is the
//! only timer armed; once a success response arrives, the inactivity
//! deadline replaces it and every accepted record or heartbeat pushes it
//! out. Exactly one request is outstanding at any time: a retry drops the
//! in-flight body before issuing the next request.
//!
//! # Examples
//!
//! ```ignore
//! use changes_stream::{ChangesConfig, ChangesStream, FeedEvent};
//!
//! let config = ChangesConfig {
//!     include_docs: true,
//!     ..ChangesConfig::new("http://127.0.0.1:5984/registry")
//! };
//! let (stream, mut subscription) = ChangesStream::spawn(config)?;
//!
//! while let Some(event) = subscription.next().await {
//!     if let FeedEvent::Change(change) = event {
//!         println!("{:?}", change.id);
//!     }
//! }
//! ```

use crate::client::backoff::ReconnectAttempt;
use crate::client::decoder::LineDecoder;
use crate::client::dispatch::{DispatchOutcome, Dispatcher};
use crate::client::parser::{self, Parsed};
use crate::client::subscription::{self, Subscription};
use crate::client::transport::{HttpTransport, Transport};
use crate::config::{ChangesConfig, ResolvedConfig};
use crate::error::{ChangesError, Result};
use crate::protocol::{QuerySnapshot, RequestPlan};
use crate::types::Seq;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// Connection lifecycle state, observable through
/// [`ChangesStream::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet started.
    Idle,
    /// A request is in flight; no response accepted yet.
    Requesting,
    /// Response accepted; consuming the feed.
    Streaming,
    /// Sleeping before the next reconnect attempt.
    Retrying,
    /// Torn down: terminal marker, explicit destroy, or consumer gone.
    Destroyed,
    /// Retry budget exhausted; the fatal error has been surfaced.
    Failed,
}

struct Shared {
    cursor: Arc<Mutex<Seq>>,
    state: Mutex<ConnectionState>,
    destroy: watch::Sender<bool>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        // Destroyed and Failed are absorbing.
        if matches!(
            *state,
            ConnectionState::Destroyed | ConnectionState::Failed
        ) {
            return;
        }
        *state = next;
    }
}

/// Handle to a running changes stream.
///
/// Created with [`ChangesStream::spawn`] (or
/// [`ChangesStream::with_transport`] for tests), paired with the
/// [`Subscription`] the consumer reads events from. Dropping the handle
/// does not stop the stream; dropping the subscription, or calling
/// [`destroy`](ChangesStream::destroy), does.
pub struct ChangesStream {
    shared: Arc<Shared>,
    driver: tokio::task::JoinHandle<()>,
}

impl ChangesStream {
    /// Start following the feed over HTTP.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: ChangesConfig) -> Result<(Self, Subscription)> {
        let resolved = config.resolve()?;
        let transport = Arc::new(HttpTransport::new(resolved.request_timeout));
        Self::start(resolved, transport)
    }

    /// Start following the feed through an injected transport.
    pub fn with_transport(
        config: ChangesConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, Subscription)> {
        let resolved = config.resolve()?;
        Self::start(resolved, transport)
    }

    fn start(
        config: ResolvedConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, Subscription)> {
        let (sink, subscription) = subscription::channel(config.high_water_mark);
        let (destroy, destroy_rx) = watch::channel(false);

        let cursor = Arc::new(Mutex::new(config.since.clone()));
        let shared = Arc::new(Shared {
            cursor: cursor.clone(),
            state: Mutex::new(ConnectionState::Idle),
            destroy,
        });

        let dispatcher = Dispatcher::new(Box::new(sink), cursor, config.client_filter.clone());
        let driver = Driver {
            config,
            transport,
            dispatcher,
            decoder: LineDecoder::new(),
            attempt: None,
            shared: shared.clone(),
        };

        let driver = tokio::spawn(driver.run(destroy_rx));
        Ok((ChangesStream { shared, driver }, subscription))
    }

    /// The current feed position: the sequence of the last accepted record.
    pub fn seq(&self) -> Seq {
        self.shared.cursor.lock().clone()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Tear the stream down: cancel timers, abort any in-flight request,
    /// release the decoder.
    ///
    /// Idempotent, and safe to call from any task at any time, including
    /// from inside the consumer's event loop.
    pub fn destroy(&self) {
        let _ = self.shared.destroy.send(true);
    }

    /// Whether the stream has reached an absorbing state.
    pub fn is_destroyed(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Destroyed | ConnectionState::Failed
        )
    }

    /// Wait for the driver task to finish tearing down.
    pub async fn closed(self) {
        let _ = self.driver.await;
    }
}

struct Driver {
    config: ResolvedConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    decoder: LineDecoder,
    attempt: Option<ReconnectAttempt>,
    shared: Arc<Shared>,
}

impl Driver {
    async fn run(mut self, mut destroy: watch::Receiver<bool>) {
        tokio::select! {
            biased;
            _ = destroy.wait_for(|d| *d) => {
                tracing::debug!("destroy requested, tearing down");
            }
            _ = self.drive() => {}
        }
        // Dropping the driver drops the in-flight body, timers and
        // decoder; the closed event channels are the consumer's signal.
        self.shared.set_state(ConnectionState::Destroyed);
    }

    async fn drive(&mut self) {
        loop {
            // ── Requesting ─────────────────────────────────────────────
            self.shared.set_state(ConnectionState::Requesting);
            let since = self.shared.cursor.lock().clone();
            let plan = RequestPlan::build(&self.config, &since);
            let query = plan.snapshot.to_value();
            tracing::debug!(url = %plan.url, "issuing _changes request");

            let opened = tokio::time::timeout(
                self.config.request_window,
                self.transport.open(&plan),
            )
            .await;

            let mut body = match opened {
                Ok(Ok(body)) => {
                    // First success response of the episode clears the
                    // backoff state.
                    self.attempt = None;
                    body
                }
                Ok(Err(err)) => {
                    if self.recover(err).await.is_break() {
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    let err = ChangesError::RequestTimeout {
                        grace: self.config.request_window,
                    };
                    if self.recover(err).await.is_break() {
                        return;
                    }
                    continue;
                }
            };

            // ── Streaming ──────────────────────────────────────────────
            self.shared.set_state(ConnectionState::Streaming);
            let mut deadline = Instant::now() + self.config.inactivity;

            let failure = loop {
                let chunk = tokio::select! {
                    chunk = body.chunk() => chunk,
                    _ = tokio::time::sleep_until(deadline) => {
                        break ChangesError::Inactivity {
                            window: self.config.inactivity,
                        };
                    }
                };

                match chunk {
                    Ok(Some(bytes)) => {
                        for line in self.decoder.feed(&bytes) {
                            let parsed = parser::parse(&line);
                            let activity = !matches!(parsed, Parsed::Malformed);

                            match self.dispatcher.on_parsed(parsed, &query).await {
                                DispatchOutcome::Continue => {}
                                DispatchOutcome::Finished => {
                                    self.dispatcher.finish().await;
                                    self.shared.set_state(ConnectionState::Destroyed);
                                    return;
                                }
                                DispatchOutcome::Closed => {
                                    tracing::debug!("consumer gone, tearing down");
                                    self.shared.set_state(ConnectionState::Destroyed);
                                    return;
                                }
                            }

                            if activity {
                                deadline = Instant::now() + self.config.inactivity;
                            }
                        }
                    }
                    Ok(None) => break ChangesError::RemoteClosed,
                    Err(err) => break err,
                }
            };

            // Abort the in-flight request before anything else happens.
            drop(body);

            if self.recover(failure).await.is_break() {
                return;
            }
        }
    }

    /// Handle a connection failure: flush the partial line, back off, or
    /// give up.
    async fn recover(&mut self, err: ChangesError) -> ControlFlow<()> {
        // A buffered partial line that parses on its own is still a
        // record; forward it before the buffer is discarded.
        if let Some(rest) = self.decoder.flush() {
            tracing::debug!("attempting to parse buffered partial line");
            if let Parsed::Record(record) = parser::parse(&rest) {
                let since = self.shared.cursor.lock().clone();
                let query = QuerySnapshot::build(&self.config, &since).to_value();
                match self
                    .dispatcher
                    .on_parsed(Parsed::Record(record), &query)
                    .await
                {
                    DispatchOutcome::Continue => {}
                    DispatchOutcome::Finished => {
                        self.dispatcher.finish().await;
                        self.shared.set_state(ConnectionState::Destroyed);
                        return ControlFlow::Break(());
                    }
                    DispatchOutcome::Closed => {
                        self.shared.set_state(ConnectionState::Destroyed);
                        return ControlFlow::Break(());
                    }
                }
            }
        }

        if !err.is_retryable() {
            self.fail(err).await;
            return ControlFlow::Break(());
        }

        let policy = self.config.reconnect;
        let seed = self.config.jitter_seed;
        let attempt = self
            .attempt
            .get_or_insert_with(|| ReconnectAttempt::new(policy, seed));

        match attempt.next_delay() {
            Some(delay) => {
                let attempt = attempt.attempts();
                self.shared.set_state(ConnectionState::Retrying);
                tracing::warn!(%err, attempt, ?delay, "feed interrupted, reconnecting");
                self.dispatcher.notify_retry(attempt, delay);
                tokio::time::sleep(delay).await;
                ControlFlow::Continue(())
            }
            None => {
                let attempts = attempt.attempts();
                self.fail(ChangesError::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                })
                .await;
                ControlFlow::Break(())
            }
        }
    }

    /// Surface a fatal error and enter the terminal error state.
    async fn fail(&mut self, err: ChangesError) {
        tracing::warn!(%err, "stream entering terminal error state");
        self.dispatcher.fatal(err).await;
        self.shared.set_state(ConnectionState::Failed);
    }
}
