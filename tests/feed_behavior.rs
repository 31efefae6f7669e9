//! End-to-end stream behavior against a scripted transport.
//!
//! These tests inject a `Transport` whose attempts and body chunks follow a
//! script, so connection failures, mid-line chunk splits, silent closes and
//! slow consumers can all be simulated deterministically. Timers run on
//! tokio's paused clock.

use async_trait::async_trait;
use bytes::Bytes;
use changes_stream::client::{FeedBody, Transport};
use changes_stream::protocol::RequestPlan;
use changes_stream::{
    ChangesConfig, ChangesError, ChangesStream, ConnectionState, FeedEvent, Filter, Heartbeat,
    ReconnectPolicy, Seq, Subscription,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One step of a scripted response body.
enum Step {
    /// Deliver these bytes as one chunk.
    Chunk(Vec<u8>),
    /// Fail the connection mid-body.
    Fail(&'static str),
    /// Keep the connection open without delivering anything.
    Hang,
}

/// One scripted connection attempt.
enum Attempt {
    /// The request succeeds and the body follows the script. A body whose
    /// script runs out ends gracefully.
    Serve(Vec<Step>),
    /// The request fails outright.
    Reject(ChangesError),
    /// The request never completes.
    Stall,
}

struct ScriptedTransport {
    attempts: Mutex<VecDeque<Attempt>>,
    plans: Mutex<Vec<RequestPlan>>,
}

impl ScriptedTransport {
    fn new(attempts: Vec<Attempt>) -> Arc<Self> {
        Arc::new(ScriptedTransport {
            attempts: Mutex::new(attempts.into()),
            plans: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.plans.lock().len()
    }

    fn since_of(&self, request: usize) -> Value {
        self.plans.lock()[request]
            .snapshot
            .get("since")
            .cloned()
            .expect("request carries a since parameter")
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, plan: &RequestPlan) -> changes_stream::Result<Box<dyn FeedBody>> {
        self.plans.lock().push(plan.clone());
        let attempt = self.attempts.lock().pop_front();
        match attempt {
            Some(Attempt::Serve(steps)) => Ok(Box::new(ScriptedBody {
                steps: steps.into(),
            })),
            Some(Attempt::Reject(err)) => Err(err),
            Some(Attempt::Stall) | None => futures::future::pending().await,
        }
    }
}

struct ScriptedBody {
    steps: VecDeque<Step>,
}

#[async_trait]
impl FeedBody for ScriptedBody {
    async fn chunk(&mut self) -> changes_stream::Result<Option<Bytes>> {
        match self.steps.pop_front() {
            Some(Step::Chunk(bytes)) => Ok(Some(Bytes::from(bytes))),
            Some(Step::Fail(msg)) => Err(ChangesError::Transport(msg.to_string())),
            Some(Step::Hang) => futures::future::pending().await,
            None => Ok(None),
        }
    }
}

fn record(seq: u64, id: &str) -> Vec<u8> {
    format!("{{\"seq\":{seq},\"id\":\"{id}\"}}\n").into_bytes()
}

/// A config whose timers are all short enough for paused-clock tests.
fn config() -> ChangesConfig {
    ChangesConfig {
        heartbeat: Heartbeat::Interval(Duration::from_millis(10)),
        inactivity: Duration::from_secs(60),
        reconnect: ReconnectPolicy {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            retries: 3,
        },
        ..ChangesConfig::new("http://127.0.0.1:5984/db")
    }
}

fn spawn(
    attempts: Vec<Attempt>,
    config: ChangesConfig,
) -> (Arc<ScriptedTransport>, ChangesStream, Subscription) {
    let transport = ScriptedTransport::new(attempts);
    let (stream, subscription) =
        ChangesStream::with_transport(config, transport.clone()).expect("spawn");
    (transport, stream, subscription)
}

/// Wait (on the paused clock) until the transport has seen `count` requests.
async fn await_requests(transport: &ScriptedTransport, count: usize) {
    while transport.request_count() < count {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn seq_of(event: &FeedEvent) -> Option<Seq> {
    match event {
        FeedEvent::Change(c) => c.seq.clone().or_else(|| c.last_seq.clone()),
        _ => None,
    }
}

#[tokio::test(start_paused = true)]
async fn chunking_invariance_across_writes() {
    let (_, stream, mut subscription) = spawn(
        vec![Attempt::Serve(vec![
            Step::Chunk(b"{\"seq\":1,\"id\":\"a\"}\n{\"seq\":2,\"i".to_vec()),
            Step::Chunk(b"d\":\"b\"}\n".to_vec()),
            Step::Hang,
        ])],
        config(),
    );

    match subscription.next().await {
        Some(FeedEvent::Change(c)) => {
            assert_eq!(c.seq, Some(Seq::Number(1)));
            assert_eq!(c.id.as_deref(), Some("a"));
        }
        other => panic!("unexpected {other:?}"),
    }
    match subscription.next().await {
        Some(FeedEvent::Change(c)) => {
            assert_eq!(c.seq, Some(Seq::Number(2)));
            assert_eq!(c.id.as_deref(), Some("b"));
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(stream.seq(), Seq::Number(2));
    stream.destroy();
}

/// Collect `count` events; change delivery and lifecycle notifications ride
/// separate lanes, so relative order between them is not asserted.
async fn collect(subscription: &mut Subscription, count: usize) -> Vec<FeedEvent> {
    let mut events = Vec::new();
    while events.len() < count {
        match subscription.next().await {
            Some(event) => events.push(event),
            None => break,
        }
    }
    events
}

#[tokio::test(start_paused = true)]
async fn reconnection_preserves_position() {
    let (transport, stream, mut subscription) = spawn(
        vec![
            Attempt::Serve(vec![Step::Chunk(record(5, "a")), Step::Fail("reset")]),
            Attempt::Serve(vec![Step::Hang]),
        ],
        config(),
    );

    let events = collect(&mut subscription, 2).await;
    assert!(events
        .iter()
        .any(|e| seq_of(e) == Some(Seq::Number(5))));
    assert!(events
        .iter()
        .any(|e| matches!(e, FeedEvent::Retry { attempt: 1, .. })));

    await_requests(&transport, 2).await;
    assert_eq!(transport.since_of(0), Value::from(0u64));
    assert_eq!(transport.since_of(1), Value::from(5u64));
    stream.destroy();
}

#[tokio::test(start_paused = true)]
async fn retry_budget_exhaustion_surfaces_one_fatal_error() {
    let reject = || Attempt::Reject(ChangesError::Transport("connection refused".to_string()));
    let (transport, stream, mut subscription) = spawn(
        vec![reject(), reject(), reject(), reject()],
        config(),
    );

    let mut retries = Vec::new();
    let mut errors = 0;
    while let Some(event) = subscription.next().await {
        match event {
            FeedEvent::Retry { attempt, delay } => retries.push((attempt, delay)),
            FeedEvent::Error(err) => {
                errors += 1;
                match err {
                    ChangesError::RetriesExhausted { attempts, last } => {
                        assert_eq!(attempts, 3);
                        assert!(matches!(*last, ChangesError::Transport(_)));
                    }
                    other => panic!("unexpected error {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    assert_eq!(errors, 1);
    assert_eq!(
        retries.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    // Delays respect the patched policy bounds: the floor is the heartbeat
    // interval plus the fixed grace, the span above it is preserved.
    let floor = Duration::from_millis(5_010);
    let ceiling = Duration::from_millis(5_910);
    for (_, delay) in &retries {
        assert!(*delay >= floor, "{delay:?}");
        assert!(*delay <= ceiling, "{delay:?}");
    }
    // Initial request plus one per retry, and nothing after the budget.
    assert_eq!(transport.request_count(), 4);
    assert_eq!(stream.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn terminal_marker_ends_the_stream_once() {
    let (transport, stream, mut subscription) = spawn(
        vec![Attempt::Serve(vec![Step::Chunk(
            b"{\"last_seq\":42}\n".to_vec(),
        )])],
        config(),
    );

    let mut events = Vec::new();
    while let Some(event) = subscription.next().await {
        events.push(event);
    }

    assert_eq!(events.len(), 2);
    assert_eq!(seq_of(&events[0]), Some(Seq::Number(42)));
    assert!(matches!(events[1], FeedEvent::End));

    stream.closed().await;
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn terminal_state_is_destroyed_and_cursor_final() {
    let (_, stream, mut subscription) = spawn(
        vec![Attempt::Serve(vec![Step::Chunk(
            b"{\"last_seq\":42}\n".to_vec(),
        )])],
        config(),
    );

    while subscription.next().await.is_some() {}
    assert_eq!(stream.state(), ConnectionState::Destroyed);
    assert_eq!(stream.seq(), Seq::Number(42));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_notifies_without_moving_the_cursor() {
    let (_, stream, mut subscription) = spawn(
        vec![Attempt::Serve(vec![
            Step::Chunk(record(1, "a")),
            Step::Chunk(b"\n".to_vec()),
            Step::Hang,
        ])],
        config(),
    );

    let events = collect(&mut subscription, 2).await;
    assert!(events.iter().any(|e| seq_of(e) == Some(Seq::Number(1))));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, FeedEvent::Heartbeat))
            .count(),
        1
    );
    assert_eq!(stream.seq(), Seq::Number(1));
    stream.destroy();
}

#[tokio::test(start_paused = true)]
async fn malformed_lines_are_dropped_silently() {
    let (_, stream, mut subscription) = spawn(
        vec![Attempt::Serve(vec![
            Step::Chunk(b"{\"seq\":1,\"id\":\"a\"}\nnot json at all\n{\"seq\":2,\"id\":\"b\"}\n".to_vec()),
            Step::Hang,
        ])],
        config(),
    );

    let first = subscription.next().await;
    let second = subscription.next().await;
    assert_eq!(first.as_ref().and_then(seq_of), Some(Seq::Number(1)));
    assert_eq!(second.as_ref().and_then(seq_of), Some(Seq::Number(2)));
    assert_eq!(stream.seq(), Seq::Number(2));
    stream.destroy();
}

#[tokio::test(start_paused = true)]
async fn backpressure_pauses_and_resumes_without_loss() {
    let mut body = Vec::new();
    body.extend(record(1, "a"));
    body.extend(record(2, "b"));
    body.extend(record(3, "c"));

    let (_, stream, mut subscription) = spawn(
        vec![Attempt::Serve(vec![Step::Chunk(body), Step::Hang])],
        ChangesConfig {
            high_water_mark: 1,
            ..config()
        },
    );

    // Let the driver run into the full delivery lane before reading.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut changes = Vec::new();
    let mut pauses = 0;
    let mut resumes = 0;
    let mut first_kind = None;
    while changes.len() < 3 {
        match subscription.next().await {
            Some(FeedEvent::Change(c)) => {
                first_kind.get_or_insert("change");
                changes.push(c.seq.clone().unwrap());
            }
            Some(FeedEvent::Pause) => {
                first_kind.get_or_insert("pause");
                pauses += 1;
            }
            Some(FeedEvent::Resume) => resumes += 1,
            other => panic!("unexpected {other:?}"),
        }
    }

    // The stall was announced before any queued record was taken, and
    // delivery resumed with nothing duplicated or skipped.
    assert_eq!(first_kind, Some("pause"));
    assert!(pauses >= 1);
    assert_eq!(pauses, resumes);
    assert_eq!(
        changes,
        vec![Seq::Number(1), Seq::Number(2), Seq::Number(3)]
    );
    stream.destroy();
}

#[tokio::test(start_paused = true)]
async fn client_filter_drops_records_but_advances_the_cursor() {
    let filter: changes_stream::FilterFn =
        Arc::new(|doc, _query| doc["keep"] == Value::Bool(true));

    let (transport, stream, mut subscription) = spawn(
        vec![Attempt::Serve(vec![
            Step::Chunk(b"{\"seq\":1,\"id\":\"a\",\"doc\":{\"keep\":true}}\n".to_vec()),
            Step::Chunk(b"{\"seq\":2,\"id\":\"b\",\"doc\":{\"keep\":false}}\n".to_vec()),
            Step::Hang,
        ])],
        ChangesConfig {
            filter: Filter::Func(filter),
            ..config()
        },
    );

    // The filter needs documents, so the query asks for them.
    await_requests(&transport, 1).await;
    assert_eq!(
        transport.plans.lock()[0].snapshot.get("include_docs"),
        Some(&Value::Bool(true))
    );

    assert_eq!(
        subscription.next().await.as_ref().and_then(seq_of),
        Some(Seq::Number(1))
    );

    // The dropped record never arrives, but the cursor has moved past it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stream.seq(), Seq::Number(2));
    stream.destroy();
}

#[tokio::test(start_paused = true)]
async fn graceful_close_is_a_recoverable_failure() {
    let (transport, stream, mut subscription) = spawn(
        vec![
            Attempt::Serve(vec![Step::Chunk(record(1, "a"))]),
            Attempt::Serve(vec![Step::Hang]),
        ],
        config(),
    );

    let events = collect(&mut subscription, 2).await;
    assert!(events.iter().any(|e| seq_of(e) == Some(Seq::Number(1))));
    assert!(events
        .iter()
        .any(|e| matches!(e, FeedEvent::Retry { .. })));

    await_requests(&transport, 2).await;
    assert_eq!(transport.since_of(1), Value::from(1u64));
    stream.destroy();
}

#[tokio::test(start_paused = true)]
async fn partial_line_is_flushed_through_on_retry() {
    let (transport, stream, mut subscription) = spawn(
        vec![
            Attempt::Serve(vec![
                Step::Chunk(b"{\"seq\":7,\"id\":\"g\"}".to_vec()),
                Step::Fail("reset"),
            ]),
            Attempt::Serve(vec![Step::Hang]),
        ],
        config(),
    );

    // The record arrived without its newline, but it parses on its own and
    // is forwarded during cleanup.
    let events = collect(&mut subscription, 2).await;
    assert!(events.iter().any(|e| seq_of(e) == Some(Seq::Number(7))));
    assert!(events
        .iter()
        .any(|e| matches!(e, FeedEvent::Retry { .. })));

    await_requests(&transport, 2).await;
    assert_eq!(transport.since_of(1), Value::from(7u64));
    stream.destroy();
}

#[tokio::test(start_paused = true)]
async fn request_timeout_triggers_a_retry() {
    let (transport, stream, mut subscription) = spawn(
        vec![Attempt::Stall, Attempt::Serve(vec![Step::Hang])],
        config(),
    );

    assert!(matches!(
        subscription.next().await,
        Some(FeedEvent::Retry { .. })
    ));
    await_requests(&transport, 2).await;
    stream.destroy();
}

#[tokio::test(start_paused = true)]
async fn inactivity_triggers_a_retry() {
    let (transport, stream, mut subscription) = spawn(
        vec![
            Attempt::Serve(vec![Step::Chunk(record(1, "a")), Step::Hang]),
            Attempt::Serve(vec![Step::Hang]),
        ],
        config(),
    );

    assert!(matches!(
        subscription.next().await,
        Some(FeedEvent::Change(_))
    ));
    // Nothing more comes down the feed; the inactivity window elapses on
    // the paused clock and the connection is replaced.
    assert!(matches!(
        subscription.next().await,
        Some(FeedEvent::Retry { .. })
    ));
    await_requests(&transport, 2).await;
    assert_eq!(transport.since_of(1), Value::from(1u64));
    stream.destroy();
}

#[tokio::test(start_paused = true)]
async fn status_errors_are_retried() {
    let (transport, stream, mut subscription) = spawn(
        vec![
            Attempt::Reject(ChangesError::Status { code: 503 }),
            Attempt::Serve(vec![Step::Chunk(record(1, "a")), Step::Hang]),
        ],
        config(),
    );

    assert!(matches!(
        subscription.next().await,
        Some(FeedEvent::Retry { .. })
    ));
    assert!(matches!(
        subscription.next().await,
        Some(FeedEvent::Change(_))
    ));
    assert_eq!(transport.request_count(), 2);
    stream.destroy();
}

#[tokio::test(start_paused = true)]
async fn destroy_is_idempotent_and_safe_from_the_event_loop() {
    let (transport, stream, mut subscription) = spawn(
        vec![Attempt::Serve(vec![Step::Chunk(record(1, "a")), Step::Hang])],
        config(),
    );

    while let Some(event) = subscription.next().await {
        match event {
            FeedEvent::Change(_) => {
                // Destroy from inside the delivery loop, twice.
                stream.destroy();
                stream.destroy();
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // The channels closing is the teardown signal; no spurious events.
    assert!(stream.is_destroyed());
    assert_eq!(stream.state(), ConnectionState::Destroyed);
    assert_eq!(transport.request_count(), 1);
    stream.closed().await;
}

#[tokio::test(start_paused = true)]
async fn dropping_the_subscription_stops_the_stream() {
    let (_, stream, subscription) = spawn(
        vec![Attempt::Serve(vec![
            Step::Chunk(record(1, "a")),
            Step::Chunk(record(2, "b")),
            Step::Hang,
        ])],
        ChangesConfig {
            high_water_mark: 1,
            ..config()
        },
    );

    drop(subscription);
    stream.closed().await;
}
