use std::sync::Arc;
use std::time::Duration;

use sentinel_bot::poller::{PollError, PollerConfig, PollerPhase, UpdatePoller};
use sentinel_bot::testing::{RecordingHandler, ScriptedTransport};
use tokio_util::sync::CancellationToken;

fn fast_config() -> PollerConfig {
    PollerConfig {
        poll_timeout: Duration::from_millis(20),
        backoff_base: Duration::from_millis(2),
        backoff_max: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn dispatches_updates_in_order_exactly_once() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_batch(vec![1, 2, 3]).await;
    transport.push_batch(vec![4, 5]).await;
    let handler = Arc::new(RecordingHandler::new());

    let shutdown = CancellationToken::new();
    let (poller, _status) = UpdatePoller::new(
        transport.clone(),
        handler.clone(),
        fast_config(),
        shutdown.clone(),
    );
    let task = tokio::spawn(poller.run());

    assert!(
        handler.wait_for_count(5, Duration::from_secs(2)).await,
        "not all updates dispatched in time"
    );
    shutdown.cancel();
    let result = task.await.expect("poller task panicked");
    assert!(result.is_ok(), "graceful stop must not report an error");

    assert_eq!(handler.seen().await, vec![1, 2, 3, 4, 5]);

    let offsets = transport.seen_offsets().await;
    assert_eq!(offsets[0], None, "first fetch must not carry an offset");
    assert_eq!(
        offsets[1],
        Some(4),
        "second fetch must acknowledge past the first batch"
    );
}

#[tokio::test]
async fn handler_failure_does_not_block_next_update() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_batch(vec![10, 11, 12]).await;
    let handler = Arc::new(RecordingHandler::failing_on(11));

    let shutdown = CancellationToken::new();
    let (poller, _status) = UpdatePoller::new(
        transport.clone(),
        handler.clone(),
        fast_config(),
        shutdown.clone(),
    );
    let task = tokio::spawn(poller.run());

    assert!(
        handler.wait_for_count(3, Duration::from_secs(2)).await,
        "updates after the failing one were not dispatched"
    );
    shutdown.cancel();
    let result = task.await.expect("poller task panicked");
    assert!(result.is_ok());

    assert_eq!(handler.seen().await, vec![10, 11, 12]);

    // The crashed update is acknowledged too, not redelivered.
    let offsets = transport.seen_offsets().await;
    assert_eq!(offsets[1], Some(13));
}

#[tokio::test]
async fn transient_fetch_failures_recover_without_fatal() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_batch(vec![1]).await;
    transport
        .push_error(PollError::Transient("connection reset".into()))
        .await;
    transport
        .push_error(PollError::Transient("timed out".into()))
        .await;
    transport.push_batch(vec![2]).await;
    let handler = Arc::new(RecordingHandler::new());

    let shutdown = CancellationToken::new();
    let (poller, mut status) = UpdatePoller::new(
        transport.clone(),
        handler.clone(),
        fast_config(),
        shutdown.clone(),
    );
    let task = tokio::spawn(poller.run());

    // The poller must pass through Degraded while fetches fail.
    let degraded = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if status.borrow().phase == PollerPhase::Degraded {
                return true;
            }
            if status.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(degraded, "Degraded phase was never observed");

    assert!(
        handler.wait_for_count(2, Duration::from_secs(2)).await,
        "poller did not recover from transient errors"
    );
    shutdown.cancel();
    let result = task.await.expect("poller task panicked");
    assert!(result.is_ok(), "transient errors must never be fatal");
    assert_eq!(handler.seen().await, vec![1, 2]);
}

#[tokio::test]
async fn rejected_credential_is_fatal() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_credential_failure(PollError::Fatal("Unauthorized".into()))
        .await;
    let handler = Arc::new(RecordingHandler::new());

    let (poller, status) = UpdatePoller::new(
        transport,
        handler.clone(),
        fast_config(),
        CancellationToken::new(),
    );
    let result = poller.run().await;

    let Err(PollError::Fatal(reason)) = result else {
        panic!("credential rejection must be fatal");
    };
    assert!(reason.contains("Unauthorized"), "unexpected reason: {reason}");
    assert!(handler.seen().await.is_empty());
    assert_eq!(status.borrow().phase, PollerPhase::Stopped);
    assert!(!status.borrow().polled_once);
}

#[tokio::test]
async fn flaky_startup_degrades_then_polls() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_credential_failure(PollError::Transient("dns failure".into()))
        .await;
    transport.push_batch(vec![1]).await;
    let handler = Arc::new(RecordingHandler::new());

    let shutdown = CancellationToken::new();
    let (poller, _status) = UpdatePoller::new(
        transport,
        handler.clone(),
        fast_config(),
        shutdown.clone(),
    );
    let task = tokio::spawn(poller.run());

    assert!(
        handler.wait_for_count(1, Duration::from_secs(2)).await,
        "startup never recovered from the transient credential failure"
    );
    shutdown.cancel();
    let result = task.await.expect("poller task panicked");
    assert!(result.is_ok());
}
