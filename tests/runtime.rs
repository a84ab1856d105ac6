use std::sync::Arc;
use std::time::Duration;

use sentinel_bot::config::Settings;
use sentinel_bot::orchestrator::POLLER_LOCK_KEY;
use sentinel_bot::poller::{PollError, PollerConfig};
use sentinel_bot::testing::{MemoryStore, RecordingHandler, ScriptedTransport};
use sentinel_bot::{Orchestrator, StateStore};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn test_settings() -> Arc<Settings> {
    Arc::new(Settings {
        bot_token: "12345678:0123456789012345678901234567891234a".to_string(),
        redis_url: "redis://localhost:6379".to_string(),
        admin_user_ids_str: None,
        // Port 0 asks the OS for a free port, reported via addr_notify.
        port: 0,
        run_mode: "development".to_string(),
    })
}

fn fast_config() -> PollerConfig {
    PollerConfig {
        poll_timeout: Duration::from_millis(20),
        backoff_base: Duration::from_millis(2),
        backoff_max: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn ttl_expiry_reads_as_absent() {
    let store = MemoryStore::new();
    store
        .set("session:1", "{}", Some(Duration::from_millis(40)))
        .await
        .expect("set failed");

    let before = store.get("session:1").await.expect("get failed");
    assert_eq!(before.as_deref(), Some("{}"));

    sleep(Duration::from_millis(80)).await;
    let after = store.get("session:1").await.expect("get failed");
    assert_eq!(after, None, "expired key must read as absent");
}

#[tokio::test]
async fn unlock_by_non_owner_is_a_noop() {
    let store = MemoryStore::new();
    let ttl = Duration::from_secs(60);

    assert!(store
        .try_lock(POLLER_LOCK_KEY, "owner-a", ttl)
        .await
        .expect("lock failed"));
    store
        .unlock(POLLER_LOCK_KEY, "owner-b")
        .await
        .expect("unlock failed");

    let holder = store.get(POLLER_LOCK_KEY).await.expect("get failed");
    assert_eq!(holder.as_deref(), Some("owner-a"));
    assert!(
        !store
            .refresh_lock(POLLER_LOCK_KEY, "owner-b", ttl)
            .await
            .expect("refresh failed"),
        "a non-owner must not be able to refresh the lock"
    );
}

#[tokio::test]
async fn health_reports_starting_until_first_poll() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::new());
    // Two startup failures keep the poller degraded while the endpoint is
    // already serving, exposing the "starting" answer.
    transport
        .push_credential_failure(PollError::Transient("dns failure".into()))
        .await;
    transport
        .push_credential_failure(PollError::Transient("dns failure".into()))
        .await;
    let handler = Arc::new(RecordingHandler::new());

    let (addr_tx, addr_rx) = oneshot::channel();
    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(test_settings(), store, transport, handler)
        .with_poller_config(PollerConfig {
            poll_timeout: Duration::from_millis(20),
            backoff_base: Duration::from_millis(300),
            backoff_max: Duration::from_millis(400),
        })
        .with_addr_notify(addr_tx);
    let task = tokio::spawn(orchestrator.run_until(shutdown.clone()));

    let addr = addr_rx.await.expect("health endpoint never came up");
    let url = format!("http://{addr}/healthz");

    let response = reqwest::get(&url).await.expect("request failed");
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.text().await.expect("body read failed"), "starting");

    // Once the credential check recovers and polling begins, the same URL
    // flips to ok.
    let became_ok = timeout(Duration::from_secs(3), async {
        loop {
            let response = reqwest::get(&url).await.expect("request failed");
            if response.status() == reqwest::StatusCode::OK {
                return response.text().await.expect("body read failed");
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("health endpoint never reported ok");
    assert_eq!(became_ok, "ok");

    shutdown.cancel();
    let result = task.await.expect("orchestrator task panicked");
    assert!(result.is_ok(), "graceful shutdown must succeed");
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_dispatch() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_batch(vec![1]).await;
    let handler = Arc::new(RecordingHandler::with_delay(Duration::from_millis(150)));

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(test_settings(), store, transport, handler.clone())
        .with_poller_config(fast_config());
    let task = tokio::spawn(orchestrator.run_until(shutdown.clone()));

    // Cancel while the handler is still sleeping on update 1.
    sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let result = task.await.expect("orchestrator task panicked");
    assert!(result.is_ok(), "graceful shutdown must succeed");
    assert_eq!(
        handler.seen().await,
        vec![1],
        "the in-flight dispatch must run to completion"
    );
}

#[tokio::test]
async fn empty_credential_fails_before_binding() {
    let mut settings = (*test_settings()).clone();
    settings.bot_token = String::new();

    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::new());
    let handler = Arc::new(RecordingHandler::new());

    let (addr_tx, addr_rx) = oneshot::channel();
    let orchestrator = Orchestrator::new(Arc::new(settings), store, transport, handler)
        .with_addr_notify(addr_tx);
    let result = orchestrator.run_until(CancellationToken::new()).await;

    let Err(err) = result else {
        panic!("empty token must abort startup");
    };
    assert!(
        format!("{err:#}").contains("BOT_TOKEN"),
        "unexpected error: {err:#}"
    );
    assert!(
        addr_rx.await.is_err(),
        "the health endpoint must not bind when startup validation fails"
    );
}

#[tokio::test]
async fn unreachable_store_at_startup_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    store.set_reachable(false);
    let transport = Arc::new(ScriptedTransport::new());
    let handler = Arc::new(RecordingHandler::new());

    let orchestrator = Orchestrator::new(test_settings(), store, transport, handler);
    let result = orchestrator.run_until(CancellationToken::new()).await;

    let Err(err) = result else {
        panic!("unreachable store must abort startup");
    };
    assert!(
        format!("{err:#}").contains("state store unreachable"),
        "unexpected error: {err:#}"
    );
}

#[tokio::test]
async fn second_instance_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::new());
    let handler = Arc::new(RecordingHandler::new());

    let shutdown = CancellationToken::new();
    let first = Orchestrator::new(
        test_settings(),
        store.clone(),
        transport.clone(),
        handler.clone(),
    )
    .with_poller_config(fast_config());
    let first_task = tokio::spawn(first.run_until(shutdown.clone()));

    // Wait until the first instance holds the lock.
    let locked = timeout(Duration::from_secs(2), async {
        loop {
            if store
                .get(POLLER_LOCK_KEY)
                .await
                .expect("get failed")
                .is_some()
            {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(locked.is_ok(), "first instance never acquired the lock");

    let second = Orchestrator::new(test_settings(), store.clone(), transport, handler)
        .with_poller_config(fast_config());
    let result = second.run_until(CancellationToken::new()).await;

    let Err(err) = result else {
        panic!("second instance must be refused while the lock is held");
    };
    assert!(
        format!("{err:#}").contains("another poller instance"),
        "unexpected error: {err:#}"
    );

    shutdown.cancel();
    let first_result = first_task.await.expect("orchestrator task panicked");
    assert!(first_result.is_ok());

    // The lock is released on shutdown.
    let holder = store.get(POLLER_LOCK_KEY).await.expect("get failed");
    assert_eq!(holder, None);
}
