//! Update poller: the long-poll fetch/dispatch loop over the messaging
//! endpoint, written as an explicit state machine so tests can drive every
//! transition instead of poking at ad hoc nested error handling.
//!
//! Delivery is at-least-once: the cursor advances only after a dispatch
//! completes, so a crash between dispatch and advance may redeliver and
//! handlers must tolerate replays.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle phases of the poller task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerPhase {
    Stopped,
    Starting,
    Polling,
    /// Retrying after a transient endpoint failure; still alive.
    Degraded,
    Stopping,
}

impl PollerPhase {
    /// Whether the task is up. `Degraded` counts: it is retrying, not dead.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Polling | Self::Degraded)
    }
}

/// Snapshot published to observers (the health endpoint and tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerStatus {
    pub phase: PollerPhase,
    /// True once the poller has reached `Polling` at least once; a startup
    /// retry loop must not read as healthy.
    pub polled_once: bool,
}

impl PollerStatus {
    #[must_use]
    pub const fn healthy(self) -> bool {
        self.polled_once && self.phase.is_alive()
    }
}

/// Errors surfaced by the messaging endpoint, already classified.
#[derive(Debug, Error)]
pub enum PollError {
    /// Network blip, timeout or endpoint-side hiccup; retried with backoff.
    #[error("transient endpoint failure: {0}")]
    Transient(String),
    /// Rejection that retrying cannot change (invalid credential and the
    /// like); propagated to the orchestrator.
    #[error("fatal endpoint failure: {0}")]
    Fatal(String),
}

/// Error raised while processing a single update; isolated to that update.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One inbound event from the messaging endpoint: its offset plus the raw
/// payload, left opaque to the runtime.
#[derive(Debug, Clone)]
pub struct InboundUpdate {
    pub id: i64,
    pub payload: serde_json::Value,
}

/// Identity returned by the credential check.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: i64,
    pub username: String,
}

/// Pull-based messaging endpoint, behind a trait so tests can script it.
#[async_trait]
pub trait UpdateTransport: Send + Sync {
    /// Validates the credential against the endpoint. A fatal error means
    /// the credential was rejected; a transient one means the endpoint was
    /// unreachable and the check is worth repeating.
    async fn check_credential(&self) -> Result<BotIdentity, PollError>;

    /// Fetches the next batch of updates after `offset`, waiting up to
    /// `timeout` (long-poll). An empty batch is a normal timeout expiry.
    async fn fetch_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<InboundUpdate>, PollError>;
}

/// Per-update callback. Runs inside the poll loop; failures are logged and
/// never abort the stream.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle(&self, update: &InboundUpdate) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Long-poll wait per fetch.
    pub poll_timeout: Duration,
    /// Base of the exponential backoff used in `Degraded`.
    pub backoff_base: Duration,
    /// Ceiling for the backoff delay; retries continue unbounded at this
    /// interval (the hosting platform supervises true outages).
    pub backoff_max: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(25),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

enum StartupOutcome {
    Ready(BotIdentity),
    Cancelled,
    Fatal(PollError),
}

pub struct UpdatePoller {
    transport: Arc<dyn UpdateTransport>,
    handler: Arc<dyn UpdateHandler>,
    config: PollerConfig,
    shutdown: CancellationToken,
    status: watch::Sender<PollerStatus>,
    cursor: Option<i64>,
    polled_once: bool,
}

impl UpdatePoller {
    /// Builds the poller together with the receiver observers watch its
    /// status on.
    pub fn new(
        transport: Arc<dyn UpdateTransport>,
        handler: Arc<dyn UpdateHandler>,
        config: PollerConfig,
        shutdown: CancellationToken,
    ) -> (Self, watch::Receiver<PollerStatus>) {
        let (status, status_rx) = watch::channel(PollerStatus {
            phase: PollerPhase::Stopped,
            polled_once: false,
        });
        let poller = Self {
            transport,
            handler,
            config,
            shutdown,
            status,
            cursor: None,
            polled_once: false,
        };
        (poller, status_rx)
    }

    /// Drives the state machine until cancellation or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::Fatal`] when the endpoint rejects the credential
    /// or fails in a way retrying cannot fix.
    pub async fn run(mut self) -> Result<(), PollError> {
        self.enter(PollerPhase::Starting);
        let identity = match self.startup_check().await {
            StartupOutcome::Ready(identity) => identity,
            StartupOutcome::Cancelled => {
                self.enter(PollerPhase::Stopped);
                return Ok(());
            }
            StartupOutcome::Fatal(err) => {
                self.enter(PollerPhase::Stopped);
                return Err(err);
            }
        };
        info!(bot_id = identity.id, username = %identity.username, "credential accepted, polling");

        self.polled_once = true;
        self.enter(PollerPhase::Polling);
        let result = self.poll_loop().await;

        self.enter(PollerPhase::Stopping);
        if result.is_ok() {
            info!("poller drained and stopped");
        }
        self.enter(PollerPhase::Stopped);
        result
    }

    /// `Starting`: validate the credential, treating endpoint flakiness as
    /// recoverable rather than failing the process on a bad first second.
    async fn startup_check(&self) -> StartupOutcome {
        let mut delays = self.backoff();
        loop {
            let check = self.transport.check_credential();
            let result = tokio::select! {
                () = self.shutdown.cancelled() => return StartupOutcome::Cancelled,
                result = check => result,
            };
            match result {
                Ok(identity) => return StartupOutcome::Ready(identity),
                Err(fatal @ PollError::Fatal(_)) => return StartupOutcome::Fatal(fatal),
                Err(PollError::Transient(reason)) => {
                    let delay = delays.next().unwrap_or(self.config.backoff_max);
                    warn!("endpoint unreachable during startup, retrying in {delay:?}: {reason}");
                    self.enter(PollerPhase::Degraded);
                    if self.wait_or_cancel(delay).await {
                        return StartupOutcome::Cancelled;
                    }
                    self.enter(PollerPhase::Starting);
                }
            }
        }
    }

    /// `Polling`/`Degraded`: fetch, dispatch in order, advance the cursor.
    async fn poll_loop(&mut self) -> Result<(), PollError> {
        let mut delays = self.backoff();
        loop {
            let fetch = self
                .transport
                .fetch_updates(self.cursor, self.config.poll_timeout);
            let batch = tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                batch = fetch => batch,
            };
            match batch {
                Ok(updates) => {
                    self.enter(PollerPhase::Polling);
                    delays = self.backoff();
                    if self.dispatch(updates).await {
                        return Ok(());
                    }
                }
                Err(PollError::Transient(reason)) => {
                    let delay = delays.next().unwrap_or(self.config.backoff_max);
                    warn!("fetch failed, backing off {delay:?}: {reason}");
                    self.enter(PollerPhase::Degraded);
                    if self.wait_or_cancel(delay).await {
                        return Ok(());
                    }
                }
                Err(fatal @ PollError::Fatal(_)) => {
                    error!("stopping poller: {fatal}");
                    return Err(fatal);
                }
            }
        }
    }

    /// Dispatches a batch in arrival order. Returns true when cancellation
    /// arrived mid-batch; the in-flight update still completes and its
    /// cursor advance sticks, the rest is left for the next replay.
    async fn dispatch(&mut self, updates: Vec<InboundUpdate>) -> bool {
        for update in updates {
            if let Err(err) = self.handler.handle(&update).await {
                // One bad update must not wedge the stream.
                error!(update_id = update.id, "handler failed: {err}");
            }
            // Advance only after the dispatch completed; a crash before this
            // point redelivers the update.
            self.cursor = Some(update.id + 1);
            if self.shutdown.is_cancelled() {
                return true;
            }
        }
        false
    }

    /// Sleeps for `delay` unless cancelled first. Returns true on cancel.
    async fn wait_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => true,
            () = tokio::time::sleep(delay) => false,
        }
    }

    fn enter(&self, phase: PollerPhase) {
        let next = PollerStatus {
            phase,
            polled_once: self.polled_once,
        };
        self.status.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
    }

    /// Fresh unbounded backoff sequence, capped and jittered.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let base_ms = u64::try_from(self.config.backoff_base.as_millis()).unwrap_or(500);
        ExponentialBackoff::from_millis(base_ms)
            .max_delay(self.config.backoff_max)
            .map(jitter)
    }
}
