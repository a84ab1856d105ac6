//! Liveness endpoint: a tiny HTTP server external orchestrators gate traffic
//! and restarts on. Serves a single `GET /healthz` route and nothing else.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::poller::PollerStatus;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("could not bind health listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Read-only view the endpoint reports from. Both handles are owned by the
/// orchestrator; the reporter never mutates them.
#[derive(Clone)]
pub struct HealthState {
    pub ready: watch::Receiver<bool>,
    pub poller: watch::Receiver<PollerStatus>,
}

/// Running health listener. Dropping the handle without [`stop`] leaves the
/// task serving until the process exits; `stop` drains it and releases the
/// port.
///
/// [`stop`]: HealthReporter::stop
pub struct HealthReporter {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl HealthReporter {
    /// Binds the listener and starts serving. The socket is live when this
    /// returns, so readiness can be flipped immediately afterwards without a
    /// false-negative window.
    ///
    /// # Errors
    ///
    /// Returns [`HealthError::Bind`] when the port is unavailable.
    pub async fn start(addr: SocketAddr, state: HealthState) -> Result<Self, HealthError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HealthError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| HealthError::Bind { addr, source })?;

        let app = Router::new().route("/healthz", get(healthz)).with_state(state);
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(err) = serve.await {
                warn!("health listener terminated: {err}");
            }
        });

        info!(addr = %local, "health endpoint listening at /healthz");
        Ok(Self {
            addr: local,
            shutdown,
            task,
        })
    }

    /// Actual bound address; useful when the configured port was 0.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Drains the listener and releases the port.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if self.task.await.is_err() {
            warn!("health listener task panicked during shutdown");
        }
    }
}

async fn healthz(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    let ready = *state.ready.borrow();
    let poller = *state.poller.borrow();
    status_line(ready, poller)
}

/// "ok" only once the process is ready and the poller is alive and has
/// polled at least once; everything else is still "starting".
fn status_line(ready: bool, poller: PollerStatus) -> (StatusCode, &'static str) {
    if ready && poller.healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::PollerPhase;

    fn status(phase: PollerPhase, polled_once: bool) -> PollerStatus {
        PollerStatus { phase, polled_once }
    }

    #[test]
    fn not_ready_is_starting() {
        let (code, body) = status_line(false, status(PollerPhase::Polling, true));
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "starting");
    }

    #[test]
    fn startup_retry_loop_is_not_healthy() {
        // Degraded before the first successful poll must not read as up.
        let (code, _) = status_line(true, status(PollerPhase::Degraded, false));
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn degraded_after_first_poll_is_still_healthy() {
        let (code, body) = status_line(true, status(PollerPhase::Degraded, true));
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[test]
    fn terminal_phases_are_unhealthy() {
        for phase in [PollerPhase::Stopping, PollerPhase::Stopped] {
            let (code, _) = status_line(true, status(phase, true));
            assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        }
    }
}
