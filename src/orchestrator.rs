//! Process orchestration: supervised startup, steady-state supervision and
//! ordered shutdown of the store, health endpoint and poller.
//!
//! Startup order is fixed: validate settings, probe the store, bind the
//! health endpoint, flip readiness, acquire the poller lock, start polling.
//! Shutdown reverses it with a bounded grace period for in-flight work.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::health::{HealthReporter, HealthState};
use crate::poller::{PollError, PollerConfig, UpdateHandler, UpdatePoller, UpdateTransport};
use crate::store::StateStore;

/// Key guarding against concurrent poller instances.
pub const POLLER_LOCK_KEY: &str = "lock:poller";
/// Lock lifetime; a crashed holder frees the slot after this long.
pub const POLLER_LOCK_TTL: Duration = Duration::from_secs(60);
/// Refresh cadence, well under the TTL.
const LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(20);
/// How long shutdown waits for the poller to finish in-flight work.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Orchestrator {
    settings: Arc<Settings>,
    store: Arc<dyn StateStore>,
    transport: Arc<dyn UpdateTransport>,
    handler: Arc<dyn UpdateHandler>,
    poller_config: PollerConfig,
    addr_notify: Option<oneshot::Sender<SocketAddr>>,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn UpdateTransport>,
        handler: Arc<dyn UpdateHandler>,
    ) -> Self {
        Self {
            settings,
            store,
            transport,
            handler,
            poller_config: PollerConfig::default(),
            addr_notify: None,
        }
    }

    #[must_use]
    pub fn with_poller_config(mut self, config: PollerConfig) -> Self {
        self.poller_config = config;
        self
    }

    /// Reports the bound health address once the listener is up. Used by
    /// tests that bind port 0.
    #[must_use]
    pub fn with_addr_notify(mut self, tx: oneshot::Sender<SocketAddr>) -> Self {
        self.addr_notify = Some(tx);
        self
    }

    /// Runs the full lifecycle, shutting down on SIGTERM or Ctrl-C.
    ///
    /// # Errors
    ///
    /// Returns an error when startup fails or the poller dies fatally.
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            signal_token.cancel();
        });
        self.run_until(shutdown).await
    }

    /// Runs the full lifecycle until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error when startup fails or the poller dies fatally.
    pub async fn run_until(mut self, shutdown: CancellationToken) -> Result<()> {
        self.settings.validate().context("invalid configuration")?;

        if !self.store.probe().await {
            bail!("state store unreachable at startup");
        }
        info!("state store reachable");

        let (ready_tx, ready_rx) = watch::channel(false);
        let poller_token = shutdown.child_token();
        let (poller, status_rx) = UpdatePoller::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.handler),
            self.poller_config.clone(),
            poller_token.clone(),
        );

        let addr = SocketAddr::from(([0, 0, 0, 0], self.settings.port));
        let health = HealthReporter::start(
            addr,
            HealthState {
                ready: ready_rx,
                poller: status_rx,
            },
        )
        .await
        .context("health listener failed to bind")?;

        if let Some(tx) = self.addr_notify.take() {
            let _ = tx.send(health.local_addr());
        }
        // The socket is already accepting, so flipping readiness here cannot
        // produce a false "ok" before the listener exists.
        let _ = ready_tx.send(true);

        let owner = Uuid::new_v4().to_string();
        let locked = self
            .store
            .try_lock(POLLER_LOCK_KEY, &owner, POLLER_LOCK_TTL)
            .await
            .context("poller lock acquisition failed")?;
        if !locked {
            health.stop().await;
            bail!("another poller instance holds the lock, refusing to start");
        }
        info!(%owner, "poller lock acquired");

        let refresh = spawn_lock_refresh(Arc::clone(&self.store), owner.clone());
        let mut poller_task = tokio::spawn(poller.run());

        let result = tokio::select! {
            () = shutdown.cancelled() => {
                info!("stopping poller");
                poller_token.cancel();
                match timeout(SHUTDOWN_GRACE, &mut poller_task).await {
                    Ok(join) => finish(join, true),
                    Err(_) => {
                        warn!("poller did not stop within grace period, aborting");
                        poller_task.abort();
                        Ok(())
                    }
                }
            }
            join = &mut poller_task => finish(join, shutdown.is_cancelled()),
        };

        refresh.abort();
        let _ = ready_tx.send(false);
        health.stop().await;
        if let Err(err) = self.store.unlock(POLLER_LOCK_KEY, &owner).await {
            warn!("failed to release poller lock: {err}");
        }

        match &result {
            Ok(()) => info!("shutdown complete"),
            Err(err) => error!("exiting after failure: {err:#}"),
        }
        result
    }
}

type PollerJoin = std::result::Result<Result<(), PollError>, tokio::task::JoinError>;

fn finish(join: PollerJoin, graceful: bool) -> Result<()> {
    match join {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err).context("poller terminated"),
        Err(err) if err.is_cancelled() && graceful => Ok(()),
        Err(err) => Err(err).context("poller task panicked"),
    }
}

fn spawn_lock_refresh(store: Arc<dyn StateStore>, owner: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(LOCK_REFRESH_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            match store
                .refresh_lock(POLLER_LOCK_KEY, &owner, POLLER_LOCK_TTL)
                .await
            {
                Ok(true) => {}
                Ok(false) => warn!("poller lock no longer held by this instance"),
                Err(err) => warn!("poller lock refresh failed: {err}"),
            }
        }
    })
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!("failed to install SIGTERM handler: {err}");
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for Ctrl-C: {err}");
            }
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!("failed to listen for Ctrl-C: {err}");
            }
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {err}");
    }
}
