//! State store client: the single narrow interface to the external key-value
//! store used for session state and the poller instance lock.
//!
//! All shared mutable state goes through this trait; there is deliberately no
//! local caching layer, which would go stale across restarts and multiple
//! concurrent handler invocations.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;

/// Per-operation timeout for store round-trips, distinct from the process
/// shutdown grace period.
const STORE_OP_TIMEOUT: Duration = Duration::from_secs(3);
/// Base for the retry backoff in milliseconds.
const STORE_RETRY_BASE_MS: u64 = 100;
/// Cap on the delay between retries.
const STORE_RETRY_MAX_DELAY: Duration = Duration::from_millis(800);
/// Retries after the first failed attempt.
const STORE_RETRY_ATTEMPTS: usize = 2;

/// Errors surfaced by the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached within the retry budget.
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    /// A value could not be serialized for storage.
    #[error("could not encode value for storage: {0}")]
    Encoding(String),
}

/// Narrow async interface over the external key-value store.
///
/// Values are opaque serialized blobs; keys with a TTL read as absent once it
/// elapses. Mutations are last-write-wins per key.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetches a value, `None` if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrites a value unconditionally; with a `ttl` the key becomes
    /// unreadable once the duration elapses.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Removes a key. Idempotent; absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Lightweight reachability check. Never errors; any failure reads as
    /// `false`.
    async fn probe(&self) -> bool;

    /// Atomically takes the lock at `key` for `owner` if nobody else holds
    /// it. Returns whether the lock was acquired. Re-acquiring a lock this
    /// owner already holds succeeds and extends it.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Extends the lock TTL if `owner` still holds it. Returns whether the
    /// lock was still owned.
    async fn refresh_lock(&self, key: &str, owner: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Releases the lock only if `owner` holds it; a non-owner release is a
    /// no-op so an expired-and-reacquired lock is never stolen back.
    async fn unlock(&self, key: &str, owner: &str) -> Result<(), StoreError>;
}

/// Compare-and-delete: release the lock only when the stored owner token
/// matches.
const LOCK_RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Compare-and-expire: extend the lock only when the stored owner token
/// matches.
const LOCK_REFRESH_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed [`StateStore`] over a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects using a single connection string (never assembled from
    /// parts).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the URL is malformed or the
    /// store does not answer within the per-operation timeout.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let conn = tokio::time::timeout(STORE_OP_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Unavailable("connection attempt timed out".into()))?
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { conn })
    }

    /// Runs an operation under the bounded retry budget, each attempt capped
    /// by the per-call timeout.
    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        mut operation: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, redis::RedisError>>,
    {
        let strategy = ExponentialBackoff::from_millis(STORE_RETRY_BASE_MS)
            .max_delay(STORE_RETRY_MAX_DELAY)
            .map(jitter)
            .take(STORE_RETRY_ATTEMPTS);

        Retry::spawn(strategy, || {
            let attempt = operation();
            async move {
                match tokio::time::timeout(STORE_OP_TIMEOUT, attempt).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(StoreError::Unavailable(format!("{op}: {err}"))),
                    Err(_) => Err(StoreError::Unavailable(format!("{op}: timed out"))),
                }
            }
        })
        .await
        .map_err(|err| {
            warn!("store operation failed after {STORE_RETRY_ATTEMPTS} retries: {err}");
            err
        })
    }

    /// Runs a single non-retried command under the per-call timeout. Used
    /// for lock operations, where a blind retry after a lost response could
    /// misreport ownership.
    async fn single_shot<T, Fut>(op: &'static str, attempt: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(STORE_OP_TIMEOUT, attempt).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StoreError::Unavailable(format!("{op}: {err}"))),
            Err(_) => Err(StoreError::Unavailable(format!("{op}: timed out"))),
        }
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_retry("get", || {
            let mut conn = self.conn.clone();
            let key = key.to_owned();
            async move { conn.get::<_, Option<String>>(&key).await }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.with_retry("set", || {
            let mut conn = self.conn.clone();
            let key = key.to_owned();
            let value = value.to_owned();
            async move {
                match ttl {
                    // SET with EX 0 is an error; sub-second TTLs round up.
                    Some(ttl) => {
                        conn.set_ex::<_, _, ()>(&key, &value, ttl.as_secs().max(1)).await
                    }
                    None => conn.set::<_, _, ()>(&key, &value).await,
                }
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.with_retry("delete", || {
            let mut conn = self.conn.clone();
            let key = key.to_owned();
            async move { conn.del::<_, ()>(&key).await }
        })
        .await
    }

    async fn probe(&self) -> bool {
        let mut conn = self.conn.clone();
        let ping = async move {
            let cmd = redis::cmd("PING");
            let reply: Result<String, _> = cmd.query_async(&mut conn).await;
            reply
        };
        matches!(tokio::time::timeout(STORE_OP_TIMEOUT, ping).await, Ok(Ok(_)))
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let reply: Option<String> = Self::single_shot("try_lock", async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(owner).arg("NX").arg("PX").arg(ttl_ms);
            cmd.query_async(&mut conn).await
        })
        .await?;
        if reply.is_some() {
            return Ok(true);
        }
        // NX failed; the holder may still be this owner from a previous run.
        let holder = self.get(key).await?;
        if holder.as_deref() == Some(owner) {
            return self.refresh_lock(key, owner, ttl).await;
        }
        Ok(false)
    }

    async fn refresh_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let refreshed: i64 = Self::single_shot("refresh_lock", async move {
            let script = redis::Script::new(LOCK_REFRESH_SCRIPT);
            let mut invocation = script.key(key);
            invocation.arg(owner).arg(ttl_ms);
            invocation.invoke_async(&mut conn).await
        })
        .await?;
        Ok(refreshed == 1)
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let released: i64 = Self::single_shot("unlock", async move {
            let script = redis::Script::new(LOCK_RELEASE_SCRIPT);
            let mut invocation = script.key(key);
            invocation.arg(owner).invoke_async(&mut conn).await
        })
        .await?;
        if released == 0 {
            warn!(key, "lock was already expired or taken over before release");
        }
        Ok(())
    }
}
