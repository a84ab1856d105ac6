//! Test support: in-memory store and scripted transport/handler doubles.
//!
//! Exposed as a regular module rather than behind `cfg(test)` so the
//! integration tests under `tests/` can share the same doubles.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::poller::{
    BotIdentity, HandlerError, InboundUpdate, PollError, UpdateHandler, UpdateTransport,
};
use crate::store::{StateStore, StoreError};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory [`StateStore`] with real TTL semantics, plus a reachability
/// switch for simulating outages.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    reachable: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("simulated outage".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check()?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn probe(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        let mut entries = self.entries.lock().await;
        let held_by_other = match entries.get(key) {
            Some(entry) if entry.expired() => false,
            Some(entry) => entry.value != owner,
            None => false,
        };
        if held_by_other {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value: owner.to_owned(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn refresh_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.expired() && entry.value == owner => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|entry| entry.value == owner) {
            entries.remove(key);
        }
        Ok(())
    }
}

/// An update shaped like a minimal Telegram message in chat 7.
#[must_use]
pub fn update_with_id(id: i64) -> InboundUpdate {
    InboundUpdate {
        id,
        payload: serde_json::json!({
            "update_id": id,
            "message": { "chat": { "id": 7 }, "text": "ping" }
        }),
    }
}

type FetchResult = Result<Vec<InboundUpdate>, PollError>;

/// Transport double fed from scripted queues. Once the fetch script is
/// exhausted it behaves like an idle long poll (sleeps for the requested
/// timeout, returns an empty batch), so cancellation paths stay realistic.
pub struct ScriptedTransport {
    credential: Mutex<VecDeque<Result<BotIdentity, PollError>>>,
    batches: Mutex<VecDeque<FetchResult>>,
    offsets: Mutex<Vec<Option<i64>>>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            credential: Mutex::new(VecDeque::new()),
            batches: Mutex::new(VecDeque::new()),
            offsets: Mutex::new(Vec::new()),
        }
    }

    /// Queues a successful batch with the given update ids.
    pub async fn push_batch(&self, ids: Vec<i64>) {
        let updates = ids.into_iter().map(update_with_id).collect();
        self.batches.lock().await.push_back(Ok(updates));
    }

    /// Queues a fetch failure.
    pub async fn push_error(&self, err: PollError) {
        self.batches.lock().await.push_back(Err(err));
    }

    /// Queues a credential-check failure; once the queue is empty the check
    /// succeeds.
    pub async fn push_credential_failure(&self, err: PollError) {
        self.credential.lock().await.push_back(Err(err));
    }

    /// Offsets seen by each fetch, in call order.
    pub async fn seen_offsets(&self) -> Vec<Option<i64>> {
        self.offsets.lock().await.clone()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateTransport for ScriptedTransport {
    async fn check_credential(&self) -> Result<BotIdentity, PollError> {
        match self.credential.lock().await.pop_front() {
            Some(result) => result,
            None => Ok(BotIdentity {
                id: 42,
                username: "test_bot".to_owned(),
            }),
        }
    }

    async fn fetch_updates(&self, offset: Option<i64>, timeout: Duration) -> FetchResult {
        self.offsets.lock().await.push(offset);
        let scripted = self.batches.lock().await.pop_front();
        match scripted {
            Some(result) => result,
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }
}

/// Handler double recording every dispatched update id, optionally failing
/// on one of them and optionally sleeping to simulate in-flight work.
pub struct RecordingHandler {
    seen: Mutex<Vec<i64>>,
    fail_on: Option<i64>,
    delay: Option<Duration>,
}

impl RecordingHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_on: None,
            delay: None,
        }
    }

    /// Fails the dispatch of the given update id (after recording it).
    #[must_use]
    pub fn failing_on(id: i64) -> Self {
        Self {
            fail_on: Some(id),
            ..Self::new()
        }
    }

    /// Sleeps for `delay` before recording, to keep a dispatch in flight.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    pub async fn seen(&self) -> Vec<i64> {
        self.seen.lock().await.clone()
    }

    /// Waits until at least `count` updates were dispatched; false on
    /// deadline.
    pub async fn wait_for_count(&self, count: usize, deadline: Duration) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if self.seen.lock().await.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateHandler for RecordingHandler {
    async fn handle(&self, update: &InboundUpdate) -> Result<(), HandlerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.seen.lock().await.push(update.id);
        if self.fail_on == Some(update.id) {
            return Err(HandlerError::new("scripted handler failure"));
        }
        Ok(())
    }
}
