//! Per-chat session state: an opaque JSON blob behind the state store,
//! scoped by a TTL so abandoned conversations clean themselves up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::poller::{HandlerError, InboundUpdate, UpdateHandler};
use crate::store::{StateStore, StoreError};

/// Sessions untouched for this long read as absent and restart fresh.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Conversation state for one chat. `data` is handler-owned and opaque to
/// the runtime; mutations are last-write-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Current dialog step; handlers advance it as the conversation moves.
    pub step: String,
    /// Arbitrary handler-owned fields.
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn fresh() -> Self {
        Self {
            step: "start".to_owned(),
            data: serde_json::Value::Null,
            updated_at: Utc::now(),
        }
    }
}

fn session_key(chat_id: i64) -> String {
    format!("session:{chat_id}")
}

/// Loads the chat's session; expired, missing or undecodable blobs all read
/// as a fresh session rather than surfacing an error to the handler.
///
/// # Errors
///
/// Returns [`StoreError`] only when the store itself is unreachable.
pub async fn load_session(store: &dyn StateStore, chat_id: i64) -> Result<Session, StoreError> {
    match store.get(&session_key(chat_id)).await? {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(session) => Ok(session),
            Err(err) => {
                debug!(chat_id, "discarding undecodable session: {err}");
                Ok(Session::fresh())
            }
        },
        None => Ok(Session::fresh()),
    }
}

/// Overwrites the chat's session and restarts its TTL.
///
/// # Errors
///
/// Returns [`StoreError`] when the store is unreachable or the session
/// cannot be encoded.
pub async fn save_session(
    store: &dyn StateStore,
    chat_id: i64,
    session: &Session,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(session)
        .map_err(|err| StoreError::Encoding(format!("session for chat {chat_id}: {err}")))?;
    store.set(&session_key(chat_id), &raw, Some(SESSION_TTL)).await
}

/// Drops the chat's session. Idempotent.
///
/// # Errors
///
/// Returns [`StoreError`] when the store is unreachable.
pub async fn clear_session(store: &dyn StateStore, chat_id: i64) -> Result<(), StoreError> {
    store.delete(&session_key(chat_id)).await
}

/// Default update handler: records the last seen update against the chat's
/// session. Business handlers replace this; until then it keeps the
/// poller-to-store path exercised end to end and is safe to replay.
pub struct SessionTouchHandler {
    store: Arc<dyn StateStore>,
}

impl SessionTouchHandler {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UpdateHandler for SessionTouchHandler {
    async fn handle(&self, update: &InboundUpdate) -> Result<(), HandlerError> {
        let Some(chat_id) = chat_id_of(update) else {
            // Polls, channel posts without a chat and the like.
            return Ok(());
        };
        let mut session = load_session(self.store.as_ref(), chat_id)
            .await
            .map_err(|err| HandlerError::new(err.to_string()))?;
        // `data` is handler-owned; a stored blob may hold any JSON shape,
        // and indexing into a non-object panics.
        if !session.data.is_object() {
            session.data = serde_json::json!({});
        }
        session.data["last_update_id"] = serde_json::json!(update.id);
        session.updated_at = Utc::now();
        save_session(self.store.as_ref(), chat_id, &session)
            .await
            .map_err(|err| HandlerError::new(err.to_string()))?;
        Ok(())
    }
}

/// Pulls the chat id out of a raw update payload, whatever the update kind.
fn chat_id_of(update: &InboundUpdate) -> Option<i64> {
    let payload = &update.payload;
    payload
        .pointer("/message/chat/id")
        .or_else(|| payload.pointer("/edited_message/chat/id"))
        .or_else(|| payload.pointer("/callback_query/message/chat/id"))
        .or_else(|| payload.pointer("/callback_query/from/id"))
        .and_then(serde_json::Value::as_i64)
}
