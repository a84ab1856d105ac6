//! Telegram transport: adapts the raw Bot API (`getMe`, `getUpdates`) to the
//! poller's transport trait and classifies its errors into the runtime's
//! transient/fatal taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use teloxide::payloads::GetUpdatesSetters;
use teloxide::prelude::*;
use teloxide::RequestError;

use crate::poller::{BotIdentity, InboundUpdate, PollError, UpdateTransport};

pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    #[must_use]
    pub fn new(token: &str) -> Self {
        Self {
            bot: Bot::new(token),
        }
    }
}

/// Maps the Telegram client error onto the runtime taxonomy. Network-level
/// failures heal on retry; API-level rejections (a bad credential among
/// them) do not.
fn classify(err: RequestError) -> PollError {
    match err {
        RequestError::Network(inner) => PollError::Transient(format!("network: {inner}")),
        RequestError::Io(inner) => PollError::Transient(format!("io: {inner}")),
        RequestError::InvalidJson { source, .. } => {
            PollError::Transient(format!("undecodable response: {source}"))
        }
        RequestError::RetryAfter(after) => {
            PollError::Transient(format!("rate limited, retry after {after:?}"))
        }
        other => PollError::Fatal(other.to_string()),
    }
}

#[async_trait]
impl UpdateTransport for TelegramTransport {
    async fn check_credential(&self) -> Result<BotIdentity, PollError> {
        let me = self.bot.get_me().await.map_err(classify)?;
        Ok(BotIdentity {
            id: i64::try_from(me.id.0).unwrap_or_default(),
            username: me.username().to_owned(),
        })
    }

    async fn fetch_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<InboundUpdate>, PollError> {
        let wait = u32::try_from(timeout.as_secs()).unwrap_or(25);
        let mut request = self.bot.get_updates().timeout(wait);
        if let Some(offset) = offset {
            request = request.offset(i32::try_from(offset).unwrap_or(i32::MAX));
        }
        let updates = request.await.map_err(classify)?;
        updates
            .into_iter()
            .map(|update| {
                let id = i64::from(update.id.0);
                let payload = serde_json::to_value(&update).map_err(|err| {
                    PollError::Transient(format!("unencodable update {id}: {err}"))
                })?;
                Ok(InboundUpdate { id, payload })
            })
            .collect()
    }
}
