//! Reliable bootstrap for a long-polling Telegram bot: Redis-backed state,
//! a liveness endpoint, a supervised update poller and ordered shutdown.

pub mod config;
pub mod health;
pub mod orchestrator;
pub mod poller;
pub mod session;
pub mod store;
pub mod testing;
pub mod transport;

pub use orchestrator::Orchestrator;
pub use store::{RedisStore, StateStore};
