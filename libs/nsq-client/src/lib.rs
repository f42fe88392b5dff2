//! Минимальный consumer для NSQ: протокол V2 поверх TCP, discovery
//! через lookupd HTTP API.
//!
//! Диагностика пишется через `tracing` с target `nsq_client`;
//! приложение может заглушить её фильтром `nsq_client=off`.

pub mod config;
pub mod error;
pub mod lookup;
pub mod protocol;
mod conn;
mod consumer;
mod message;

pub use config::ConsumerConfig;
pub use consumer::{Consumer, ConsumerStats, Handler};
pub use error::{HandlerError, NsqError};
pub use message::Message;
pub use protocol::MessageId;
